//! Benchmarks for the ECG contrastive training pipeline.
//!
//! Dataset inputs are deterministic; embedding inputs come from
//! `Tensor::randn` after a fixed `tch::manual_seed`, so every run sees the
//! same numbers.
//!
//! Run with:
//!
//! ```bash
//! cargo bench -p ecg-contrast-train
//! ```
//!
//! Criterion HTML reports are written to `target/criterion/`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ecg_contrast_train::{
    augment::{collate_views, ViewAugmentor},
    config::TrainingConfig,
    dataset::{EcgDataset, SyntheticEcgConfig, SyntheticEcgDataset},
    losses::{cmsc_loss, l2_normalize, moco_logits, moco_loss, simclr_loss, TEMPERATURE},
    queue::NegativeQueue,
};
use tch::{Device, Kind, Tensor};

fn unit_rows(b: i64, d: i64) -> Tensor {
    l2_normalize(&Tensor::randn([b, d], (Kind::Float, Device::Cpu)), 1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Loss benchmarks
// ─────────────────────────────────────────────────────────────────────────────

/// SimCLR loss at varying batch sizes with D = 256.
fn bench_simclr_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("simclr_loss");
    tch::manual_seed(0);

    for batch in [32_i64, 128, 256] {
        let v1 = unit_rows(batch, 256);
        let v2 = unit_rows(batch, 256);
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, _| {
            b.iter(|| {
                let _ = simclr_loss(black_box(&v1), black_box(&v2), TEMPERATURE);
            });
        });
    }

    group.finish();
}

/// CMSC loss with 4 records per patient in a batch of 256.
fn bench_cmsc_256(c: &mut Criterion) {
    tch::manual_seed(0);
    let v1 = unit_rows(256, 256);
    let v2 = unit_rows(256, 256);
    let ids = Tensor::from_slice(&(0..256_i64).map(|i| i / 4).collect::<Vec<_>>());

    c.bench_function("cmsc_loss_256", |b| {
        b.iter(|| {
            let _ = cmsc_loss(black_box(&v1), black_box(&v2), black_box(&ids), TEMPERATURE);
        });
    });
}

/// MoCo logits plus loss against a 16384-entry queue.
fn bench_moco_16384(c: &mut Criterion) {
    tch::manual_seed(0);
    let q = unit_rows(256, 256);
    let k = unit_rows(256, 256);
    let queue = NegativeQueue::new(256, 16384, Device::Cpu);
    let negatives = queue.negatives();

    c.bench_function("moco_loss_256x16384", |b| {
        b.iter(|| {
            let logits = moco_logits(black_box(&q), black_box(&k), black_box(&negatives));
            let _ = moco_loss(&logits, TEMPERATURE);
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue benchmarks
// ─────────────────────────────────────────────────────────────────────────────

/// One full cycle of enqueues (64 batches of 256 into 16384 slots).
fn bench_queue_cycle(c: &mut Criterion) {
    tch::manual_seed(0);
    let keys = unit_rows(256, 256);
    let mut queue = NegativeQueue::new(256, 16384, Device::Cpu);

    c.bench_function("queue_full_cycle", |b| {
        b.iter(|| {
            for _ in 0..64 {
                queue.enqueue(black_box(&keys)).expect("aligned enqueue");
            }
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Data pipeline benchmarks
// ─────────────────────────────────────────────────────────────────────────────

/// Augment and collate one batch of 64 synthetic recordings.
fn bench_augment_collate_64(c: &mut Criterion) {
    let config = TrainingConfig::default();
    let dataset = SyntheticEcgDataset::new(16, 4, SyntheticEcgConfig::default());
    let samples: Vec<_> = (0..dataset.len())
        .map(|i| dataset.get(i).expect("sample must exist"))
        .collect();
    let mut augmentor = ViewAugmentor::from_config(&config);

    c.bench_function("augment_collate_64", |b| {
        b.iter(|| {
            let views: Vec<_> = samples
                .iter()
                .map(|s| augmentor.create_views(black_box(&s.signal)).expect("segment fits"))
                .collect();
            let _ = collate_views(&views).expect("uniform views");
        });
    });
}

/// Benchmark `TrainingConfig::validate()` to ensure it stays O(1).
fn bench_config_validate(c: &mut Criterion) {
    let config = TrainingConfig::default();
    c.bench_function("config_validate", |b| {
        b.iter(|| {
            let _ = black_box(&config).validate();
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Criterion registration
// ─────────────────────────────────────────────────────────────────────────────

criterion_group!(
    benches,
    // Losses
    bench_simclr_scaling,
    bench_cmsc_256,
    bench_moco_16384,
    // Queue
    bench_queue_cycle,
    // Data
    bench_augment_collate_64,
    bench_config_validate,
);
criterion_main!(benches);
