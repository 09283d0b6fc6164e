//! `train` binary: entry point for ECG contrastive pre-training and
//! fine-tuning.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --dry-run --paradigm cmsc --epochs 2
//! cargo run --bin train -- --config run.json --dry-run --resume checkpoints/checkpoint_10
//! cargo run --bin train -- --config run.json --dry-run --finetune checkpoints/checkpoint_400
//! ```
//!
//! Recordings are supplied to the library through the `EcgDataset` trait;
//! this binary drives the built-in synthetic dataset.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use ecg_contrast_train::config::{Backbone, Paradigm, TrainingConfig};
use ecg_contrast_train::dataset::{EcgDataset, InMemoryEcgDataset, SyntheticEcgConfig, SyntheticEcgDataset};
use ecg_contrast_train::trainer::Trainer;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Contrastive pre-training for ECG waveforms",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the contrastive paradigm (plain, simclr, cmsc, moco, mcp, comet).
    #[arg(long)]
    paradigm: Option<Paradigm>,

    /// Override the encoder backbone (cnn3, res20).
    #[arg(long)]
    backbone: Option<Backbone>,

    /// Override the number of epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override the checkpoint directory from the config.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Resume pre-training from this checkpoint directory.
    #[arg(long, value_name = "DIR", conflicts_with = "finetune")]
    resume: Option<PathBuf>,

    /// Fine-tune a classifier starting from this pre-trained checkpoint.
    #[arg(long, value_name = "DIR")]
    finetune: Option<PathBuf>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use the deterministic synthetic dataset.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic patients when `--dry-run` is active.
    #[arg(long, default_value_t = 32)]
    dry_run_patients: usize,

    /// Recordings per synthetic patient when `--dry-run` is active.
    #[arg(long, default_value_t = 4)]
    dry_run_records: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("ECG contrastive training v{}", ecg_contrast_train::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match TrainingConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            TrainingConfig::default()
        }
    };

    // CLI overrides.
    if let Some(paradigm) = args.paradigm {
        config.paradigm = paradigm;
    }
    if let Some(backbone) = args.backbone {
        config.backbone = backbone;
    }
    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint_dir = dir;
    }
    if args.cuda {
        config.use_gpu = true;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  paradigm     : {}", config.paradigm);
    info!("  backbone     : {}", config.backbone);
    info!("  embed dim    : {}", config.embed_dim);
    info!("  views        : {} x {} samples", config.num_views, config.segment_len);
    if config.paradigm.uses_queue() {
        info!("  queue        : {} (m = {})", config.queue_size, config.momentum);
    }
    info!("  batch size   : {}", config.batch_size);
    info!("  learning rate: {}", config.learning_rate);
    info!("  epochs       : {}", config.num_epochs);
    info!("  device       : {:?}", config.device());

    if !args.dry_run {
        error!("No recording source configured; pass --dry-run to train on the synthetic dataset");
        std::process::exit(2);
    }

    info!(
        "DRY RUN: synthetic dataset ({} patients x {} records)",
        args.dry_run_patients, args.dry_run_records
    );
    let syn_cfg = SyntheticEcgConfig {
        num_leads: config.in_channels,
        signal_len: config.window_len,
        num_classes: config.num_classes,
        ..SyntheticEcgConfig::default()
    };
    let dataset = SyntheticEcgDataset::new(args.dry_run_patients, args.dry_run_records, syn_cfg);

    let outcome = match args.finetune.as_deref() {
        Some(pretrained) => run_finetune(&config, pretrained, &dataset),
        None => run_pretrain(config, args.resume, &dataset),
    };
    if let Err(e) = outcome {
        error!("Training failed: {e}");
        std::process::exit(1);
    }
}

/// Contrastive pre-training, optionally resumed from a checkpoint.
fn run_pretrain(
    config: TrainingConfig,
    resume: Option<PathBuf>,
    dataset: &dyn EcgDataset,
) -> ecg_contrast_train::TrainResult<()> {
    let mut trainer = match resume {
        Some(dir) => {
            info!("Resuming from {}", dir.display());
            Trainer::resume(config, &dir)?
        }
        None => Trainer::new(config)?,
    };
    info!("Dataset: {} ({} samples)", dataset.name(), dataset.len());

    let summary = trainer.run(dataset)?;
    if let Some(best) = summary.best_loss {
        info!("Best epoch loss: {best:.6}");
    }
    if let Some(dir) = summary.last_checkpoint {
        info!("Last checkpoint: {}", dir.display());
    }
    Ok(())
}

/// Supervised fine-tuning on a patient-disjoint split of `dataset`.
fn run_finetune(
    config: &TrainingConfig,
    pretrained: &std::path::Path,
    dataset: &SyntheticEcgDataset,
) -> ecg_contrast_train::TrainResult<()> {
    let samples = (0..dataset.len())
        .map(|i| dataset.get(i))
        .collect::<Result<Vec<_>, _>>()?;
    let all = InMemoryEcgDataset::new(dataset.name(), samples);
    let (train, eval) = all.split_by_identity(0.2, config.seed);
    info!("Fine-tuning: {} train / {} eval samples", train.len(), eval.len());

    let summary = Trainer::finetune(config, Some(pretrained), &train, &eval)?;
    if let Some(acc) = summary.best_accuracy {
        info!("Best eval accuracy: {acc:.4}");
    }
    Ok(())
}
