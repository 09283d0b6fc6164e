//! Integration tests for [`ecg_contrast_train::queue::NegativeQueue`].
//!
//! Keys are drawn after a fixed `tch::manual_seed`.

use approx::assert_abs_diff_eq;
use ecg_contrast_train::error::{ConfigError, TrainError};
use ecg_contrast_train::losses::l2_normalize;
use ecg_contrast_train::queue::{NegativeQueue, UNKNOWN_IDENTITY};
use tch::{Device, Kind, Tensor};

fn keys(batch: i64, dim: i64) -> Tensor {
    l2_normalize(&Tensor::randn([batch, dim], (Kind::Float, Device::Cpu)), 1)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b).abs().max().double_value(&[])
}

/// After `k` enqueues of `B` keys the pointer is `(k · B) mod K`.
#[test]
fn pointer_after_k_enqueues() {
    tch::manual_seed(1);
    let (dim, capacity, batch) = (8, 32, 8);
    let mut queue = NegativeQueue::new(dim, capacity, Device::Cpu);
    for k in 1..=10_i64 {
        queue.enqueue(&keys(batch, dim)).unwrap();
        assert_eq!(queue.pointer(), (k * batch) % capacity, "after {k} enqueues");
    }
}

/// A full cycle returns the pointer to its start and overwrites every slot.
#[test]
fn full_cycle_overwrites_every_slot() {
    tch::manual_seed(2);
    let (dim, capacity, batch) = (4, 12, 3);
    let mut queue = NegativeQueue::new(dim, capacity, Device::Cpu);

    let written: Vec<Tensor> = (0..capacity / batch)
        .map(|_| {
            let k = keys(batch, dim);
            queue.enqueue(&k).unwrap();
            k
        })
        .collect();
    assert_eq!(queue.pointer(), 0);

    let expected = Tensor::cat(&written, 0).transpose(0, 1);
    assert!(max_abs_diff(&queue.negatives(), &expected) < 1e-7);
}

/// A queue of 8 receiving two batches of 4: each half equals its batch and
/// the pointer is back at 0.
#[test]
fn two_batches_fill_a_queue_of_eight() {
    tch::manual_seed(3);
    let mut queue = NegativeQueue::new(6, 8, Device::Cpu);
    let first = keys(4, 6);
    let second = keys(4, 6);

    queue.enqueue(&first).unwrap();
    assert_eq!(queue.pointer(), 4);
    queue.enqueue(&second).unwrap();
    assert_eq!(queue.pointer(), 0);

    let buf = queue.negatives();
    assert!(max_abs_diff(&buf.narrow(1, 0, 4), &first.transpose(0, 1)) < 1e-7);
    assert!(max_abs_diff(&buf.narrow(1, 4, 4), &second.transpose(0, 1)) < 1e-7);
}

/// `K % B != 0` is a configuration error and nothing is written.
#[test]
fn indivisible_batch_is_a_config_error() {
    tch::manual_seed(4);
    let mut queue = NegativeQueue::new(4, 8, Device::Cpu);
    let before = queue.negatives();
    match queue.enqueue(&keys(3, 4)) {
        Err(TrainError::Config(ConfigError::QueueNotDivisible { queue_size, batch_size })) => {
            assert_eq!((queue_size, batch_size), (8, 3));
        }
        other => panic!("expected QueueNotDivisible, got {other:?}"),
    }
    assert_eq!(queue.pointer(), 0);
    assert_eq!(max_abs_diff(&before, &queue.negatives()), 0.0);
}

/// The buffer starts with unit-norm columns and unknown identities.
#[test]
fn fresh_queue_is_normalised() {
    tch::manual_seed(5);
    let queue = NegativeQueue::new(16, 64, Device::Cpu);
    assert_eq!(queue.negatives().size(), [16, 64]);
    let norms = queue
        .negatives()
        .pow_tensor_scalar(2)
        .sum_dim_intlist(&[0_i64][..], false, Kind::Float)
        .sqrt();
    assert_abs_diff_eq!(norms.min().double_value(&[]), 1.0, epsilon = 1e-5);
    assert_abs_diff_eq!(norms.max().double_value(&[]), 1.0, epsilon = 1e-5);
    assert_eq!(queue.identities().max().int64_value(&[]), UNKNOWN_IDENTITY);
}

/// Negatives are detached: they never carry gradients, even when the keys
/// that were enqueued did.
#[test]
fn negatives_are_detached() {
    tch::manual_seed(6);
    let mut queue = NegativeQueue::new(4, 8, Device::Cpu);
    let k = keys(4, 4).set_requires_grad(true);
    queue.enqueue(&k).unwrap();
    assert!(!queue.negatives().requires_grad());
}

/// Saved state restores into a fresh queue exactly.
#[test]
fn state_round_trip() {
    tch::manual_seed(7);
    let mut queue = NegativeQueue::new(4, 8, Device::Cpu);
    queue
        .enqueue_with_identities(&keys(4, 4), &Tensor::from_slice(&[1_i64, 2, 3, 4]))
        .unwrap();
    let [(_, buf), (_, ptr), (_, ids)] = queue.state_tensors();

    let mut fresh = NegativeQueue::new(4, 8, Device::Cpu);
    fresh.restore(&buf, ptr.int64_value(&[0]), &ids).unwrap();
    assert_eq!(fresh.pointer(), 4);
    assert_eq!(max_abs_diff(&fresh.negatives(), &queue.negatives()), 0.0);
    assert_eq!(max_abs_diff(&fresh.identities(), &queue.identities()), 0.0);
}

/// A restore with the wrong buffer shape changes nothing.
#[test]
fn restore_with_wrong_shape_is_rejected() {
    tch::manual_seed(8);
    let mut queue = NegativeQueue::new(4, 8, Device::Cpu);
    let before = queue.negatives();
    let bad = Tensor::zeros([4, 16], (Kind::Float, Device::Cpu));
    let ids = Tensor::full([8], UNKNOWN_IDENTITY, (Kind::Int64, Device::Cpu));
    assert!(queue.restore(&bad, 0, &ids).is_err());
    assert_eq!(max_abs_diff(&before, &queue.negatives()), 0.0);
}
