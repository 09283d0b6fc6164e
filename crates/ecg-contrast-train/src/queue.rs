//! Fixed-capacity circular buffer of historical key embeddings.
//!
//! The queue stores keys column-wise in a `[D, K]` tensor so that the
//! query-negative similarities are a single `[B, D] x [D, K]` product. Writes
//! never wrap: `K % B == 0` is required, and each enqueue overwrites the `B`
//! columns starting at the pointer before advancing it by `B` modulo `K`.
//!
//! A parallel `[K]` buffer records the identity label of the sample each key
//! came from. Slots that have never received a labelled key hold
//! [`UNKNOWN_IDENTITY`].

use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{ConfigError, ShapeError, TrainError, TrainResult};
use crate::losses::l2_normalize;

/// Identity label of a queue slot that holds no labelled key.
pub const UNKNOWN_IDENTITY: i64 = -1;

/// Circular buffer of unit-normalised negative keys.
#[derive(Debug)]
pub struct NegativeQueue {
    /// `[D, K]` key buffer.
    queue: Tensor,
    /// `[K]` identity labels, `int64`.
    ids: Tensor,
    ptr: i64,
    embed_dim: i64,
    capacity: i64,
}

impl NegativeQueue {
    /// Create a queue of `queue_size` random unit-norm columns.
    pub fn new(embed_dim: i64, queue_size: i64, device: Device) -> Self {
        let queue = l2_normalize(&Tensor::randn([embed_dim, queue_size], (Kind::Float, device)), 0);
        let ids = Tensor::full([queue_size], UNKNOWN_IDENTITY, (Kind::Int64, device));
        NegativeQueue { queue, ids, ptr: 0, embed_dim, capacity: queue_size }
    }

    /// Current write position, always in `[0, capacity)`.
    pub fn pointer(&self) -> i64 {
        self.ptr
    }

    /// Number of slots `K`.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Key dimensionality `D`.
    pub fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    /// Device of the buffers.
    pub fn device(&self) -> Device {
        self.queue.device()
    }

    /// Snapshot of the `[D, K]` buffer, detached from the autograd graph.
    ///
    /// The snapshot does not share storage with the queue, so later enqueues
    /// cannot invalidate a graph that used it.
    pub fn negatives(&self) -> Tensor {
        self.queue.detach().copy()
    }

    /// Snapshot of the `[K]` identity buffer.
    pub fn identities(&self) -> Tensor {
        self.ids.copy()
    }

    /// Check that `keys` can be enqueued at the current pointer and return
    /// the batch size.
    ///
    /// # Errors
    ///
    /// - [`ShapeError`] when `keys` is not `[B, D]`.
    /// - [`ConfigError::QueueNotDivisible`] when `K % B != 0`, which also
    ///   covers `B > K`.
    pub fn check_batch(&self, keys: &Tensor) -> TrainResult<i64> {
        ShapeError::check_rank("queue keys", keys, 2)?;
        let size = keys.size();
        let batch = size[0];
        if size[1] != self.embed_dim {
            return Err(ShapeError::mismatch("queue keys", vec![batch, self.embed_dim], size).into());
        }
        self.check_batch_size(batch)?;
        Ok(batch)
    }

    /// Check that a batch of `batch` keys fits at the current pointer.
    pub fn check_batch_size(&self, batch: i64) -> TrainResult<()> {
        if batch <= 0 || self.capacity % batch != 0 {
            return Err(ConfigError::QueueNotDivisible {
                queue_size: self.capacity as usize,
                batch_size: batch.max(0) as usize,
            }
            .into());
        }
        if self.ptr + batch > self.capacity {
            return Err(TrainError::training_step(format!(
                "queue pointer {} is not aligned to batch size {batch}",
                self.ptr
            )));
        }
        Ok(())
    }

    /// Write `keys` (`[B, D]`, unit-normalised) at the pointer and advance it.
    ///
    /// The identity labels of the overwritten slots are reset to
    /// [`UNKNOWN_IDENTITY`].
    pub fn enqueue(&mut self, keys: &Tensor) -> TrainResult<()> {
        let batch = self.check_batch(keys)?;
        self.write(keys, None, batch);
        Ok(())
    }

    /// [`enqueue`](Self::enqueue) that also records the identity label of
    /// every key.
    pub fn enqueue_with_identities(&mut self, keys: &Tensor, identities: &Tensor) -> TrainResult<()> {
        let batch = self.check_batch(keys)?;
        if identities.size() != [batch] {
            return Err(ShapeError::mismatch("queue identities", vec![batch], identities.size()).into());
        }
        self.write(keys, Some(identities), batch);
        Ok(())
    }

    /// Buffers for persistence: `queue`, `queue_ptr` and `queue_ids`.
    pub fn state_tensors(&self) -> [(&'static str, Tensor); 3] {
        [
            ("queue", self.queue.detach().copy()),
            ("queue_ptr", Tensor::from_slice(&[self.ptr])),
            ("queue_ids", self.ids.copy()),
        ]
    }

    /// Check that `queue`, `ptr` and `identities` describe a state of this
    /// queue without modifying anything.
    pub fn check_state(&self, queue: &Tensor, ptr: i64, identities: &Tensor) -> TrainResult<()> {
        if queue.size() != [self.embed_dim, self.capacity] {
            return Err(
                ShapeError::mismatch("queue", vec![self.embed_dim, self.capacity], queue.size()).into()
            );
        }
        if identities.size() != [self.capacity] {
            return Err(
                ShapeError::mismatch("queue_ids", vec![self.capacity], identities.size()).into()
            );
        }
        if !(0..self.capacity).contains(&ptr) {
            return Err(ConfigError::invalid_value(
                "queue_ptr",
                format!("{ptr} is outside [0, {})", self.capacity),
            )
            .into());
        }
        Ok(())
    }

    /// Replace the queue state.
    ///
    /// All three values are validated before anything is written.
    pub fn restore(&mut self, queue: &Tensor, ptr: i64, identities: &Tensor) -> TrainResult<()> {
        self.check_state(queue, ptr, identities)?;
        tch::no_grad(|| {
            self.queue.copy_(queue);
            self.ids.copy_(&identities.to_kind(Kind::Int64));
        });
        self.ptr = ptr;
        Ok(())
    }

    fn write(&mut self, keys: &Tensor, identities: Option<&Tensor>, batch: i64) {
        tch::no_grad(|| {
            let mut slots = self.queue.narrow(1, self.ptr, batch);
            slots.copy_(&keys.detach().transpose(0, 1));

            let mut id_slots = self.ids.narrow(0, self.ptr, batch);
            match identities {
                Some(ids) => id_slots.copy_(&ids.to_kind(Kind::Int64)),
                None => {
                    let _ = id_slots.fill_(UNKNOWN_IDENTITY);
                }
            }
        });
        let start = self.ptr;
        self.ptr = (self.ptr + batch) % self.capacity;
        debug!(start, batch, next = self.ptr, "enqueued keys");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(batch: i64, dim: i64) -> Tensor {
        l2_normalize(&Tensor::randn([batch, dim], (Kind::Float, Device::Cpu)), 1)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn initial_columns_are_unit_norm() {
        tch::manual_seed(0);
        let q = NegativeQueue::new(16, 32, Device::Cpu);
        let norms = q.negatives().pow_tensor_scalar(2).sum_dim_intlist(&[0_i64][..], false, Kind::Float).sqrt();
        assert!(max_abs_diff(&norms, &Tensor::ones([32], (Kind::Float, Device::Cpu))) < 1e-5);
        assert_eq!(q.pointer(), 0);
        assert_eq!(q.identities().min().int64_value(&[]), UNKNOWN_IDENTITY);
    }

    #[test]
    fn pointer_advances_modulo_capacity() {
        tch::manual_seed(1);
        let mut q = NegativeQueue::new(4, 12, Device::Cpu);
        for k in 1..=7 {
            q.enqueue(&keys(3, 4)).unwrap();
            assert_eq!(q.pointer(), (k * 3) % 12);
        }
    }

    #[test]
    fn indivisible_batch_leaves_queue_untouched() {
        tch::manual_seed(2);
        let mut q = NegativeQueue::new(4, 10, Device::Cpu);
        let before = q.negatives();
        let err = q.enqueue(&keys(3, 4)).unwrap_err();
        assert!(matches!(err, TrainError::Config(ConfigError::QueueNotDivisible { .. })));
        assert_eq!(q.pointer(), 0);
        assert_eq!(max_abs_diff(&before, &q.negatives()), 0.0);
    }

    #[test]
    fn batch_larger_than_queue_is_rejected() {
        let mut q = NegativeQueue::new(4, 4, Device::Cpu);
        assert!(q.enqueue(&keys(8, 4)).is_err());
    }

    #[test]
    fn wrong_dimension_is_a_shape_error() {
        let mut q = NegativeQueue::new(4, 8, Device::Cpu);
        assert!(matches!(q.enqueue(&keys(4, 5)), Err(TrainError::Shape(_))));
    }

    #[test]
    fn snapshot_is_independent_of_later_writes() {
        tch::manual_seed(3);
        let mut q = NegativeQueue::new(4, 8, Device::Cpu);
        let snap = q.negatives();
        q.enqueue(&keys(4, 4)).unwrap();
        assert!(max_abs_diff(&snap, &q.negatives()) > 0.0);
    }

    #[test]
    fn identities_follow_their_keys() {
        let mut q = NegativeQueue::new(4, 8, Device::Cpu);
        q.enqueue_with_identities(&keys(4, 4), &Tensor::from_slice(&[5_i64, 6, 7, 8])).unwrap();
        let ids: Vec<i64> = Vec::<i64>::try_from(&q.identities()).unwrap();
        assert_eq!(ids, vec![5, 6, 7, 8, -1, -1, -1, -1]);

        q.enqueue(&keys(4, 4)).unwrap();
        q.enqueue(&keys(4, 4)).unwrap();
        let ids: Vec<i64> = Vec::<i64>::try_from(&q.identities()).unwrap();
        assert_eq!(ids, vec![-1; 8]);
    }

    #[test]
    fn identity_length_must_match_batch() {
        let mut q = NegativeQueue::new(4, 8, Device::Cpu);
        let err = q.enqueue_with_identities(&keys(4, 4), &Tensor::from_slice(&[1_i64, 2]));
        assert!(err.is_err());
        assert_eq!(q.pointer(), 0);
    }

    #[test]
    fn restore_rejects_out_of_range_pointer() {
        let mut q = NegativeQueue::new(4, 8, Device::Cpu);
        let [(_, buf), _, (_, ids)] = q.state_tensors();
        assert!(q.restore(&buf, 8, &ids).is_err());
        assert!(q.restore(&buf, 4, &ids).is_ok());
        assert_eq!(q.pointer(), 4);
    }
}
