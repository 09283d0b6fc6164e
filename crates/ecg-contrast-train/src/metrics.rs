//! Training and evaluation metrics.
//!
//! - [`LossMeter`]: sample-weighted running mean of batch losses.
//! - [`AccuracyMeter`]: fraction of correct class predictions over an epoch.
//! - [`EpochStats`]: one epoch's aggregated numbers, for logging.
//!
//! Meters are fed once per mini-batch and read at the end of the epoch.

use tch::Tensor;

// ---------------------------------------------------------------------------
// EpochStats
// ---------------------------------------------------------------------------

/// Aggregated numbers for one training or evaluation epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Sample-weighted mean loss.
    pub mean_loss: f64,
    /// Number of optimizer (or evaluation) steps.
    pub num_batches: usize,
    /// Number of samples seen.
    pub num_samples: usize,
    /// Classification accuracy, for supervised epochs.
    pub accuracy: Option<f64>,
}

impl EpochStats {
    /// `true` when this epoch's loss is strictly lower than `other`'s.
    pub fn is_better_than(&self, other: &EpochStats) -> bool {
        self.mean_loss < other.mean_loss
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        let acc = match self.accuracy {
            Some(a) => format!("  acc={a:.4}"),
            None => String::new(),
        };
        format!(
            "epoch {:>4}  loss={:.6}{acc}  (n_batches={}  n_samples={})",
            self.epoch, self.mean_loss, self.num_batches, self.num_samples
        )
    }
}

// ---------------------------------------------------------------------------
// LossMeter
// ---------------------------------------------------------------------------

/// Running mean of per-batch losses, weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    weighted_sum: f64,
    num_samples: usize,
    num_batches: usize,
}

impl LossMeter {
    /// Empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mean loss of a batch of `batch_size` samples.
    ///
    /// Non-finite losses are ignored.
    pub fn update(&mut self, loss: f64, batch_size: usize) {
        if !loss.is_finite() || batch_size == 0 {
            return;
        }
        self.weighted_sum += loss * batch_size as f64;
        self.num_samples += batch_size;
        self.num_batches += 1;
    }

    /// Mean over all recorded samples, `None` before the first update.
    pub fn mean(&self) -> Option<f64> {
        (self.num_samples > 0).then(|| self.weighted_sum / self.num_samples as f64)
    }

    /// Number of recorded batches.
    pub fn count(&self) -> usize {
        self.num_batches
    }

    /// Number of recorded samples.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Clear the meter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Accuracy
// ---------------------------------------------------------------------------

/// Number of rows of `logits` (`[B, classes]`) whose argmax equals `labels`.
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> usize {
    tch::no_grad(|| {
        let preds = logits.argmax(-1, false);
        preds.eq_tensor(&labels.to_device(preds.device())).sum(tch::Kind::Int64).int64_value(&[])
    }) as usize
}

/// Fraction of rows of `logits` whose argmax equals `labels`. An empty batch
/// has accuracy 0.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> f64 {
    let n = labels.numel();
    if n == 0 {
        return 0.0;
    }
    correct_predictions(logits, labels) as f64 / n as f64
}

/// Running classification accuracy across an epoch.
#[derive(Debug, Clone, Default)]
pub struct AccuracyMeter {
    correct: usize,
    total: usize,
}

impl AccuracyMeter {
    /// Empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch.
    pub fn update(&mut self, logits: &Tensor, labels: &Tensor) {
        self.correct += correct_predictions(logits, labels);
        self.total += labels.numel();
    }

    /// Accuracy so far, `None` before the first sample.
    pub fn finalize(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }

    /// Number of samples seen.
    pub fn num_samples(&self) -> usize {
        self.total
    }

    /// Clear the meter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
