//! Error types for the ECG contrastive pre-training pipeline.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline, keeping the error hierarchy
//! centralised and consistent.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError      (config validation / file loading, queue divisibility)
//! ├── DatasetError     (sample access, invalid signals, augmentation)
//! ├── ShapeError       (view count / rank / embedding dimension mismatches)
//! ├── CheckpointError  (save / restore of encoders and the negative queue)
//! └── tch::TchError    (libtorch failures)
//! ```
//!
//! Configuration and shape errors are fatal: they are raised before any
//! training step mutates model state and are never retried.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError
// ---------------------------------------------------------------------------

/// Top-level error type for the contrastive training pipeline.
///
/// Orchestration-level functions (e.g. [`crate::trainer::Trainer`] and
/// [`crate::model::ContrastiveModel`] methods) return `TrainResult<T>`.
/// Lower-level functions return their own module-specific error types which
/// are automatically coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset access or augmentation error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A tensor did not have the shape a component expects.
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    /// A checkpoint could not be saved or restored.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An error reported by libtorch.
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The dataset is empty and no training can be performed.
    #[error("Dataset is empty")]
    EmptyDataset,

    /// An identity-aware paradigm was invoked without identity labels.
    #[error("Paradigm `{paradigm}` requires per-sample identity labels")]
    MissingIdentities {
        /// Name of the paradigm that needed the labels.
        paradigm: String,
    },

    /// A training step failed.
    #[error("Training step failed: {0}")]
    TrainingStep(String),

    /// A log or output file could not be written.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl TrainError {
    /// Construct a [`TrainError::TrainingStep`].
    pub fn training_step<S: Into<String>>(msg: S) -> Self {
        TrainError::TrainingStep(msg.into())
    }

    /// Construct a [`TrainError::MissingIdentities`].
    pub fn missing_identities<S: Into<String>>(paradigm: S) -> Self {
        TrainError::MissingIdentities { paradigm: paradigm.into() }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`TrainingConfig`].
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// The paradigm selector names no known contrastive method.
    #[error("Unknown contrastive paradigm `{0}`")]
    UnknownParadigm(String),

    /// The backbone selector names no known encoder network.
    #[error("Unknown backbone network `{0}`")]
    UnknownBackbone(String),

    /// The negative queue cannot be filled by whole batches.
    #[error("queue_size {queue_size} is not divisible by batch size {batch_size}")]
    QueueNotDivisible {
        /// Capacity of the negative queue.
        queue_size: usize,
        /// Enqueue batch size.
        batch_size: usize,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while accessing or augmenting dataset samples.
///
/// Invalid samples (NaN-contaminated or all-zero recordings) are reported
/// through [`DatasetError::InvalidSignal`]; the [`DataLoader`] skips them
/// with a warning instead of aborting the epoch.
///
/// [`DataLoader`]: crate::dataset::DataLoader
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the dataset.
        len: usize,
    },

    /// The recording contains NaN values or is identically zero.
    #[error("Record `{record}` is unusable: {reason}")]
    InvalidSignal {
        /// Record identifier.
        record: String,
        /// Why the signal was rejected.
        reason: String,
    },

    /// The requested segment is longer than the recording.
    #[error("Segment length {segment_len} exceeds signal length {signal_len}")]
    SegmentTooLong {
        /// Requested segment length in samples.
        segment_len: usize,
        /// Available signal length in samples.
        signal_len: usize,
    },

    /// Samples in one batch do not share a common view shape.
    #[error("Ragged batch: sample {index} has view shape {found:?}, expected {expected:?}")]
    RaggedBatch {
        /// Position of the offending sample inside the batch.
        index: usize,
        /// Shape of the first sample's views.
        expected: Vec<usize>,
        /// Shape of the offending sample's views.
        found: Vec<usize>,
    },

    /// A batch with no samples was handed to collation.
    #[error("Cannot collate an empty batch")]
    EmptyBatch,
}

impl DatasetError {
    /// Construct a [`DatasetError::InvalidSignal`].
    pub fn invalid_signal<S: Into<String>, R: Into<String>>(record: S, reason: R) -> Self {
        DatasetError::InvalidSignal { record: record.into(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// ShapeError
// ---------------------------------------------------------------------------

/// A tensor handed to the projector, queue, or loss engine has the wrong shape.
#[derive(Debug, Error)]
pub enum ShapeError {
    /// The batch carries a different number of views than the paradigm uses.
    #[error("{paradigm} expects {expected} views, got {actual}")]
    ViewCount {
        /// Paradigm name.
        paradigm: String,
        /// Human-readable expectation (`"2"`, `">= 2"`).
        expected: String,
        /// Number of views present in the batch.
        actual: i64,
    },

    /// A hierarchical batch carries no levels.
    #[error("{paradigm} expects at least {expected} level(s), got {actual}")]
    LevelCount {
        /// Paradigm name.
        paradigm: String,
        /// Minimum number of levels.
        expected: i64,
        /// Number of levels present.
        actual: i64,
    },

    /// The tensor rank differs from what the component accepts.
    #[error("{what}: expected a rank-{expected} tensor, got shape {actual:?}")]
    Rank {
        /// What was being checked.
        what: &'static str,
        /// Expected rank.
        expected: usize,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// Two tensors that must agree on a dimension do not.
    #[error("{what}: expected shape {expected:?}, got {actual:?}")]
    Mismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },
}

impl ShapeError {
    /// Construct a [`ShapeError::Mismatch`].
    pub fn mismatch(what: &'static str, expected: Vec<i64>, actual: Vec<i64>) -> Self {
        ShapeError::Mismatch { what, expected, actual }
    }

    /// Construct a [`ShapeError::Rank`] when `tensor` does not have `rank`
    /// dimensions, or `Ok(())` otherwise.
    pub fn check_rank(what: &'static str, tensor: &tch::Tensor, rank: usize) -> Result<(), Self> {
        if tensor.dim() == rank {
            Ok(())
        } else {
            Err(ShapeError::Rank { what, expected: rank, actual: tensor.size() })
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors produced while persisting or restoring model state.
///
/// A restore either succeeds completely or leaves the model untouched; every
/// mismatch is detected before the first tensor is copied.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A file that every checkpoint must contain is absent.
    #[error("Checkpoint file `{path}` is missing")]
    MissingFile {
        /// The missing path.
        path: PathBuf,
    },

    /// A named tensor expected in a checkpoint file is absent.
    #[error("Tensor `{name}` not found in `{path}`")]
    MissingTensor {
        /// Tensor name.
        name: String,
        /// File that was searched.
        path: PathBuf,
    },

    /// A stored tensor does not match the shape of the live model.
    #[error("Tensor `{name}` in `{path}` has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// File the tensor came from.
        path: PathBuf,
        /// Shape in the live model.
        expected: Vec<i64>,
        /// Shape stored on disk.
        found: Vec<i64>,
    },

    /// The checkpoint was written for a different model configuration.
    #[error("Checkpoint metadata mismatch for `{field}`: stored {stored}, current {current}")]
    MetaMismatch {
        /// Field that differs.
        field: &'static str,
        /// Value stored in the checkpoint.
        stored: String,
        /// Value of the current configuration.
        current: String,
    },

    /// An I/O error while reading or writing checkpoint files.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    /// Construct a [`CheckpointError::MetaMismatch`].
    pub fn meta_mismatch(
        field: &'static str,
        stored: impl ToString,
        current: impl ToString,
    ) -> Self {
        CheckpointError::MetaMismatch {
            field,
            stored: stored.to_string(),
            current: current.to_string(),
        }
    }
}
