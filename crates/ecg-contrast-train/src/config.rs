//! Training configuration for ECG contrastive pre-training.
//!
//! [`TrainingConfig`] is the single source of truth for every hyper-parameter,
//! signal shape, queue setting, and infrastructure option used throughout the
//! pipeline. It is serializable via [`serde`] so it can be stored next to
//! checkpoints and restored from JSON files.
//!
//! # Example
//!
//! ```rust
//! use ecg_contrast_train::config::{Paradigm, TrainingConfig};
//!
//! let mut cfg = TrainingConfig::default();
//! cfg.paradigm = Paradigm::Moco;
//! cfg.validate().expect("default MoCo config is valid");
//!
//! assert_eq!(cfg.embed_dim, 256);
//! assert_eq!(cfg.queue_size % cfg.batch_size, 0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Paradigm
// ---------------------------------------------------------------------------

/// The contrastive method used for pre-training.
///
/// Names parse from the kebab-case forms below as well as the short names of
/// the published methods (`cmsc`, `mcp`, `comet`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Paradigm {
    /// Two-view contrastive learning scored with the SimCLR-style loss.
    #[serde(alias = "contrastive")]
    PlainContrastive,
    /// SimCLR: cross-view positives, cross- and within-view negatives.
    Simclr,
    /// Contrastive multi-segment coding: same-patient pairs are positives.
    Cmsc,
    /// Momentum contrast with a negative queue.
    Moco,
    /// Patient-specific momentum contrast (MCP).
    #[serde(alias = "mcp")]
    PatientMoco,
    /// Hierarchical multi-level contrast (COMET-style).
    #[serde(alias = "comet")]
    Hierarchical,
}

impl Paradigm {
    /// All paradigms, in a stable order.
    pub const ALL: [Paradigm; 6] = [
        Paradigm::PlainContrastive,
        Paradigm::Simclr,
        Paradigm::Cmsc,
        Paradigm::Moco,
        Paradigm::PatientMoco,
        Paradigm::Hierarchical,
    ];

    /// Canonical kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Paradigm::PlainContrastive => "plain-contrastive",
            Paradigm::Simclr => "simclr",
            Paradigm::Cmsc => "cmsc",
            Paradigm::Moco => "moco",
            Paradigm::PatientMoco => "patient-moco",
            Paradigm::Hierarchical => "hierarchical",
        }
    }

    /// `true` for the momentum paradigms that own a key encoder and a queue.
    pub fn uses_queue(&self) -> bool {
        matches!(self, Paradigm::Moco | Paradigm::PatientMoco)
    }

    /// `true` for the paradigms whose loss needs per-sample identity labels.
    pub fn uses_identities(&self) -> bool {
        matches!(self, Paradigm::Cmsc | Paradigm::PatientMoco)
    }

    /// `true` when batches carry an extra level axis.
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Paradigm::Hierarchical)
    }

    /// Exact number of views per sample, or `None` when any count `>= 2`
    /// is accepted (hierarchical paradigm).
    pub fn expected_views(&self) -> Option<i64> {
        match self {
            Paradigm::Hierarchical => None,
            _ => Some(2),
        }
    }
}

impl fmt::Display for Paradigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Paradigm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "plain-contrastive" | "contrastive" | "plain" => Ok(Paradigm::PlainContrastive),
            "simclr" => Ok(Paradigm::Simclr),
            "cmsc" => Ok(Paradigm::Cmsc),
            "moco" => Ok(Paradigm::Moco),
            "patient-moco" | "mcp" => Ok(Paradigm::PatientMoco),
            "hierarchical" | "comet" => Ok(Paradigm::Hierarchical),
            _ => Err(ConfigError::UnknownParadigm(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

/// Encoder network architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    /// Three convolutional blocks followed by global pooling.
    Cnn3,
    /// Residual 1-D network with three stages.
    Res20,
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backbone::Cnn3 => "cnn3",
            Backbone::Res20 => "res20",
        })
    }
}

impl FromStr for Backbone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cnn3" => Ok(Backbone::Cnn3),
            "res20" => Ok(Backbone::Res20),
            _ => Err(ConfigError::UnknownBackbone(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a contrastive pre-training (or fine-tuning) run.
///
/// Defaults follow the reference ECG setup: 10 s single-lead recordings at
/// 250 Hz cropped into two 5 s views, a 256-dimensional embedding, and a
/// 16384-entry negative queue for the momentum paradigms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data / Signal
    // -----------------------------------------------------------------------
    /// Number of ECG leads fed to the encoder. Default: **1**.
    pub in_channels: usize,

    /// Length of each raw recording in samples. Default: **2500**.
    pub window_len: usize,

    /// Length of each augmented view (random crop). Default: **1250**.
    pub segment_len: usize,

    /// Views per sample (per level for the hierarchical paradigm). Default: **2**.
    pub num_views: usize,

    /// Levels per sample for the hierarchical paradigm. Default: **2**.
    pub num_levels: usize,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Contrastive method. Default: **cmsc**.
    pub paradigm: Paradigm,

    /// Encoder architecture. Default: **cnn3**.
    pub backbone: Backbone,

    /// Embedding dimensionality produced by the encoder. Default: **256**.
    pub embed_dim: usize,

    /// Capacity of the negative queue (momentum paradigms). Default: **16384**.
    pub queue_size: usize,

    /// Momentum coefficient `m` of the key-encoder moving average. Default: **0.999**.
    pub momentum: f64,

    /// Number of classes for supervised fine-tuning. Default: **4**.
    pub num_classes: usize,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Mini-batch size. Default: **256**.
    pub batch_size: usize,

    /// Adam learning rate. Default: **1e-4**.
    pub learning_rate: f64,

    /// Total number of training epochs. Default: **400**.
    pub num_epochs: usize,

    // -----------------------------------------------------------------------
    // Checkpointing / logging
    // -----------------------------------------------------------------------
    /// Save a checkpoint every N epochs. Default: **10**.
    pub checkpoint_every: usize,

    /// Directory where checkpoints are written.
    pub checkpoint_dir: PathBuf,

    /// Directory where per-epoch loss logs are written.
    pub log_dir: PathBuf,

    // -----------------------------------------------------------------------
    // Device
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    // -----------------------------------------------------------------------
    // Reproducibility
    // -----------------------------------------------------------------------
    /// Seed for torch, the loader shuffle, and view augmentation. Default: **42**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            // Data
            in_channels: 1,
            window_len: 2500,
            segment_len: 1250,
            num_views: 2,
            num_levels: 2,
            // Model
            paradigm: Paradigm::Cmsc,
            backbone: Backbone::Cnn3,
            embed_dim: 256,
            queue_size: 16384,
            momentum: 0.999,
            num_classes: 4,
            // Optimisation
            batch_size: 256,
            learning_rate: 1e-4,
            num_epochs: 400,
            // Checkpointing
            checkpoint_every: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            // Device
            use_gpu: false,
            gpu_device_id: 0,
            // Reproducibility
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any
    /// validation error from [`TrainingConfig::validate`].
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// The torch device selected by `use_gpu` / `gpu_device_id`.
    ///
    /// Falls back to CPU when CUDA is not available.
    pub fn device(&self) -> tch::Device {
        if self.use_gpu && tch::Cuda::is_available() {
            tch::Device::Cuda(self.gpu_device_id)
        } else {
            tch::Device::Cpu
        }
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - Channel count, lengths, embedding dimension and batch size are non-zero.
    /// - `segment_len <= window_len`.
    /// - `num_views` is exactly 2, except for the hierarchical paradigm which
    ///   accepts any count `>= 2` and needs `num_levels >= 1`.
    /// - For momentum paradigms: `queue_size > 0`, `momentum ∈ (0, 1)` and
    ///   `queue_size % batch_size == 0`.
    /// - `learning_rate > 0`, `num_epochs > 0`, `checkpoint_every > 0`,
    ///   `num_classes >= 2`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.in_channels == 0 {
            return Err(ConfigError::invalid_value("in_channels", "must be > 0"));
        }
        if self.window_len == 0 {
            return Err(ConfigError::invalid_value("window_len", "must be > 0"));
        }
        if self.segment_len == 0 {
            return Err(ConfigError::invalid_value("segment_len", "must be > 0"));
        }
        if self.segment_len > self.window_len {
            return Err(ConfigError::invalid_value(
                "segment_len",
                format!("must be <= window_len ({})", self.window_len),
            ));
        }

        // Views
        match self.paradigm.expected_views() {
            Some(n) if self.num_views as i64 != n => {
                return Err(ConfigError::invalid_value(
                    "num_views",
                    format!("{} uses exactly {n} views", self.paradigm),
                ));
            }
            None if self.num_views < 2 => {
                return Err(ConfigError::invalid_value(
                    "num_views",
                    "hierarchical contrast needs at least 2 views per level",
                ));
            }
            _ => {}
        }
        if self.paradigm.is_hierarchical() && self.num_levels == 0 {
            return Err(ConfigError::invalid_value("num_levels", "must be > 0"));
        }

        // Model
        if self.embed_dim == 0 {
            return Err(ConfigError::invalid_value("embed_dim", "must be > 0"));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 2"));
        }

        // Optimisation
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if self.num_epochs == 0 {
            return Err(ConfigError::invalid_value("num_epochs", "must be > 0"));
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::invalid_value("checkpoint_every", "must be > 0"));
        }

        // Queue / momentum
        if self.paradigm.uses_queue() {
            if self.queue_size == 0 {
                return Err(ConfigError::invalid_value("queue_size", "must be > 0"));
            }
            if !(self.momentum > 0.0 && self.momentum < 1.0) {
                return Err(ConfigError::invalid_value("momentum", "must be in (0.0, 1.0)"));
            }
            if self.queue_size % self.batch_size != 0 {
                return Err(ConfigError::QueueNotDivisible {
                    queue_size: self.queue_size,
                    batch_size: self.batch_size,
                });
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
