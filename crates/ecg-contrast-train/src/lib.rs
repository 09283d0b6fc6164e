//! # ECG Contrastive Pre-training
//!
//! This crate learns fixed-length representations of ECG segments without
//! labels, using contrastive self-supervision, and fine-tunes a classifier on
//! top. It includes configuration management, view augmentation, signal
//! encoders, the momentum encoder pair and negative queue, the contrastive
//! losses, checkpointing, and the training loop orchestrator.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► Trainer ──► ContrastiveModel
//!       │               │            │
//!       │           DataLoader       ├── MultiViewProjector ── SignalEncoder
//!       │               │            ├── MomentumPair + NegativeQueue (moco, mcp)
//!       │         EcgDataset         └── LossEngine
//!       │               │
//!       │         augment::ViewAugmentor
//!       │
//!       └──► checkpoint / metrics
//! ```
//!
//! ## Paradigms
//!
//! | Paradigm       | Encoders        | Positives                               |
//! |----------------|-----------------|-----------------------------------------|
//! | `plain`/`simclr` | shared        | the other view of the same sample       |
//! | `cmsc`         | shared          | views of any sample of the same patient |
//! | `moco`         | query + EMA key | the key of the same sample              |
//! | `patient-moco` | query + EMA key | keys (batch and queue) of the patient   |
//! | `hierarchical` | shared          | every view pair within each level       |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ecg_contrast_train::config::{Paradigm, TrainingConfig};
//! use ecg_contrast_train::dataset::{SyntheticEcgConfig, SyntheticEcgDataset};
//! use ecg_contrast_train::trainer::Trainer;
//!
//! let mut config = TrainingConfig::default();
//! config.paradigm = Paradigm::Cmsc;
//! config.num_epochs = 1;
//!
//! let dataset = SyntheticEcgDataset::new(32, 4, SyntheticEcgConfig::default());
//! let mut trainer = Trainer::new(config).expect("valid config");
//! let summary = trainer.run(&dataset).expect("training runs");
//! println!("best loss: {:?}", summary.best_loss);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod momentum;
pub mod projector;
pub mod queue;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::{Backbone, Paradigm, TrainingConfig};
pub use dataset::{DataLoader, EcgDataset, EcgSample, InMemoryEcgDataset, SyntheticEcgConfig, SyntheticEcgDataset};
pub use encoder::{Encoder, SignalEncoder};
pub use error::{ConfigError, DatasetError, ShapeError, TrainError, TrainResult};
pub use losses::{LossEngine, LossOutput, TEMPERATURE};
pub use model::{ContrastiveModel, SupervisedModel};
pub use momentum::MomentumPair;
pub use projector::{MultiViewProjector, ProjectorOutput};
pub use queue::NegativeQueue;
pub use trainer::Trainer;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
