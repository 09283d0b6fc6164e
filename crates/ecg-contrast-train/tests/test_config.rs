//! Integration tests for [`ecg_contrast_train::config`].
//!
//! All tests are deterministic: they use only fixed values and the
//! `TrainingConfig::default()` constructor.

use ecg_contrast_train::config::{Backbone, Paradigm, TrainingConfig};
use ecg_contrast_train::error::ConfigError;
use tempfile::tempdir;

// ---------------------------------------------------------------------------
// Default config invariants
// ---------------------------------------------------------------------------

/// The default configuration must pass its own validation.
#[test]
fn default_config_is_valid() {
    let cfg = TrainingConfig::default();
    cfg.validate().expect("default TrainingConfig must be valid");
}

/// Every paradigm is valid with the default shapes, as long as the view
/// count matches.
#[test]
fn every_paradigm_validates_with_defaults() {
    for paradigm in Paradigm::ALL {
        let cfg = TrainingConfig { paradigm, ..TrainingConfig::default() };
        cfg.validate()
            .unwrap_or_else(|e| panic!("{paradigm} should validate: {e}"));
    }
}

/// Momentum and queue defaults match the reference setup.
#[test]
fn default_queue_settings() {
    let cfg = TrainingConfig::default();
    assert_eq!(cfg.embed_dim, 256);
    assert_eq!(cfg.queue_size, 16384);
    assert!((cfg.momentum - 0.999).abs() < 1e-12);
    assert_eq!(cfg.queue_size % cfg.batch_size, 0);
}

// ---------------------------------------------------------------------------
// Queue divisibility
// ---------------------------------------------------------------------------

/// A queue that whole batches cannot fill is a fatal configuration error for
/// the queue paradigms.
#[test]
fn indivisible_queue_is_rejected_for_momentum_paradigms() {
    for paradigm in [Paradigm::Moco, Paradigm::PatientMoco] {
        let cfg = TrainingConfig { paradigm, queue_size: 1000, batch_size: 256, ..TrainingConfig::default() };
        match cfg.validate() {
            Err(ConfigError::QueueNotDivisible { queue_size, batch_size }) => {
                assert_eq!(queue_size, 1000);
                assert_eq!(batch_size, 256);
            }
            other => panic!("expected QueueNotDivisible for {paradigm}, got {other:?}"),
        }
    }
}

/// Paradigms without a queue ignore the queue size.
#[test]
fn indivisible_queue_is_ignored_without_queue() {
    let cfg = TrainingConfig {
        paradigm: Paradigm::Cmsc,
        queue_size: 1000,
        batch_size: 256,
        ..TrainingConfig::default()
    };
    cfg.validate().expect("cmsc has no queue");
}

/// `momentum` must lie strictly inside (0, 1).
#[test]
fn momentum_bounds_are_exclusive() {
    for m in [0.0, 1.0, -0.5, 1.5] {
        let cfg = TrainingConfig { paradigm: Paradigm::Moco, momentum: m, ..TrainingConfig::default() };
        assert!(cfg.validate().is_err(), "momentum {m} must be rejected");
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Two-view paradigms reject any other view count.
#[test]
fn two_view_paradigms_reject_three_views() {
    let cfg = TrainingConfig { paradigm: Paradigm::Simclr, num_views: 3, ..TrainingConfig::default() };
    assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field: "num_views", .. })));
}

/// The hierarchical paradigm accepts more than two views per level.
#[test]
fn hierarchical_accepts_many_views() {
    let cfg = TrainingConfig {
        paradigm: Paradigm::Hierarchical,
        num_views: 4,
        num_levels: 3,
        ..TrainingConfig::default()
    };
    cfg.validate().expect("4 views x 3 levels is valid");
}

/// A segment longer than the recording is rejected.
#[test]
fn segment_longer_than_window_is_rejected() {
    let cfg = TrainingConfig { segment_len: 3000, ..TrainingConfig::default() };
    assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field: "segment_len", .. })));
}

// ---------------------------------------------------------------------------
// Names and JSON
// ---------------------------------------------------------------------------

/// Paradigm and backbone names parse, and unknown names are errors.
#[test]
fn names_parse() {
    assert_eq!("cmsc".parse::<Paradigm>().unwrap(), Paradigm::Cmsc);
    assert_eq!("mcp".parse::<Paradigm>().unwrap(), Paradigm::PatientMoco);
    assert_eq!("comet".parse::<Paradigm>().unwrap(), Paradigm::Hierarchical);
    assert_eq!("res20".parse::<Backbone>().unwrap(), Backbone::Res20);
    assert!(matches!("byol".parse::<Paradigm>(), Err(ConfigError::UnknownParadigm(_))));
    assert!(matches!("vit".parse::<Backbone>(), Err(ConfigError::UnknownBackbone(_))));
}

/// Display output parses back to the same paradigm.
#[test]
fn paradigm_display_parses_back() {
    for paradigm in Paradigm::ALL {
        assert_eq!(paradigm.to_string().parse::<Paradigm>().unwrap(), paradigm);
    }
}

/// A config written to JSON loads back with the same values.
#[test]
fn json_round_trip_preserves_fields() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested/run.json");
    let cfg = TrainingConfig {
        paradigm: Paradigm::PatientMoco,
        backbone: Backbone::Res20,
        queue_size: 4096,
        batch_size: 128,
        seed: 7,
        ..TrainingConfig::default()
    };
    cfg.to_json(&path).unwrap();

    let loaded = TrainingConfig::from_json(&path).unwrap();
    assert_eq!(loaded.paradigm, Paradigm::PatientMoco);
    assert_eq!(loaded.backbone, Backbone::Res20);
    assert_eq!(loaded.queue_size, 4096);
    assert_eq!(loaded.batch_size, 128);
    assert_eq!(loaded.seed, 7);
}

/// Loading validates: an invalid config on disk is rejected.
#[test]
fn from_json_validates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    let cfg = TrainingConfig { paradigm: Paradigm::Moco, queue_size: 100, batch_size: 64, ..TrainingConfig::default() };
    cfg.to_json(&path).unwrap();
    assert!(matches!(TrainingConfig::from_json(&path), Err(ConfigError::QueueNotDivisible { .. })));
}

/// Missing and malformed files map to distinct errors.
#[test]
fn from_json_file_errors() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        TrainingConfig::from_json(&dir.path().join("absent.json")),
        Err(ConfigError::FileRead { .. })
    ));

    let path = dir.path().join("garbage.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(TrainingConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
}
