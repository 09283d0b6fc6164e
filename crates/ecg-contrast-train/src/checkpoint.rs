//! Checkpoint layout and all-or-nothing restore helpers.
//!
//! A checkpoint is a directory:
//!
//! ```text
//! checkpoint_<epoch>/
//!   encoder.ot        query (or shared) encoder variables
//!   key_encoder.ot    key encoder variables          (momentum paradigms)
//!   queue.ot          queue, queue_ptr, queue_ids    (momentum paradigms)
//!   meta.json         epoch, optimizer steps, paradigm, full TrainingConfig
//! ```
//!
//! `meta.json` is written last, so a directory without it is an incomplete
//! checkpoint. Restores read every file into memory and validate names and
//! shapes against the live model before the first variable is overwritten.
//!
//! Of the optimizer only the step count is persisted; `tch` does not expose
//! Adam's moment estimates, so a resumed run rebuilds them from zero at the
//! configured learning rate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::{nn, Tensor};
use tracing::{debug, info};

use crate::config::{Paradigm, TrainingConfig};
use crate::error::{CheckpointError, TrainResult};

/// Query / shared encoder file name.
pub const ENCODER_FILE: &str = "encoder.ot";
/// Key encoder file name.
pub const KEY_ENCODER_FILE: &str = "key_encoder.ot";
/// Queue state file name.
pub const QUEUE_FILE: &str = "queue.ot";
/// Metadata file name.
pub const META_FILE: &str = "meta.json";

/// Directory name for the checkpoint written after `epoch` epochs.
pub fn checkpoint_path(root: &Path, epoch: usize) -> PathBuf {
    root.join(format!("checkpoint_{epoch}"))
}

/// The complete checkpoint under `root` with the highest epoch, if any.
pub fn latest_checkpoint(root: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let epoch: usize = name.strip_prefix("checkpoint_")?.parse().ok()?;
            let path = e.path();
            path.join(META_FILE).is_file().then_some((epoch, path))
        })
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, path)| path)
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Contents of `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Number of completed epochs.
    pub epoch: usize,
    /// Optimizer steps taken up to this checkpoint.
    #[serde(default)]
    pub optimizer_steps: u64,
    /// Paradigm the model was trained with.
    pub paradigm: Paradigm,
    /// Configuration of the run that wrote the checkpoint.
    pub config: TrainingConfig,
    /// Crate version that wrote the checkpoint.
    pub crate_version: String,
}

impl CheckpointMeta {
    /// Metadata for a checkpoint of `config` after `epoch` epochs.
    pub fn new(epoch: usize, config: &TrainingConfig) -> Self {
        CheckpointMeta {
            epoch,
            optimizer_steps: 0,
            paradigm: config.paradigm,
            config: config.clone(),
            crate_version: crate::VERSION.to_string(),
        }
    }

    /// The same metadata recording `steps` optimizer steps.
    pub fn with_optimizer_steps(mut self, steps: u64) -> Self {
        self.optimizer_steps = steps;
        self
    }

    /// Fail unless the stored model shape agrees with `current`.
    ///
    /// Checked: paradigm, the encoder fields of
    /// [`check_encoder_compatible`](Self::check_encoder_compatible) and, for
    /// momentum paradigms, queue size.
    pub fn check_compatible(&self, current: &TrainingConfig) -> Result<(), CheckpointError> {
        if self.paradigm != current.paradigm {
            return Err(CheckpointError::meta_mismatch("paradigm", self.paradigm, current.paradigm));
        }
        self.check_encoder_compatible(current)?;
        if current.paradigm.uses_queue() && self.config.queue_size != current.queue_size {
            return Err(CheckpointError::meta_mismatch(
                "queue_size",
                self.config.queue_size,
                current.queue_size,
            ));
        }
        Ok(())
    }

    /// Fail unless the stored encoder can be loaded into an encoder built
    /// from `current`: backbone, input channels and embedding dimension.
    pub fn check_encoder_compatible(&self, current: &TrainingConfig) -> Result<(), CheckpointError> {
        let stored = &self.config;
        if stored.backbone != current.backbone {
            return Err(CheckpointError::meta_mismatch("backbone", stored.backbone, current.backbone));
        }
        if stored.in_channels != current.in_channels {
            return Err(CheckpointError::meta_mismatch(
                "in_channels",
                stored.in_channels,
                current.in_channels,
            ));
        }
        if stored.embed_dim != current.embed_dim {
            return Err(CheckpointError::meta_mismatch("embed_dim", stored.embed_dim, current.embed_dim));
        }
        Ok(())
    }
}

/// Write `meta.json` into `dir`.
pub fn write_meta(dir: &Path, meta: &CheckpointMeta) -> TrainResult<()> {
    let path = dir.join(META_FILE);
    let json = serde_json::to_string_pretty(meta)?;
    std::fs::write(&path, json).map_err(|source| CheckpointError::Io { path, source })?;
    Ok(())
}

/// Read `meta.json` from `dir`.
pub fn read_meta(dir: &Path) -> TrainResult<CheckpointMeta> {
    let path = dir.join(META_FILE);
    if !path.is_file() {
        return Err(CheckpointError::MissingFile { path }.into());
    }
    let json = std::fs::read_to_string(&path).map_err(|source| CheckpointError::Io { path, source })?;
    Ok(serde_json::from_str(&json)?)
}

/// Create `dir` (and parents).
pub fn create_dir(dir: &Path) -> Result<(), CheckpointError> {
    std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io { path: dir.to_path_buf(), source })
}

// ---------------------------------------------------------------------------
// Tensor files
// ---------------------------------------------------------------------------

/// Named tensors read from one checkpoint file.
#[derive(Debug)]
pub struct TensorFile {
    path: PathBuf,
    tensors: HashMap<String, Tensor>,
}

impl TensorFile {
    /// Load every tensor of `path` into memory.
    pub fn read(path: &Path) -> TrainResult<Self> {
        if !path.is_file() {
            return Err(CheckpointError::MissingFile { path: path.to_path_buf() }.into());
        }
        let tensors = Tensor::load_multi(path)?.into_iter().collect();
        debug!("read {}", path.display());
        Ok(TensorFile { path: path.to_path_buf(), tensors })
    }

    /// Write `named` tensors to `path`.
    pub fn write(path: &Path, named: &[(&str, Tensor)]) -> TrainResult<()> {
        Tensor::save_multi(named, path)?;
        Ok(())
    }

    /// The tensor called `name`.
    pub fn tensor(&self, name: &str) -> Result<&Tensor, CheckpointError> {
        self.tensors.get(name).ok_or_else(|| CheckpointError::MissingTensor {
            name: name.to_string(),
            path: self.path.clone(),
        })
    }

    /// Check that every variable of `vs` is present with the same shape.
    pub fn check_var_store(&self, vs: &nn::VarStore) -> Result<(), CheckpointError> {
        self.check_variables(vs, |_| true)
    }

    /// Check that every variable of `vs` whose name starts with `prefix` is
    /// present with the same shape. Other variables may be absent, but any
    /// that are stored must still match.
    pub fn check_var_store_prefix(&self, vs: &nn::VarStore, prefix: &str) -> Result<(), CheckpointError> {
        self.check_variables(vs, |name| name.starts_with(prefix))
    }

    fn check_variables<F>(&self, vs: &nn::VarStore, required: F) -> Result<(), CheckpointError>
    where
        F: Fn(&str) -> bool,
    {
        for (name, var) in vs.variables() {
            match self.tensors.get(&name) {
                Some(stored) if stored.size() != var.size() => {
                    return Err(CheckpointError::ShapeMismatch {
                        name,
                        path: self.path.clone(),
                        expected: var.size(),
                        found: stored.size(),
                    });
                }
                None if required(&name) => {
                    return Err(CheckpointError::MissingTensor { name, path: self.path.clone() });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Copy every stored tensor that names a variable of `vs` into it.
    ///
    /// Returns how many variables were written. Call one of the check
    /// methods first; this does not validate shapes.
    pub fn copy_into(&self, vs: &nn::VarStore) -> usize {
        let mut copied = 0;
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if let Some(stored) = self.tensors.get(&name) {
                    var.copy_(stored);
                    copied += 1;
                }
            }
        });
        copied
    }
}

/// Save every variable of `vs` to `path`.
pub fn save_var_store(vs: &nn::VarStore, path: &Path) -> TrainResult<()> {
    vs.save(path)?;
    info!("saved {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
