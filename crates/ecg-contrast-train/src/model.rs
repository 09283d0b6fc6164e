//! Top-level contrastive and supervised ECG models.
//!
//! # Architecture
//!
//! ```text
//!                      batch [B, N, C, S] / [B, L, N, C, S]
//!                                   │
//!              ┌────────────────────┴────────────────────┐
//!              ▼                                         ▼
//!   Shared (plain, simclr, cmsc, comet)      Momentum (moco, mcp)
//!   MultiViewProjector ─▶ SignalEncoder     view 0 ─▶ query encoder
//!              │                            view 1 ─▶ EMA key encoder (shuffled)
//!              │                                      │
//!              │                              NegativeQueue snapshot, enqueue
//!              ▼                                         ▼
//!                          ProjectorOutput ─▶ LossEngine
//! ```
//!
//! The model owns every piece of mutable training state: the encoder(s), the
//! momentum pair and the negative queue. A forward pass takes `&mut self`,
//! so at most one step can touch the pair or the queue at a time.
//!
//! [`SupervisedModel`] puts a linear classifier on top of a [`SignalEncoder`]
//! for fine-tuning, optionally starting from a contrastive checkpoint.

use std::path::{Path, PathBuf};
use tch::{nn, nn::Module, Device, Kind, Tensor};
use tracing::info;

use crate::checkpoint::{
    self, CheckpointMeta, TensorFile, ENCODER_FILE, KEY_ENCODER_FILE, QUEUE_FILE,
};
use crate::config::{Paradigm, TrainingConfig};
use crate::encoder::{Encoder, SignalEncoder};
use crate::error::{CheckpointError, ShapeError, TrainError, TrainResult};
use crate::losses::{l2_normalize, LossEngine, LossOutput};
use crate::momentum::MomentumPair;
use crate::projector::{MomentumOutput, MultiViewProjector, ProjectorOutput};
use crate::queue::NegativeQueue;

// ---------------------------------------------------------------------------
// ContrastiveModel
// ---------------------------------------------------------------------------

enum Branch {
    Shared(SignalEncoder),
    Momentum {
        pair: MomentumPair<SignalEncoder>,
        queue: NegativeQueue,
    },
}

/// Contrastive pre-training model for one [`Paradigm`].
pub struct ContrastiveModel {
    branch: Branch,
    projector: MultiViewProjector,
    engine: LossEngine,
    config: TrainingConfig,
}

impl ContrastiveModel {
    /// Build a model for `config.paradigm` on `device`.
    ///
    /// # Errors
    ///
    /// Any [`TrainingConfig::validate`] failure, and torch errors while
    /// initialising the key encoder.
    pub fn new(config: &TrainingConfig, device: Device) -> TrainResult<Self> {
        config.validate()?;
        let paradigm = config.paradigm;

        let branch = if paradigm.uses_queue() {
            let query = SignalEncoder::from_config(config, device);
            let key = SignalEncoder::from_config(config, device);
            let pair = MomentumPair::new(query, key, config.momentum)?;
            let queue = NegativeQueue::new(config.embed_dim as i64, config.queue_size as i64, device);
            Branch::Momentum { pair, queue }
        } else {
            Branch::Shared(SignalEncoder::from_config(config, device))
        };

        let model = ContrastiveModel {
            branch,
            projector: MultiViewProjector::new(paradigm),
            engine: LossEngine::new(paradigm),
            config: config.clone(),
        };
        info!(
            paradigm = %paradigm,
            backbone = %config.backbone,
            parameters = model.encoder().num_parameters(),
            "built contrastive model"
        );
        Ok(model)
    }

    /// Paradigm this model trains.
    pub fn paradigm(&self) -> Paradigm {
        self.config.paradigm
    }

    /// Configuration the model was built from.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// The gradient-trained encoder (shared encoder or momentum query).
    pub fn encoder(&self) -> &SignalEncoder {
        match &self.branch {
            Branch::Shared(encoder) => encoder,
            Branch::Momentum { pair, .. } => pair.query(),
        }
    }

    /// The momentum key encoder, for momentum paradigms.
    pub fn key_encoder(&self) -> Option<&SignalEncoder> {
        match &self.branch {
            Branch::Shared(_) => None,
            Branch::Momentum { pair, .. } => Some(pair.key()),
        }
    }

    /// The negative queue, for momentum paradigms.
    pub fn queue(&self) -> Option<&NegativeQueue> {
        match &self.branch {
            Branch::Shared(_) => None,
            Branch::Momentum { queue, .. } => Some(queue),
        }
    }

    /// The loss engine used by [`loss`](Self::loss).
    pub fn engine(&self) -> &LossEngine {
        &self.engine
    }

    /// Store holding every trainable parameter (build the optimizer on this).
    pub fn var_store(&self) -> &nn::VarStore {
        self.encoder().var_store()
    }

    /// One forward pass.
    ///
    /// `identities` is a `[B]` `int64` tensor of interned record identities.
    /// It is required by the patient-aware momentum paradigm, and when given
    /// to a momentum paradigm it is recorded in the queue alongside the keys.
    ///
    /// For momentum paradigms every check (view layout, queue divisibility
    /// and pointer alignment, identity shape) runs before the key encoder is
    /// updated or the queue is written.
    pub fn forward(
        &mut self,
        batch: &Tensor,
        identities: Option<&Tensor>,
        train: bool,
    ) -> TrainResult<ProjectorOutput> {
        let paradigm = self.config.paradigm;
        match &mut self.branch {
            Branch::Shared(encoder) => self.projector.project(encoder, batch, train),
            Branch::Momentum { pair, queue } => {
                let (output, pending) =
                    momentum_forward(&self.projector, pair, queue, paradigm, batch, identities, train)?;
                pending.commit(queue)?;
                Ok(ProjectorOutput::Momentum(output))
            }
        }
    }

    /// Score `output` with this model's paradigm.
    pub fn loss(&self, output: &ProjectorOutput, identities: Option<&Tensor>) -> TrainResult<LossOutput> {
        self.engine.compute(output, identities)
    }

    /// Forward pass followed by the loss.
    ///
    /// For momentum paradigms the step is all or nothing: the keys are
    /// enqueued only once the loss is known to be finite, and on any error
    /// the key encoder is restored to its state before the call.
    ///
    /// # Errors
    ///
    /// Everything [`forward`](Self::forward) and [`loss`](Self::loss)
    /// report, and [`TrainError::TrainingStep`] when the loss is not finite.
    pub fn forward_loss(
        &mut self,
        batch: &Tensor,
        identities: Option<&Tensor>,
        train: bool,
    ) -> TrainResult<LossOutput> {
        let paradigm = self.config.paradigm;
        let engine = self.engine;
        match &mut self.branch {
            Branch::Shared(encoder) => {
                let output = self.projector.project(encoder, batch, train)?;
                finite(engine.compute(&output, identities)?)
            }
            Branch::Momentum { pair, queue } => {
                let saved = pair.snapshot_key();
                let step = momentum_forward(&self.projector, pair, queue, paradigm, batch, identities, train)
                    .and_then(|(output, pending)| {
                        let loss = finite(engine.compute(&ProjectorOutput::Momentum(output), identities)?)?;
                        pending.commit(queue)?;
                        Ok(loss)
                    });
                if step.is_err() {
                    pair.restore_key(&saved);
                }
                step
            }
        }
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    /// Write `checkpoint_<epoch>` under `root` and return its path.
    pub fn save(&self, root: &Path, epoch: usize) -> TrainResult<PathBuf> {
        self.save_with_meta(root, &CheckpointMeta::new(epoch, &self.config))
    }

    /// [`save`](Self::save) with caller-built metadata; the directory is
    /// named after `meta.epoch`.
    pub fn save_with_meta(&self, root: &Path, meta: &CheckpointMeta) -> TrainResult<PathBuf> {
        let dir = checkpoint::checkpoint_path(root, meta.epoch);
        checkpoint::create_dir(&dir)?;

        checkpoint::save_var_store(self.encoder().var_store(), &dir.join(ENCODER_FILE))?;
        if let Branch::Momentum { pair, queue } = &self.branch {
            checkpoint::save_var_store(pair.key().var_store(), &dir.join(KEY_ENCODER_FILE))?;
            TensorFile::write(&dir.join(QUEUE_FILE), &queue.state_tensors())?;
        }
        checkpoint::write_meta(&dir, meta)?;
        Ok(dir)
    }

    /// Restore the state saved in checkpoint directory `dir`.
    ///
    /// Every file is read and checked against this model before any variable
    /// or queue slot is overwritten; on error the model is unchanged.
    pub fn load(&mut self, dir: &Path) -> TrainResult<CheckpointMeta> {
        let meta = checkpoint::read_meta(dir)?;
        meta.check_compatible(&self.config)?;

        let encoder_file = TensorFile::read(&dir.join(ENCODER_FILE))?;
        encoder_file.check_var_store(self.encoder().var_store())?;

        match &mut self.branch {
            Branch::Shared(encoder) => {
                encoder_file.copy_into(encoder.var_store());
            }
            Branch::Momentum { pair, queue } => {
                let key_file = TensorFile::read(&dir.join(KEY_ENCODER_FILE))?;
                key_file.check_var_store(pair.key().var_store())?;

                let queue_path = dir.join(QUEUE_FILE);
                let queue_file = TensorFile::read(&queue_path)?;
                let stored = queue_file.tensor("queue")?;
                let stored_ids = queue_file.tensor("queue_ids")?;
                let ptr_tensor = queue_file.tensor("queue_ptr")?;
                if ptr_tensor.numel() != 1 {
                    return Err(CheckpointError::ShapeMismatch {
                        name: "queue_ptr".into(),
                        path: queue_path,
                        expected: vec![1],
                        found: ptr_tensor.size(),
                    }
                    .into());
                }
                let ptr = ptr_tensor.flatten(0, -1).int64_value(&[0]);
                queue.check_state(stored, ptr, stored_ids)?;

                encoder_file.copy_into(pair.query().var_store());
                key_file.copy_into(pair.key().var_store());
                queue.restore(stored, ptr, stored_ids)?;
            }
        }

        info!(epoch = meta.epoch, dir = %dir.display(), "restored checkpoint");
        Ok(meta)
    }
}

/// Keys of a momentum step that have not been written to the queue yet.
struct PendingEnqueue {
    keys: Tensor,
    ids: Option<Tensor>,
}

impl PendingEnqueue {
    fn commit(self, queue: &mut NegativeQueue) -> TrainResult<()> {
        match &self.ids {
            Some(ids) => queue.enqueue_with_identities(&self.keys, ids),
            None => queue.enqueue(&self.keys),
        }
    }
}

/// Query and momentum keys for `batch`, with the queue snapshot taken before
/// this step's keys are enqueued. Updates the key encoder; leaves the queue
/// untouched.
fn momentum_forward(
    projector: &MultiViewProjector,
    pair: &mut MomentumPair<SignalEncoder>,
    queue: &NegativeQueue,
    paradigm: Paradigm,
    batch: &Tensor,
    identities: Option<&Tensor>,
    train: bool,
) -> TrainResult<(MomentumOutput, PendingEnqueue)> {
    let (query_view, key_view) = projector.split_momentum(batch)?;
    let b = query_view.size()[0];
    queue.check_batch_size(b)?;

    let ids = match identities {
        Some(ids) if ids.size() != [b] => {
            return Err(ShapeError::mismatch("identities", vec![b], ids.size()).into());
        }
        Some(ids) => Some(ids.to_device(queue.device()).to_kind(Kind::Int64)),
        None if paradigm.uses_identities() => {
            return Err(TrainError::missing_identities(paradigm.as_str()));
        }
        None => None,
    };

    let query = l2_normalize(&pair.query().encode(&query_view, train), 1);
    let keys = l2_normalize(&pair.momentum_keys(&key_view, train)?, 1);

    let output = MomentumOutput {
        query,
        keys: keys.shallow_clone(),
        negatives: queue.negatives(),
        queue_ids: queue.identities(),
    };
    Ok((output, PendingEnqueue { keys, ids }))
}

/// Reject a loss whose value is NaN or infinite.
fn finite(output: LossOutput) -> TrainResult<LossOutput> {
    let value = output.value();
    if value.is_finite() {
        Ok(output)
    } else {
        Err(TrainError::training_step(format!("loss is {value}")))
    }
}

// ---------------------------------------------------------------------------
// SupervisedModel
// ---------------------------------------------------------------------------

/// Encoder plus a linear classification head.
///
/// The head lives under `classifier` in the encoder's own [`nn::VarStore`],
/// so a single optimizer covers both.
pub struct SupervisedModel {
    encoder: SignalEncoder,
    head: nn::Linear,
    num_classes: i64,
}

impl SupervisedModel {
    /// Randomly initialised classifier for `config`.
    pub fn new(config: &TrainingConfig, device: Device) -> Self {
        let encoder = SignalEncoder::from_config(config, device);
        let num_classes = config.num_classes as i64;
        let head = nn::linear(
            encoder.var_store().root() / "classifier",
            encoder.embed_dim(),
            num_classes,
            Default::default(),
        );
        SupervisedModel { encoder, head, num_classes }
    }

    /// Classifier whose encoder starts from the contrastive checkpoint `dir`.
    pub fn from_pretrained(config: &TrainingConfig, dir: &Path, device: Device) -> TrainResult<Self> {
        let mut model = Self::new(config, device);
        model.load_encoder(dir, config)?;
        Ok(model)
    }

    /// Overwrite the encoder with the query/shared encoder of checkpoint
    /// `dir`. The classifier head is left as is.
    ///
    /// Returns the number of variables loaded.
    pub fn load_encoder(&mut self, dir: &Path, config: &TrainingConfig) -> TrainResult<usize> {
        let meta = checkpoint::read_meta(dir)?;
        meta.check_encoder_compatible(config)?;

        let file = TensorFile::read(&dir.join(ENCODER_FILE))?;
        file.check_var_store_prefix(self.encoder.var_store(), "encoder.")?;
        let loaded = file.copy_into(self.encoder.var_store());
        info!(loaded, from = %dir.display(), "loaded pre-trained encoder");
        Ok(loaded)
    }

    /// The encoder.
    pub fn encoder(&self) -> &SignalEncoder {
        &self.encoder
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Store holding the encoder and head parameters.
    pub fn var_store(&self) -> &nn::VarStore {
        self.encoder.var_store()
    }

    /// `[B, C, S]` windows to `[B, num_classes]` logits.
    pub fn forward(&self, windows: &Tensor, train: bool) -> Tensor {
        self.head.forward(&self.encoder.encode(windows, train))
    }

    /// Mean cross-entropy of `logits` against `labels` (`[B]`, `int64`).
    pub fn loss(&self, logits: &Tensor, labels: &Tensor) -> Tensor {
        logits.cross_entropy_for_logits(labels)
    }

    /// Predicted class per window, in evaluation mode.
    pub fn predict(&self, windows: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward(windows, false).argmax(-1, false))
    }

    /// Save encoder and head to `path`.
    pub fn save(&self, path: &Path) -> TrainResult<()> {
        checkpoint::save_var_store(self.var_store(), path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(paradigm: Paradigm) -> TrainingConfig {
        TrainingConfig {
            paradigm,
            window_len: 128,
            segment_len: 64,
            embed_dim: 16,
            queue_size: 8,
            batch_size: 4,
            num_views: 2,
            ..TrainingConfig::default()
        }
    }

    fn batch(b: i64) -> Tensor {
        Tensor::randn([b, 2, 1, 64], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn shared_paradigm_has_no_queue() {
        tch::manual_seed(0);
        let model = ContrastiveModel::new(&tiny(Paradigm::Simclr), Device::Cpu).unwrap();
        assert!(model.queue().is_none());
        assert!(model.key_encoder().is_none());
    }

    #[test]
    fn moco_forward_advances_queue() {
        tch::manual_seed(0);
        let mut model = ContrastiveModel::new(&tiny(Paradigm::Moco), Device::Cpu).unwrap();
        let out = model.forward(&batch(4), None, true).unwrap();
        assert_eq!(model.queue().unwrap().pointer(), 4);
        let loss = model.loss(&out, None).unwrap();
        assert!(loss.value().is_finite());
    }

    #[test]
    fn mcp_without_identities_leaves_state_untouched() {
        tch::manual_seed(0);
        let mut model = ContrastiveModel::new(&tiny(Paradigm::PatientMoco), Device::Cpu).unwrap();
        let before = model.queue().unwrap().negatives();
        let err = model.forward(&batch(4), None, true).unwrap_err();
        assert!(matches!(err, TrainError::MissingIdentities { .. }));
        assert_eq!(model.queue().unwrap().pointer(), 0);
        let diff = (model.queue().unwrap().negatives() - before).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn indivisible_batch_is_rejected_before_update() {
        tch::manual_seed(0);
        let mut model = ContrastiveModel::new(&tiny(Paradigm::Moco), Device::Cpu).unwrap();
        let err = model.forward(&batch(3), None, true).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
        assert_eq!(model.queue().unwrap().pointer(), 0);
    }

    #[test]
    fn supervised_logits_have_class_dimension() {
        tch::manual_seed(0);
        let cfg = tiny(Paradigm::Simclr);
        let model = SupervisedModel::new(&cfg, Device::Cpu);
        let x = Tensor::randn([3, 1, 64], (Kind::Float, Device::Cpu));
        assert_eq!(model.forward(&x, false).size(), [3, 4]);
        assert_eq!(model.predict(&x).size(), [3]);
    }
}
