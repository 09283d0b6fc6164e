//! Training loop orchestrator.
//!
//! [`Trainer`] drives contrastive pre-training:
//!
//! ```text
//! for epoch in start..num_epochs
//!     for batch in DataLoader (seeded shuffle, drop_last for queue paradigms)
//!         ViewAugmentor ─▶ collate ─▶ ContrastiveModel::forward ─▶ loss
//!         Adam backward_step
//!     log epoch loss (tracing + <log_dir>/loss.csv)
//!     every `checkpoint_every` epochs: checkpoint_<epoch>
//! ```
//!
//! [`Trainer::finetune`] trains a [`SupervisedModel`] on labelled samples and
//! reports accuracy on an evaluation set.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use tch::{nn, nn::OptimizerConfig, Device, Tensor};
use tracing::{debug, info, warn};

use crate::augment::{collate, collate_levels, collate_views, ViewAugmentor};
use crate::checkpoint::CheckpointMeta;
use crate::config::TrainingConfig;
use crate::dataset::{DataLoader, EcgDataset, EcgSample, IdentityRegistry};
use crate::error::{TrainError, TrainResult};
use crate::metrics::{AccuracyMeter, EpochStats, LossMeter};
use crate::model::{ContrastiveModel, SupervisedModel};

/// File under `log_dir` receiving one `epoch,loss` line per epoch.
pub const LOSS_LOG_FILE: &str = "loss.csv";

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Stats of every epoch run by this call.
    pub epochs: Vec<EpochStats>,
    /// Lowest epoch loss seen.
    pub best_loss: Option<f64>,
    /// Most recent checkpoint written.
    pub last_checkpoint: Option<PathBuf>,
}

/// Outcome of [`Trainer::finetune`].
#[derive(Debug, Clone)]
pub struct FinetuneSummary {
    /// Per-epoch training stats.
    pub train: Vec<EpochStats>,
    /// Per-epoch evaluation stats.
    pub eval: Vec<EpochStats>,
    /// Highest evaluation accuracy seen.
    pub best_accuracy: Option<f64>,
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Orchestrates contrastive pre-training: data loading, augmentation, forward
/// pass, loss, back-propagation and checkpointing.
pub struct Trainer {
    config: TrainingConfig,
    model: ContrastiveModel,
    optimizer: nn::Optimizer,
    augmentor: ViewAugmentor,
    registry: IdentityRegistry,
    completed_epochs: usize,
    optimizer_steps: u64,
}

impl Trainer {
    /// Fresh trainer for `config`.
    ///
    /// Seeds torch with `config.seed` before any parameter is created.
    pub fn new(config: TrainingConfig) -> TrainResult<Self> {
        config.validate()?;
        tch::manual_seed(config.seed as i64);
        let device = config.device();

        let model = ContrastiveModel::new(&config, device)?;
        let optimizer = nn::Adam::default().build(model.var_store(), config.learning_rate)?;
        info!(device = ?device, lr = config.learning_rate, "trainer ready");

        Ok(Trainer {
            augmentor: ViewAugmentor::from_config(&config),
            config,
            model,
            optimizer,
            registry: IdentityRegistry::new(),
            completed_epochs: 0,
            optimizer_steps: 0,
        })
    }

    /// Trainer continuing from checkpoint directory `dir`.
    ///
    /// Model parameters, queue state and the optimizer step count are
    /// restored; Adam's moment estimates start fresh.
    pub fn resume(config: TrainingConfig, dir: &Path) -> TrainResult<Self> {
        let mut trainer = Self::new(config)?;
        let meta = trainer.model.load(dir)?;
        trainer.completed_epochs = meta.epoch;
        trainer.optimizer_steps = meta.optimizer_steps;
        info!(epoch = meta.epoch, steps = meta.optimizer_steps, "resuming");
        warn!("optimizer moments are not checkpointed; Adam restarts from zero moments");
        Ok(trainer)
    }

    /// Active configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// The model being trained.
    pub fn model(&self) -> &ContrastiveModel {
        &self.model
    }

    /// Optimizer steps taken so far, including those before a resume.
    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer_steps
    }

    /// Number of epochs already completed (non-zero after a resume).
    pub fn completed_epochs(&self) -> usize {
        self.completed_epochs
    }

    /// Augment and collate `samples` into a view batch and a `[B]` identity
    /// tensor on the model's device.
    pub fn prepare_batch(&mut self, samples: &[EcgSample]) -> TrainResult<(Tensor, Tensor)> {
        let batch = if self.config.paradigm.is_hierarchical() {
            let levels = samples
                .iter()
                .map(|s| self.augmentor.create_levels(&s.signal))
                .collect::<Result<Vec<_>, _>>()?;
            collate_levels(&levels)?
        } else {
            let views = samples
                .iter()
                .map(|s| self.augmentor.create_views(&s.signal))
                .collect::<Result<Vec<_>, _>>()?;
            collate_views(&views)?
        };
        let ids = Tensor::from_slice(&self.registry.intern_batch(samples));

        let device = self.model.encoder().device();
        Ok((batch.to_device(device), ids.to_device(device)))
    }

    /// One optimisation step on `samples`; returns the loss value.
    ///
    /// # Errors
    ///
    /// Augmentation, shape and configuration errors from the forward pass,
    /// and [`TrainError::TrainingStep`] when the loss is not finite. On error
    /// the optimizer step is skipped and the key encoder and queue keep their
    /// state from before the call.
    pub fn train_step(&mut self, samples: &[EcgSample]) -> TrainResult<f64> {
        let (batch, ids) = self.prepare_batch(samples)?;
        let output = self.model.forward_loss(&batch, Some(&ids), true)?;
        let value = output.value();
        self.optimizer.backward_step(&output.loss);
        self.optimizer_steps += 1;
        debug!(loss = value, terms = output.num_terms, step = self.optimizer_steps, "step");
        Ok(value)
    }

    /// Train one epoch (`epoch` is 0-based) over `dataset`.
    pub fn train_epoch(&mut self, dataset: &dyn EcgDataset, epoch: usize) -> TrainResult<EpochStats> {
        let loader = DataLoader::new(dataset, self.config.batch_size, true, self.config.seed)?
            .with_drop_last(self.config.paradigm.uses_queue());

        let mut meter = LossMeter::new();
        for samples in loader.iter_epoch(epoch) {
            let loss = self.train_step(&samples)?;
            meter.update(loss, samples.len());
        }
        let mean_loss = meter.mean().ok_or_else(|| {
            TrainError::training_step(format!(
                "epoch {} produced no batch of {} valid samples",
                epoch + 1,
                self.config.batch_size
            ))
        })?;

        Ok(EpochStats {
            epoch: epoch + 1,
            mean_loss,
            num_batches: meter.count(),
            num_samples: meter.num_samples(),
            accuracy: None,
        })
    }

    /// Train until `num_epochs` epochs are complete.
    ///
    /// A checkpoint is written every `checkpoint_every` epochs and after the
    /// final epoch.
    pub fn run(&mut self, dataset: &dyn EcgDataset) -> TrainResult<TrainingSummary> {
        if dataset.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        info!(
            dataset = dataset.name(),
            samples = dataset.len(),
            paradigm = %self.config.paradigm,
            from_epoch = self.completed_epochs + 1,
            to_epoch = self.config.num_epochs,
            "starting training"
        );

        let mut summary = TrainingSummary { epochs: Vec::new(), best_loss: None, last_checkpoint: None };
        for epoch in self.completed_epochs..self.config.num_epochs {
            let stats = self.train_epoch(dataset, epoch)?;
            info!("{}", stats.summary());
            append_loss_log(&self.config.log_dir, &stats)?;

            self.completed_epochs = stats.epoch;
            if stats.epoch % self.config.checkpoint_every == 0 || stats.epoch == self.config.num_epochs {
                let meta = CheckpointMeta::new(stats.epoch, &self.config)
                    .with_optimizer_steps(self.optimizer_steps);
                let dir = self.model.save_with_meta(&self.config.checkpoint_dir, &meta)?;
                info!(dir = %dir.display(), "checkpoint saved");
                summary.last_checkpoint = Some(dir);
            }

            summary.best_loss = Some(match summary.best_loss {
                Some(best) => best.min(stats.mean_loss),
                None => stats.mean_loss,
            });
            summary.epochs.push(stats);
        }
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Supervised fine-tuning
    // ------------------------------------------------------------------

    /// Fine-tune a classifier on the labelled samples of `train`, evaluating
    /// on `eval` after every epoch.
    ///
    /// With `pretrained`, the encoder starts from that contrastive
    /// checkpoint. Samples without a label are skipped with a warning.
    pub fn finetune(
        config: &TrainingConfig,
        pretrained: Option<&Path>,
        train: &dyn EcgDataset,
        eval: &dyn EcgDataset,
    ) -> TrainResult<FinetuneSummary> {
        config.validate()?;
        if train.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        tch::manual_seed(config.seed as i64);
        let device = config.device();

        let model = match pretrained {
            Some(dir) => SupervisedModel::from_pretrained(config, dir, device)?,
            None => SupervisedModel::new(config, device),
        };
        let mut optimizer = nn::Adam::default().build(model.var_store(), config.learning_rate)?;
        let mut augmentor = ViewAugmentor::from_config(config);

        let train_loader = DataLoader::new(train, config.batch_size, true, config.seed)?;
        let eval_loader = DataLoader::new(eval, config.batch_size, false, config.seed)?;

        let mut summary = FinetuneSummary { train: Vec::new(), eval: Vec::new(), best_accuracy: None };
        for epoch in 0..config.num_epochs {
            let mut loss_meter = LossMeter::new();
            let mut acc_meter = AccuracyMeter::new();
            for samples in train_loader.iter_epoch(epoch) {
                let Some((windows, labels)) =
                    labelled_batch(&samples, device, |s| augmentor.segment(s))?
                else {
                    continue;
                };
                let logits = model.forward(&windows, true);
                let loss = model.loss(&logits, &labels);
                optimizer.backward_step(&loss);
                loss_meter.update(loss.double_value(&[]), labels.numel());
                acc_meter.update(&logits, &labels);
            }
            let train_stats = epoch_stats(epoch, &loss_meter, &acc_meter);
            info!("train {}", train_stats.summary());

            let eval_stats = evaluate(&model, &eval_loader, &augmentor, device, epoch)?;
            info!("eval  {}", eval_stats.summary());

            if let Some(acc) = eval_stats.accuracy {
                summary.best_accuracy = Some(summary.best_accuracy.map_or(acc, |best| best.max(acc)));
            }
            summary.train.push(train_stats);
            summary.eval.push(eval_stats);
        }
        Ok(summary)
    }
}

/// Evaluation pass over centre crops.
fn evaluate(
    model: &SupervisedModel,
    loader: &DataLoader<'_>,
    augmentor: &ViewAugmentor,
    device: Device,
    epoch: usize,
) -> TrainResult<EpochStats> {
    let mut loss_meter = LossMeter::new();
    let mut acc_meter = AccuracyMeter::new();
    for samples in loader.iter() {
        let Some((windows, labels)) = labelled_batch(&samples, device, |s| augmentor.center(s))? else {
            continue;
        };
        let (logits, loss) = tch::no_grad(|| {
            let logits = model.forward(&windows, false);
            let loss = model.loss(&logits, &labels).double_value(&[]);
            (logits, loss)
        });
        loss_meter.update(loss, labels.numel());
        acc_meter.update(&logits, &labels);
    }
    Ok(epoch_stats(epoch, &loss_meter, &acc_meter))
}

/// `[B, C, S]` windows and `[B]` labels of the labelled samples in
/// `samples`, or `None` when none is labelled.
fn labelled_batch<F>(samples: &[EcgSample], device: Device, mut crop: F) -> TrainResult<Option<(Tensor, Tensor)>>
where
    F: FnMut(&Array2<f32>) -> Result<Array2<f32>, crate::error::DatasetError>,
{
    let mut windows = Vec::with_capacity(samples.len());
    let mut labels = Vec::with_capacity(samples.len());
    for sample in samples {
        match sample.label {
            Some(label) => {
                windows.push(crop(&sample.signal)?);
                labels.push(label);
            }
            None => warn!("Skipping unlabelled sample `{}`", sample.identity),
        }
    }
    if windows.is_empty() {
        return Ok(None);
    }
    let x = collate(&windows)?.to_device(device);
    let y = Tensor::from_slice(&labels).to_device(device);
    Ok(Some((x, y)))
}

fn epoch_stats(epoch: usize, loss: &LossMeter, acc: &AccuracyMeter) -> EpochStats {
    EpochStats {
        epoch: epoch + 1,
        mean_loss: loss.mean().unwrap_or(f64::NAN),
        num_batches: loss.count(),
        num_samples: loss.num_samples(),
        accuracy: acc.finalize(),
    }
}

/// Append `epoch,loss` to `<log_dir>/loss.csv`, writing the header when the
/// file is new.
fn append_loss_log(log_dir: &Path, stats: &EpochStats) -> TrainResult<()> {
    let path = log_dir.join(LOSS_LOG_FILE);
    let io_err = |source| TrainError::Io { path: path.clone(), source };

    std::fs::create_dir_all(log_dir).map_err(io_err)?;
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
    if is_new {
        writeln!(file, "epoch,loss").map_err(io_err)?;
    }
    writeln!(file, "{},{}", stats.epoch, stats.mean_loss).map_err(io_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
