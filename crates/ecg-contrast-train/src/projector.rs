//! Multi-view projection: batches of augmented views to view-major embeddings.
//!
//! Batches arrive sample-major, `[B, N, C, S]` (or `[B, L, N, C, S]` for the
//! hierarchical paradigm). The projector moves the view axis to the front,
//! encodes every view separately so each encoder call sees one view of every
//! sample, and stacks the results:
//!
//! ```text
//! [B, N, C, S]     ──permute──▶ [N, B, C, S]     ──encode each──▶ [N, B, D]
//! [B, L, N, C, S]  ──permute──▶ [L, N, B, C, S]  ──encode each──▶ [L, N, B, D]
//! ```
//!
//! Momentum paradigms do not encode through the projector; they only need the
//! two views split apart ([`MultiViewProjector::split_momentum`]) so that the
//! model can route view 0 to the query encoder and view 1 to the key encoder.

use tch::Tensor;

use crate::config::Paradigm;
use crate::encoder::Encoder;
use crate::error::{ShapeError, TrainResult};

// ---------------------------------------------------------------------------
// ProjectorOutput
// ---------------------------------------------------------------------------

/// Embeddings produced by one forward pass of a contrastive model.
#[derive(Debug)]
pub enum ProjectorOutput {
    /// `[N, B, D]` embeddings from a shared encoder.
    Views(Tensor),
    /// `[L, N, B, D]` embeddings for the hierarchical paradigm.
    Levels(Tensor),
    /// Queries, keys and a queue snapshot from a momentum pair.
    Momentum(MomentumOutput),
}

impl ProjectorOutput {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ProjectorOutput::Views(_) => "view",
            ProjectorOutput::Levels(_) => "level",
            ProjectorOutput::Momentum(_) => "momentum",
        }
    }
}

/// Output of a momentum forward pass.
///
/// `query` and `keys` are unit-normalised. `negatives` and `queue_ids` are
/// snapshots taken before this batch's keys were enqueued.
#[derive(Debug)]
pub struct MomentumOutput {
    /// `[B, D]` query embeddings (carry gradients).
    pub query: Tensor,
    /// `[B, D]` key embeddings (no gradients).
    pub keys: Tensor,
    /// `[D, K]` queue contents.
    pub negatives: Tensor,
    /// `[K]` identity labels of the queue contents.
    pub queue_ids: Tensor,
}

impl MomentumOutput {
    /// `[B, B]` query–key similarities.
    pub fn query_key(&self) -> Tensor {
        self.query.matmul(&self.keys.transpose(0, 1))
    }

    /// `[B, K]` query–queue similarities.
    pub fn query_queue(&self) -> Tensor {
        self.query.matmul(&self.negatives)
    }

    /// `[B, 1 + K]` MoCo logits with the positive in column 0.
    pub fn logits(&self) -> Tensor {
        crate::losses::moco_logits(&self.query, &self.keys, &self.negatives)
    }
}

// ---------------------------------------------------------------------------
// MultiViewProjector
// ---------------------------------------------------------------------------

/// Validates view layouts for a paradigm and encodes them view by view.
#[derive(Debug, Clone, Copy)]
pub struct MultiViewProjector {
    paradigm: Paradigm,
}

impl MultiViewProjector {
    /// Projector for `paradigm`.
    pub fn new(paradigm: Paradigm) -> Self {
        MultiViewProjector { paradigm }
    }

    /// The paradigm whose view layout this projector enforces.
    pub fn paradigm(&self) -> Paradigm {
        self.paradigm
    }

    /// Encode every view with `encoder`.
    ///
    /// Returns [`ProjectorOutput::Levels`] for the hierarchical paradigm and
    /// [`ProjectorOutput::Views`] otherwise.
    pub fn project<E: Encoder>(&self, encoder: &E, batch: &Tensor, train: bool) -> TrainResult<ProjectorOutput> {
        if self.paradigm.is_hierarchical() {
            self.project_levels(encoder, batch, train).map(ProjectorOutput::Levels)
        } else {
            self.project_views(encoder, batch, train).map(ProjectorOutput::Views)
        }
    }

    /// `[B, N, C, S]` to `[N, B, D]`.
    pub fn project_views<E: Encoder>(&self, encoder: &E, batch: &Tensor, train: bool) -> TrainResult<Tensor> {
        ShapeError::check_rank("view batch", batch, 4)?;
        self.check_views(batch.size()[1])?;
        Ok(encode_views(encoder, &batch.permute([1, 0, 2, 3]), train))
    }

    /// `[B, L, N, C, S]` to `[L, N, B, D]`.
    pub fn project_levels<E: Encoder>(&self, encoder: &E, batch: &Tensor, train: bool) -> TrainResult<Tensor> {
        ShapeError::check_rank("level batch", batch, 5)?;
        let size = batch.size();
        if size[1] == 0 {
            return Err(ShapeError::mismatch("level batch", vec![size[0], 1, size[2], size[3], size[4]], size).into());
        }
        self.check_views(size[2])?;

        let level_major = batch.permute([1, 2, 0, 3, 4]);
        let levels: Vec<Tensor> = (0..size[1])
            .map(|l| encode_views(encoder, &level_major.get(l), train))
            .collect();
        Ok(Tensor::stack(&levels, 0))
    }

    /// Split a `[B, 2, C, S]` batch into the query view and the key view.
    pub fn split_momentum(&self, batch: &Tensor) -> TrainResult<(Tensor, Tensor)> {
        ShapeError::check_rank("view batch", batch, 4)?;
        self.check_views(batch.size()[1])?;
        Ok((batch.select(1, 0), batch.select(1, 1)))
    }

    fn check_views(&self, actual: i64) -> Result<(), ShapeError> {
        let ok = match self.paradigm.expected_views() {
            Some(n) => actual == n,
            None => actual >= 2,
        };
        if ok {
            return Ok(());
        }
        let expected = match self.paradigm.expected_views() {
            Some(n) => n.to_string(),
            None => ">= 2".to_string(),
        };
        Err(ShapeError::ViewCount { paradigm: self.paradigm.to_string(), expected, actual })
    }
}

/// Encode each `[B, C, S]` slice of a view-major `[N, B, C, S]` tensor.
fn encode_views<E: Encoder>(encoder: &E, view_major: &Tensor, train: bool) -> Tensor {
    let n = view_major.size()[0];
    let views: Vec<Tensor> = (0..n).map(|v| encoder.encode(&view_major.get(v), train)).collect();
    Tensor::stack(&views, 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backbone;
    use crate::encoder::SignalEncoder;
    use crate::error::TrainError;
    use tch::{Device, Kind};

    fn encoder() -> SignalEncoder {
        tch::manual_seed(0);
        SignalEncoder::new(Backbone::Cnn3, 1, 8, Device::Cpu)
    }

    #[test]
    fn views_are_view_major() {
        let enc = encoder();
        let batch = Tensor::randn([5, 2, 1, 64], (Kind::Float, Device::Cpu));
        let out = MultiViewProjector::new(Paradigm::Simclr).project_views(&enc, &batch, false).unwrap();
        assert_eq!(out.size(), [2, 5, 8]);

        let direct = enc.encode(&batch.select(1, 1), false);
        let diff = (out.get(1) - direct).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn three_views_rejected_for_cmsc() {
        let enc = encoder();
        let batch = Tensor::randn([4, 3, 1, 64], (Kind::Float, Device::Cpu));
        let err = MultiViewProjector::new(Paradigm::Cmsc).project(&enc, &batch, true).unwrap_err();
        assert!(matches!(err, TrainError::Shape(ShapeError::ViewCount { actual: 3, .. })));
    }

    #[test]
    fn levels_are_level_then_view_major() {
        let enc = encoder();
        let batch = Tensor::randn([4, 2, 3, 1, 64], (Kind::Float, Device::Cpu));
        let out = MultiViewProjector::new(Paradigm::Hierarchical).project(&enc, &batch, true).unwrap();
        match out {
            ProjectorOutput::Levels(t) => assert_eq!(t.size(), [2, 3, 4, 8]),
            other => panic!("expected levels, got {}", other.kind()),
        }
    }

    #[test]
    fn hierarchical_needs_two_views() {
        let enc = encoder();
        let batch = Tensor::randn([4, 2, 1, 1, 64], (Kind::Float, Device::Cpu));
        assert!(MultiViewProjector::new(Paradigm::Hierarchical).project(&enc, &batch, true).is_err());
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let enc = encoder();
        let batch = Tensor::randn([4, 1, 64], (Kind::Float, Device::Cpu));
        let err = MultiViewProjector::new(Paradigm::Simclr).project(&enc, &batch, true).unwrap_err();
        assert!(matches!(err, TrainError::Shape(ShapeError::Rank { .. })));
    }

    #[test]
    fn momentum_split_keeps_sample_order() {
        let batch = Tensor::arange(2 * 2 * 3, (Kind::Float, Device::Cpu)).view([2, 2, 1, 3]);
        let (q, k) = MultiViewProjector::new(Paradigm::Moco).split_momentum(&batch).unwrap();
        assert_eq!(q.size(), [2, 1, 3]);
        assert_eq!(k.double_value(&[1, 0, 0]), 9.0);
    }
}
