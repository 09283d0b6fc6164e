//! Contrastive objectives for ECG representation learning.
//!
//! Every objective works on unit-normalised embeddings, divides similarities
//! by a temperature `τ` and evaluates the InfoNCE ratio
//!
//! ```text
//! −log((exp(s⁺/τ) + ε) / (Σ exp(s/τ) + ε))
//! ```
//!
//! with `ε = 1e-12` guarding against underflow. The objectives differ only in
//! which pairs count as positives and which entries form the denominator:
//!
//! | Objective      | Positives                              | Denominator                    |
//! |----------------|----------------------------------------|--------------------------------|
//! | SimCLR         | same sample, other view                | cross-view + within-view       |
//! | CMSC           | any sample of the same patient         | cross-view row / column sums   |
//! | MoCo           | the sample's own key                   | own key + queue                |
//! | MCP            | own key, same-patient keys and queue   | queue                          |
//! | Hierarchical   | SimCLR over every view pair per level  | as SimCLR                      |
//!
//! Terms built from an empty positive set are omitted rather than padded, so
//! the CMSC and MCP results are means over a variable number of terms.

use tch::{Kind, Tensor};

use crate::config::Paradigm;
use crate::error::{ShapeError, TrainError, TrainResult};
use crate::projector::{MomentumOutput, ProjectorOutput};

/// Softmax temperature `τ` shared by all objectives.
pub const TEMPERATURE: f64 = 0.1;

/// Additive epsilon inside every logarithm.
pub const LOG_EPS: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Scale `x` to unit L2 norm along `dim`.
///
/// Norms are clamped to `1e-12` so an all-zero vector stays zero instead of
/// producing NaN.
pub fn l2_normalize(x: &Tensor, dim: i64) -> Tensor {
    let norm = x
        .pow_tensor_scalar(2)
        .sum_dim_intlist(&[dim][..], true, Kind::Float)
        .sqrt()
        .clamp_min(1e-12);
    x / norm
}

/// `−mean log((num + ε) / (den + ε))` over matching 1-D tensors.
fn neg_mean_log_ratio(numerator: &Tensor, denominator: &Tensor) -> Tensor {
    -((numerator + LOG_EPS) / (denominator + LOG_EPS))
        .log()
        .mean(Kind::Float)
}

/// `[B, K]` boolean mask with `true` where `rows[i] == cols[k]`.
pub fn identity_mask(rows: &Tensor, cols: &Tensor) -> Tensor {
    rows.unsqueeze(1).eq_tensor(&cols.unsqueeze(0))
}

/// `[n, n]` boolean mask of the entries strictly above (`diagonal = 1`) or
/// strictly below (`diagonal = -1`) the main diagonal.
fn strict_triangle(n: i64, diagonal: i64, like: &Tensor) -> Tensor {
    let ones = Tensor::ones([n, n], (Kind::Float, like.device()));
    let tri = if diagonal > 0 { ones.triu(diagonal) } else { ones.tril(diagonal) };
    tri.gt(0.5)
}

/// `[n, n]` boolean mask with `false` on the main diagonal.
fn off_diagonal(n: i64, like: &Tensor) -> Tensor {
    Tensor::eye(n, (Kind::Bool, like.device())).logical_not()
}

fn sum_rows(x: &Tensor) -> Tensor {
    x.sum_dim_intlist(&[1_i64][..], false, Kind::Float)
}

fn sum_cols(x: &Tensor) -> Tensor {
    x.sum_dim_intlist(&[0_i64][..], false, Kind::Float)
}

/// The InfoNCE term over the entries selected by `mask`, each divided by the
/// denominator of its row (`by_row = true`) or column.
///
/// Returns `None` when the mask selects nothing.
fn masked_term(exp_sim: &Tensor, mask: &Tensor, denominator: &Tensor, by_row: bool) -> Option<Tensor> {
    let numerator = exp_sim.masked_select(mask);
    if numerator.numel() == 0 {
        return None;
    }
    let den = if by_row { denominator.unsqueeze(1) } else { denominator.unsqueeze(0) };
    Some(neg_mean_log_ratio(&numerator, &den.masked_select(mask)))
}

fn check_pair(what: &'static str, a: &Tensor, b: &Tensor) -> Result<(), ShapeError> {
    ShapeError::check_rank(what, a, 2)?;
    if a.size() != b.size() {
        return Err(ShapeError::mismatch(what, a.size(), b.size()));
    }
    Ok(())
}

fn check_identities(what: &'static str, identities: &Tensor, batch: i64) -> Result<(), ShapeError> {
    if identities.size() != [batch] {
        return Err(ShapeError::mismatch(what, vec![batch], identities.size()));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// LossOutput
// ─────────────────────────────────────────────────────────────────────────────

/// A scalar loss and the number of terms averaged into it.
#[derive(Debug)]
pub struct LossOutput {
    /// Scalar loss, attached to the autograd graph.
    pub loss: Tensor,
    /// How many terms were averaged (1 for single-term objectives).
    pub num_terms: usize,
}

impl LossOutput {
    /// Average `terms` into a single scalar.
    ///
    /// Returns an error when `terms` is empty.
    pub fn mean_of(terms: Vec<Tensor>) -> TrainResult<Self> {
        let num_terms = terms.len();
        let first = terms
            .first()
            .map(Tensor::shallow_clone)
            .ok_or_else(|| TrainError::training_step("no loss terms to average"))?;
        let total = terms.iter().skip(1).fold(first, |acc, t| acc + t);
        Ok(LossOutput { loss: total / num_terms as f64, num_terms })
    }

    /// Scalar value of the loss.
    pub fn value(&self) -> f64 {
        self.loss.double_value(&[])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimCLR
// ─────────────────────────────────────────────────────────────────────────────

/// Symmetric SimCLR loss between two `[B, D]` views.
///
/// Row `i` of the forward direction uses `exp S12[i,i]` as the positive and
/// `Σ_j exp S12[i,j] + Σ_{j≠i} exp S11[i,j]` as the denominator; the backward
/// direction does the same over columns with `S22`. The loss is the mean of
/// the two directions.
pub fn simclr_loss(view1: &Tensor, view2: &Tensor, temperature: f64) -> Tensor {
    let v1 = l2_normalize(view1, -1);
    let v2 = l2_normalize(view2, -1);
    let b = v1.size()[0];
    let off = off_diagonal(b, &v1).to_kind(Kind::Float);

    let exp12 = (v1.matmul(&v2.transpose(0, 1)) / temperature).exp();
    let exp11 = (v1.matmul(&v1.transpose(0, 1)) / temperature).exp() * &off;
    let exp22 = (v2.matmul(&v2.transpose(0, 1)) / temperature).exp() * &off;

    let den_rows = sum_rows(&exp12) + sum_rows(&exp11);
    let den_cols = sum_cols(&exp12) + sum_cols(&exp22);

    let diag = exp12.diagonal(0, 0, 1);
    (neg_mean_log_ratio(&diag, &den_rows) + neg_mean_log_ratio(&diag, &den_cols)) / 2.0
}

// ─────────────────────────────────────────────────────────────────────────────
// CMSC
// ─────────────────────────────────────────────────────────────────────────────

/// The 2–4 CMSC terms for two `[B, D]` views and `[B]` identity labels.
///
/// Two diagonal terms (row and column normalised) are always present. The
/// strict-upper same-identity entries add one row-normalised term and the
/// strict-lower ones add one column-normalised term when non-empty.
pub fn cmsc_terms(view1: &Tensor, view2: &Tensor, identities: &Tensor, temperature: f64) -> Vec<Tensor> {
    let v1 = l2_normalize(view1, -1);
    let v2 = l2_normalize(view2, -1);
    let b = v1.size()[0];

    let exp12 = (v1.matmul(&v2.transpose(0, 1)) / temperature).exp();
    let row_sum = sum_rows(&exp12);
    let col_sum = sum_cols(&exp12);

    let diag = exp12.diagonal(0, 0, 1);
    let mut terms = vec![neg_mean_log_ratio(&diag, &row_sum), neg_mean_log_ratio(&diag, &col_sum)];

    let same = identity_mask(identities, identities);
    let upper = same.logical_and(&strict_triangle(b, 1, &v1));
    let lower = same.logical_and(&strict_triangle(b, -1, &v1));
    terms.extend(masked_term(&exp12, &upper, &row_sum, true));
    terms.extend(masked_term(&exp12, &lower, &col_sum, false));
    terms
}

/// Mean of [`cmsc_terms`].
pub fn cmsc_loss(
    view1: &Tensor,
    view2: &Tensor,
    identities: &Tensor,
    temperature: f64,
) -> TrainResult<LossOutput> {
    check_pair("cmsc views", view1, view2)?;
    check_identities("cmsc identities", identities, view1.size()[0])?;
    LossOutput::mean_of(cmsc_terms(view1, view2, identities, temperature))
}

// ─────────────────────────────────────────────────────────────────────────────
// MoCo
// ─────────────────────────────────────────────────────────────────────────────

/// Unscaled MoCo logits `[B, 1 + K]`: column 0 holds `q·k`, the rest `q·queue`.
pub fn moco_logits(query: &Tensor, keys: &Tensor, negatives: &Tensor) -> Tensor {
    let pos = (query * keys).sum_dim_intlist(&[1_i64][..], true, Kind::Float);
    let neg = query.matmul(negatives);
    Tensor::cat(&[pos, neg], 1)
}

/// Cross-entropy of `logits / τ` against the all-zero target.
pub fn moco_loss(logits: &Tensor, temperature: f64) -> Tensor {
    let b = logits.size()[0];
    let targets = Tensor::zeros([b], (Kind::Int64, logits.device()));
    (logits / temperature).cross_entropy_for_logits(&targets)
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP
// ─────────────────────────────────────────────────────────────────────────────

/// The 1–3 patient-specific MoCo terms.
///
/// `query_key` is `[B, B]`, `query_queue` is `[B, K]`, both unscaled. Every
/// term of row `i` uses the denominator `Σ_k exp(query_queue[i, k] / τ)`.
///
/// - diagonal: the sample's own key (always present);
/// - same batch: off-diagonal keys with the same identity;
/// - queue: queue entries whose identity matches.
pub fn mcp_terms(
    query_key: &Tensor,
    query_queue: &Tensor,
    identities: &Tensor,
    queue_identities: &Tensor,
    temperature: f64,
) -> Vec<Tensor> {
    let b = query_key.size()[0];
    let exp_qk = (query_key / temperature).exp();
    let exp_qq = (query_queue / temperature).exp();
    let den = sum_rows(&exp_qq);

    let mut terms = vec![neg_mean_log_ratio(&exp_qk.diagonal(0, 0, 1), &den)];

    let same_batch = identity_mask(identities, identities).logical_and(&off_diagonal(b, query_key));
    terms.extend(masked_term(&exp_qk, &same_batch, &den, true));

    let same_queue = identity_mask(identities, queue_identities);
    terms.extend(masked_term(&exp_qq, &same_queue, &den, true));
    terms
}

/// Mean of [`mcp_terms`] for normalised queries, keys and a queue snapshot.
pub fn mcp_loss(output: &MomentumOutput, identities: &Tensor, temperature: f64) -> TrainResult<LossOutput> {
    let b = output.query.size()[0];
    check_identities("mcp identities", identities, b)?;
    check_identities("mcp queue identities", &output.queue_ids, output.negatives.size()[1])?;
    let terms = mcp_terms(
        &output.query_key(),
        &output.query_queue(),
        identities,
        &output.queue_ids,
        temperature,
    );
    LossOutput::mean_of(terms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Hierarchical
// ─────────────────────────────────────────────────────────────────────────────

/// Mean over levels of the mean SimCLR loss over all view pairs `a < b`.
///
/// `levels` is `[L, N, B, D]` with `N >= 2`.
pub fn hierarchical_loss(levels: &Tensor, temperature: f64) -> TrainResult<Tensor> {
    ShapeError::check_rank("hierarchical embeddings", levels, 4)?;
    let size = levels.size();
    let (num_levels, num_views) = (size[0], size[1]);
    if num_levels == 0 {
        return Err(ShapeError::LevelCount {
            paradigm: Paradigm::Hierarchical.to_string(),
            expected: 1,
            actual: num_levels,
        }
        .into());
    }
    if num_views < 2 {
        return Err(ShapeError::ViewCount {
            paradigm: Paradigm::Hierarchical.to_string(),
            expected: ">= 2".into(),
            actual: num_views,
        }
        .into());
    }

    let mut level_losses = Vec::with_capacity(num_levels as usize);
    for l in 0..num_levels {
        let level = levels.get(l);
        let mut pair_losses = Vec::new();
        for a in 0..num_views {
            for b in (a + 1)..num_views {
                pair_losses.push(simclr_loss(&level.get(a), &level.get(b), temperature));
            }
        }
        level_losses.push(LossOutput::mean_of(pair_losses)?.loss);
    }
    Ok(LossOutput::mean_of(level_losses)?.loss)
}

// ─────────────────────────────────────────────────────────────────────────────
// LossEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Stateless dispatcher from a paradigm and projector output to its loss.
#[derive(Debug, Clone, Copy)]
pub struct LossEngine {
    paradigm: Paradigm,
    temperature: f64,
}

impl LossEngine {
    /// Engine for `paradigm` at the standard [`TEMPERATURE`].
    pub fn new(paradigm: Paradigm) -> Self {
        Self::with_temperature(paradigm, TEMPERATURE)
    }

    /// Engine with an explicit temperature.
    pub fn with_temperature(paradigm: Paradigm, temperature: f64) -> Self {
        LossEngine { paradigm, temperature }
    }

    /// The paradigm this engine scores.
    pub fn paradigm(&self) -> Paradigm {
        self.paradigm
    }

    /// Temperature `τ`.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Compute the loss for one forward pass.
    ///
    /// `identities` (`[B]`, `int64`) is required by CMSC and MCP and ignored
    /// otherwise.
    ///
    /// # Errors
    ///
    /// - [`TrainError::MissingIdentities`] when an identity-aware paradigm
    ///   gets `None`.
    /// - [`ShapeError`] when the embeddings do not fit the paradigm.
    pub fn compute(&self, output: &ProjectorOutput, identities: Option<&Tensor>) -> TrainResult<LossOutput> {
        let ids = || identities.ok_or_else(|| TrainError::missing_identities(self.paradigm.as_str()));
        let tau = self.temperature;

        match (self.paradigm, output) {
            (Paradigm::PlainContrastive | Paradigm::Simclr, ProjectorOutput::Views(views)) => {
                let (v1, v2) = self.two_views(views)?;
                Ok(LossOutput { loss: simclr_loss(&v1, &v2, tau), num_terms: 1 })
            }
            (Paradigm::Cmsc, ProjectorOutput::Views(views)) => {
                let (v1, v2) = self.two_views(views)?;
                cmsc_loss(&v1, &v2, ids()?, tau)
            }
            (Paradigm::Moco, ProjectorOutput::Momentum(out)) => {
                Ok(LossOutput { loss: moco_loss(&out.logits(), tau), num_terms: 1 })
            }
            (Paradigm::PatientMoco, ProjectorOutput::Momentum(out)) => mcp_loss(out, ids()?, tau),
            (Paradigm::Hierarchical, ProjectorOutput::Levels(levels)) => {
                Ok(LossOutput { loss: hierarchical_loss(levels, tau)?, num_terms: 1 })
            }
            (paradigm, other) => Err(TrainError::training_step(format!(
                "{paradigm} cannot score {} embeddings",
                other.kind()
            ))),
        }
    }

    fn two_views(&self, views: &Tensor) -> TrainResult<(Tensor, Tensor)> {
        ShapeError::check_rank("view embeddings", views, 3)?;
        let n = views.size()[0];
        if n != 2 {
            return Err(ShapeError::ViewCount {
                paradigm: self.paradigm.to_string(),
                expected: "2".into(),
                actual: n,
            }
            .into());
        }
        let (v1, v2) = (views.get(0), views.get(1));
        check_pair("view embeddings", &v1, &v2)?;
        Ok((v1, v2))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn randn(shape: &[i64]) -> Tensor {
        Tensor::randn(shape, (Kind::Float, Device::Cpu))
    }

    fn ids(v: &[i64]) -> Tensor {
        Tensor::from_slice(v)
    }

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    #[test]
    fn l2_normalize_produces_unit_rows() {
        tch::manual_seed(0);
        let x = l2_normalize(&randn(&[5, 7]), 1);
        let norms = x.pow_tensor_scalar(2).sum_dim_intlist(&[1_i64][..], false, Kind::Float);
        for i in 0..5 {
            assert!((norms.double_value(&[i]) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn l2_normalize_keeps_zero_vector_finite() {
        let x = l2_normalize(&Tensor::zeros([2, 3], (Kind::Float, Device::Cpu)), 1);
        assert_eq!(scalar(&x.abs().sum(Kind::Float)), 0.0);
    }

    #[test]
    fn simclr_is_positive_and_finite() {
        tch::manual_seed(1);
        let l = scalar(&simclr_loss(&randn(&[8, 16]), &randn(&[8, 16]), TEMPERATURE));
        assert!(l.is_finite() && l > 0.0, "loss = {l}");
    }

    #[test]
    fn simclr_single_sample_is_zero() {
        tch::manual_seed(2);
        let l = scalar(&simclr_loss(&randn(&[1, 4]), &randn(&[1, 4]), TEMPERATURE));
        assert!(l.abs() < 1e-6, "loss = {l}");
    }

    #[test]
    fn cmsc_term_count_follows_identities() {
        tch::manual_seed(3);
        let (a, b) = (randn(&[4, 8]), randn(&[4, 8]));
        assert_eq!(cmsc_terms(&a, &b, &ids(&[0, 0, 1, 1]), TEMPERATURE).len(), 4);
        assert_eq!(cmsc_terms(&a, &b, &ids(&[0, 1, 2, 3]), TEMPERATURE).len(), 2);
    }

    #[test]
    fn cmsc_with_distinct_identities_has_no_cross_sample_terms() {
        tch::manual_seed(4);
        let (a, b) = (randn(&[1, 8]), randn(&[1, 8]));
        let out = cmsc_loss(&a, &b, &ids(&[9]), TEMPERATURE).unwrap();
        assert_eq!(out.num_terms, 2);
        assert!(out.value().is_finite());
    }

    #[test]
    fn cmsc_rejects_wrong_identity_length() {
        let (a, b) = (randn(&[4, 8]), randn(&[4, 8]));
        assert!(cmsc_loss(&a, &b, &ids(&[0, 1]), TEMPERATURE).is_err());
    }

    #[test]
    fn moco_matches_manual_cross_entropy() {
        tch::manual_seed(5);
        let logits = randn(&[3, 6]);
        let loss = scalar(&moco_loss(&logits, TEMPERATURE));
        let manual = -scalar(
            &(&logits / TEMPERATURE)
                .log_softmax(1, Kind::Float)
                .select(1, 0)
                .mean(Kind::Float),
        );
        assert!((loss - manual).abs() < 1e-5);
    }

    #[test]
    fn mcp_term_count() {
        tch::manual_seed(6);
        let qk = randn(&[3, 3]);
        let qq = randn(&[3, 4]);
        let queue_ids = ids(&[-1, 7, -1, -1]);
        assert_eq!(mcp_terms(&qk, &qq, &ids(&[1, 2, 3]), &queue_ids, TEMPERATURE).len(), 1);
        assert_eq!(mcp_terms(&qk, &qq, &ids(&[1, 1, 3]), &queue_ids, TEMPERATURE).len(), 2);
        assert_eq!(mcp_terms(&qk, &qq, &ids(&[1, 1, 7]), &queue_ids, TEMPERATURE).len(), 3);
    }

    #[test]
    fn hierarchical_with_two_views_one_level_equals_simclr() {
        tch::manual_seed(7);
        let levels = randn(&[1, 2, 5, 8]);
        let h = scalar(&hierarchical_loss(&levels, TEMPERATURE).unwrap());
        let s = scalar(&simclr_loss(&levels.get(0).get(0), &levels.get(0).get(1), TEMPERATURE));
        assert!((h - s).abs() < 1e-6);
    }

    #[test]
    fn engine_requires_identities_for_cmsc() {
        let out = ProjectorOutput::Views(randn(&[2, 4, 8]));
        let err = LossEngine::new(Paradigm::Cmsc).compute(&out, None).unwrap_err();
        assert!(matches!(err, TrainError::MissingIdentities { .. }));
    }

    #[test]
    fn engine_rejects_mismatched_output() {
        let out = ProjectorOutput::Levels(randn(&[1, 2, 4, 8]));
        assert!(LossEngine::new(Paradigm::Simclr).compute(&out, None).is_err());
    }
}
