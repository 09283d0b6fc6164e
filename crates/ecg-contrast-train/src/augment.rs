//! View augmentation for contrastive ECG training.
//!
//! A recording `[leads, length]` is normalised lead by lead and then cropped
//! at random offsets into `N` views of `segment_len` samples. The hierarchical
//! paradigm repeats this for `L` levels. All randomness comes from a seeded
//! [`Xorshift64`], so a run with a fixed seed produces the same views.
//!
//! ```rust
//! use ecg_contrast_train::augment::{ViewAugmentor, Xorshift64};
//! use ndarray::Array2;
//!
//! let signal = Array2::from_shape_fn((1, 100), |(_, t)| (t as f32 * 0.3).sin());
//! let mut aug = ViewAugmentor::new(40, 2, 1, 7);
//! let views = aug.create_views(&signal).unwrap();
//! assert_eq!(views.shape(), &[2, 1, 40]);
//! ```

use ndarray::{s, Array, Array2, Array3, Array4, Axis, Dimension};
use tch::Tensor;

use crate::config::TrainingConfig;
use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// Xorshift64 PRNG
// ---------------------------------------------------------------------------

/// Lightweight 64-bit Xorshift PRNG for deterministic augmentation and
/// shuffling.
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    /// Create a new PRNG. Seed `0` is replaced with a fixed non-zero value.
    pub fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 0x853c49e6748fea9b } else { seed } }
    }

    /// Advance the state and return the next `u64`.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Return a uniformly distributed `f32` in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Return a uniformly distributed `usize` in `[lo, hi]` (inclusive).
    #[inline]
    pub fn next_usize_range(&mut self, lo: usize, hi: usize) -> usize {
        if lo >= hi {
            return lo;
        }
        lo + (self.next_u64() % (hi - lo + 1) as u64) as usize
    }
}

// ---------------------------------------------------------------------------
// Single-signal transforms
// ---------------------------------------------------------------------------

/// Z-score every lead (row) independently.
///
/// A flat lead is only mean-centred.
pub fn normalize(signal: &Array2<f32>) -> Array2<f32> {
    let mut out = signal.clone();
    for mut lead in out.axis_iter_mut(Axis(0)) {
        let n = lead.len();
        if n == 0 {
            continue;
        }
        let mean = lead.sum() / n as f32;
        let var = lead.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
        let std = var.sqrt();
        let scale = if std > 1e-8 { 1.0 / std } else { 1.0 };
        lead.mapv_inplace(|v| (v - mean) * scale);
    }
    out
}

/// Crop `segment_len` consecutive samples from every lead at a random offset.
///
/// # Errors
///
/// [`DatasetError::SegmentTooLong`] when the recording is shorter than
/// `segment_len`.
pub fn random_segment(
    signal: &Array2<f32>,
    segment_len: usize,
    rng: &mut Xorshift64,
) -> Result<Array2<f32>, DatasetError> {
    let signal_len = signal.ncols();
    if segment_len > signal_len {
        return Err(DatasetError::SegmentTooLong { segment_len, signal_len });
    }
    let start = rng.next_usize_range(0, signal_len - segment_len);
    Ok(signal.slice(s![.., start..start + segment_len]).to_owned())
}

/// Crop `segment_len` samples from the middle of every lead.
///
/// Deterministic counterpart of [`random_segment`] for evaluation.
pub fn center_segment(signal: &Array2<f32>, segment_len: usize) -> Result<Array2<f32>, DatasetError> {
    let signal_len = signal.ncols();
    if segment_len > signal_len {
        return Err(DatasetError::SegmentTooLong { segment_len, signal_len });
    }
    let start = (signal_len - segment_len) / 2;
    Ok(signal.slice(s![.., start..start + segment_len]).to_owned())
}

/// `num_views` independent crops of `signal`, stacked as `[N, C, S]`.
pub fn create_views(
    signal: &Array2<f32>,
    num_views: usize,
    segment_len: usize,
    rng: &mut Xorshift64,
) -> Result<Array3<f32>, DatasetError> {
    let mut views = Array3::zeros((num_views, signal.nrows(), segment_len));
    for v in 0..num_views {
        let segment = random_segment(signal, segment_len, rng)?;
        views.slice_mut(s![v, .., ..]).assign(&segment);
    }
    Ok(views)
}

/// `num_levels` independent sets of views, stacked as `[L, N, C, S]`.
pub fn create_levels(
    signal: &Array2<f32>,
    num_levels: usize,
    num_views: usize,
    segment_len: usize,
    rng: &mut Xorshift64,
) -> Result<Array4<f32>, DatasetError> {
    let mut levels = Array4::zeros((num_levels, num_views, signal.nrows(), segment_len));
    for l in 0..num_levels {
        let views = create_views(signal, num_views, segment_len, rng)?;
        levels.slice_mut(s![l, .., .., ..]).assign(&views);
    }
    Ok(levels)
}

// ---------------------------------------------------------------------------
// ViewAugmentor
// ---------------------------------------------------------------------------

/// Stateful augmentation pipeline: normalise, then crop views.
#[derive(Debug, Clone)]
pub struct ViewAugmentor {
    segment_len: usize,
    num_views: usize,
    num_levels: usize,
    rng: Xorshift64,
}

impl ViewAugmentor {
    /// Create an augmentor producing `num_views` crops of `segment_len`
    /// samples (per level, `num_levels` levels) seeded with `seed`.
    pub fn new(segment_len: usize, num_views: usize, num_levels: usize, seed: u64) -> Self {
        ViewAugmentor { segment_len, num_views, num_levels, rng: Xorshift64::new(seed) }
    }

    /// Augmentor matching the view layout of `config`.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.segment_len, config.num_views, config.num_levels, config.seed)
    }

    /// `[N, C, S]` views of a normalised copy of `signal`.
    pub fn create_views(&mut self, signal: &Array2<f32>) -> Result<Array3<f32>, DatasetError> {
        create_views(&normalize(signal), self.num_views, self.segment_len, &mut self.rng)
    }

    /// `[L, N, C, S]` levels of a normalised copy of `signal`.
    pub fn create_levels(&mut self, signal: &Array2<f32>) -> Result<Array4<f32>, DatasetError> {
        create_levels(
            &normalize(signal),
            self.num_levels,
            self.num_views,
            self.segment_len,
            &mut self.rng,
        )
    }

    /// A single normalised crop, `[C, S]`, for supervised training.
    pub fn segment(&mut self, signal: &Array2<f32>) -> Result<Array2<f32>, DatasetError> {
        random_segment(&normalize(signal), self.segment_len, &mut self.rng)
    }

    /// The normalised centre crop, `[C, S]`, for evaluation.
    pub fn center(&self, signal: &Array2<f32>) -> Result<Array2<f32>, DatasetError> {
        center_segment(&normalize(signal), self.segment_len)
    }

    /// Crop length in samples.
    pub fn segment_len(&self) -> usize {
        self.segment_len
    }
}

// ---------------------------------------------------------------------------
// Collation
// ---------------------------------------------------------------------------

/// Stack equally shaped arrays into a `[B, ...]` float tensor.
///
/// # Errors
///
/// - [`DatasetError::EmptyBatch`] for an empty slice.
/// - [`DatasetError::RaggedBatch`] when shapes differ.
pub fn collate<D: Dimension>(arrays: &[Array<f32, D>]) -> Result<Tensor, DatasetError> {
    let first = arrays.first().ok_or(DatasetError::EmptyBatch)?;
    let expected = first.shape().to_vec();

    let mut flat = Vec::with_capacity(arrays.len() * first.len());
    for (index, a) in arrays.iter().enumerate() {
        if a.shape() != expected.as_slice() {
            return Err(DatasetError::RaggedBatch {
                index,
                expected,
                found: a.shape().to_vec(),
            });
        }
        flat.extend(a.iter().copied());
    }

    let shape: Vec<i64> = std::iter::once(arrays.len() as i64)
        .chain(expected.iter().map(|&d| d as i64))
        .collect();
    Ok(Tensor::from_slice(&flat).view(shape.as_slice()))
}

/// `[B, N, C, S]` batch from per-sample views.
pub fn collate_views(views: &[Array3<f32>]) -> Result<Tensor, DatasetError> {
    collate(views)
}

/// `[B, L, N, C, S]` batch from per-sample levels.
pub fn collate_levels(levels: &[Array4<f32>]) -> Result<Tensor, DatasetError> {
    collate(levels)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
