//! Dataset abstractions and concrete implementations for ECG pre-training.
//!
//! This module defines the [`EcgDataset`] trait plus two concrete
//! implementations:
//!
//! - [`InMemoryEcgDataset`]: recordings already decoded into memory, filtered
//!   for unusable signals on construction.
//! - [`SyntheticEcgDataset`]: fully deterministic ECG-like waveforms for
//!   several synthetic patients; useful for tests and dry runs. **Never uses
//!   random data.**
//!
//! A [`DataLoader`] wraps any [`EcgDataset`] and provides batched iteration
//! with an optional deterministic shuffle (seeded, varied per epoch).
//! [`IdentityRegistry`] interns record/patient names into the dense integer
//! labels the identity-aware losses consume.
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use ecg_contrast_train::dataset::{EcgDataset, SyntheticEcgConfig, SyntheticEcgDataset};
//!
//! let ds = SyntheticEcgDataset::new(4, 3, SyntheticEcgConfig::default());
//! assert_eq!(ds.len(), 12);
//! let sample = ds.get(5).unwrap();
//! assert_eq!(sample.signal.shape(), &[1, 2500]);
//! assert_eq!(sample.identity, "P0001");
//! ```

use ndarray::Array2;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::augment::Xorshift64;
use crate::error::{ConfigError, DatasetError};

// ---------------------------------------------------------------------------
// EcgSample
// ---------------------------------------------------------------------------

/// A single ECG recording with its patient identity and optional class.
#[derive(Debug, Clone)]
pub struct EcgSample {
    /// Signal, `[leads, length]`.
    pub signal: Array2<f32>,
    /// Patient (or record) identifier. Samples with equal identities are
    /// positives for the patient-aware objectives.
    pub identity: String,
    /// Rhythm class for supervised fine-tuning, when known.
    pub label: Option<i64>,
}

/// Reject recordings that contain NaN values or a lead that is all zeros.
///
/// # Errors
///
/// [`DatasetError::InvalidSignal`] naming `record` and the reason.
pub fn validate_signal(record: &str, signal: &Array2<f32>) -> Result<(), DatasetError> {
    if signal.is_empty() {
        return Err(DatasetError::invalid_signal(record, "signal is empty"));
    }
    if signal.iter().any(|v| v.is_nan()) {
        return Err(DatasetError::invalid_signal(record, "signal contains NaN"));
    }
    if let Some(lead) = signal.outer_iter().position(|lead| lead.iter().all(|&v| v == 0.0)) {
        return Err(DatasetError::invalid_signal(record, format!("lead {lead} is all zeros")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EcgDataset trait
// ---------------------------------------------------------------------------

/// Common interface for all ECG datasets.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// data-loading threads without additional synchronisation.
pub trait EcgDataset: Send + Sync {
    /// Total number of samples in this dataset.
    fn len(&self) -> usize;

    /// Load the sample at position `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()`.
    fn get(&self, idx: usize) -> Result<EcgSample, DatasetError>;

    /// Returns `true` when the dataset contains no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// InMemoryEcgDataset
// ---------------------------------------------------------------------------

/// Decoded recordings held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryEcgDataset {
    name: String,
    samples: Vec<EcgSample>,
}

impl InMemoryEcgDataset {
    /// Build a dataset, dropping every sample that fails [`validate_signal`].
    pub fn new<S: Into<String>>(name: S, samples: Vec<EcgSample>) -> Self {
        let name = name.into();
        let total = samples.len();
        let samples: Vec<EcgSample> = samples
            .into_iter()
            .filter(|s| match validate_signal(&s.identity, &s.signal) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping sample: {e}");
                    false
                }
            })
            .collect();
        info!("{name}: kept {} of {total} recordings", samples.len());
        InMemoryEcgDataset { name, samples }
    }

    /// Split every multi-lead recording into single-lead samples that keep
    /// the identity and label of their source.
    pub fn explode_leads(self) -> Self {
        let mut samples = Vec::new();
        for s in self.samples {
            for lead in s.signal.outer_iter() {
                samples.push(EcgSample {
                    signal: lead.insert_axis(ndarray::Axis(0)).to_owned(),
                    identity: s.identity.clone(),
                    label: s.label,
                });
            }
        }
        debug!("{}: exploded into {} single-lead samples", self.name, samples.len());
        InMemoryEcgDataset { name: self.name, samples }
    }

    /// Partition by identity so no patient appears on both sides.
    ///
    /// Roughly `holdout_fraction` of the identities (chosen by a seeded
    /// shuffle) go to the second dataset.
    pub fn split_by_identity(&self, holdout_fraction: f64, seed: u64) -> (Self, Self) {
        let mut identities: Vec<&str> = Vec::new();
        for s in &self.samples {
            if !identities.contains(&s.identity.as_str()) {
                identities.push(&s.identity);
            }
        }
        let mut order: Vec<usize> = (0..identities.len()).collect();
        xorshift_shuffle(&mut order, seed);
        let n_holdout = ((identities.len() as f64) * holdout_fraction.clamp(0.0, 1.0)).round() as usize;
        let holdout: Vec<&str> = order[..n_holdout].iter().map(|&i| identities[i]).collect();

        let (held, kept): (Vec<EcgSample>, Vec<EcgSample>) = self
            .samples
            .iter()
            .cloned()
            .partition(|s| holdout.contains(&s.identity.as_str()));
        (
            InMemoryEcgDataset { name: format!("{}-train", self.name), samples: kept },
            InMemoryEcgDataset { name: format!("{}-holdout", self.name), samples: held },
        )
    }
}

impl EcgDataset for InMemoryEcgDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize) -> Result<EcgSample, DatasetError> {
        self.samples
            .get(idx)
            .cloned()
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.samples.len() })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// SyntheticEcgDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticEcgDataset`].
///
/// All fields are plain numbers; no randomness is involved.
#[derive(Debug, Clone)]
pub struct SyntheticEcgConfig {
    /// Number of leads. Default: **1**.
    pub num_leads: usize,
    /// Samples per recording. Default: **2500** (10 s at 250 Hz).
    pub signal_len: usize,
    /// Sampling rate. Default: **250 Hz**.
    pub sampling_rate_hz: f32,
    /// Number of rhythm classes patients are spread over. Default: **4**.
    pub num_classes: usize,
}

impl Default for SyntheticEcgConfig {
    fn default() -> Self {
        SyntheticEcgConfig {
            num_leads: 1,
            signal_len: 2500,
            sampling_rate_hz: 250.0,
            num_classes: 4,
        }
    }
}

/// Deterministic multi-patient ECG-like dataset.
///
/// Sample `idx` belongs to patient `idx / records_per_patient`. Each beat is
/// a sum of three Gaussian bumps (P wave, QRS complex, T wave):
///
/// ```text
/// x(t) = g(t; 0.16, 0.025, 0.15) + g(t; 0.30, 0.012, 1.0) + g(t; 0.55, 0.04, 0.3)
/// ```
///
/// evaluated on the phase of the beat. The heart rate depends on the patient
/// (`50 + 9 · (patient mod 9)` bpm), each record of a patient starts at a
/// different phase, and lead `c` is scaled by `1 / (c + 1)`. The class label
/// is `patient mod num_classes`.
pub struct SyntheticEcgDataset {
    num_patients: usize,
    records_per_patient: usize,
    config: SyntheticEcgConfig,
}

impl SyntheticEcgDataset {
    /// Create `num_patients × records_per_patient` recordings.
    pub fn new(num_patients: usize, records_per_patient: usize, config: SyntheticEcgConfig) -> Self {
        SyntheticEcgDataset { num_patients, records_per_patient, config }
    }

    /// Number of distinct identities.
    pub fn num_patients(&self) -> usize {
        self.num_patients
    }

    #[inline]
    fn value(&self, patient: usize, record: usize, lead: usize, t: usize) -> f32 {
        let bpm = 50.0 + 9.0 * (patient % 9) as f32;
        let beat_s = 60.0 / bpm;
        let time_s = t as f32 / self.config.sampling_rate_hz + 0.137 * record as f32;
        let phase = (time_s / beat_s).fract();

        let bump = |centre: f32, width: f32, amp: f32| {
            let d = (phase - centre) / width;
            amp * (-0.5 * d * d).exp()
        };
        let beat = bump(0.16, 0.025, 0.15) + bump(0.30, 0.012, 1.0) + bump(0.55, 0.04, 0.3);
        // Small patient-specific baseline so no lead is ever identically zero.
        let baseline = 0.01 * (1.0 + patient as f32 * 0.1).sin() + 0.02;
        (beat + baseline) / (lead as f32 + 1.0)
    }
}

impl EcgDataset for SyntheticEcgDataset {
    fn len(&self) -> usize {
        self.num_patients * self.records_per_patient
    }

    fn get(&self, idx: usize) -> Result<EcgSample, DatasetError> {
        if idx >= self.len() {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.len() });
        }
        let patient = idx / self.records_per_patient;
        let record = idx % self.records_per_patient;
        let cfg = &self.config;

        let signal = Array2::from_shape_fn((cfg.num_leads, cfg.signal_len), |(c, t)| {
            self.value(patient, record, c, t)
        });

        Ok(EcgSample {
            signal,
            identity: format!("P{patient:04}"),
            label: Some((patient % cfg.num_classes.max(1)) as i64),
        })
    }

    fn name(&self) -> &str {
        "SyntheticEcgDataset"
    }
}

// ---------------------------------------------------------------------------
// IdentityRegistry
// ---------------------------------------------------------------------------

/// Interns identity strings into dense non-negative `i64` labels.
///
/// Labels are assigned in first-seen order and stay stable for the lifetime
/// of the registry, so the same patient gets the same label in every batch.
#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    ids: HashMap<String, i64>,
    names: Vec<String>,
}

impl IdentityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for `name`, assigning the next free label if unseen.
    pub fn intern(&mut self, name: &str) -> i64 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as i64;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }

    /// Labels for every sample of a batch, in order.
    pub fn intern_batch(&mut self, samples: &[EcgSample]) -> Vec<i64> {
        samples.iter().map(|s| self.intern(&s.identity)).collect()
    }

    /// Label of `name`, if already interned.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    /// Name behind `id`.
    pub fn name(&self, id: i64) -> Option<&str> {
        usize::try_from(id).ok().and_then(|i| self.names.get(i)).map(String::as_str)
    }

    /// Number of distinct identities.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// `true` when nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

/// Batched, optionally-shuffled iterator over an [`EcgDataset`].
///
/// The shuffle order is fully deterministic: given the same `seed`, epoch and
/// dataset length the iteration order is always identical. Samples that fail
/// to load or fail [`validate_signal`] are skipped with a `warn!` and the
/// batch is refilled from the following indices, so every batch except
/// possibly the last is full. With `drop_last` the short final batch is
/// discarded, which the queue paradigms need.
pub struct DataLoader<'a> {
    dataset: &'a dyn EcgDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
}

impl<'a> DataLoader<'a> {
    /// Create a new `DataLoader`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when `batch_size == 0`.
    pub fn new(
        dataset: &'a dyn EcgDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        Ok(DataLoader { dataset, batch_size, shuffle, drop_last: false, seed })
    }

    /// Discard a final batch shorter than `batch_size`.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Upper bound on the number of batches per epoch (exact when every
    /// sample is valid).
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            (n + self.batch_size - 1) / self.batch_size
        }
    }

    /// Iterate the first epoch.
    pub fn iter(&self) -> DataLoaderIter<'_> {
        self.iter_epoch(0)
    }

    /// Iterate epoch `epoch`; each epoch has its own shuffle order.
    pub fn iter_epoch(&self, epoch: usize) -> DataLoaderIter<'_> {
        let n = self.dataset.len();
        let mut indices: Vec<usize> = (0..n).collect();
        if self.shuffle {
            let epoch_seed = self.seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            xorshift_shuffle(&mut indices, epoch_seed);
        }
        DataLoaderIter {
            dataset: self.dataset,
            indices,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            cursor: 0,
        }
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn EcgDataset,
    indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    cursor: usize,
}

impl<'a> Iterator for DataLoaderIter<'a> {
    type Item = Vec<EcgSample>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size && self.cursor < self.indices.len() {
            let idx = self.indices[self.cursor];
            self.cursor += 1;
            let loaded = self
                .dataset
                .get(idx)
                .and_then(|s| validate_signal(&s.identity, &s.signal).map(|()| s));
            match loaded {
                Ok(sample) => batch.push(sample),
                Err(e) => warn!("Skipping sample {idx}: {e}"),
            }
        }
        if batch.is_empty() || (self.drop_last && batch.len() < self.batch_size) {
            None
        } else {
            Some(batch)
        }
    }
}

// ---------------------------------------------------------------------------
// Xorshift shuffle
// ---------------------------------------------------------------------------

/// In-place Fisher-Yates shuffle driven by [`Xorshift64`] seeded with `seed`.
pub(crate) fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut rng = Xorshift64::new(seed);
    for i in (1..n).rev() {
        let j = (rng.next_u64() as usize) % (i + 1);
        indices.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &str, signal: Array2<f32>) -> EcgSample {
        EcgSample { signal, identity: identity.to_string(), label: None }
    }

    // ----- SyntheticEcgDataset --------------------------------------------

    #[test]
    fn synthetic_is_deterministic() {
        let ds = SyntheticEcgDataset::new(3, 2, SyntheticEcgConfig::default());
        assert_eq!(ds.get(4).unwrap().signal, ds.get(4).unwrap().signal);
    }

    #[test]
    fn synthetic_records_of_one_patient_differ() {
        let ds = SyntheticEcgDataset::new(2, 2, SyntheticEcgConfig::default());
        let a = ds.get(0).unwrap();
        let b = ds.get(1).unwrap();
        assert_eq!(a.identity, b.identity);
        assert_ne!(a.signal, b.signal);
    }

    #[test]
    fn synthetic_samples_are_valid() {
        let cfg = SyntheticEcgConfig { num_leads: 12, ..Default::default() };
        let ds = SyntheticEcgDataset::new(5, 1, cfg);
        for i in 0..ds.len() {
            let s = ds.get(i).unwrap();
            validate_signal(&s.identity, &s.signal).unwrap();
        }
    }

    #[test]
    fn synthetic_out_of_bounds() {
        let ds = SyntheticEcgDataset::new(2, 2, SyntheticEcgConfig::default());
        assert!(matches!(ds.get(4), Err(DatasetError::IndexOutOfBounds { idx: 4, len: 4 })));
    }

    // ----- validation ------------------------------------------------------

    #[test]
    fn nan_and_zero_leads_are_rejected() {
        let mut nan = Array2::<f32>::ones((2, 8));
        nan[[1, 3]] = f32::NAN;
        assert!(validate_signal("a", &nan).is_err());

        let mut zero_lead = Array2::<f32>::ones((2, 8));
        zero_lead.row_mut(1).fill(0.0);
        assert!(validate_signal("b", &zero_lead).is_err());

        assert!(validate_signal("c", &Array2::<f32>::ones((2, 8))).is_ok());
    }

    #[test]
    fn in_memory_dataset_filters_invalid() {
        let mut bad = Array2::<f32>::ones((1, 4));
        bad[[0, 0]] = f32::NAN;
        let ds = InMemoryEcgDataset::new(
            "mem",
            vec![sample("x", Array2::ones((1, 4))), sample("y", bad)],
        );
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.get(0).unwrap().identity, "x");
    }

    #[test]
    fn explode_leads_keeps_identity() {
        let ds = InMemoryEcgDataset::new("mem", vec![sample("x", Array2::ones((3, 4)))]).explode_leads();
        assert_eq!(ds.len(), 3);
        let s = ds.get(2).unwrap();
        assert_eq!(s.signal.shape(), &[1, 4]);
        assert_eq!(s.identity, "x");
    }

    #[test]
    fn identity_split_is_disjoint() {
        let samples = (0..20)
            .map(|i| sample(&format!("p{}", i % 5), Array2::ones((1, 4))))
            .collect();
        let (train, holdout) = InMemoryEcgDataset::new("mem", samples).split_by_identity(0.4, 3);
        assert_eq!(train.len() + holdout.len(), 20);
        assert_eq!(holdout.len(), 8);
        for i in 0..holdout.len() {
            let id = holdout.get(i).unwrap().identity;
            assert!((0..train.len()).all(|j| train.get(j).unwrap().identity != id));
        }
    }

    // ----- IdentityRegistry -----------------------------------------------

    #[test]
    fn registry_interns_densely() {
        let mut reg = IdentityRegistry::new();
        assert_eq!(reg.intern("b"), 0);
        assert_eq!(reg.intern("a"), 1);
        assert_eq!(reg.intern("b"), 0);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.name(1), Some("a"));
        assert_eq!(reg.name(-1), None);
    }

    // ----- DataLoader -------------------------------------------------------

    #[test]
    fn dataloader_rejects_zero_batch() {
        let ds = SyntheticEcgDataset::new(1, 1, SyntheticEcgConfig::default());
        assert!(DataLoader::new(&ds, 0, false, 0).is_err());
    }

    #[test]
    fn dataloader_drop_last() {
        let ds = SyntheticEcgDataset::new(5, 2, SyntheticEcgConfig { signal_len: 8, ..Default::default() });
        let dl = DataLoader::new(&ds, 4, true, 1).unwrap().with_drop_last(true);
        assert_eq!(dl.num_batches(), 2);
        let sizes: Vec<usize> = dl.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[test]
    fn dataloader_epochs_shuffle_differently() {
        let ds = SyntheticEcgDataset::new(16, 1, SyntheticEcgConfig { signal_len: 8, ..Default::default() });
        let dl = DataLoader::new(&ds, 16, true, 7).unwrap();
        let order = |epoch| -> Vec<String> {
            dl.iter_epoch(epoch).flatten().map(|s| s.identity).collect()
        };
        assert_eq!(order(0), order(0));
        assert_ne!(order(0), order(1));
    }

    #[test]
    fn xorshift_shuffle_is_permutation() {
        let mut indices: Vec<usize> = (0..20).collect();
        xorshift_shuffle(&mut indices, 42);
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
