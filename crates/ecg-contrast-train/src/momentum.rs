//! Query/key encoder pair with an exponential-moving-average key.
//!
//! The key encoder never receives gradients: at construction its parameters
//! are copied from the query encoder and frozen, and afterwards they change
//! only through [`MomentumPair::update`]:
//!
//! ```text
//! key ← m · key + (1 − m) · query
//! ```
//!
//! Only parameters (variables with `requires_grad` on the query side) take
//! part in the average. Normalisation running statistics of the key encoder
//! evolve through its own forward passes.
//!
//! Keys for a batch are produced by [`MomentumPair::momentum_keys`], which
//! performs the update first and then the shuffled key forward pass, so the
//! key encoder used for a batch always reflects that step's update. A caller
//! that may still abandon the step takes a [`KeySnapshot`] first and hands it
//! back to [`MomentumPair::restore_key`].

use std::collections::HashMap;

use tch::{Kind, Tensor};
use tracing::debug;

use crate::encoder::Encoder;
use crate::error::{ConfigError, ShapeError, TrainError, TrainResult};

/// Deep copy of every key-encoder variable, running statistics included.
pub struct KeySnapshot {
    vars: HashMap<String, Tensor>,
}

/// A query encoder and its momentum-averaged key encoder.
pub struct MomentumPair<E: Encoder> {
    query: E,
    key: E,
    momentum: f64,
}

impl<E: Encoder> MomentumPair<E> {
    /// Pair `query` with `key`, overwriting the key parameters with a copy of
    /// the query parameters and freezing them.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidValue`] when `momentum ∉ (0, 1)`.
    /// - [`TrainError::Torch`] when the two encoders do not share variable
    ///   names and shapes.
    pub fn new(query: E, mut key: E, momentum: f64) -> TrainResult<Self> {
        if !(momentum > 0.0 && momentum < 1.0) {
            return Err(ConfigError::invalid_value("momentum", "must be in (0.0, 1.0)").into());
        }
        key.var_store_mut().copy(query.var_store())?;
        key.var_store_mut().freeze();
        Ok(MomentumPair { query, key, momentum })
    }

    /// The gradient-trained encoder.
    pub fn query(&self) -> &E {
        &self.query
    }

    /// Mutable access to the query encoder (e.g. to restore weights).
    pub fn query_mut(&mut self) -> &mut E {
        &mut self.query
    }

    /// The momentum-averaged encoder.
    pub fn key(&self) -> &E {
        &self.key
    }

    /// Mutable access to the key encoder (checkpoint restore only).
    pub fn key_mut(&mut self) -> &mut E {
        &mut self.key
    }

    /// Momentum coefficient `m`.
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Apply one momentum step to every parameter of the key encoder.
    ///
    /// Runs without gradient tracking. All parameter pairs are matched and
    /// shape-checked before the first one is written.
    pub fn update(&mut self) -> TrainResult<()> {
        let query_vars = self.query.var_store().variables();
        let key_vars = self.key.var_store().variables();
        let pairs = parameter_pairs(&query_vars, &key_vars)?;

        let m = self.momentum;
        tch::no_grad(|| {
            for (q, k) in pairs {
                let mut k = k.shallow_clone();
                let blended = &k * m + q * (1.0 - m);
                k.copy_(&blended);
            }
        });
        Ok(())
    }

    /// Encode `view` with the key encoder behind a random batch permutation.
    ///
    /// The permutation breaks batch-statistic alignment between the query and
    /// key views; the inverse permutation restores the original sample
    /// order, so row `i` of the result is the key of sample `i`.
    pub fn shuffle_forward(&self, view: &Tensor, train: bool) -> Tensor {
        let batch = view.size()[0];
        let perm = Tensor::randperm(batch, (Kind::Int64, view.device()));
        self.shuffle_forward_with(view, &perm, train)
    }

    /// [`shuffle_forward`](Self::shuffle_forward) with a caller-supplied
    /// permutation of `0..B`.
    pub fn shuffle_forward_with(&self, view: &Tensor, perm: &Tensor, train: bool) -> Tensor {
        tch::no_grad(|| {
            let keys = self.key.encode(&view.index_select(0, perm), train);
            let inverse = perm.argsort(0, false);
            keys.index_select(0, &inverse)
        })
    }

    /// Copy the current key-encoder state.
    pub fn snapshot_key(&self) -> KeySnapshot {
        let vars = self
            .key
            .var_store()
            .variables()
            .into_iter()
            .map(|(name, t)| (name, t.detach().copy()))
            .collect();
        KeySnapshot { vars }
    }

    /// Write `snapshot` back into the key encoder.
    ///
    /// Variables absent from the snapshot are left as they are.
    pub fn restore_key(&mut self, snapshot: &KeySnapshot) {
        let key_vars = self.key.var_store().variables();
        tch::no_grad(|| {
            for (name, mut k) in key_vars {
                if let Some(saved) = snapshot.vars.get(&name) {
                    k.copy_(saved);
                }
            }
        });
    }

    /// Momentum-update the key encoder, then encode `view` with it.
    ///
    /// This is the only order in which keys should be produced during
    /// training.
    pub fn momentum_keys(&mut self, view: &Tensor, train: bool) -> TrainResult<Tensor> {
        self.update()?;
        let keys = self.shuffle_forward(view, train);
        debug!(batch = keys.size()[0], "computed momentum keys");
        Ok(keys)
    }
}

/// Match every trainable query parameter with the key variable of the same
/// name and shape.
fn parameter_pairs<'a>(
    query_vars: &'a HashMap<String, Tensor>,
    key_vars: &'a HashMap<String, Tensor>,
) -> TrainResult<Vec<(&'a Tensor, &'a Tensor)>> {
    let mut pairs = Vec::with_capacity(query_vars.len());
    for (name, q) in query_vars.iter().filter(|(_, q)| q.requires_grad()) {
        let k = key_vars.get(name).ok_or_else(|| {
            TrainError::training_step(format!("key encoder has no parameter `{name}`"))
        })?;
        if k.size() != q.size() {
            return Err(ShapeError::mismatch("momentum parameter", q.size(), k.size()).into());
        }
        pairs.push((q, k));
    }
    Ok(pairs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backbone;
    use crate::encoder::SignalEncoder;
    use tch::Device;

    fn pair(momentum: f64) -> MomentumPair<SignalEncoder> {
        tch::manual_seed(7);
        let q = SignalEncoder::new(Backbone::Cnn3, 1, 8, Device::Cpu);
        let k = SignalEncoder::new(Backbone::Cnn3, 1, 8, Device::Cpu);
        MomentumPair::new(q, k, momentum).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn key_starts_equal_to_query() {
        let p = pair(0.9);
        let k_vars = p.key().var_store().variables();
        for (name, q) in p.query().var_store().variables() {
            assert_eq!(max_abs_diff(&q, &k_vars[&name]), 0.0, "{name} differs at construction");
        }
    }

    #[test]
    fn key_parameters_do_not_require_grad() {
        let p = pair(0.9);
        for t in p.key().var_store().trainable_variables() {
            assert!(!t.requires_grad());
        }
        assert!(p
            .query()
            .var_store()
            .trainable_variables()
            .iter()
            .all(|t| t.requires_grad()));
    }

    #[test]
    fn invalid_momentum_is_rejected() {
        let q = SignalEncoder::new(Backbone::Cnn3, 1, 8, Device::Cpu);
        let k = SignalEncoder::new(Backbone::Cnn3, 1, 8, Device::Cpu);
        assert!(MomentumPair::new(q, k, 1.0).is_err());
    }

    #[test]
    fn update_without_query_change_keeps_key() {
        let mut p = pair(0.5);
        p.update().unwrap();
        let k_vars = p.key().var_store().variables();
        for (name, q) in p.query().var_store().variables() {
            assert!(max_abs_diff(&q, &k_vars[&name]) < 1e-6);
        }
    }

    #[test]
    fn restore_key_undoes_update_and_forward() {
        let mut p = pair(0.5);
        tch::no_grad(|| {
            for mut t in p.query_mut().var_store_mut().trainable_variables() {
                let shifted = &t + 1.0;
                t.copy_(&shifted);
            }
        });
        let saved = p.snapshot_key();
        let x = Tensor::randn([4, 1, 64], (Kind::Float, Device::Cpu));
        p.momentum_keys(&x, true).unwrap();

        p.restore_key(&saved);
        for (name, k) in p.key().var_store().variables() {
            assert_eq!(max_abs_diff(&k, &saved.vars[&name]), 0.0, "{name} not restored");
        }
    }

    #[test]
    fn shuffle_forward_restores_sample_order_in_eval_mode() {
        let p = pair(0.9);
        let x = Tensor::randn([6, 1, 64], (Kind::Float, Device::Cpu));
        let plain = p.key().encode(&x, false);
        let perm = Tensor::from_slice(&[3_i64, 0, 5, 1, 4, 2]);
        let shuffled = p.shuffle_forward_with(&x, &perm, false);
        assert!(max_abs_diff(&plain, &shuffled) < 1e-5);
        assert!(!shuffled.requires_grad());
    }
}
