//! Signal encoders mapping an ECG window to a fixed-size embedding.
//!
//! The contrastive machinery only relies on the [`Encoder`] trait: a
//! deterministic-at-inference, differentiable map
//! `[B, channels, length] -> [B, embed_dim]` whose parameters live in a
//! [`nn::VarStore`] owned by the encoder. Owning the store per encoder is what
//! lets the momentum pair keep query and key parameters fully independent.
//!
//! # Architectures
//!
//! ```text
//! Cnn3                               Res20
//! ────                               ─────
//! [Conv1d → BN → ReLU → MaxPool] ×3  Conv1d(k=7) → BN → ReLU
//!            │                       3 stages × 3 ResidualBlock (16/32/64 ch)
//!     GlobalAvgPool                          │
//!            │                        GlobalAvgPool
//!     Linear(128 → D)                 Linear(64 → D)
//! ```
//!
//! Weights are initialised from scratch with the tch defaults.

use tch::{nn, nn::ModuleT, Device, Tensor};

use crate::config::{Backbone, TrainingConfig};
use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Encoder trait
// ---------------------------------------------------------------------------

/// An embedding network with its own parameter store.
pub trait Encoder {
    /// Encode `window` (`[B, C, S]`) into `[B, embed_dim]`.
    ///
    /// `train` selects batch statistics vs. running statistics in the
    /// normalisation layers.
    fn encode(&self, window: &Tensor, train: bool) -> Tensor;

    /// Output dimensionality.
    fn embed_dim(&self) -> i64;

    /// Parameter store backing this encoder.
    fn var_store(&self) -> &nn::VarStore;

    /// Mutable access to the parameter store.
    fn var_store_mut(&mut self) -> &mut nn::VarStore;
}

// ---------------------------------------------------------------------------
// SignalEncoder
// ---------------------------------------------------------------------------

/// Convolutional 1-D encoder for single- or multi-lead ECG windows.
pub struct SignalEncoder {
    vs: nn::VarStore,
    net: nn::SequentialT,
    backbone: Backbone,
    in_channels: i64,
    embed_dim: i64,
}

impl SignalEncoder {
    /// Build a fresh encoder on `device`.
    ///
    /// All parameters are registered under the `encoder` prefix of a new
    /// [`nn::VarStore`], so two encoders built with the same arguments have
    /// identical variable names and shapes.
    pub fn new(backbone: Backbone, in_channels: usize, embed_dim: usize, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let in_channels = in_channels as i64;
        let embed_dim = embed_dim as i64;
        let net = {
            let root = vs.root() / "encoder";
            match backbone {
                Backbone::Cnn3 => cnn3(&root, in_channels, embed_dim),
                Backbone::Res20 => res20(&root, in_channels, embed_dim),
            }
        };
        SignalEncoder { vs, net, backbone, in_channels, embed_dim }
    }

    /// Build the encoder described by `config`.
    pub fn from_config(config: &TrainingConfig, device: Device) -> Self {
        Self::new(config.backbone, config.in_channels, config.embed_dim, device)
    }

    /// Architecture of this encoder.
    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    /// Number of input leads.
    pub fn in_channels(&self) -> i64 {
        self.in_channels
    }

    /// Count trainable parameters.
    pub fn num_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }

    /// Device the parameters live on.
    pub fn device(&self) -> Device {
        self.vs.device()
    }
}

impl Encoder for SignalEncoder {
    fn encode(&self, window: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(window, train)
    }

    fn embed_dim(&self) -> i64 {
        self.embed_dim
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

/// Build an encoder from a backbone name such as `"cnn3"` or `"res20"`.
///
/// # Errors
///
/// [`ConfigError::UnknownBackbone`] when `name` is not a known architecture.
pub fn load_backbone(
    name: &str,
    in_channels: usize,
    embed_dim: usize,
    device: Device,
) -> Result<SignalEncoder, ConfigError> {
    let backbone: Backbone = name.parse()?;
    Ok(SignalEncoder::new(backbone, in_channels, embed_dim, device))
}

// ---------------------------------------------------------------------------
// Cnn3
// ---------------------------------------------------------------------------

/// Three conv blocks, each halving the temporal resolution.
fn cnn3(p: &nn::Path, in_channels: i64, embed_dim: i64) -> nn::SequentialT {
    let blocks: [(i64, i64, i64); 3] = [(in_channels, 32, 7), (32, 64, 5), (64, 128, 3)];

    let mut seq = nn::seq_t();
    for (i, &(c_in, c_out, k)) in blocks.iter().enumerate() {
        let conv = nn::conv1d(
            p / format!("conv{i}"),
            c_in,
            c_out,
            k,
            nn::ConvConfig { padding: k / 2, bias: false, ..Default::default() },
        );
        let bn = nn::batch_norm1d(p / format!("bn{i}"), c_out, Default::default());
        seq = seq
            .add(conv)
            .add(bn)
            .add_fn(|x| x.relu().max_pool1d([2], [2], [0], [1], false));
    }

    seq.add_fn(|x| x.adaptive_avg_pool1d([1]).flatten(1, -1))
        .add(nn::linear(p / "fc", 128, embed_dim, Default::default()))
}

// ---------------------------------------------------------------------------
// Res20
// ---------------------------------------------------------------------------

/// Residual 1-D backbone: stem + 3 stages × 3 basic blocks + projection.
fn res20(p: &nn::Path, in_channels: i64, embed_dim: i64) -> nn::SequentialT {
    let stem_conv = nn::conv1d(
        p / "stem_conv",
        in_channels,
        16,
        7,
        nn::ConvConfig { padding: 3, bias: false, ..Default::default() },
    );
    let stem_bn = nn::batch_norm1d(p / "stem_bn", 16, Default::default());

    let mut seq = nn::seq_t().add(stem_conv).add(stem_bn).add_fn(|x| x.relu());

    let mut c_in = 16;
    for (stage, &(c_out, stride)) in [(16_i64, 1_i64), (32, 2), (64, 2)].iter().enumerate() {
        for block in 0..3 {
            let s = if block == 0 { stride } else { 1 };
            seq = seq.add(ResidualBlock::new(&(p / format!("s{stage}b{block}")), c_in, c_out, s));
            c_in = c_out;
        }
    }

    seq.add_fn(|x| x.adaptive_avg_pool1d([1]).flatten(1, -1))
        .add(nn::linear(p / "fc", c_in, embed_dim, Default::default()))
}

/// ResNet basic block for 1-D signals.
///
/// ```text
/// x ─── Conv1d(s) ─── BN ─── ReLU ─── Conv1d(1) ─── BN ──+── ReLU
///  │                                                      │
///  └── (1×1 conv + BN when shape changes) ───────────────┘
/// ```
#[derive(Debug)]
struct ResidualBlock {
    conv1: nn::Conv1D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv1D,
    bn2: nn::BatchNorm,
    shortcut: Option<(nn::Conv1D, nn::BatchNorm)>,
}

impl ResidualBlock {
    fn new(p: &nn::Path, c_in: i64, c_out: i64, stride: i64) -> Self {
        let conv = |name: &str, i: i64, k: i64, s: i64| {
            nn::conv1d(
                p / name,
                i,
                c_out,
                k,
                nn::ConvConfig { stride: s, padding: k / 2, bias: false, ..Default::default() },
            )
        };
        let shortcut = (c_in != c_out || stride != 1).then(|| {
            (
                conv("ds_conv", c_in, 1, stride),
                nn::batch_norm1d(p / "ds_bn", c_out, Default::default()),
            )
        });
        ResidualBlock {
            conv1: conv("conv1", c_in, 3, stride),
            bn1: nn::batch_norm1d(p / "bn1", c_out, Default::default()),
            conv2: conv("conv2", c_out, 3, 1),
            bn2: nn::batch_norm1d(p / "bn2", c_out, Default::default()),
            shortcut,
        }
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train);
        let residual = match &self.shortcut {
            Some((conv, bn)) => xs.apply(conv).apply_t(bn, train),
            None => xs.shallow_clone(),
        };
        (out + residual).relu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
