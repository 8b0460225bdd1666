//! Reference layer kernels and the per-layer compute capability.
//!
//! Kernels read and write caller-owned `f32` slices with explicit row
//! counts; internally they use candle tensors. Each rank holds only its
//! tensor-parallel shard of every weight, so attention and FFN outputs are
//! partial sums that the caller reduce-adds across the TP group.

mod attention;
mod decoder_layer;
mod embedding;
mod linear;
mod mlp;
mod normalization;
mod rotary;

pub use attention::{repeat_kv, Attention};
pub use decoder_layer::{build_layer, DecoderLayer};
pub use embedding::{Embedding, OutputHead};
pub use linear::{split_range, DistLinear, Linear};
pub use mlp::Mlp;
pub use normalization::Norm;
pub use rotary::RotaryEmbedding;

use candle_core::{bail, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ModelConfig};
use crate::kv_cache::LayerCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    #[default]
    RmsNorm,
    LayerNorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Gated: `down(silu(gate(x)) * up(x))`.
    #[default]
    Silu,
    /// Two-layer: `fc2(gelu(fc1(x)))`.
    Gelu,
    /// Two-layer: `fc2(relu(fc1(x)))`.
    Relu,
}

impl ActivationKind {
    pub fn is_gated(self) -> bool {
        matches!(self, Self::Silu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantKind {
    #[default]
    None,
    /// Per-column u8 weights with scale and zero point.
    Int8,
}

/// How the gated MLP's gate and up projections are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpProjection {
    /// One matmul over the concatenated gate|up weight. Fewer passes over
    /// the activation, one larger temporary.
    #[default]
    Fused,
    /// Two separate matmuls.
    Unfused,
}

/// Runtime selection of a layer implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerKind {
    pub norm: NormKind,
    pub activation: ActivationKind,
    pub quant: QuantKind,
    pub projection: MlpProjection,
}

/// Per-rank layer dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerShape {
    pub hidden: usize,
    pub head_dim: usize,
    pub total_heads: usize,
    pub total_kv_heads: usize,
    /// Query heads owned by this rank.
    pub heads: usize,
    /// KV heads owned by this rank.
    pub kv_heads: usize,
    pub total_intermediate: usize,
    pub eps: f64,
    pub tp_rank: usize,
    pub tp_size: usize,
}

impl LayerShape {
    pub fn new(config: &ModelConfig, tp_rank: usize, tp_size: usize) -> std::result::Result<Self, ConfigError> {
        let heads = config.num_attention_heads;
        let kv_heads = config.num_key_value_heads;
        if heads % tp_size != 0 || kv_heads % tp_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "{heads} attention heads / {kv_heads} kv heads cannot be split over {tp_size} ranks"
            )));
        }
        Ok(Self {
            hidden: config.hidden_size,
            head_dim: config.head_dim,
            total_heads: heads,
            total_kv_heads: kv_heads,
            heads: heads / tp_size,
            kv_heads: kv_heads / tp_size,
            total_intermediate: config.intermediate_size,
            eps: config.norm_eps,
            tp_rank,
            tp_size,
        })
    }

    /// Intermediate columns owned by this rank.
    pub fn intermediate_range(&self) -> std::ops::Range<usize> {
        split_range(self.total_intermediate, self.tp_size, self.tp_rank)
    }
}

/// Shape of the tokens processed in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepShape {
    /// Sequences in this call.
    pub batch: usize,
    /// New tokens per sequence.
    pub seq: usize,
    /// Tokens already in the cache before this call.
    pub past: usize,
}

impl StepShape {
    pub fn rows(&self) -> usize {
        self.batch * self.seq
    }

    pub fn kv_len(&self) -> usize {
        self.past + self.seq
    }
}

/// One decoder layer's compute, as seen by the orchestrator.
///
/// Outputs are this rank's partial contribution. The rank passing
/// `add_residual = true` also adds the residual and any row-parallel bias,
/// so the group-wide sum is `residual + full_output`.
pub trait LayerCompute: Send {
    /// Self-attention over `input` (`step.rows() × hidden`). Writes this
    /// call's keys and values into `cache` at `[past, past + seq)`.
    #[allow(clippy::too_many_arguments)]
    fn forward_attention(
        &self,
        step: &StepShape,
        input: &[f32],
        output: &mut [f32],
        mask: &[f32],
        cache: &LayerCache,
        positions: &[u32],
        add_residual: bool,
    ) -> Result<()>;

    /// Feed-forward on `input`. `residual`, when given, is added to the
    /// output; the down-projection bias is added only when `add_bias`.
    fn forward_ffn(
        &self,
        step: &StepShape,
        input: &[f32],
        residual: Option<&[f32]>,
        add_bias: bool,
        output: &mut [f32],
    ) -> Result<()>;
}

/// Copy a tensor's values into a caller-owned slice of the same length.
pub(crate) fn write_into(t: &Tensor, out: &mut [f32]) -> Result<()> {
    let values: Vec<f32> = t.flatten_all()?.to_vec1()?;
    if values.len() != out.len() {
        bail!(
            "output slice holds {} values, tensor has {}",
            out.len(),
            values.len()
        );
    }
    out.copy_from_slice(&values);
    Ok(())
}
