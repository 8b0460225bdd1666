//! Runtime execution strategy.
//!
//! Everything that selects *how* a step is computed, as opposed to the model
//! shapes, lives in one value chosen at construction.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ModelConfig};
use crate::distributed::RemainderPolicy;
use crate::layers::{LayerKind, MlpProjection, NormKind, QuantKind};
use crate::loader::WeightDataType;

/// How attention and FFN are chained inside a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttnFfnMode {
    /// FFN consumes the reduced attention output; two reduce-adds per layer.
    #[default]
    Sequential,
    /// Attention and FFN both read the layer input; one reduce-add per layer.
    Parallel,
}

/// Element type of the KV cache tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvDataType {
    #[default]
    F16,
    Bf16,
    F32,
}

impl KvDataType {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStrategy {
    pub attn_ffn: AttnFfnMode,
    pub layer: LayerKind,
    pub kv_dtype: KvDataType,
    pub weight_dtype: WeightDataType,
    pub remainder: RemainderPolicy,
}

impl ExecutionStrategy {
    /// Default strategy with the activation taken from the model config.
    pub fn for_model(config: &ModelConfig) -> Result<Self, ConfigError> {
        let mut strategy = Self::default();
        strategy.layer.activation = config.activation()?;
        Ok(strategy)
    }

    pub fn with_attn_ffn(mut self, mode: AttnFfnMode) -> Self {
        self.attn_ffn = mode;
        self
    }

    pub fn with_norm(mut self, norm: NormKind) -> Self {
        self.layer.norm = norm;
        self
    }

    pub fn with_quant(mut self, quant: QuantKind) -> Self {
        self.layer.quant = quant;
        self
    }

    pub fn with_projection(mut self, projection: MlpProjection) -> Self {
        self.layer.projection = projection;
        self
    }

    pub fn with_kv_dtype(mut self, kv_dtype: KvDataType) -> Self {
        self.kv_dtype = kv_dtype;
        self
    }

    pub fn with_remainder(mut self, remainder: RemainderPolicy) -> Self {
        self.remainder = remainder;
        self
    }
}
