use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layers::ActivationKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported activation function: {0}")]
    UnsupportedActivation(String),

    #[error("invalid model config: {0}")]
    Invalid(String),
}

/// Model hyper-parameters, read from `config.json` in the model directory.
///
/// Legacy converter key names (`head_num`, `size_per_head`, `inter_size`,
/// `num_layer`, ...) are accepted as aliases. Derived fields left at zero
/// are filled in by [`ModelConfig::finalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(alias = "num_layer")]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub hidden_size: usize,
    #[serde(alias = "head_num")]
    pub num_attention_heads: usize,
    #[serde(default, alias = "kv_head_num")]
    pub num_key_value_heads: usize,
    #[serde(default, alias = "size_per_head")]
    pub head_dim: usize,
    #[serde(alias = "inter_size")]
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(alias = "max_pos_seq_len")]
    pub max_position_embeddings: usize,
    /// KV cache capacity; defaults to `max_position_embeddings`.
    #[serde(default, alias = "model_max_length")]
    pub max_positions: Option<usize>,
    #[serde(default = "default_eps", alias = "layernorm_eps", alias = "rms_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_act", alias = "activation_type")]
    pub hidden_act: String,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_bos", alias = "start_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos", alias = "end_id")]
    pub eos_token_id: u32,
}

fn default_eps() -> f64 {
    1e-6
}

fn default_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_bos() -> u32 {
    1
}

fn default_eos() -> u32 {
    2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_hidden_layers: 32,
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: 32,
            head_dim: 128,
            intermediate_size: 11008,
            vocab_size: 32000,
            max_position_embeddings: 4096,
            max_positions: None,
            norm_eps: default_eps(),
            hidden_act: default_act(),
            rope_theta: default_rope_theta(),
            bos_token_id: default_bos(),
            eos_token_id: default_eos(),
        }
    }
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.finalize()
    }

    /// Fill derived fields and check divisibility constraints.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.num_attention_heads == 0 {
            return Err(ConfigError::Invalid("num_attention_heads must be > 0".into()));
        }
        if self.hidden_size == 0 {
            self.hidden_size = self.num_attention_heads * self.head_dim;
        }
        if self.head_dim == 0 {
            self.head_dim = self.hidden_size / self.num_attention_heads;
        }
        if self.num_key_value_heads == 0 {
            self.num_key_value_heads = self.num_attention_heads;
        }
        if self.hidden_size == 0 || self.head_dim == 0 {
            return Err(ConfigError::Invalid(
                "hidden_size or head_dim must be given".into(),
            ));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(ConfigError::Invalid(format!(
                "num_attention_heads {} not divisible by num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        self.activation()?;
        Ok(self)
    }

    /// Maximum sequence length the KV cache must hold.
    pub fn max_positions(&self) -> usize {
        self.max_positions.unwrap_or(self.max_position_embeddings)
    }

    /// Number of query heads sharing one KV head.
    pub fn gqa_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    pub fn activation(&self) -> Result<ActivationKind, ConfigError> {
        match self.hidden_act.to_ascii_lowercase().as_str() {
            "silu" | "swiglu" => Ok(ActivationKind::Silu),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(ActivationKind::Gelu),
            "relu" => Ok(ActivationKind::Relu),
            other => Err(ConfigError::UnsupportedActivation(other.to_string())),
        }
    }
}
