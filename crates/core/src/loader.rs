//! Weight sources.
//!
//! Weights are read once at construction, as full (unsharded) f32 tensors;
//! each rank then slices out its own shard. Linear weights are stored
//! `[in, out]` so that `y = x · W`.
//!
//! On disk every tensor is a raw little-endian file named after the tensor
//! (`model.layers.3.attention.dense.weight.0.bin`) in f32, f16 or bf16.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("required weight file missing: {}", path.display())]
    Missing { path: PathBuf },

    #[error("weight {name}: expected {expected} elements, file holds {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Element type of weight files on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDataType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl WeightDataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::Bf16 => 2,
        }
    }

    fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            Self::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Self::Bf16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        }
    }

    fn encode(self, data: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * self.size_in_bytes());
        for &v in data {
            match self {
                Self::F32 => out.extend_from_slice(&v.to_le_bytes()),
                Self::F16 => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
                Self::Bf16 => out.extend_from_slice(&bf16::from_f32(v).to_le_bytes()),
            }
        }
        out
    }
}

/// Tensor names for the per-file weight layout.
pub mod names {
    pub const EMBEDDING: &str = "model.wte";
    pub const FINAL_NORM_WEIGHT: &str = "model.final_layernorm.weight";
    pub const FINAL_NORM_BIAS: &str = "model.final_layernorm.bias";
    pub const LM_HEAD: &str = "model.lm_head.weight";

    /// `model.layers.{layer}.{suffix}`
    pub fn layer(layer: usize, suffix: &str) -> String {
        format!("model.layers.{layer}.{suffix}")
    }

    pub const INPUT_NORM_WEIGHT: &str = "input_layernorm.weight";
    pub const INPUT_NORM_BIAS: &str = "input_layernorm.bias";
    pub const POST_NORM_WEIGHT: &str = "post_attention_layernorm.weight";
    pub const POST_NORM_BIAS: &str = "post_attention_layernorm.bias";
    pub const QKV_WEIGHT: &str = "attention.query_key_value.weight.0";
    pub const QKV_BIAS: &str = "attention.query_key_value.bias.0";
    pub const ATTN_OUT_WEIGHT: &str = "attention.dense.weight.0";
    pub const ATTN_OUT_BIAS: &str = "attention.dense.bias";
    pub const GATE_WEIGHT: &str = "mlp.gate_proj.weight.0";
    pub const UP_WEIGHT: &str = "mlp.up_proj.weight.0";
    pub const DOWN_WEIGHT: &str = "mlp.down_proj.weight.0";
    pub const FC1_WEIGHT: &str = "mlp.dense_h_to_4h.weight.0";
    pub const FC1_BIAS: &str = "mlp.dense_h_to_4h.bias.0";
    pub const FC2_WEIGHT: &str = "mlp.dense_4h_to_h.weight.0";
    pub const FC2_BIAS: &str = "mlp.dense_4h_to_h.bias";
}

/// Supplies full-size f32 tensors by name.
pub trait WeightSource: Send + Sync {
    /// Load `name` with `shape`, or `None` if the source has no such tensor.
    fn load(&self, name: &str, shape: &[usize]) -> Result<Option<Tensor>, WeightError>;

    /// A tensor the model cannot run without.
    fn required(&self, name: &str, shape: &[usize]) -> Result<Tensor, WeightError> {
        self.load(name, shape)?.ok_or_else(|| WeightError::Missing {
            path: PathBuf::from(format!("{name}.bin")),
        })
    }

    /// A tensor whose absence means "not used" (biases).
    fn optional(&self, name: &str, shape: &[usize]) -> Result<Option<Tensor>, WeightError> {
        self.load(name, shape)
    }
}

/// Reads `<dir>/<name>.bin` files.
pub struct DirWeightSource {
    dir: PathBuf,
    dtype: WeightDataType,
    device: Device,
}

impl DirWeightSource {
    pub fn new(dir: impl Into<PathBuf>, dtype: WeightDataType, device: Device) -> Self {
        Self {
            dir: dir.into(),
            dtype,
            device,
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.bin"))
    }
}

impl WeightSource for DirWeightSource {
    fn load(&self, name: &str, shape: &[usize]) -> Result<Option<Tensor>, WeightError> {
        let path = self.path_of(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(WeightError::Io { path, source }),
        };
        let expected: usize = shape.iter().product();
        let elem = self.dtype.size_in_bytes();
        if bytes.len() != expected * elem {
            return Err(WeightError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual: bytes.len() / elem,
            });
        }
        let data = self.dtype.decode(&bytes);
        tracing::trace!(name, ?shape, "loaded weight");
        Ok(Some(Tensor::from_vec(data, shape, &self.device)?))
    }

    fn required(&self, name: &str, shape: &[usize]) -> Result<Tensor, WeightError> {
        self.load(name, shape)?.ok_or_else(|| WeightError::Missing {
            path: self.path_of(name),
        })
    }
}

/// Write one weight file in the layout [`DirWeightSource`] reads.
pub fn save_weight(
    dir: &Path,
    name: &str,
    data: &[f32],
    dtype: WeightDataType,
) -> Result<(), WeightError> {
    let path = dir.join(format!("{name}.bin"));
    std::fs::write(&path, dtype.encode(data)).map_err(|source| WeightError::Io { path, source })
}

/// One tensor of the per-file layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    /// Biases; absent files mean "no bias".
    pub optional: bool,
}

impl TensorSpec {
    fn new(name: impl Into<String>, shape: &[usize], optional: bool) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            optional,
        }
    }
}

/// Every tensor a full model reads, with full (unsharded) shapes.
pub fn model_tensors(config: &ModelConfig, gated: bool) -> Vec<TensorSpec> {
    let hidden = config.hidden_size;
    let inter = config.intermediate_size;
    let q_cols = config.num_attention_heads * config.head_dim;
    let qkv_cols = q_cols + 2 * config.num_key_value_heads * config.head_dim;

    let mut specs = vec![
        TensorSpec::new(names::EMBEDDING, &[config.vocab_size, hidden], false),
        TensorSpec::new(names::FINAL_NORM_WEIGHT, &[hidden], false),
        TensorSpec::new(names::FINAL_NORM_BIAS, &[hidden], true),
        TensorSpec::new(names::LM_HEAD, &[hidden, config.vocab_size], false),
    ];
    for layer in 0..config.num_hidden_layers {
        let name = |suffix: &str| names::layer(layer, suffix);
        specs.extend([
            TensorSpec::new(name(names::INPUT_NORM_WEIGHT), &[hidden], false),
            TensorSpec::new(name(names::INPUT_NORM_BIAS), &[hidden], true),
            TensorSpec::new(name(names::QKV_WEIGHT), &[hidden, qkv_cols], false),
            TensorSpec::new(name(names::QKV_BIAS), &[qkv_cols], true),
            TensorSpec::new(name(names::ATTN_OUT_WEIGHT), &[q_cols, hidden], false),
            TensorSpec::new(name(names::ATTN_OUT_BIAS), &[hidden], true),
            TensorSpec::new(name(names::POST_NORM_WEIGHT), &[hidden], false),
            TensorSpec::new(name(names::POST_NORM_BIAS), &[hidden], true),
        ]);
        if gated {
            specs.extend([
                TensorSpec::new(name(names::GATE_WEIGHT), &[hidden, inter], false),
                TensorSpec::new(name(names::UP_WEIGHT), &[hidden, inter], false),
                TensorSpec::new(name(names::DOWN_WEIGHT), &[inter, hidden], false),
            ]);
        } else {
            specs.extend([
                TensorSpec::new(name(names::FC1_WEIGHT), &[hidden, inter], false),
                TensorSpec::new(name(names::FC1_BIAS), &[inter], true),
                TensorSpec::new(name(names::FC2_WEIGHT), &[inter, hidden], false),
                TensorSpec::new(name(names::FC2_BIAS), &[hidden], true),
            ]);
        }
    }
    specs
}

/// Copy every tensor in `specs` from `source` into `dir`. Optional tensors
/// the source does not have are skipped. Returns the number of files written.
pub fn export_weights(
    source: &dyn WeightSource,
    specs: &[TensorSpec],
    dir: &Path,
    dtype: WeightDataType,
) -> Result<usize, WeightError> {
    std::fs::create_dir_all(dir).map_err(|source| WeightError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut written = 0;
    for spec in specs {
        let tensor = if spec.optional {
            source.optional(&spec.name, &spec.shape)?
        } else {
            Some(source.required(&spec.name, &spec.shape)?)
        };
        if let Some(tensor) = tensor {
            let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
            save_weight(dir, &spec.name, &data, dtype)?;
            written += 1;
        }
    }
    tracing::info!(dir = %dir.display(), written, "weights exported");
    Ok(written)
}

/// Deterministic pseudo-random weights keyed by tensor name.
///
/// Every rank derives the same full tensor from the same name, so shards
/// cut from it are consistent across processes.
pub struct SyntheticWeights {
    seed: u64,
    with_biases: bool,
    device: Device,
}

impl SyntheticWeights {
    pub fn new(seed: u64, device: Device) -> Self {
        Self {
            seed,
            with_biases: false,
            device,
        }
    }

    pub fn with_biases(mut self, with_biases: bool) -> Self {
        self.with_biases = with_biases;
        self
    }

    fn rng_for(&self, name: &str) -> StdRng {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        hasher.write(name.as_bytes());
        StdRng::seed_from_u64(self.seed ^ hasher.finish())
    }
}

impl WeightSource for SyntheticWeights {
    fn load(&self, name: &str, shape: &[usize]) -> Result<Option<Tensor>, WeightError> {
        let is_bias = name.contains(".bias");
        if is_bias && !self.with_biases {
            return Ok(None);
        }
        let numel: usize = shape.iter().product();
        let mut rng = self.rng_for(name);
        let data: Vec<f32> = if name.ends_with("layernorm.weight") {
            (0..numel).map(|_| 1.0 + rng.gen_range(-0.1..0.1)).collect()
        } else if is_bias {
            (0..numel).map(|_| rng.gen_range(-0.02..0.02)).collect()
        } else {
            let bound = 1.0 / (shape[0].max(1) as f32).sqrt();
            (0..numel).map(|_| rng.gen_range(-bound..bound)).collect()
        };
        Ok(Some(Tensor::from_vec(data, shape, &self.device)?))
    }
}
