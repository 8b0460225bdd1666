use std::sync::Arc;

use candle_core::{Device, Result, Tensor};

use super::{
    write_into, Attention, LayerCompute, LayerKind, LayerShape, Mlp, RotaryEmbedding, StepShape,
};
use crate::kv_cache::LayerCache;
use crate::loader::{WeightError, WeightSource};

/// Reference transformer block: pre-norm attention and pre-norm FFN.
pub struct DecoderLayer {
    attn: Attention,
    mlp: Mlp,
    hidden: usize,
    device: Device,
}

impl DecoderLayer {
    pub fn load(
        source: &dyn WeightSource,
        layer: usize,
        shape: &LayerShape,
        kind: &LayerKind,
        rotary: Arc<RotaryEmbedding>,
        device: &Device,
    ) -> std::result::Result<Self, WeightError> {
        Ok(Self {
            attn: Attention::load(source, layer, shape, kind, rotary)?,
            mlp: Mlp::load(source, layer, shape, kind)?,
            hidden: shape.hidden,
            device: device.clone(),
        })
    }

    fn rows_tensor(&self, data: &[f32], rows: usize) -> Result<Tensor> {
        Tensor::from_slice(&data[..rows * self.hidden], (rows, self.hidden), &self.device)
    }
}

/// Instantiate the layer implementation selected by `kind` for global
/// layer index `layer`.
pub fn build_layer(
    source: &dyn WeightSource,
    layer: usize,
    shape: &LayerShape,
    kind: &LayerKind,
    rotary: Arc<RotaryEmbedding>,
    device: &Device,
) -> std::result::Result<Box<dyn LayerCompute>, WeightError> {
    Ok(Box::new(DecoderLayer::load(
        source, layer, shape, kind, rotary, device,
    )?))
}

impl LayerCompute for DecoderLayer {
    fn forward_attention(
        &self,
        step: &StepShape,
        input: &[f32],
        output: &mut [f32],
        mask: &[f32],
        cache: &LayerCache,
        positions: &[u32],
        add_residual: bool,
    ) -> Result<()> {
        let rows = step.rows();
        let x = self.rows_tensor(input, rows)?;
        let mask_len = step.batch * step.seq * step.kv_len();
        let mask = Tensor::from_slice(
            &mask[..mask_len],
            (step.batch, step.seq, step.kv_len()),
            &self.device,
        )?
        .unsqueeze(1)?;
        let out = self
            .attn
            .forward(step, &x, &mask, cache, positions, add_residual)?;
        write_into(&out, &mut output[..rows * self.hidden])
    }

    fn forward_ffn(
        &self,
        step: &StepShape,
        input: &[f32],
        residual: Option<&[f32]>,
        add_bias: bool,
        output: &mut [f32],
    ) -> Result<()> {
        let rows = step.rows();
        let x = self.rows_tensor(input, rows)?;
        let mut out = self.mlp.forward_partial(&x)?;
        if let Some(residual) = residual {
            out = (out + self.rows_tensor(residual, rows)?)?;
        }
        if add_bias {
            if let Some(bias) = self.mlp.down_bias() {
                out = out.broadcast_add(bias)?;
            }
        }
        write_into(&out, &mut output[..rows * self.hidden])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::MaskBuffer;
    use crate::config::ModelConfig;
    use crate::kv_cache::KvCacheManager;
    use crate::layers::{ActivationKind, MlpProjection, NormKind, QuantKind};
    use crate::loader::SyntheticWeights;
    use candle_core::DType;

    fn config() -> ModelConfig {
        ModelConfig {
            num_hidden_layers: 1,
            hidden_size: 16,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            head_dim: 4,
            intermediate_size: 24,
            vocab_size: 32,
            max_position_embeddings: 16,
            ..ModelConfig::default()
        }
    }

    /// Run one attention + FFN pass on `tp_size` shards and sum the partials.
    fn run_sharded(kind: LayerKind, tp_size: usize, with_biases: bool) -> Vec<f32> {
        let config = config();
        let source = SyntheticWeights::new(11, Device::Cpu).with_biases(with_biases);
        let rotary = Arc::new(RotaryEmbedding::new(4, 16, 10000.0, &Device::Cpu).unwrap());
        let step = StepShape {
            batch: 2,
            seq: 3,
            past: 0,
        };
        let input: Vec<f32> = (0..step.rows() * 16).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();
        let mut masks = MaskBuffer::default();
        let mask = masks.fill_causal(2, 3, 0).to_vec();
        let positions = [0u32, 1, 2];

        let mut attn_sum = vec![0.0f32; input.len()];
        let mut partials = Vec::new();
        for rank in 0..tp_size {
            let shape = LayerShape::new(&config, rank, tp_size).unwrap();
            let layer = DecoderLayer::load(&source, 0, &shape, &kind, rotary.clone(), &Device::Cpu).unwrap();
            let mut cache = KvCacheManager::new(1, DType::F32, Device::Cpu);
            cache.resize(16, 2, shape.kv_heads, 4, false).unwrap();
            let mut out = vec![0.0f32; input.len()];
            layer
                .forward_attention(&step, &input, &mut out, &mask, cache.layer(0).unwrap(), &positions, rank == 0)
                .unwrap();
            for (acc, v) in attn_sum.iter_mut().zip(&out) {
                *acc += v;
            }
            partials.push(layer);
        }
        let mut ffn_sum = vec![0.0f32; input.len()];
        for (rank, layer) in partials.iter().enumerate() {
            let mut out = vec![0.0f32; input.len()];
            layer
                .forward_ffn(
                    &step,
                    &attn_sum,
                    (rank == 0).then_some(attn_sum.as_slice()),
                    rank == 0,
                    &mut out,
                )
                .unwrap();
            for (acc, v) in ffn_sum.iter_mut().zip(&out) {
                *acc += v;
            }
        }
        ffn_sum
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn tensor_parallel_partials_sum_to_single_rank() {
        let kind = LayerKind::default();
        assert_close(&run_sharded(kind, 2, true), &run_sharded(kind, 1, true));
    }

    #[test]
    fn fused_and_unfused_projection_agree() {
        let fused = LayerKind::default();
        let unfused = LayerKind {
            projection: MlpProjection::Unfused,
            ..fused
        };
        assert_close(&run_sharded(fused, 1, false), &run_sharded(unfused, 1, false));
    }

    #[test]
    fn layer_norm_gelu_variant_shards() {
        let kind = LayerKind {
            norm: NormKind::LayerNorm,
            activation: ActivationKind::Gelu,
            ..LayerKind::default()
        };
        assert_close(&run_sharded(kind, 2, true), &run_sharded(kind, 1, true));
    }

    #[test]
    fn int8_stays_near_dense() {
        let int8 = LayerKind {
            quant: QuantKind::Int8,
            ..LayerKind::default()
        };
        let dense = run_sharded(LayerKind::default(), 1, false);
        let quant = run_sharded(int8, 1, false);
        for (x, y) in dense.iter().zip(&quant) {
            assert!((x - y).abs() < 0.1, "{x} vs {y}");
        }
    }
}
