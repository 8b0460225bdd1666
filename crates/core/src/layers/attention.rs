use std::sync::Arc;

use candle_core::{Module, Result, Tensor};

use super::{Linear, LayerKind, LayerShape, Norm, RotaryEmbedding, StepShape};
use crate::kv_cache::LayerCache;
use crate::loader::{names, WeightError, WeightSource};

/// Repeat KV heads for grouped-query attention.
///
/// `[batch, kv_heads, seq, head_dim]` → `[batch, kv_heads * groups, seq, head_dim]`
pub fn repeat_kv(x: Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(x);
    }
    let (b, kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b, kv_heads, groups, s, d))?
        .reshape((b, kv_heads * groups, s, d))
}

/// Pre-norm self-attention over this rank's head shard.
///
/// QKV is column-parallel (this rank's query and KV heads), the output
/// projection is row-parallel, so the output is a partial sum.
pub struct Attention {
    norm: Norm,
    qkv: Linear,
    o_proj: Linear,
    rotary: Arc<RotaryEmbedding>,
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn load(
        source: &dyn WeightSource,
        layer: usize,
        shape: &LayerShape,
        kind: &LayerKind,
        rotary: Arc<RotaryEmbedding>,
    ) -> std::result::Result<Self, WeightError> {
        let hidden = shape.hidden;
        let d = shape.head_dim;
        let q_cols = shape.total_heads * d;
        let kv_cols = shape.total_kv_heads * d;
        let int8 = kind.quant == super::QuantKind::Int8;

        let norm = Norm::new(
            kind.norm,
            source.required(&names::layer(layer, names::INPUT_NORM_WEIGHT), &[hidden])?,
            source.optional(&names::layer(layer, names::INPUT_NORM_BIAS), &[hidden])?,
            shape.eps,
        );

        // Full QKV is [hidden, q | k | v]; keep this rank's heads of each part.
        let qkv_full = source.required(
            &names::layer(layer, names::QKV_WEIGHT),
            &[hidden, q_cols + 2 * kv_cols],
        )?;
        let q_off = shape.tp_rank * shape.heads * d;
        let kv_off = shape.tp_rank * shape.kv_heads * d;
        let (q_len, kv_len) = (shape.heads * d, shape.kv_heads * d);
        let pick = |t: &Tensor, dim: usize| -> Result<Tensor> {
            Tensor::cat(
                &[
                    t.narrow(dim, q_off, q_len)?,
                    t.narrow(dim, q_cols + kv_off, kv_len)?,
                    t.narrow(dim, q_cols + kv_cols + kv_off, kv_len)?,
                ],
                dim,
            )?
            .contiguous()
        };
        let qkv_weight = pick(&qkv_full, 1)?;
        let qkv_bias = source
            .optional(
                &names::layer(layer, names::QKV_BIAS),
                &[q_cols + 2 * kv_cols],
            )?
            .map(|b| pick(&b, 0))
            .transpose()?;

        let o_full = source.required(&names::layer(layer, names::ATTN_OUT_WEIGHT), &[q_cols, hidden])?;
        let o_weight = o_full.narrow(0, q_off, q_len)?.contiguous()?;
        let o_bias = source.optional(&names::layer(layer, names::ATTN_OUT_BIAS), &[hidden])?;

        Ok(Self {
            norm,
            qkv: Linear::with_quant(qkv_weight, qkv_bias, int8)?,
            o_proj: Linear::with_quant(o_weight, o_bias, int8)?,
            rotary,
            heads: shape.heads,
            kv_heads: shape.kv_heads,
            head_dim: d,
        })
    }

    /// `x`: `[rows, hidden]`, `mask`: `[batch, 1, seq, past + seq]`.
    pub fn forward(
        &self,
        step: &StepShape,
        x: &Tensor,
        mask: &Tensor,
        cache: &LayerCache,
        positions: &[u32],
        add_residual: bool,
    ) -> Result<Tensor> {
        let (b, s, d) = (step.batch, step.seq, self.head_dim);
        let (hq, hkv) = (self.heads, self.kv_heads);

        let h = self.norm.forward(x)?;
        let qkv = self.qkv.forward(&h)?;
        let q = qkv
            .narrow(1, 0, hq * d)?
            .reshape((b, s, hq, d))?
            .transpose(1, 2)?;
        let k = qkv
            .narrow(1, hq * d, hkv * d)?
            .reshape((b, s, hkv, d))?
            .transpose(1, 2)?;
        let v = qkv
            .narrow(1, (hq + hkv) * d, hkv * d)?
            .reshape((b, s, hkv, d))?;
        let (q, k) = self.rotary.apply(&q, &k, positions)?;

        cache
            .key
            .write(step.past, &k.transpose(1, 2)?)
            .map_err(candle_core::Error::wrap)?;
        cache
            .value
            .write(step.past, &v)
            .map_err(candle_core::Error::wrap)?;

        let kv_len = step.kv_len();
        let keys = cache.key.read(kv_len, b).map_err(candle_core::Error::wrap)?;
        let values = cache.value.read(kv_len, b).map_err(candle_core::Error::wrap)?;
        let keys = repeat_kv(keys.transpose(1, 2)?.contiguous()?, hq / hkv)?;
        let values = repeat_kv(values.transpose(1, 2)?.contiguous()?, hq / hkv)?;

        let scale = 1.0 / (d as f64).sqrt();
        let scores = (q.contiguous()?.matmul(&keys.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let ctx = probs
            .matmul(&values)?
            .transpose(1, 2)?
            .reshape((b * s, hq * d))?;

        let out = self.o_proj.forward_no_bias(&ctx)?;
        if !add_residual {
            return Ok(out);
        }
        let out = (out + x)?;
        match self.o_proj.bias() {
            Some(bias) => out.broadcast_add(bias),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn repeat_kv_identity_for_one_group() {
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(repeat_kv(x, 1).unwrap().dims(), &[1, 2, 3, 4]);
    }

    #[test]
    fn repeat_kv_groups_adjacent_heads() {
        let x = Tensor::arange(0f32, 2.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap();
        let y: Vec<f32> = repeat_kv(x, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
