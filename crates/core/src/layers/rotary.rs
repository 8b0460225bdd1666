use candle_core::{DType, Device, Result, Tensor};

/// Precomputed rotary tables for positions `0..max_positions`.
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_positions: usize, rope_theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?,
            cos: freqs.cos()?,
        })
    }

    /// Rotate `q` `[b, h, t, d]` and `k` `[b, kv_h, t, d]` at the given
    /// position ids (one per time step, shared across the batch).
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &[u32]) -> Result<(Tensor, Tensor)> {
        let pos = Tensor::new(positions, self.sin.device())?;
        let cos = self.cos.index_select(&pos, 0)?;
        let sin = self.sin.index_select(&pos, 0)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        let rope = RotaryEmbedding::new(16, 32, 10000.0, &Device::Cpu).unwrap();
        assert_eq!(rope.sin.dims(), &[32, 8]);
        assert_eq!(rope.cos.dims(), &[32, 8]);
    }

    #[test]
    fn position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::arange(0f32, 4.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 4))
            .unwrap();
        let (rq, rk) = rope.apply(&q, &q, &[0]).unwrap();
        let orig: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        for t in [rq, rk] {
            let v: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
            for (a, b) in v.iter().zip(orig.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 4))
            .unwrap();
        let (rq, _) = rope.apply(&q, &q, &[5]).unwrap();
        let n0 = q.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let n1 = rq.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((n0 - n1).abs() < 1e-4);
    }
}
