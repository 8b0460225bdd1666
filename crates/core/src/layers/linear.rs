use std::ops::Range;

use candle_core::{DType, Module, Result, Tensor, D};

/// `[offset, offset + len)` of `total` owned by `part` out of `parts`.
/// The first `total % parts` parts get one extra element.
pub fn split_range(total: usize, parts: usize, part: usize) -> Range<usize> {
    let base = total / parts;
    let extra = total % parts;
    let start = part * base + part.min(extra);
    let len = base + usize::from(part < extra);
    start..start + len
}

/// Weight storage for a linear projection.
#[derive(Debug, Clone)]
enum LinearWeight {
    /// `[in, out]` float weight.
    Dense(Tensor),
    /// Per-output-column asymmetric u8 quantization, dequantized on each call.
    Int8 {
        qweight: Tensor,
        scale: Tensor,
        zero: Tensor,
    },
}

/// `y = x · W (+ b)` with `W` laid out `[in, out]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: LinearWeight,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight: LinearWeight::Dense(weight),
            bias,
        }
    }

    /// Quantize `weight` column-wise to u8 with a scale and zero point per
    /// output column.
    pub fn quantized(weight: &Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (rows, cols) = weight.dims2()?;
        let w: Vec<Vec<f32>> = weight.to_dtype(DType::F32)?.to_vec2()?;
        let mut scales = vec![0f32; cols];
        let mut zeros = vec![0f32; cols];
        for c in 0..cols {
            let (lo, hi) = w
                .iter()
                .map(|row| row[c])
                .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
            let lo = lo.min(0.0);
            let hi = hi.max(0.0);
            let scale = if hi > lo { (hi - lo) / 255.0 } else { 1.0 };
            scales[c] = scale;
            zeros[c] = (-lo / scale).round().clamp(0.0, 255.0);
        }
        let mut q = Vec::with_capacity(rows * cols);
        for row in &w {
            for c in 0..cols {
                q.push((row[c] / scales[c] + zeros[c]).round().clamp(0.0, 255.0) as u8);
            }
        }
        let device = weight.device();
        Ok(Self {
            weight: LinearWeight::Int8 {
                qweight: Tensor::from_vec(q, (rows, cols), device)?,
                scale: Tensor::from_vec(scales, (1, cols), device)?,
                zero: Tensor::from_vec(zeros, (1, cols), device)?,
            },
            bias,
        })
    }

    /// Build dense or int8 from a float weight.
    pub fn with_quant(weight: Tensor, bias: Option<Tensor>, int8: bool) -> Result<Self> {
        if int8 {
            Self::quantized(&weight, bias)
        } else {
            Ok(Self::new(weight, bias))
        }
    }

    fn dense_weight(&self) -> Result<Tensor> {
        match &self.weight {
            LinearWeight::Dense(w) => Ok(w.clone()),
            LinearWeight::Int8 {
                qweight,
                scale,
                zero,
            } => qweight
                .to_dtype(DType::F32)?
                .broadcast_sub(zero)?
                .broadcast_mul(scale),
        }
    }

    pub fn out_features(&self) -> Result<usize> {
        match &self.weight {
            LinearWeight::Dense(w) => w.dim(1),
            LinearWeight::Int8 { qweight, .. } => qweight.dim(1),
        }
    }

    /// Projection without the bias term.
    pub fn forward_no_bias(&self, xs: &Tensor) -> Result<Tensor> {
        xs.matmul(&self.dense_weight()?)
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.forward_no_bias(xs)?;
        match &self.bias {
            Some(b) => ys.broadcast_add(b),
            None => Ok(ys),
        }
    }
}

/// Column-sharded output projection over the vocabulary.
///
/// Rank `r` of `n` owns vocabulary columns `[split_offset, split_offset + split_size)`
/// following [`split_range`].
#[derive(Debug, Clone)]
pub struct DistLinear {
    inner: Linear,
    split_offset: usize,
    split_size: usize,
}

impl DistLinear {
    /// Cut this rank's shard out of the full `[hidden, vocab]` weight.
    pub fn from_full(weight: &Tensor, tp_rank: usize, tp_size: usize, int8: bool) -> Result<Self> {
        let vocab = weight.dim(D::Minus1)?;
        let range = split_range(vocab, tp_size, tp_rank);
        let shard = weight.narrow(1, range.start, range.len())?.contiguous()?;
        Ok(Self {
            inner: Linear::with_quant(shard, None, int8)?,
            split_offset: range.start,
            split_size: range.len(),
        })
    }

    pub fn split_offset(&self) -> usize {
        self.split_offset
    }

    pub fn split_size(&self) -> usize {
        self.split_size
    }
}

impl Module for DistLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner.forward(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn split_range_tiles_total() {
        assert_eq!(split_range(10, 3, 0), 0..4);
        assert_eq!(split_range(10, 3, 1), 4..7);
        assert_eq!(split_range(10, 3, 2), 7..10);
        assert_eq!(split_range(8, 2, 1), 4..8);
    }

    #[test]
    fn dense_forward_with_bias() {
        let w = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[10f32, 20.0], &Device::Cpu).unwrap();
        let lin = Linear::new(w, Some(b));
        let x = Tensor::new(&[[1f32, 1.0]], &Device::Cpu).unwrap();
        let y: Vec<Vec<f32>> = lin.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![14.0, 26.0]]);
    }

    #[test]
    fn int8_close_to_dense() {
        let data: Vec<f32> = (0..24).map(|i| (i as f32 - 11.0) * 0.1).collect();
        let w = Tensor::from_vec(data, (6, 4), &Device::Cpu).unwrap();
        let x = Tensor::ones((2, 6), DType::F32, &Device::Cpu).unwrap();
        let dense = Linear::new(w.clone(), None).forward(&x).unwrap();
        let q = Linear::quantized(&w, None).unwrap().forward(&x).unwrap();
        let err: f32 = (dense - q)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(1)
            .unwrap()
            .max_keepdim(0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(err < 0.05, "quantization error {err}");
    }

    #[test]
    fn dist_linear_shards_vocab() {
        let w = Tensor::arange(0f32, 14.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 7))
            .unwrap();
        let r0 = DistLinear::from_full(&w, 0, 2, false).unwrap();
        let r1 = DistLinear::from_full(&w, 1, 2, false).unwrap();
        assert_eq!((r0.split_offset(), r0.split_size()), (0, 4));
        assert_eq!((r1.split_offset(), r1.split_size()), (4, 3));
        let x = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let y1: Vec<Vec<f32>> = r1.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(y1, vec![vec![4.0, 5.0, 6.0]]);
    }
}
