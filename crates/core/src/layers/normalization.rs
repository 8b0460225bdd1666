use candle_core::{Module, Result, Tensor};

use super::NormKind;

/// RMSNorm or LayerNorm over the last dimension.
#[derive(Clone, Debug)]
pub struct Norm {
    kind: NormKind,
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
}

impl Norm {
    pub fn new(kind: NormKind, weight: Tensor, bias: Option<Tensor>, eps: f64) -> Self {
        Self {
            kind,
            weight,
            bias,
            eps,
        }
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }
}

impl Module for Norm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.contiguous()?;
        match self.kind {
            NormKind::RmsNorm => {
                let ys = candle_nn::ops::rms_norm(&xs, &self.weight, self.eps as f32)?;
                match &self.bias {
                    Some(b) => ys.broadcast_add(b),
                    None => Ok(ys),
                }
            }
            NormKind::LayerNorm => {
                let beta = match &self.bias {
                    Some(b) => b.clone(),
                    None => self.weight.zeros_like()?,
                };
                candle_nn::ops::layer_norm(&xs, &self.weight, &beta, self.eps as f32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rms_norm_unit_rows() {
        let x = Tensor::new(&[[3f32, 4.0]], &Device::Cpu).unwrap();
        let w = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        let y: Vec<Vec<f32>> = Norm::new(NormKind::RmsNorm, w, None, 0.0)
            .forward(&x)
            .unwrap()
            .to_vec2()
            .unwrap();
        // rms = sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((y[0][0] - 3.0 / rms).abs() < 1e-5);
        assert!((y[0][1] - 4.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn layer_norm_centers_and_shifts() {
        let x = Tensor::new(&[[1f32, 3.0]], &Device::Cpu).unwrap();
        let w = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::new(&[0.5f32, 0.5], &Device::Cpu).unwrap();
        let y: Vec<Vec<f32>> = Norm::new(NormKind::LayerNorm, w, Some(b), 1e-5)
            .forward(&x)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!((y[0][0] + 0.5).abs() < 1e-3);
        assert!((y[0][1] - 1.5).abs() < 1e-3);
    }
}
