use candle_core::{Module, Result, Tensor};
use candle_nn::Activation;

use super::{ActivationKind, LayerKind, LayerShape, Linear, MlpProjection, Norm, QuantKind};
use crate::loader::{names, WeightError, WeightSource};

enum Up {
    /// `[hidden, 2 * inter]`: gate columns then up columns.
    Fused(Linear),
    Split { gate: Linear, up: Linear },
    /// Non-gated first layer.
    Plain(Linear),
}

/// Pre-norm feed-forward over this rank's intermediate shard.
pub struct Mlp {
    norm: Norm,
    up: Up,
    down: Linear,
    activation: ActivationKind,
    inter: usize,
}

impl Mlp {
    pub fn load(
        source: &dyn WeightSource,
        layer: usize,
        shape: &LayerShape,
        kind: &LayerKind,
    ) -> std::result::Result<Self, WeightError> {
        let hidden = shape.hidden;
        let total = shape.total_intermediate;
        let range = shape.intermediate_range();
        let int8 = kind.quant == QuantKind::Int8;
        let cols = |t: Tensor| -> Result<Tensor> { t.narrow(1, range.start, range.len())?.contiguous() };
        let rows = |t: Tensor| -> Result<Tensor> { t.narrow(0, range.start, range.len())?.contiguous() };

        let norm = Norm::new(
            kind.norm,
            source.required(&names::layer(layer, names::POST_NORM_WEIGHT), &[hidden])?,
            source.optional(&names::layer(layer, names::POST_NORM_BIAS), &[hidden])?,
            shape.eps,
        );

        let (up, down) = if kind.activation.is_gated() {
            let gate = cols(source.required(&names::layer(layer, names::GATE_WEIGHT), &[hidden, total])?)?;
            let up = cols(source.required(&names::layer(layer, names::UP_WEIGHT), &[hidden, total])?)?;
            let down = rows(source.required(&names::layer(layer, names::DOWN_WEIGHT), &[total, hidden])?)?;
            let up = match kind.projection {
                MlpProjection::Fused => {
                    Up::Fused(Linear::with_quant(Tensor::cat(&[gate, up], 1)?, None, int8)?)
                }
                MlpProjection::Unfused => Up::Split {
                    gate: Linear::with_quant(gate, None, int8)?,
                    up: Linear::with_quant(up, None, int8)?,
                },
            };
            (up, Linear::with_quant(down, None, int8)?)
        } else {
            let fc1 = cols(source.required(&names::layer(layer, names::FC1_WEIGHT), &[hidden, total])?)?;
            let fc1_bias = source
                .optional(&names::layer(layer, names::FC1_BIAS), &[total])?
                .map(|b| b.narrow(0, range.start, range.len()))
                .transpose()?;
            let fc2 = rows(source.required(&names::layer(layer, names::FC2_WEIGHT), &[total, hidden])?)?;
            let fc2_bias = source.optional(&names::layer(layer, names::FC2_BIAS), &[hidden])?;
            (
                Up::Plain(Linear::with_quant(fc1, fc1_bias, int8)?),
                Linear::with_quant(fc2, fc2_bias, int8)?,
            )
        };

        Ok(Self {
            norm,
            up,
            down,
            activation: kind.activation,
            inter: range.len(),
        })
    }

    /// Partial FFN output for `x` (`[rows, hidden]`), without residual or
    /// the down-projection bias.
    pub fn forward_partial(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(x)?;
        let act = match &self.up {
            Up::Fused(gate_up) => {
                let gu = gate_up.forward(&h)?;
                let gate = gu.narrow(1, 0, self.inter)?;
                let up = gu.narrow(1, self.inter, self.inter)?;
                (gate.apply(&Activation::Silu)? * up)?
            }
            Up::Split { gate, up } => {
                (gate.forward(&h)?.apply(&Activation::Silu)? * up.forward(&h)?)?
            }
            Up::Plain(fc1) => {
                let act = match self.activation {
                    ActivationKind::Relu => Activation::Relu,
                    _ => Activation::NewGelu,
                };
                fc1.forward(&h)?.apply(&act)?
            }
        };
        self.down.forward_no_bias(&act.contiguous()?)
    }

    pub fn down_bias(&self) -> Option<&Tensor> {
        self.down.bias()
    }
}
