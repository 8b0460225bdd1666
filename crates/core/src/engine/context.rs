//! Shape context shared by every decoder a process constructs.
//!
//! The context is built explicitly and passed around as `Arc`. Constructing
//! a second decoder reuses the existing context only when the model shapes
//! match; anything else is a configuration error, never a silent rebuild.

use std::sync::Arc;

use candle_core::Device;

use super::error::{DecoderError, Result};
use super::strategy::ExecutionStrategy;
use crate::config::{ConfigError, ModelConfig};
use crate::distributed::{LayerAssignment, ParallelCoordinates};
use crate::layers::{split_range, LayerShape, RotaryEmbedding};

/// Model dimensions that must agree between decoders sharing a context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextShape {
    pub layers: usize,
    pub hidden: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub intermediate: usize,
    pub vocab: usize,
    pub max_positions: usize,
    pub eps: f64,
}

impl ContextShape {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            layers: config.num_hidden_layers,
            hidden: config.hidden_size,
            heads: config.num_attention_heads,
            kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
            intermediate: config.intermediate_size,
            vocab: config.vocab_size,
            max_positions: config.max_positions(),
            eps: config.norm_eps,
        }
    }
}

pub struct ExecutionContext {
    config: ModelConfig,
    shape: ContextShape,
    coords: ParallelCoordinates,
    strategy: ExecutionStrategy,
    layer_shape: LayerShape,
    assignment: LayerAssignment,
    rotary: Arc<RotaryEmbedding>,
    device: Device,
}

impl ExecutionContext {
    pub fn new(
        config: ModelConfig,
        coords: ParallelCoordinates,
        strategy: ExecutionStrategy,
        device: Device,
    ) -> Result<Arc<Self>> {
        let config = config.finalize()?;
        check_activation(&config, &strategy)?;
        let layer_shape = LayerShape::new(&config, coords.tp_rank, coords.tp_size)?;
        let assignment = LayerAssignment::new(
            coords.pp_rank,
            coords.pp_size,
            config.num_hidden_layers,
            strategy.remainder,
        );
        let rotary = Arc::new(RotaryEmbedding::new(
            config.head_dim,
            config.max_positions(),
            config.rope_theta,
            &device,
        )?);
        tracing::info!(
            pp_rank = coords.pp_rank,
            pp_size = coords.pp_size,
            tp_rank = coords.tp_rank,
            tp_size = coords.tp_size,
            first_layer = assignment.first_layer,
            num_layers = assignment.num_layers,
            heads = layer_shape.heads,
            kv_heads = layer_shape.kv_heads,
            "execution context created"
        );
        Ok(Arc::new(Self {
            shape: ContextShape::from_config(&config),
            config,
            coords,
            strategy,
            layer_shape,
            assignment,
            rotary,
            device,
        }))
    }

    /// Return `existing` when it was built for the same shapes, topology and
    /// strategy, otherwise create a fresh context. A mismatch against an
    /// existing context is rejected.
    pub fn reuse_or_create(
        existing: Option<&Arc<Self>>,
        config: ModelConfig,
        coords: ParallelCoordinates,
        strategy: ExecutionStrategy,
        device: Device,
    ) -> Result<Arc<Self>> {
        let Some(existing) = existing else {
            return Self::new(config, coords, strategy, device);
        };
        let config = config.finalize()?;
        check_activation(&config, &strategy)?;
        let shape = ContextShape::from_config(&config);
        if shape != existing.shape {
            return Err(DecoderError::IncompatibleContext(format!(
                "{:?} vs {:?}",
                existing.shape, shape
            )));
        }
        if coords != existing.coords || strategy != existing.strategy {
            return Err(DecoderError::IncompatibleContext(
                "topology or execution strategy differs".into(),
            ));
        }
        Ok(Arc::clone(existing))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn shape(&self) -> &ContextShape {
        &self.shape
    }

    pub fn coords(&self) -> &ParallelCoordinates {
        &self.coords
    }

    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    pub fn layer_shape(&self) -> &LayerShape {
        &self.layer_shape
    }

    pub fn assignment(&self) -> &LayerAssignment {
        &self.assignment
    }

    pub fn rotary(&self) -> Arc<RotaryEmbedding> {
        Arc::clone(&self.rotary)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// This rank's slice of the vocabulary in the output projection.
    pub fn vocab_range(&self) -> std::ops::Range<usize> {
        split_range(self.shape.vocab, self.coords.tp_size, self.coords.tp_rank)
    }
}

/// The FFN layout is fixed by the model's weights, so the strategy must
/// name the activation the config declares.
fn check_activation(config: &ModelConfig, strategy: &ExecutionStrategy) -> Result<()> {
    let declared = config.activation()?;
    if strategy.layer.activation != declared {
        return Err(ConfigError::Invalid(format!(
            "strategy activation {:?} does not match model activation {declared:?}",
            strategy.layer.activation
        ))
        .into());
    }
    Ok(())
}
