//! Pipeline parallelism: layer assignment and stage-to-stage hand-off.
//!
//! # Architecture
//!
//! ```text
//! Stage 0             Stage 1             Stage 2
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Layers 0-7  │ --> │ Layers 8-15 │ --> │ Layers 16-23│
//! └─────────────┘     └─────────────┘     └─────────────┘
//!       │                   │                   │
//!       v                   v                   v
//!   tag 0 to 1        tag 100 to 2          logits
//! ```
//!
//! Each TP rank talks to the rank with the same `tp_rank` in the adjacent
//! stage. Messages are tagged `100 * source_stage`, so a stage pair carries
//! at most one step in flight.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::Result;
use super::transport::{recv_f32, send_f32, Transport};

/// What to do with `total_layers % num_stages` leftover layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Earlier stages take one extra layer each.
    #[default]
    Spread,
    /// The last stage takes every leftover layer.
    LastStage,
    /// Plain floor division; leftover layers run nowhere.
    Floor,
}

/// Contiguous layer range owned by one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAssignment {
    pub stage_id: usize,
    pub num_stages: usize,
    pub first_layer: usize,
    pub num_layers: usize,
}

impl LayerAssignment {
    /// Assign layers to `stage_id`.
    ///
    /// Emits a warning whenever the split is uneven, whichever policy is
    /// chosen.
    pub fn new(
        stage_id: usize,
        num_stages: usize,
        total_layers: usize,
        policy: RemainderPolicy,
    ) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(stage_id < num_stages, "stage_id must be < num_stages");

        let base = total_layers / num_stages;
        let extra = total_layers % num_stages;
        if extra != 0 {
            tracing::warn!(
                total_layers,
                num_stages,
                remainder = extra,
                policy = ?policy,
                "layer count is not divisible by pipeline stages"
            );
        }

        let (first_layer, num_layers) = match policy {
            RemainderPolicy::Spread if stage_id < extra => (stage_id * (base + 1), base + 1),
            RemainderPolicy::Spread => (extra * (base + 1) + (stage_id - extra) * base, base),
            RemainderPolicy::LastStage if stage_id + 1 == num_stages => {
                (stage_id * base, base + extra)
            }
            RemainderPolicy::LastStage | RemainderPolicy::Floor => (stage_id * base, base),
        };

        Self {
            stage_id,
            num_stages,
            first_layer,
            num_layers,
        }
    }

    /// Global layer indices for this stage.
    pub fn layer_range(&self) -> Range<usize> {
        self.first_layer..self.first_layer + self.num_layers
    }

    pub fn is_first(&self) -> bool {
        self.stage_id == 0
    }

    pub fn is_last(&self) -> bool {
        self.stage_id + 1 == self.num_stages
    }
}

/// Tag for a hand-off leaving `stage`.
pub fn stage_tag(stage: usize) -> u32 {
    100 * stage as u32
}

/// Blocking point-to-point activation transfer over the global group.
pub trait PipelineLink: Send + Sync {
    fn send(&self, buf: &[f32], dst: usize, tag: u32) -> Result<()>;
    fn recv(&self, buf: &mut [f32], src: usize, tag: u32) -> Result<()>;
}

/// [`PipelineLink`] backed by a [`Transport`].
pub struct StageLink {
    transport: Arc<dyn Transport>,
}

impl StageLink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl PipelineLink for StageLink {
    fn send(&self, buf: &[f32], dst: usize, tag: u32) -> Result<()> {
        send_f32(self.transport.as_ref(), dst, tag, buf)
    }

    fn recv(&self, buf: &mut [f32], src: usize, tag: u32) -> Result<()> {
        recv_f32(self.transport.as_ref(), src, tag, buf)
    }
}
