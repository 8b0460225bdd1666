//! Parallel topology: where this process sits in the TP × PP grid.
//!
//! Global ranks are laid out stage-major. With `world_size = 8` and two
//! pipeline stages:
//!
//! ```text
//!            tp_rank 0   tp_rank 1   tp_rank 2   tp_rank 3
//! stage 0 :  rank 0      rank 1      rank 2      rank 3
//! stage 1 :  rank 4      rank 5      rank 6      rank 7
//! ```
//!
//! The stage index doubles as the "color" used to split the global group
//! into tensor-parallel groups.

use std::ops::Range;

use super::error::{DistributedError, Result};

/// Immutable coordinates of one process in the parallel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelCoordinates {
    pub pp_size: usize,
    pub pp_rank: usize,
    pub tp_size: usize,
    pub tp_rank: usize,
}

impl ParallelCoordinates {
    /// Derive coordinates from the global rank and the requested stage count.
    ///
    /// `color = rank / (world_size / stages)`. World sizes that do not split
    /// evenly into `stages` groups are rejected.
    pub fn from_world(world_size: usize, rank: usize, stages: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        if stages == 0 || world_size % stages != 0 {
            return Err(DistributedError::InvalidTopology { world_size, stages });
        }
        let tp_size = world_size / stages;
        let color = rank / tp_size;
        Ok(Self {
            pp_size: stages,
            pp_rank: color,
            tp_size,
            tp_rank: rank - color * tp_size,
        })
    }

    /// A single process owning everything.
    pub fn single() -> Self {
        Self {
            pp_size: 1,
            pp_rank: 0,
            tp_size: 1,
            tp_rank: 0,
        }
    }

    pub fn world_size(&self) -> usize {
        self.pp_size * self.tp_size
    }

    pub fn global_rank(&self) -> usize {
        self.pp_rank * self.tp_size + self.tp_rank
    }

    /// Color shared by every member of this process's TP group.
    pub fn color(&self) -> usize {
        self.pp_rank
    }

    /// Global ranks forming this process's TP group.
    pub fn tp_group(&self) -> Range<usize> {
        let start = self.pp_rank * self.tp_size;
        start..start + self.tp_size
    }

    pub fn is_first_stage(&self) -> bool {
        self.pp_rank == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.pp_rank + 1 == self.pp_size
    }

    pub fn is_tp_root(&self) -> bool {
        self.tp_rank == 0
    }

    /// Peer with the same `tp_rank` in the previous stage.
    pub fn prev_stage_peer(&self) -> Option<usize> {
        (!self.is_first_stage()).then(|| (self.pp_rank - 1) * self.tp_size + self.tp_rank)
    }

    /// Peer with the same `tp_rank` in the next stage.
    pub fn next_stage_peer(&self) -> Option<usize> {
        (!self.is_last_stage()).then(|| (self.pp_rank + 1) * self.tp_size + self.tp_rank)
    }

    /// Global rank that gathers logits and broadcasts chosen tokens.
    pub fn sampler_rank(&self) -> usize {
        (self.pp_size - 1) * self.tp_size
    }
}
