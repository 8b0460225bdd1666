//! Shared test utilities for tandem-core.
//!
//! Tiny model configurations, a counting collective, and helpers that run a
//! full TP × PP grid of decoders as threads over a
//! [`LocalFabric`](crate::distributed::LocalFabric).

mod grid;
mod recording;
mod tiny_config;

pub use grid::{run_grid, single_rank_decoder, GridRank, TEST_SEED};
pub use recording::{NullLink, RecordingChannel};
pub use tiny_config::{tiny_config, tiny_gelu_config};
