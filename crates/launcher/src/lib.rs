//! Launcher for tandem: persisted configuration, logging setup, worker
//! process spawning and the per-rank generation runner behind the `tandem`
//! binary.

pub mod config;
pub mod distributed_launcher;
pub mod logging;
pub mod runner;
