//! Distributed building blocks for tensor- and pipeline-parallel decoding.
//!
//! - [`ParallelCoordinates`] - where this process sits in the TP × PP grid
//! - [`Transport`] - ordered, tagged point-to-point frames
//!   ([`LocalFabric`] for threads, [`TcpTransport`] for processes)
//! - [`CollectiveChannel`] - reduce-add and broadcast within a TP group
//! - [`PipelineLink`] - blocking hand-off between adjacent stages
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem_core::distributed::{GroupCommunicator, LocalFabric, ParallelCoordinates};
//!
//! let endpoints = LocalFabric::create(4);
//! // On each rank thread:
//! let coords = ParallelCoordinates::from_world(4, rank, 2)?;
//! let tp = GroupCommunicator::new(Arc::new(endpoint), coords);
//! ```

mod communicator;
mod error;
mod launcher;
mod local;
mod pipeline;
mod process_group;
mod transport;

pub use communicator::{CollectiveChannel, GroupCommunicator};
pub use error::{DistributedError, Result};
pub use launcher::{DistributedConfig, TcpTransport};
pub use local::{LocalFabric, LocalTransport};
pub use pipeline::{stage_tag, LayerAssignment, PipelineLink, RemainderPolicy, StageLink};
pub use process_group::ParallelCoordinates;
pub use transport::{recv_f32, send_f32, Transport};

pub(crate) use transport::{decode_u32, encode_u32};
