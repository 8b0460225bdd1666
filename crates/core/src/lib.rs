//! Core of the tandem decoder: a tensor- and pipeline-parallel decoding
//! orchestrator with its KV cache manager.
//!
//! Every process of a `W = T × P` grid builds one [`engine::Decoder`] over its
//! stage's layers and its tensor-parallel shard of each weight, and calls it
//! in lockstep with its peers.

pub mod buffers;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod kv_cache;
pub mod layers;
pub mod loader;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
