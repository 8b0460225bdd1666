use thiserror::Error;

use crate::config::ConfigError;
use crate::distributed::DistributedError;
use crate::kv_cache::CacheError;
use crate::loader::WeightError;

/// Errors surfaced by the decoder. All of them are fatal for the session;
/// the launcher turns them into a non-zero exit.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("distributed: {0}")]
    Distributed(#[from] DistributedError),

    #[error("kv cache: {0}")]
    Cache(#[from] CacheError),

    #[error("weights: {0}")]
    Weight(#[from] WeightError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("compute: {0}")]
    Compute(#[from] candle_core::Error),

    #[error("step {step} issued before any step 0")]
    NoSession { step: usize },

    #[error("execution context already exists with different shapes: {0}")]
    IncompatibleContext(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DecoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_cache_errors() {
        let err: DecoderError = CacheError::CapacityExceeded {
            requested: 40,
            capacity: 32,
        }
        .into();
        assert!(matches!(err, DecoderError::Cache(_)));
        assert!(err.to_string().contains("40"));
    }

    #[test]
    fn no_session_display() {
        let err = DecoderError::NoSession { step: 3 };
        assert_eq!(err.to_string(), "step 3 issued before any step 0");
    }
}
