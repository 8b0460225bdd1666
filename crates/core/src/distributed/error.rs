//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// World size cannot be split into equal tensor-parallel groups.
    #[error("world_size {world_size} cannot be split into {stages} equal pipeline stages")]
    InvalidTopology { world_size: usize, stages: usize },

    /// Buffer length differs between the sender and the receiver.
    #[error("buffer length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A frame's payload size differs from what the receiver expects.
    #[error("frame from rank {src} carries {actual} bytes, expected {expected}")]
    FrameSize { src: usize, expected: usize, actual: u64 },

    /// A frame arrived with a different tag than the receiver asked for.
    #[error("tag mismatch from rank {src}: expected {expected}, got {actual}")]
    TagMismatch { src: usize, expected: u32, actual: u32 },

    /// The peer hung up or the channel was dropped.
    #[error("peer rank {peer} disconnected")]
    Disconnected { peer: usize },

    /// Socket level failure in the TCP transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment did not describe a valid distributed job.
    #[error("invalid distributed environment: {0}")]
    Environment(String),
}

pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = DistributedError::InvalidTopology {
            world_size: 6,
            stages: 4,
        };
        assert_eq!(
            err.to_string(),
            "world_size 6 cannot be split into 4 equal pipeline stages"
        );

        let err = DistributedError::TagMismatch {
            src: 3,
            expected: 100,
            actual: 0,
        };
        assert!(err.to_string().contains("expected 100, got 0"));
    }
}
