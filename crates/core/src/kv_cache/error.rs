use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("kv cache capacity exceeded: need {requested} positions, capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("kv cache for layer {layer} has not been allocated")]
    NotAllocated { layer: usize },

    #[error("layer {layer} out of range: {num_layers} local layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("{rows} rows do not fit a cache with batch_beam {batch_beam}")]
    RowsExceeded { rows: usize, batch_beam: usize },

    #[error("invalid reorder index {index} for size {size}")]
    InvalidReorderIndex { index: u32, size: usize },

    #[error("reorder size {size} does not match batch_beam {batch_beam} (idx len {len})")]
    ReorderSizeMismatch {
        size: usize,
        len: usize,
        batch_beam: usize,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_capacity_exceeded() {
        let e = CacheError::CapacityExceeded {
            requested: 130,
            capacity: 128,
        };
        assert_eq!(
            e.to_string(),
            "kv cache capacity exceeded: need 130 positions, capacity 128"
        );
    }

    #[test]
    fn error_display_not_allocated() {
        let e = CacheError::NotAllocated { layer: 3 };
        assert_eq!(e.to_string(), "kv cache for layer 3 has not been allocated");
    }

    #[test]
    fn error_display_reorder() {
        let e = CacheError::InvalidReorderIndex { index: 9, size: 4 };
        assert_eq!(e.to_string(), "invalid reorder index 9 for size 4");
    }
}
