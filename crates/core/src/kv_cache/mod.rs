//! Per-layer key/value cache for the layers owned by this pipeline stage.
//!
//! Two independent sets of tensors are kept:
//! - the decode cache, `[max_positions, batch * beam, heads, head_dim]`
//! - the prefix cache, `[prefix_len, 1, heads, head_dim]`, primed once by
//!   prefix priming and broadcast into the decode cache at step 0
//!
//! All operations take local layer indices (`0..num_layers`).

mod cache_engine;
mod error;

pub use cache_engine::{CacheShape, KvCacheTensor};
pub use error::CacheError;

use candle_core::{DType, Device, Tensor};

/// Key and value tensors of one layer.
pub struct LayerCache {
    pub key: KvCacheTensor,
    pub value: KvCacheTensor,
}

impl LayerCache {
    fn zeros(shape: CacheShape, dtype: DType, device: &Device) -> Result<Self, CacheError> {
        Ok(Self {
            key: KvCacheTensor::zeros(shape, dtype, device)?,
            value: KvCacheTensor::zeros(shape, dtype, device)?,
        })
    }
}

#[derive(Default)]
struct CacheSet {
    shape: Option<CacheShape>,
    layers: Vec<LayerCache>,
}

pub struct KvCacheManager {
    num_layers: usize,
    dtype: DType,
    device: Device,
    decode: CacheSet,
    prefix: CacheSet,
}

impl KvCacheManager {
    pub fn new(num_layers: usize, dtype: DType, device: Device) -> Self {
        Self {
            num_layers,
            dtype,
            device,
            decode: CacheSet::default(),
            prefix: CacheSet::default(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Reallocate every layer's K/V of the selected set if any dimension
    /// changed. Returns `true` when storage was reallocated.
    pub fn resize(
        &mut self,
        capacity: usize,
        batch_beam: usize,
        heads: usize,
        head_dim: usize,
        is_prefix: bool,
    ) -> Result<bool, CacheError> {
        let shape = CacheShape {
            capacity,
            batch_beam,
            heads,
            head_dim,
        };
        let set = if is_prefix {
            &mut self.prefix
        } else {
            &mut self.decode
        };
        if set.shape == Some(shape) {
            return Ok(false);
        }
        tracing::debug!(
            capacity,
            batch_beam,
            heads,
            head_dim,
            is_prefix,
            layers = self.num_layers,
            "allocating kv cache"
        );
        set.layers = (0..self.num_layers)
            .map(|_| LayerCache::zeros(shape, self.dtype, &self.device))
            .collect::<Result<_, _>>()?;
        set.shape = Some(shape);
        Ok(true)
    }

    /// Shape of the decode cache, if allocated.
    pub fn shape(&self) -> Option<CacheShape> {
        self.decode.shape
    }

    /// Shape of the prefix cache, if allocated.
    pub fn prefix_shape(&self) -> Option<CacheShape> {
        self.prefix.shape
    }

    fn check_layer(&self, layer: usize) -> Result<(), CacheError> {
        if layer >= self.num_layers {
            return Err(CacheError::LayerOutOfRange {
                layer,
                num_layers: self.num_layers,
            });
        }
        Ok(())
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerCache, CacheError> {
        self.check_layer(layer)?;
        self.decode
            .layers
            .get(layer)
            .ok_or(CacheError::NotAllocated { layer })
    }

    pub fn prefix_layer(&self, layer: usize) -> Result<&LayerCache, CacheError> {
        self.check_layer(layer)?;
        self.prefix
            .layers
            .get(layer)
            .ok_or(CacheError::NotAllocated { layer })
    }

    /// Duplicate each batch row into its `beam` sibling rows over
    /// `[0, seq_len)`. Called once per layer at step 0 when `beam > 1`.
    pub fn expand_cache(
        &self,
        layer: usize,
        batch: usize,
        beam: usize,
        seq_len: usize,
    ) -> Result<(), CacheError> {
        let cache = self.layer(layer)?;
        cache.key.expand(batch, beam, seq_len)?;
        cache.value.expand(batch, beam, seq_len)
    }

    /// Broadcast the single shared prefix row into `batch` decode rows.
    pub fn expand_prefix_cache(
        &self,
        layer: usize,
        batch: usize,
        prefix_len: usize,
    ) -> Result<(), CacheError> {
        let prefix = self.prefix_layer(layer)?;
        let cache = self.layer(layer)?;
        cache.key.broadcast_prefix(&prefix.key, batch, prefix_len)?;
        cache.value.broadcast_prefix(&prefix.value, batch, prefix_len)
    }

    /// Permute the batch×beam rows of every layer over time steps
    /// `[init_seq_len, acc_seq_len)`. The shared prompt region is untouched.
    ///
    /// `idx` may repeat entries (beams collapsing onto one parent).
    pub fn reorder_cache(
        &self,
        idx: &[u32],
        size: usize,
        init_seq_len: usize,
        acc_seq_len: usize,
    ) -> Result<(), CacheError> {
        let Some(shape) = self.decode.shape else {
            return Err(CacheError::NotAllocated { layer: 0 });
        };
        if idx.len() != size || size != shape.batch_beam {
            return Err(CacheError::ReorderSizeMismatch {
                size,
                len: idx.len(),
                batch_beam: shape.batch_beam,
            });
        }
        if let Some(&index) = idx.iter().find(|&&i| i as usize >= size) {
            return Err(CacheError::InvalidReorderIndex { index, size });
        }
        if acc_seq_len > shape.capacity {
            return Err(CacheError::CapacityExceeded {
                requested: acc_seq_len,
                capacity: shape.capacity,
            });
        }
        if acc_seq_len <= init_seq_len || idx.iter().enumerate().all(|(i, &v)| i as u32 == v) {
            return Ok(());
        }
        let idx = Tensor::new(idx, &self.device)?;
        for cache in &self.decode.layers {
            cache.key.reorder(&idx, init_seq_len, acc_seq_len)?;
            cache.value.reorder(&idx, init_seq_len, acc_seq_len)?;
        }
        Ok(())
    }
}
