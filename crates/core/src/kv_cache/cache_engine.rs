use candle_core::{DType, Device, Tensor};

use super::error::CacheError;

/// Logical dimensions of one cache tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheShape {
    /// Maximum number of time steps.
    pub capacity: usize,
    /// Batch rows times beams.
    pub batch_beam: usize,
    /// KV heads owned by this TP rank.
    pub heads: usize,
    pub head_dim: usize,
}

impl CacheShape {
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.capacity, self.batch_beam, self.heads, self.head_dim)
    }
}

/// Key or value storage for one layer.
///
/// Layout: `[capacity, batch_beam, heads, head_dim]`, time-major so that a
/// range of time steps is one contiguous chunk and can be replaced with
/// `slice_set` along dim 0.
pub struct KvCacheTensor {
    data: Tensor,
    shape: CacheShape,
}

impl KvCacheTensor {
    /// Allocate a zero-filled tensor.
    pub fn zeros(shape: CacheShape, dtype: DType, device: &Device) -> Result<Self, CacheError> {
        let data = Tensor::zeros(shape.dims(), dtype, device)?;
        Ok(Self { data, shape })
    }

    pub fn shape(&self) -> CacheShape {
        self.shape
    }

    /// Raw storage tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    fn check_len(&self, end: usize) -> Result<(), CacheError> {
        if end > self.shape.capacity {
            return Err(CacheError::CapacityExceeded {
                requested: end,
                capacity: self.shape.capacity,
            });
        }
        Ok(())
    }

    fn check_rows(&self, rows: usize) -> Result<(), CacheError> {
        if rows > self.shape.batch_beam {
            return Err(CacheError::RowsExceeded {
                rows,
                batch_beam: self.shape.batch_beam,
            });
        }
        Ok(())
    }

    /// Replace time steps `[offset, offset + len)` with `rows_block`, which
    /// covers the leading rows `[0, n)` with `n <= batch_beam`. Rows past `n`
    /// keep their content.
    fn store_rows(&self, offset: usize, rows_block: &Tensor) -> Result<(), CacheError> {
        let (len, rows, _, _) = rows_block.dims4()?;
        self.check_len(offset + len)?;
        self.check_rows(rows)?;
        let block = rows_block.to_dtype(self.data.dtype())?;
        let block = if rows < self.shape.batch_beam {
            let tail = self
                .data
                .narrow(0, offset, len)?
                .narrow(1, rows, self.shape.batch_beam - rows)?
                .contiguous()?;
            Tensor::cat(&[&block.contiguous()?, &tail], 1)?
        } else {
            block.contiguous()?
        };
        self.data.slice_set(&block, 0, offset)?;
        Ok(())
    }

    /// Write new entries for `rows` sequences at time step `offset`.
    ///
    /// `src` is `[rows, seq, heads, head_dim]` in any float dtype.
    pub fn write(&self, offset: usize, src: &Tensor) -> Result<(), CacheError> {
        let time_major = src.transpose(0, 1)?;
        self.store_rows(offset, &time_major)
    }

    /// Read the first `len` time steps of the first `rows` rows as
    /// `[rows, len, heads, head_dim]` f32.
    pub fn read(&self, len: usize, rows: usize) -> Result<Tensor, CacheError> {
        self.check_len(len)?;
        self.check_rows(rows)?;
        let view = self
            .data
            .narrow(0, 0, len)?
            .narrow(1, 0, rows)?
            .transpose(0, 1)?
            .to_dtype(DType::F32)?
            .contiguous()?;
        Ok(view)
    }

    /// Duplicate row `b` into rows `[b * beam, (b + 1) * beam)` over
    /// `[0, seq_len)`.
    pub fn expand(&self, batch: usize, beam: usize, seq_len: usize) -> Result<(), CacheError> {
        if beam <= 1 || seq_len == 0 {
            return Ok(());
        }
        self.check_len(seq_len)?;
        self.check_rows(batch * beam)?;
        let sources: Vec<u32> = (0..batch * beam).map(|r| (r / beam) as u32).collect();
        let idx = Tensor::new(sources.as_slice(), self.data.device())?;
        let expanded = self.data.narrow(0, 0, seq_len)?.index_select(&idx, 1)?;
        self.store_rows(0, &expanded)
    }

    /// Broadcast the single row of `prefix` into rows `[0, batch)` over
    /// `[0, prefix_len)`.
    pub fn broadcast_prefix(
        &self,
        prefix: &KvCacheTensor,
        batch: usize,
        prefix_len: usize,
    ) -> Result<(), CacheError> {
        if prefix_len == 0 {
            return Ok(());
        }
        prefix.check_len(prefix_len)?;
        let (_, _, heads, head_dim) = self.shape.dims();
        let row = prefix.data.narrow(0, 0, prefix_len)?.narrow(1, 0, 1)?;
        let block = row
            .broadcast_as((prefix_len, batch, heads, head_dim))?
            .contiguous()?;
        self.store_rows(0, &block)
    }

    /// Permute the row dimension over time steps `[start, end)`.
    pub fn reorder(&self, idx: &Tensor, start: usize, end: usize) -> Result<(), CacheError> {
        if end <= start {
            return Ok(());
        }
        self.check_len(end)?;
        let reordered = self.data.narrow(0, start, end - start)?.index_select(idx, 1)?;
        self.store_rows(start, &reordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(capacity: usize, batch_beam: usize) -> CacheShape {
        CacheShape {
            capacity,
            batch_beam,
            heads: 2,
            head_dim: 3,
        }
    }

    fn filled(rows: usize, seq: usize, base: f32) -> Tensor {
        let n = rows * seq * 2 * 3;
        let data: Vec<f32> = (0..n).map(|i| base + i as f32).collect();
        Tensor::from_vec(data, (rows, seq, 2, 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn write_then_read_roundtrip_f32() {
        let t = KvCacheTensor::zeros(shape(8, 2), DType::F32, &Device::Cpu).unwrap();
        let src = filled(2, 3, 0.0);
        t.write(0, &src).unwrap();
        let back = t.read(3, 2).unwrap();
        let diff = (back - &src).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn partial_row_write_keeps_other_rows() {
        let t = KvCacheTensor::zeros(shape(4, 3), DType::F32, &Device::Cpu).unwrap();
        t.write(0, &filled(3, 1, 100.0)).unwrap();
        t.write(0, &filled(1, 1, 0.0)).unwrap();
        let rows = t.read(1, 3).unwrap();
        let row2: Vec<f32> = rows.get(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(row2[0], 112.0);
        let row0: Vec<f32> = rows.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(row0[0], 0.0);
    }

    #[test]
    fn write_past_capacity_fails() {
        let t = KvCacheTensor::zeros(shape(4, 1), DType::F16, &Device::Cpu).unwrap();
        let err = t.write(3, &filled(1, 2, 0.0)).unwrap_err();
        assert!(matches!(
            err,
            CacheError::CapacityExceeded {
                requested: 5,
                capacity: 4
            }
        ));
    }

    #[test]
    fn too_many_rows_fails() {
        let t = KvCacheTensor::zeros(shape(4, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            t.write(0, &filled(2, 1, 0.0)),
            Err(CacheError::RowsExceeded { .. })
        ));
    }

    #[test]
    fn broadcast_prefix_fills_rows() {
        let prefix = KvCacheTensor::zeros(shape(2, 1), DType::F32, &Device::Cpu).unwrap();
        prefix.write(0, &filled(1, 2, 1.0)).unwrap();
        let t = KvCacheTensor::zeros(shape(6, 3), DType::F32, &Device::Cpu).unwrap();
        t.broadcast_prefix(&prefix, 3, 2).unwrap();
        let rows = t.read(2, 3).unwrap();
        let first = rows.get(0).unwrap();
        for r in 1..3 {
            let diff = (rows.get(r).unwrap() - &first)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0);
        }
    }
}
