use candle_core::{Device, Module, Result, Tensor};

use super::{write_into, DistLinear, Norm, NormKind};
use crate::loader::{names, WeightError, WeightSource};

/// Token embedding table, held in full by first-stage ranks.
pub struct Embedding {
    table: Tensor,
    hidden: usize,
}

impl Embedding {
    pub fn load(
        source: &dyn WeightSource,
        vocab: usize,
        hidden: usize,
    ) -> std::result::Result<Self, WeightError> {
        Ok(Self {
            table: source.required(names::EMBEDDING, &[vocab, hidden])?,
            hidden,
        })
    }

    /// Look up `ids` and write `ids.len() × hidden` values into `out`.
    pub fn forward(&self, ids: &[u32], out: &mut [f32]) -> Result<()> {
        let ids = Tensor::new(ids, self.table.device())?;
        let rows = self.table.index_select(&ids, 0)?;
        write_into(&rows, &mut out[..ids.elem_count() * self.hidden])
    }
}

/// Final normalization plus the vocabulary-sharded projection, held by
/// last-stage ranks.
pub struct OutputHead {
    norm: Norm,
    proj: DistLinear,
    hidden: usize,
    device: Device,
}

impl OutputHead {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        source: &dyn WeightSource,
        norm_kind: NormKind,
        hidden: usize,
        vocab: usize,
        eps: f64,
        tp_rank: usize,
        tp_size: usize,
        int8: bool,
    ) -> std::result::Result<Self, WeightError> {
        let norm = Norm::new(
            norm_kind,
            source.required(names::FINAL_NORM_WEIGHT, &[hidden])?,
            source.optional(names::FINAL_NORM_BIAS, &[hidden])?,
            eps,
        );
        let lm_head = source.required(names::LM_HEAD, &[hidden, vocab])?;
        let device = lm_head.device().clone();
        Ok(Self {
            norm,
            proj: DistLinear::from_full(&lm_head, tp_rank, tp_size, int8)?,
            hidden,
            device,
        })
    }

    pub fn split_offset(&self) -> usize {
        self.proj.split_offset()
    }

    pub fn split_size(&self) -> usize {
        self.proj.split_size()
    }

    /// Normalize `rows` hidden states from `input` and write
    /// `rows × split_size` logits into `out`.
    pub fn forward(&self, input: &[f32], rows: usize, out: &mut [f32]) -> Result<()> {
        let x = Tensor::from_slice(&input[..rows * self.hidden], (rows, self.hidden), &self.device)?;
        let logits = self.proj.forward(&self.norm.forward(&x)?)?;
        write_into(&logits, &mut out[..rows * self.split_size()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SyntheticWeights;

    #[test]
    fn embedding_lookup_rows() {
        let source = SyntheticWeights::new(1, Device::Cpu);
        let emb = Embedding::load(&source, 10, 4).unwrap();
        let mut out = vec![0.0; 8];
        emb.forward(&[3, 3], &mut out).unwrap();
        assert_eq!(out[..4], out[4..]);
        let table: Vec<Vec<f32>> = emb.table.to_vec2().unwrap();
        assert_eq!(out[..4], table[3][..]);
    }

    #[test]
    fn output_head_shards_sum_to_full_width() {
        let source = SyntheticWeights::new(2, Device::Cpu);
        let h0 = OutputHead::load(&source, NormKind::RmsNorm, 4, 11, 1e-6, 0, 2, false).unwrap();
        let h1 = OutputHead::load(&source, NormKind::RmsNorm, 4, 11, 1e-6, 1, 2, false).unwrap();
        assert_eq!(h0.split_size() + h1.split_size(), 11);
        assert_eq!(h1.split_offset(), h0.split_size());

        let full = OutputHead::load(&source, NormKind::RmsNorm, 4, 11, 1e-6, 0, 1, false).unwrap();
        let x = [0.3f32, -0.2, 0.9, 0.1];
        let mut all = vec![0.0; 11];
        full.forward(&x, 1, &mut all).unwrap();
        let mut part = vec![0.0; h1.split_size()];
        h1.forward(&x, 1, &mut part).unwrap();
        for (a, b) in part.iter().zip(&all[h1.split_offset()..]) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
