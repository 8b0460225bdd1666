//! Grow-only scratch storage reused across decoding steps.
//!
//! Storage is reallocated only when a step needs more than the current
//! capacity. Contents are not preserved across a reallocation; every step
//! rewrites what it reads.

/// A `Vec<f32>` that only ever grows.
#[derive(Debug, Default)]
pub struct GrowBuffer {
    data: Vec<f32>,
    reallocations: usize,
}

impl GrowBuffer {
    /// Make sure at least `len` elements are available.
    /// Returns `true` if storage was reallocated.
    pub fn ensure(&mut self, len: usize) -> bool {
        if len <= self.data.len() {
            return false;
        }
        self.data = vec![0.0; len];
        self.reallocations += 1;
        true
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    pub fn as_slice(&self, len: usize) -> &[f32] {
        &self.data[..len]
    }

    pub fn as_mut_slice(&mut self, len: usize) -> &mut [f32] {
        &mut self.data[..len]
    }
}

/// Activation storage: the embedding region followed by the output region.
///
/// The output region doubles as the last-token staging area and the
/// un-reduced logits buffer, so it is sized for whichever is larger.
#[derive(Debug, Default)]
pub struct ActivationBuffers {
    buf: GrowBuffer,
    emb_len: usize,
    out_len: usize,
    /// Attention output of the current layer.
    attn: GrowBuffer,
}

/// Row counts the activation buffer must hold for one step shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationRequirement {
    pub act_rows: usize,
    pub out_rows: usize,
}

impl ActivationRequirement {
    /// Rows for `batch * seq` activations plus room for the logits of
    /// `logits_rows` positions over a vocabulary shard of `vocab_split`.
    pub fn new(act_rows: usize, logits_rows: usize, vocab_split: usize, hidden: usize) -> Self {
        let logits_hidden_rows = (logits_rows * vocab_split) / hidden + 1;
        Self {
            act_rows,
            out_rows: act_rows.max(logits_hidden_rows),
        }
    }
}

impl ActivationBuffers {
    /// Grow to fit `req`; returns `true` if anything was reallocated.
    pub fn ensure(&mut self, req: ActivationRequirement, hidden: usize) -> bool {
        let emb_len = req.act_rows * hidden;
        let out_len = req.out_rows * hidden;
        let grown = self.buf.ensure(emb_len + out_len);
        let attn_grown = self.attn.ensure(emb_len);
        if grown || attn_grown {
            tracing::debug!(
                act_rows = req.act_rows,
                out_rows = req.out_rows,
                hidden,
                "activation buffers grown"
            );
        }
        self.emb_len = emb_len;
        self.out_len = self.buf.capacity() - emb_len;
        grown || attn_grown
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn reallocations(&self) -> usize {
        self.buf.reallocations()
    }

    /// Embedding and output regions, split for simultaneous use.
    pub fn regions(&mut self) -> (&mut [f32], &mut [f32]) {
        let total = self.emb_len + self.out_len;
        self.buf.as_mut_slice(total).split_at_mut(self.emb_len)
    }

    /// Embedding, output and attention scratch at once. The embedding and
    /// attention slices are exactly the current step's activation size.
    pub fn all(&mut self) -> (&mut [f32], &mut [f32], &mut [f32]) {
        let total = self.emb_len + self.out_len;
        let emb_len = self.emb_len;
        let (emb, out) = self.buf.as_mut_slice(total).split_at_mut(emb_len);
        (emb, out, self.attn.as_mut_slice(emb_len))
    }
}

/// Attention mask storage, tracked independently of activations.
#[derive(Debug, Default)]
pub struct MaskBuffer {
    buf: GrowBuffer,
    len: usize,
}

impl MaskBuffer {
    /// Build a causal mask of shape `[batch, seq, past + seq]`: query `i`
    /// sees keys `0..=past + i`, everything else is `-inf`.
    pub fn fill_causal(&mut self, batch: usize, seq: usize, past: usize) -> &[f32] {
        let kv = past + seq;
        let per_batch = seq * kv;
        self.len = batch * per_batch;
        self.buf.ensure(self.len);
        let mask = self.buf.as_mut_slice(self.len);
        for (i, row) in mask[..per_batch].chunks_mut(kv).enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = if j > past + i { f32::NEG_INFINITY } else { 0.0 };
            }
        }
        for b in 1..batch {
            mask.copy_within(0..per_batch, b * per_batch);
        }
        self.buf.as_slice(self.len)
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn reallocations(&self) -> usize {
        self.buf.reallocations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_buffer_never_shrinks() {
        let mut b = GrowBuffer::default();
        assert!(b.ensure(100));
        assert!(!b.ensure(10));
        assert!(!b.ensure(100));
        assert_eq!(b.capacity(), 100);
        assert!(b.ensure(101));
        assert_eq!(b.reallocations(), 2);
    }

    #[test]
    fn activation_requirement_covers_logits() {
        // 2 rows of hidden 4, but 2 logits rows over a 10-wide vocab shard
        let req = ActivationRequirement::new(2, 2, 10, 4);
        assert_eq!(req.act_rows, 2);
        assert_eq!(req.out_rows, 6);
        let req = ActivationRequirement::new(64, 1, 8, 4);
        assert_eq!(req.out_rows, 64);
    }

    #[test]
    fn decode_steps_reuse_prefill_allocation() {
        let mut acts = ActivationBuffers::default();
        assert!(acts.ensure(ActivationRequirement::new(20, 2, 16, 8), 8));
        let cap = acts.capacity();
        for _ in 0..5 {
            assert!(!acts.ensure(ActivationRequirement::new(2, 2, 16, 8), 8));
        }
        assert_eq!(acts.capacity(), cap);
        assert_eq!(acts.reallocations(), 1);
        let (emb, out) = acts.regions();
        assert_eq!(emb.len(), 16);
        assert_eq!(emb.len() + out.len(), cap);
    }

    #[test]
    fn causal_mask_with_past() {
        let mut m = MaskBuffer::default();
        let mask = m.fill_causal(2, 2, 1).to_vec();
        let inf = f32::NEG_INFINITY;
        let expected_one = [0.0, 0.0, inf, 0.0, 0.0, 0.0];
        assert_eq!(&mask[..6], &expected_one);
        assert_eq!(&mask[6..], &expected_one);
        assert_eq!(m.capacity(), 12);
    }

    #[test]
    fn mask_grows_independently() {
        let mut m = MaskBuffer::default();
        m.fill_causal(1, 8, 0);
        m.fill_causal(1, 1, 8);
        assert_eq!(m.reallocations(), 1);
    }
}
