//! Per-process decoding orchestrator.
//!
//! Every rank of the TP×PP grid owns one [`Decoder`] and calls it in
//! lockstep with its peers:
//!
//! ```text
//!  stage 0 (tp ranks 0..T)        stage 1                 last stage
//!  ┌──────────────────────┐      ┌─────────────────┐     ┌────────────────────┐
//!  │ embed                │      │ recv(tag 100·0) │     │ recv(tag 100·(P-2))│
//!  │ layers [0, n0)       │ ───► │ layers [n0, n1) │ ──► │ layers [.., L)     │
//!  │   attn → reduce_add  │ send │                 │     │ final norm         │
//!  │   ffn  → reduce_add  │      │                 │     │ vocab-shard logits │
//!  └──────────────────────┘      └─────────────────┘     └────────────────────┘
//! ```
//!
//! The peer of a hand-off is the rank with the same TP rank in the adjacent
//! stage. Only one step is in flight per stage boundary.

use std::sync::Arc;

use super::context::ExecutionContext;
use super::error::{DecoderError, Result};
use super::session::{DecodingSession, SessionPhase};
use super::strategy::AttnFfnMode;
use crate::buffers::{ActivationBuffers, ActivationRequirement, MaskBuffer};
use crate::distributed::{stage_tag, CollectiveChannel, PipelineLink};
use crate::kv_cache::{CacheError, KvCacheManager};
use crate::layers::{build_layer, Embedding, LayerCompute, OutputHead, QuantKind, StepShape};
use crate::loader::WeightSource;

/// Caller-side shape of one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDims {
    /// Distinct user sequences.
    pub user_side_bs: usize,
    pub beam_size: usize,
    /// Tokens per sequence in this call, shared prefix included.
    pub seq_len: usize,
}

impl StepDims {
    pub fn new(user_side_bs: usize, beam_size: usize, seq_len: usize) -> Self {
        Self {
            user_side_bs,
            beam_size,
            seq_len,
        }
    }
}

/// This rank's vocabulary shard of the logits.
#[derive(Debug)]
pub struct LogitsView<'a> {
    /// `rows × split_size` values, row-major.
    pub data: &'a [f32],
    pub rows: usize,
    pub split_offset: usize,
    pub split_size: usize,
}

impl LogitsView<'_> {
    /// One row of the shard, or `None` past the last row.
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row >= self.rows {
            return None;
        }
        self.data
            .get(row * self.split_size..(row + 1) * self.split_size)
    }
}

#[derive(Debug)]
pub enum StepOutput<'a> {
    /// The activation went to the next stage.
    Handoff,
    /// Last stage: this rank's logits shard.
    Logits(LogitsView<'a>),
}

impl<'a> StepOutput<'a> {
    pub fn logits(&self) -> Option<&LogitsView<'a>> {
        match self {
            Self::Logits(view) => Some(view),
            Self::Handoff => None,
        }
    }
}

/// KV cache work done around each layer's attention in one pass.
#[derive(Debug, Clone, Copy, Default)]
struct CachePlan {
    /// Write into the dedicated prefix cache instead of the decode cache.
    prefix_cache: bool,
    /// `(batch, prefix_len)`: broadcast the shared prefix before attention.
    expand_prefix: Option<(usize, usize)>,
    /// `(batch, beam, seq_len)`: duplicate rows per beam after attention.
    expand_beam: Option<(usize, usize, usize)>,
}

pub struct Decoder {
    ctx: Arc<ExecutionContext>,
    layers: Vec<Box<dyn LayerCompute>>,
    embedding: Option<Embedding>,
    head: Option<OutputHead>,
    tp: Arc<dyn CollectiveChannel>,
    link: Arc<dyn PipelineLink>,
    kv: KvCacheManager,
    acts: ActivationBuffers,
    masks: MaskBuffer,
    positions: Vec<u32>,
    tokens: Vec<u32>,
    session: DecodingSession,
}

impl Decoder {
    /// Load this stage's layers (plus the embedding on the first stage and
    /// the output head on the last) from `source`.
    pub fn new(
        ctx: Arc<ExecutionContext>,
        source: &dyn WeightSource,
        tp: Arc<dyn CollectiveChannel>,
        link: Arc<dyn PipelineLink>,
    ) -> Result<Self> {
        let coords = *ctx.coords();
        if tp.size() != coords.tp_size || tp.rank() != coords.tp_rank {
            return Err(DecoderError::InvalidInput(format!(
                "collective channel is rank {} of {}, coordinates say {} of {}",
                tp.rank(),
                tp.size(),
                coords.tp_rank,
                coords.tp_size
            )));
        }
        let shape = *ctx.shape();
        let strategy = *ctx.strategy();

        let layers = ctx
            .assignment()
            .layer_range()
            .map(|layer| {
                build_layer(
                    source,
                    layer,
                    ctx.layer_shape(),
                    &strategy.layer,
                    ctx.rotary(),
                    ctx.device(),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let embedding = coords
            .is_first_stage()
            .then(|| Embedding::load(source, shape.vocab, shape.hidden))
            .transpose()?;
        let head = coords
            .is_last_stage()
            .then(|| {
                OutputHead::load(
                    source,
                    strategy.layer.norm,
                    shape.hidden,
                    shape.vocab,
                    shape.eps,
                    coords.tp_rank,
                    coords.tp_size,
                    strategy.layer.quant == QuantKind::Int8,
                )
            })
            .transpose()?;

        tracing::info!(
            rank = coords.global_rank(),
            layers = layers.len(),
            first_stage = embedding.is_some(),
            last_stage = head.is_some(),
            "decoder loaded"
        );

        let kv = KvCacheManager::new(layers.len(), strategy.kv_dtype.dtype(), ctx.device().clone());
        Ok(Self {
            ctx,
            layers,
            embedding,
            head,
            tp,
            link,
            kv,
            acts: ActivationBuffers::default(),
            masks: MaskBuffer::default(),
            positions: Vec::new(),
            tokens: Vec::new(),
            session: DecodingSession::default(),
        })
    }

    /// Run one decoding step.
    ///
    /// `ids` holds `batch × seq_len` tokens, where `batch` is
    /// `user_side_bs` at step 0 and `user_side_bs × beam_size` afterwards.
    /// Every rank passes the same ids; only the first stage embeds them.
    pub fn forward(
        &mut self,
        ids: &[u32],
        dims: StepDims,
        step: usize,
        logits_all: bool,
    ) -> Result<StepOutput<'_>> {
        let StepDims {
            user_side_bs,
            beam_size,
            seq_len,
        } = dims;
        if user_side_bs == 0 || beam_size == 0 || seq_len == 0 {
            return Err(DecoderError::InvalidInput(format!("empty step shape {dims:?}")));
        }
        let batch = if step == 0 {
            user_side_bs
        } else {
            user_side_bs * beam_size
        };
        if ids.len() != batch * seq_len {
            return Err(DecoderError::InvalidInput(format!(
                "expected {} token ids for {batch} sequences of {seq_len}, got {}",
                batch * seq_len,
                ids.len()
            )));
        }
        if step > 0 && !self.session.is_started() {
            return Err(DecoderError::NoSession { step });
        }

        let ctx = Arc::clone(&self.ctx);
        let coords = *ctx.coords();
        let shape = *ctx.shape();
        let layer_shape = *ctx.layer_shape();
        let capacity = shape.max_positions;

        let acc = if step == 0 { 0 } else { self.session.acc_seq_len };
        if acc + seq_len > capacity {
            return Err(CacheError::CapacityExceeded {
                requested: acc + seq_len,
                capacity,
            }
            .into());
        }

        let prefix_step = step == 0 && self.session.prefix_sharing;
        let prefix_len = self.session.prefix_seq_len;
        let (past, input_seq) = if prefix_step {
            if seq_len <= prefix_len {
                return Err(DecoderError::InvalidInput(format!(
                    "prompt of {seq_len} tokens does not extend the {prefix_len}-token prefix"
                )));
            }
            if self.kv.prefix_shape().map(|s| s.capacity) != Some(prefix_len) {
                return Err(DecoderError::InvalidInput(
                    "prefix sharing enabled but the prefix cache is not primed".into(),
                ));
            }
            (prefix_len, seq_len - prefix_len)
        } else {
            (acc, seq_len)
        };

        let batch_beam = user_side_bs * beam_size;
        if step == 0 {
            self.session.begin(seq_len, user_side_bs, beam_size);
            self.kv.resize(
                capacity,
                batch_beam,
                layer_shape.kv_heads,
                layer_shape.head_dim,
                false,
            )?;
        } else {
            match self.kv.shape() {
                // Entered through skip_first_step.
                None => {
                    self.kv.resize(
                        capacity,
                        batch,
                        layer_shape.kv_heads,
                        layer_shape.head_dim,
                        false,
                    )?;
                }
                Some(s) if s.batch_beam != batch => {
                    return Err(DecoderError::InvalidInput(format!(
                        "step {step} has {batch} sequences, the session has {}",
                        s.batch_beam
                    )));
                }
                Some(_) => {}
            }
            self.session.phase = SessionPhase::Decode;
        }

        let step_shape = StepShape {
            batch,
            seq: input_seq,
            past,
        };
        let _span = tracing::debug_span!(
            "forward",
            step,
            batch,
            seq = input_seq,
            past,
            stage = coords.pp_rank
        )
        .entered();

        let hidden = shape.hidden;
        let split = ctx.vocab_range().len();
        let logits_rows = if logits_all {
            step_shape.rows()
        } else {
            batch_beam
        };
        self.acts.ensure(
            ActivationRequirement::new(step_shape.rows(), logits_rows, split, hidden),
            hidden,
        );

        self.tokens.clear();
        if prefix_step {
            for row in ids.chunks(seq_len) {
                self.tokens.extend_from_slice(&row[prefix_len..]);
            }
        } else {
            self.tokens.extend_from_slice(ids);
        }
        self.positions.clear();
        self.positions.extend((past..past + input_seq).map(|p| p as u32));
        self.session.advance(seq_len);

        let mask = self.masks.fill_causal(batch, input_seq, past);
        let (emb, out, attn) = self.acts.all();
        if let Some(embedding) = &self.embedding {
            embedding.forward(&self.tokens, emb)?;
        }
        if let Some(src) = coords.prev_stage_peer() {
            self.link.recv(emb, src, stage_tag(coords.pp_rank - 1))?;
        }

        let plan = CachePlan {
            prefix_cache: false,
            expand_prefix: prefix_step.then_some((user_side_bs, prefix_len)),
            expand_beam: (step == 0 && beam_size > 1).then_some((user_side_bs, beam_size, seq_len)),
        };
        run_layers(
            &self.layers,
            &self.kv,
            self.tp.as_ref(),
            ctx.strategy().attn_ffn,
            coords.is_tp_root(),
            &step_shape,
            (&mut *emb, &mut *out, attn),
            mask,
            &self.positions,
            plan,
        )?;

        if let Some(dst) = coords.next_stage_peer() {
            self.link.send(emb, dst, stage_tag(coords.pp_rank))?;
            return Ok(StepOutput::Handoff);
        }
        let head = self.head.as_ref().ok_or_else(|| {
            DecoderError::InvalidInput("last stage constructed without an output head".into())
        })?;

        let rows = if logits_all {
            step_shape.rows()
        } else {
            if input_seq > 1 {
                for b in 0..batch {
                    let src = ((b + 1) * input_seq - 1) * hidden;
                    emb.copy_within(src..src + hidden, b * hidden);
                }
            }
            batch
        };
        let split_size = head.split_size();
        head.forward(emb, rows, out)?;

        let mut out_rows = rows;
        if step == 0 && beam_size > 1 && !logits_all {
            // Descending order keeps every source row intact until it is copied.
            for b in (0..user_side_bs).rev() {
                let src = b * split_size;
                for k in (0..beam_size).rev() {
                    let dst = (b * beam_size + k) * split_size;
                    if dst != src {
                        out.copy_within(src..src + split_size, dst);
                    }
                }
            }
            out_rows = batch_beam;
        }

        let out: &[f32] = out;
        Ok(StepOutput::Logits(LogitsView {
            data: &out[..out_rows * split_size],
            rows: out_rows,
            split_offset: head.split_offset(),
            split_size,
        }))
    }

    /// Run the layer stack over a single shared prefix, filling the prefix
    /// cache. Takes part in the pipeline hand-off like `forward` but
    /// produces no logits.
    pub fn prefix_forward(&mut self, ids: &[u32]) -> Result<()> {
        let seq = ids.len();
        let ctx = Arc::clone(&self.ctx);
        let coords = *ctx.coords();
        let shape = *ctx.shape();
        let layer_shape = *ctx.layer_shape();
        if seq == 0 {
            return Err(DecoderError::InvalidInput("empty prefix".into()));
        }
        if seq > shape.max_positions {
            return Err(CacheError::CapacityExceeded {
                requested: seq,
                capacity: shape.max_positions,
            }
            .into());
        }
        let _span = tracing::debug_span!("prefix_forward", seq, stage = coords.pp_rank).entered();

        self.kv
            .resize(seq, 1, layer_shape.kv_heads, layer_shape.head_dim, true)?;
        let step_shape = StepShape {
            batch: 1,
            seq,
            past: 0,
        };
        self.acts.ensure(
            ActivationRequirement::new(seq, 1, ctx.vocab_range().len(), shape.hidden),
            shape.hidden,
        );
        self.positions.clear();
        self.positions.extend(0..seq as u32);

        let mask = self.masks.fill_causal(1, seq, 0);
        let (emb, out, attn) = self.acts.all();
        if let Some(embedding) = &self.embedding {
            embedding.forward(ids, emb)?;
        }
        if let Some(src) = coords.prev_stage_peer() {
            self.link.recv(emb, src, stage_tag(coords.pp_rank - 1))?;
        }
        run_layers(
            &self.layers,
            &self.kv,
            self.tp.as_ref(),
            ctx.strategy().attn_ffn,
            coords.is_tp_root(),
            &step_shape,
            (&mut *emb, out, attn),
            mask,
            &self.positions,
            CachePlan {
                prefix_cache: true,
                ..CachePlan::default()
            },
        )?;
        if let Some(dst) = coords.next_stage_peer() {
            self.link.send(emb, dst, stage_tag(coords.pp_rank))?;
        }
        Ok(())
    }

    /// Prime the shared prefix and enable prefix sharing for later sessions.
    pub fn set_prefix(&mut self, ids: &[u32]) -> Result<()> {
        self.prefix_forward(ids)?;
        self.session.set_prefix(ids.len());
        tracing::debug!(prefix_len = ids.len(), "prefix sharing enabled");
        Ok(())
    }

    pub fn unset_prefix(&mut self) {
        self.session.unset_prefix();
    }

    /// Permute beam rows over the generated region `[init, acc)`.
    pub fn reorder_cache(&mut self, idx: &[u32]) -> Result<()> {
        self.kv.reorder_cache(
            idx,
            idx.len(),
            self.session.init_seq_len,
            self.session.acc_seq_len,
        )?;
        Ok(())
    }

    /// Continue from a cache the caller already holds up to `init_seq_len`.
    pub fn skip_first_step(&mut self, init_seq_len: usize) {
        self.session.skip_first_step(init_seq_len);
    }

    pub fn session(&self) -> &DecodingSession {
        &self.session
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn kv_cache(&self) -> &KvCacheManager {
        &self.kv
    }

    pub fn activations(&self) -> &ActivationBuffers {
        &self.acts
    }

    pub fn masks(&self) -> &MaskBuffer {
        &self.masks
    }

    pub fn num_local_layers(&self) -> usize {
        self.layers.len()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_layers(
    layers: &[Box<dyn LayerCompute>],
    kv: &KvCacheManager,
    tp: &dyn CollectiveChannel,
    mode: AttnFfnMode,
    is_tp_root: bool,
    step: &StepShape,
    (emb, out, attn): (&mut [f32], &mut [f32], &mut [f32]),
    mask: &[f32],
    positions: &[u32],
    plan: CachePlan,
) -> Result<()> {
    for (i, layer) in layers.iter().enumerate() {
        if let Some((batch, prefix_len)) = plan.expand_prefix {
            kv.expand_prefix_cache(i, batch, prefix_len)?;
        }
        let cache = if plan.prefix_cache {
            kv.prefix_layer(i)?
        } else {
            kv.layer(i)?
        };
        layer.forward_attention(step, emb, attn, mask, cache, positions, is_tp_root)?;
        if let Some((batch, beam, seq_len)) = plan.expand_beam {
            kv.expand_cache(i, batch, beam, seq_len)?;
        }

        match mode {
            AttnFfnMode::Sequential => {
                tp.reduce_add(attn)?;
                let attn: &[f32] = &*attn;
                layer.forward_ffn(step, attn, is_tp_root.then_some(attn), is_tp_root, emb)?;
                tp.reduce_add(emb)?;
            }
            AttnFfnMode::Parallel => {
                let out = &mut out[..emb.len()];
                layer.forward_ffn(step, emb, Some(&*attn), is_tp_root, out)?;
                tp.reduce_add(out)?;
                emb.copy_from_slice(out);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ParallelCoordinates;
    use crate::engine::ExecutionStrategy;
    use crate::testing::{single_rank_decoder, tiny_config, NullLink, RecordingChannel};
    use candle_core::Device;

    #[test]
    fn step_zero_accumulates_full_prompt() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let ids: Vec<u32> = (0..8).collect();
        let out = decoder.forward(&ids, StepDims::new(2, 1, 4), 0, false).unwrap();
        let view = out.logits().unwrap();
        assert_eq!(view.rows, 2);
        assert_eq!(view.split_offset, 0);
        assert_eq!(view.data.len(), 2 * view.split_size);
        assert_eq!(decoder.session().acc_seq_len, 4);
        decoder.forward(&[1, 2], StepDims::new(2, 1, 1), 1, false).unwrap();
        assert_eq!(decoder.session().acc_seq_len, 5);
        assert_eq!(decoder.session().phase, SessionPhase::Decode);
    }

    #[test]
    fn step_before_prompt_is_rejected() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let err = decoder
            .forward(&[1], StepDims::new(1, 1, 1), 1, false)
            .err()
            .unwrap();
        assert!(matches!(err, DecoderError::NoSession { step: 1 }));
    }

    #[test]
    fn wrong_id_count_is_rejected() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let err = decoder
            .forward(&[1, 2, 3], StepDims::new(2, 1, 2), 0, false)
            .err()
            .unwrap();
        assert!(matches!(err, DecoderError::InvalidInput(_)));
    }

    #[test]
    fn logits_all_returns_every_position() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let ids: Vec<u32> = (0..6).collect();
        let out = decoder.forward(&ids, StepDims::new(2, 1, 3), 0, true).unwrap();
        assert_eq!(out.logits().unwrap().rows, 6);
    }

    #[test]
    fn mismatched_channel_is_rejected() {
        let coords = ParallelCoordinates::from_world(2, 0, 1).unwrap();
        let ctx = ExecutionContext::new(tiny_config(), coords, ExecutionStrategy::default(), Device::Cpu)
            .unwrap();
        let source = crate::loader::SyntheticWeights::new(1, Device::Cpu);
        let err = Decoder::new(
            ctx,
            &source,
            Arc::new(RecordingChannel::default()),
            Arc::new(NullLink),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DecoderError::InvalidInput(_)));
    }
}
