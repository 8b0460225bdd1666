//! Greedy generation loop run by every rank of the grid.
//!
//! Each iteration all ranks call [`Decoder::forward`]. On the last stage the
//! TP peers ship their vocabulary shards to the sampler rank (the last
//! stage's TP root), which assembles full rows, takes the argmax and sends
//! the chosen tokens to every other rank so the next step starts from the
//! same ids everywhere.

use super::decoder::{Decoder, StepDims, StepOutput};
use super::error::{DecoderError, Result};
use crate::distributed::{decode_u32, encode_u32, recv_f32, send_f32, Transport};
use crate::layers::split_range;

const LOGITS_TAG: u32 = 0x7100_0001;
const TOKENS_TAG: u32 = 0x7100_0002;

#[derive(Debug, Clone)]
pub struct GreedyRequest {
    /// `batch × prompt_len` token ids.
    pub prompts: Vec<u32>,
    pub batch: usize,
    pub max_new_tokens: usize,
    /// Sequences stop collecting tokens after emitting this id.
    pub eos_token_id: Option<u32>,
}

/// Generate up to `max_new_tokens` per sequence. Every rank returns the
/// same tokens.
pub fn generate_greedy(
    decoder: &mut Decoder,
    transport: &dyn Transport,
    request: &GreedyRequest,
) -> Result<Vec<Vec<u32>>> {
    let batch = request.batch;
    if batch == 0 || request.prompts.is_empty() || request.prompts.len() % batch != 0 {
        return Err(DecoderError::InvalidInput(format!(
            "{} prompt ids do not split into {batch} sequences",
            request.prompts.len()
        )));
    }
    let coords = *decoder.context().coords();
    let vocab = decoder.context().shape().vocab;
    let sampler = coords.sampler_rank();
    let rank = transport.rank();

    let mut ids = request.prompts.clone();
    let mut dims = StepDims::new(batch, 1, request.prompts.len() / batch);
    let mut next = vec![0u32; batch];
    let mut generated = vec![Vec::new(); batch];
    let mut finished = vec![false; batch];

    for step in 0..request.max_new_tokens {
        let output = decoder.forward(&ids, dims, step, false)?;
        if let StepOutput::Logits(view) = output {
            if rank == sampler {
                let mut full = vec![0.0f32; batch * vocab];
                place_shard(&mut full, vocab, view.data, view.split_offset, view.split_size, batch);
                for tp_rank in 1..coords.tp_size {
                    let range = split_range(vocab, coords.tp_size, tp_rank);
                    let mut shard = vec![0.0f32; batch * range.len()];
                    recv_f32(transport, sampler + tp_rank, LOGITS_TAG, &mut shard)?;
                    place_shard(&mut full, vocab, &shard, range.start, range.len(), batch);
                }
                for (b, row) in full.chunks(vocab).enumerate() {
                    next[b] = argmax(row);
                }
            } else {
                send_f32(transport, sampler, LOGITS_TAG, view.data)?;
            }
        }

        if rank == sampler {
            let bytes = encode_u32(&next);
            for dst in (0..transport.world_size()).filter(|&r| r != sampler) {
                transport.send_frame(dst, TOKENS_TAG, bytes.clone())?;
            }
        } else {
            let bytes = transport.recv_frame(sampler, TOKENS_TAG, next.len() * 4)?;
            decode_u32(&bytes, &mut next)?;
        }

        for (b, &token) in next.iter().enumerate() {
            if finished[b] {
                continue;
            }
            generated[b].push(token);
            finished[b] = request.eos_token_id == Some(token);
        }
        tracing::trace!(step, tokens = ?next, "step sampled");
        if finished.iter().all(|&f| f) {
            break;
        }
        ids.clone_from(&next);
        dims.seq_len = 1;
    }
    Ok(generated)
}

fn place_shard(full: &mut [f32], vocab: usize, shard: &[f32], offset: usize, len: usize, rows: usize) {
    for r in 0..rows {
        full[r * vocab + offset..r * vocab + offset + len]
            .copy_from_slice(&shard[r * len..(r + 1) * len]);
    }
}

/// Index of the largest value; the lowest index wins ties.
fn argmax(row: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionStrategy;
    use crate::testing::single_rank_decoder;
    use crate::distributed::LocalFabric;

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, -1.0]), 1);
        assert_eq!(argmax(&[f32::NEG_INFINITY, -3.0]), 1);
    }

    #[test]
    fn place_shard_writes_column_block() {
        let mut full = vec![0.0; 2 * 5];
        place_shard(&mut full, 5, &[1.0, 2.0, 3.0, 4.0], 3, 2, 2);
        assert_eq!(full, vec![0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn single_rank_generates_requested_tokens() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let transport = LocalFabric::create(1).remove(0);
        let request = GreedyRequest {
            prompts: vec![1, 2, 3, 4, 5, 6],
            batch: 2,
            max_new_tokens: 4,
            eos_token_id: None,
        };
        let out = generate_greedy(&mut decoder, &transport, &request).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|seq| seq.len() == 4));
        assert_eq!(decoder.session().acc_seq_len, 3 + 3);
    }

    #[test]
    fn invalid_batch_is_rejected() {
        let mut decoder = single_rank_decoder(ExecutionStrategy::default());
        let transport = LocalFabric::create(1).remove(0);
        let request = GreedyRequest {
            prompts: vec![1, 2, 3],
            batch: 2,
            max_new_tokens: 1,
            eos_token_id: None,
        };
        assert!(generate_greedy(&mut decoder, &transport, &request).is_err());
    }
}
