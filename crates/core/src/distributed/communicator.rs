//! Tensor-parallel group collectives.
//!
//! Every method is a lockstep collective: all members of the TP group must
//! call it in the same order with buffers of the same length, or the group
//! deadlocks. There is no partial or asynchronous variant.

use std::sync::Arc;

use super::error::Result;
use super::process_group::ParallelCoordinates;
use super::transport::{decode_f32, decode_u32, encode_f32, encode_u32, Transport};

/// Collective operations within one tensor-parallel group.
pub trait CollectiveChannel: Send + Sync {
    /// Number of members in the group.
    fn size(&self) -> usize;

    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Color (pipeline stage) identifying the group.
    fn color(&self) -> usize;

    /// In-place element-wise sum across the group. Every member ends up with
    /// a bit-identical result.
    fn reduce_add(&self, buf: &mut [f32]) -> Result<()>;

    /// Replicate group rank 0's buffer to every member.
    fn broadcast(&self, buf: &mut [f32]) -> Result<()>;

    /// Replicate group rank 0's token ids to every member.
    fn broadcast_ids(&self, buf: &mut [u32]) -> Result<()>;
}

const REDUCE_GATHER_TAG: u32 = 0x7000_0001;
const REDUCE_RESULT_TAG: u32 = 0x7000_0002;
const BROADCAST_TAG: u32 = 0x7000_0003;
const BROADCAST_IDS_TAG: u32 = 0x7000_0004;

/// TP group collectives over a point-to-point [`Transport`].
///
/// Reduce-add gathers to the group root, sums in member order and sends the
/// result back, so floating point summation order is the same everywhere.
pub struct GroupCommunicator {
    transport: Arc<dyn Transport>,
    coords: ParallelCoordinates,
    members: Vec<usize>,
}

impl GroupCommunicator {
    /// Split the global group by color and keep this process's TP group.
    pub fn new(transport: Arc<dyn Transport>, coords: ParallelCoordinates) -> Self {
        let members: Vec<usize> = coords.tp_group().collect();
        tracing::debug!(
            rank = transport.rank(),
            color = coords.color(),
            tp_rank = coords.tp_rank,
            tp_size = coords.tp_size,
            "TP group formed"
        );
        Self {
            transport,
            coords,
            members,
        }
    }

    fn root(&self) -> usize {
        self.members[0]
    }

    fn broadcast_bytes(&self, tag: u32, bytes: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.coords.is_tp_root() {
            for &member in &self.members[1..] {
                self.transport.send_frame(member, tag, bytes.clone())?;
            }
            Ok(None)
        } else {
            let len = bytes.len();
            Ok(Some(self.transport.recv_frame(self.root(), tag, len)?))
        }
    }
}

impl CollectiveChannel for GroupCommunicator {
    fn size(&self) -> usize {
        self.coords.tp_size
    }

    fn rank(&self) -> usize {
        self.coords.tp_rank
    }

    fn color(&self) -> usize {
        self.coords.color()
    }

    fn reduce_add(&self, buf: &mut [f32]) -> Result<()> {
        if self.members.len() == 1 {
            return Ok(());
        }
        if self.coords.is_tp_root() {
            let mut partial = vec![0f32; buf.len()];
            for &member in &self.members[1..] {
                let bytes = self.transport
                    .recv_frame(member, REDUCE_GATHER_TAG, buf.len() * 4)?;
                decode_f32(&bytes, &mut partial)?;
                for (acc, v) in buf.iter_mut().zip(partial.iter()) {
                    *acc += *v;
                }
            }
            let reduced = encode_f32(buf);
            for &member in &self.members[1..] {
                self.transport
                    .send_frame(member, REDUCE_RESULT_TAG, reduced.clone())?;
            }
        } else {
            self.transport
                .send_frame(self.root(), REDUCE_GATHER_TAG, encode_f32(buf))?;
            let bytes = self.transport
                .recv_frame(self.root(), REDUCE_RESULT_TAG, buf.len() * 4)?;
            decode_f32(&bytes, buf)?;
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32]) -> Result<()> {
        if self.members.len() == 1 {
            return Ok(());
        }
        if let Some(bytes) = self.broadcast_bytes(BROADCAST_TAG, encode_f32(buf))? {
            decode_f32(&bytes, buf)?;
        }
        Ok(())
    }

    fn broadcast_ids(&self, buf: &mut [u32]) -> Result<()> {
        if self.members.len() == 1 {
            return Ok(());
        }
        if let Some(bytes) = self.broadcast_bytes(BROADCAST_IDS_TAG, encode_u32(buf))? {
            decode_u32(&bytes, buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::local::LocalFabric;

    fn spawn_group<F>(world: usize, stages: usize, f: F) -> Vec<Vec<f32>>
    where
        F: Fn(usize, &GroupCommunicator) -> Vec<f32> + Send + Sync + Copy + 'static,
    {
        let handles: Vec<_> = LocalFabric::create(world)
            .into_iter()
            .enumerate()
            .map(|(rank, t)| {
                std::thread::spawn(move || {
                    let coords = ParallelCoordinates::from_world(world, rank, stages).unwrap();
                    let comm = GroupCommunicator::new(Arc::new(t), coords);
                    f(rank, &comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn reduce_add_sums_within_group_only() {
        let results = spawn_group(4, 2, |rank, comm| {
            let mut buf = vec![rank as f32, 1.0];
            comm.reduce_add(&mut buf).unwrap();
            buf
        });
        // Stage 0 = ranks {0,1}, stage 1 = ranks {2,3}.
        assert_eq!(results[0], vec![1.0, 2.0]);
        assert_eq!(results[1], vec![1.0, 2.0]);
        assert_eq!(results[2], vec![5.0, 2.0]);
        assert_eq!(results[3], vec![5.0, 2.0]);
    }

    #[test]
    fn broadcast_copies_group_root() {
        let results = spawn_group(3, 1, |rank, comm| {
            let mut buf = vec![rank as f32 + 10.0; 2];
            comm.broadcast(&mut buf).unwrap();
            let mut ids = vec![rank as u32; 1];
            comm.broadcast_ids(&mut ids).unwrap();
            buf.push(ids[0] as f32);
            buf
        });
        for r in results {
            assert_eq!(r, vec![10.0, 10.0, 0.0]);
        }
    }

    #[test]
    fn single_member_group_is_identity() {
        let results = spawn_group(2, 2, |rank, comm| {
            assert_eq!(comm.size(), 1);
            assert_eq!(comm.color(), rank);
            let mut buf = vec![3.0];
            comm.reduce_add(&mut buf).unwrap();
            buf
        });
        assert_eq!(results, vec![vec![3.0], vec![3.0]]);
    }
}
