//! In-process transport: every rank is a thread, every ordered rank pair
//! gets its own channel.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use super::error::{DistributedError, Result};
use super::transport::{check_peer, Transport};

struct Frame {
    tag: u32,
    payload: Vec<u8>,
}

/// One rank's endpoint of a [`LocalFabric`].
pub struct LocalTransport {
    rank: usize,
    world_size: usize,
    /// `outbound[dst]` delivers to rank `dst`.
    outbound: Vec<Sender<Frame>>,
    /// `inbound[src]` yields frames sent by rank `src`.
    inbound: Vec<Mutex<Receiver<Frame>>>,
}

/// Builder for a fully connected set of in-process endpoints.
pub struct LocalFabric;

impl LocalFabric {
    /// Create `world_size` connected endpoints, index `r` being rank `r`.
    pub fn create(world_size: usize) -> Vec<LocalTransport> {
        // senders[src][dst], receivers[dst][src]
        let mut senders: Vec<Vec<Sender<Frame>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Mutex<Receiver<Frame>>>> =
            (0..world_size).map(|_| Vec::new()).collect();
        for src_senders in senders.iter_mut() {
            for dst_receivers in receivers.iter_mut() {
                let (tx, rx) = channel();
                src_senders.push(tx);
                dst_receivers.push(Mutex::new(rx));
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbound, inbound))| LocalTransport {
                rank,
                world_size,
                outbound,
                inbound,
            })
            .collect()
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_frame(&self, dst: usize, tag: u32, payload: Vec<u8>) -> Result<()> {
        check_peer(dst, self.world_size)?;
        tracing::trace!(src = self.rank, dst, tag, bytes = payload.len(), "send frame");
        self.outbound[dst]
            .send(Frame { tag, payload })
            .map_err(|_| DistributedError::Disconnected { peer: dst })
    }

    fn recv_frame(&self, src: usize, tag: u32, len: usize) -> Result<Vec<u8>> {
        check_peer(src, self.world_size)?;
        let frame = {
            let rx = self.inbound[src]
                .lock()
                .map_err(|_| DistributedError::Disconnected { peer: src })?;
            rx.recv()
                .map_err(|_| DistributedError::Disconnected { peer: src })?
        };
        if frame.tag != tag {
            return Err(DistributedError::TagMismatch {
                src,
                expected: tag,
                actual: frame.tag,
            });
        }
        if frame.payload.len() != len {
            return Err(DistributedError::FrameSize {
                src,
                expected: len,
                actual: frame.payload.len() as u64,
            });
        }
        tracing::trace!(src, dst = self.rank, tag, "recv frame");
        Ok(frame.payload)
    }
}
