//! Multi-process bootstrap and the TCP transport.
//!
//! # Environment Variables
//!
//! The launcher uses the usual distributed environment variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node
//! - `MASTER_ADDR`: Address every rank listens and dials on (default: 127.0.0.1)
//! - `MASTER_PORT`: Base port; rank `r` listens on `MASTER_PORT + r` (default: 29500)
//!
//! # Usage
//!
//! ```ignore
//! use tandem_core::distributed::{DistributedConfig, TcpTransport};
//!
//! let config = DistributedConfig::from_env();
//! let transport = TcpTransport::connect(&config)?;
//! ```

use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use super::error::{DistributedError, Result};
use super::transport::{check_peer, Transport};

/// Distributed configuration from environment.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
    /// Address used for the TCP mesh.
    pub master_addr: String,
    /// Base port for the TCP mesh.
    pub master_port: u16,
}

impl DistributedConfig {
    /// Create from environment variables.
    ///
    /// Falls back to single-process defaults if not set.
    pub fn from_env() -> Self {
        let rank = env::var("RANK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let world_size = env::var("WORLD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        let local_rank = env::var("LOCAL_RANK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(rank);
        let master_addr = env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let master_port = env::var("MASTER_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(29500);
        Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        }
    }

    /// Configuration for a single process.
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Validate rank against world size.
    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(DistributedError::Environment(
                "WORLD_SIZE must be > 0".to_string(),
            ));
        }
        check_peer(self.rank, self.world_size)
    }

    fn port_of(&self, rank: usize) -> Result<u16> {
        u16::try_from(self.master_port as usize + rank).map_err(|_| {
            DistributedError::Environment(format!(
                "MASTER_PORT {} + rank {} overflows the port range",
                self.master_port, rank
            ))
        })
    }
}

struct PeerStream {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

/// Full-mesh TCP transport. One stream per peer pair.
///
/// Frame layout: `tag: u32 LE`, `len: u64 LE`, `len` payload bytes.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    peers: Vec<Option<PeerStream>>,
    loopback_tx: Mutex<Sender<(u32, Vec<u8>)>>,
    loopback_rx: Mutex<Receiver<(u32, Vec<u8>)>>,
}

const CONNECT_RETRIES: usize = 300;
const RETRY_DELAY: Duration = Duration::from_millis(100);

impl TcpTransport {
    /// Build the mesh.
    ///
    /// 1. Bind `MASTER_PORT + rank`
    /// 2. Dial every lower rank and announce our rank
    /// 3. Accept one connection from every higher rank
    pub fn connect(config: &DistributedConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            rank = config.rank,
            world_size = config.world_size,
            local_rank = config.local_rank,
            "Initializing TCP transport"
        );

        let listen_addr = format!("{}:{}", config.master_addr, config.port_of(config.rank)?);
        let listener = TcpListener::bind(&listen_addr)?;
        tracing::debug!(addr = %listen_addr, "Listening for higher ranks");

        let mut streams: Vec<Option<TcpStream>> = (0..config.world_size).map(|_| None).collect();

        for peer in 0..config.rank {
            let addr = format!("{}:{}", config.master_addr, config.port_of(peer)?);
            let mut stream = dial(&addr)?;
            stream.write_all(&(config.rank as u64).to_le_bytes())?;
            stream.set_nodelay(true)?;
            streams[peer] = Some(stream);
        }

        for _ in config.rank + 1..config.world_size {
            let (mut stream, remote) = listener.accept()?;
            let mut hello = [0u8; 8];
            stream.read_exact(&mut hello)?;
            let peer = u64::from_le_bytes(hello) as usize;
            if peer <= config.rank || peer >= config.world_size || streams[peer].is_some() {
                return Err(DistributedError::Environment(format!(
                    "unexpected handshake from rank {peer} at {remote}"
                )));
            }
            stream.set_nodelay(true)?;
            tracing::trace!(peer, remote = %remote, "Accepted peer");
            streams[peer] = Some(stream);
        }

        let peers = streams
            .into_iter()
            .map(|s| {
                s.map(|stream| -> Result<PeerStream> {
                    Ok(PeerStream {
                        reader: Mutex::new(stream.try_clone()?),
                        writer: Mutex::new(stream),
                    })
                })
                .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        let (tx, rx) = channel();
        tracing::info!(rank = config.rank, "TCP mesh established");
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            peers,
            loopback_tx: Mutex::new(tx),
            loopback_rx: Mutex::new(rx),
        })
    }

    fn peer(&self, peer: usize) -> Result<&PeerStream> {
        check_peer(peer, self.world_size)?;
        self.peers[peer]
            .as_ref()
            .ok_or(DistributedError::Disconnected { peer })
    }
}

fn dial(addr: &str) -> Result<TcpStream> {
    for attempt in 0..CONNECT_RETRIES {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                tracing::trace!(addr = %addr, "Connected to peer");
                return Ok(stream);
            }
            Err(e) if attempt < CONNECT_RETRIES - 1 => {
                tracing::trace!(attempt, addr = %addr, error = %e, "Retrying connection");
                std::thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(DistributedError::Environment(format!(
        "failed to connect to {addr}"
    )))
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_frame(&self, dst: usize, tag: u32, payload: Vec<u8>) -> Result<()> {
        if dst == self.rank {
            let tx = self
                .loopback_tx
                .lock()
                .map_err(|_| DistributedError::Disconnected { peer: dst })?;
            return tx
                .send((tag, payload))
                .map_err(|_| DistributedError::Disconnected { peer: dst });
        }
        let peer = self.peer(dst)?;
        let mut stream = peer
            .writer
            .lock()
            .map_err(|_| DistributedError::Disconnected { peer: dst })?;
        stream.write_all(&tag.to_le_bytes())?;
        stream.write_all(&(payload.len() as u64).to_le_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }

    fn recv_frame(&self, src: usize, tag: u32, len: usize) -> Result<Vec<u8>> {
        let (actual, payload) = if src == self.rank {
            let rx = self
                .loopback_rx
                .lock()
                .map_err(|_| DistributedError::Disconnected { peer: src })?;
            rx.recv()
                .map_err(|_| DistributedError::Disconnected { peer: src })?
        } else {
            let peer = self.peer(src)?;
            let mut stream = peer
                .reader
                .lock()
                .map_err(|_| DistributedError::Disconnected { peer: src })?;
            let mut header = [0u8; 12];
            stream.read_exact(&mut header)?;
            let actual = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if actual != tag {
                return Err(DistributedError::TagMismatch {
                    src,
                    expected: tag,
                    actual,
                });
            }
            let mut size = [0u8; 8];
            size.copy_from_slice(&header[4..]);
            let size = u64::from_le_bytes(size);
            // Checked against the header before anything is allocated.
            if size != len as u64 {
                return Err(DistributedError::FrameSize {
                    src,
                    expected: len,
                    actual: size,
                });
            }
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload)?;
            (actual, payload)
        };
        if actual != tag {
            return Err(DistributedError::TagMismatch {
                src,
                expected: tag,
                actual,
            });
        }
        if payload.len() != len {
            return Err(DistributedError::FrameSize {
                src,
                expected: len,
                actual: payload.len() as u64,
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::transport::{recv_f32, send_f32};

    #[test]
    fn single_process_defaults() {
        let config = DistributedConfig::single_process();
        assert_eq!(config.rank, 0);
        assert_eq!(config.world_size, 1);
        assert!(!config.is_distributed());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_rank_outside_world() {
        let config = DistributedConfig {
            rank: 3,
            world_size: 2,
            ..DistributedConfig::single_process()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_overflow_detected() {
        let config = DistributedConfig {
            master_port: u16::MAX,
            world_size: 2,
            ..DistributedConfig::single_process()
        };
        assert!(config.port_of(1).is_err());
    }

    #[test]
    fn two_rank_mesh_exchanges_frames() {
        let base = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = |rank| DistributedConfig {
            rank,
            world_size: 2,
            local_rank: rank,
            master_addr: "127.0.0.1".to_string(),
            master_port: base,
        };
        let c1 = config(1);
        let handle = std::thread::spawn(move || {
            let t = TcpTransport::connect(&c1).unwrap();
            let mut buf = [0.0f32; 2];
            recv_f32(&t, 0, 7, &mut buf).unwrap();
            send_f32(&t, 0, 8, &[buf[0] + buf[1]]).unwrap();
        });
        let t0 = TcpTransport::connect(&config(0)).unwrap();
        send_f32(&t0, 1, 7, &[1.5, 2.5]).unwrap();
        let mut sum = [0.0f32; 1];
        recv_f32(&t0, 1, 8, &mut sum).unwrap();
        handle.join().unwrap();
        assert_eq!(sum, [4.0]);

        send_f32(&t0, 0, 3, &[9.0]).unwrap();
        let mut own = [0.0f32; 1];
        recv_f32(&t0, 0, 3, &mut own).unwrap();
        assert_eq!(own, [9.0]);
    }

    #[test]
    fn oversized_frame_header_is_rejected() {
        let base = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = |rank| DistributedConfig {
            rank,
            world_size: 2,
            local_rank: rank,
            master_addr: "127.0.0.1".to_string(),
            master_port: base,
        };
        let c1 = config(1);
        let handle = std::thread::spawn(move || {
            let t = TcpTransport::connect(&c1).unwrap();
            let peer = t.peer(0).unwrap();
            let mut stream = peer.writer.lock().unwrap();
            stream.write_all(&7u32.to_le_bytes()).unwrap();
            stream.write_all(&u64::MAX.to_le_bytes()).unwrap();
            stream.flush().unwrap();
            drop(stream);
            t
        });
        let t0 = TcpTransport::connect(&config(0)).unwrap();
        let err = t0.recv_frame(1, 7, 8).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::FrameSize {
                src: 1,
                expected: 8,
                actual: u64::MAX
            }
        ));
        drop(handle.join().unwrap());
    }
}
