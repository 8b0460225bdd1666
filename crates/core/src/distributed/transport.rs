//! Point-to-point frame transport shared by collectives and pipeline links.
//!
//! A frame is an opaque byte payload labelled with a `u32` tag. Frames
//! between one ordered pair of ranks arrive in send order. Receivers name
//! the tag they expect; anything else is a protocol error, since in a
//! lockstep SPMD program a mismatched tag means two ranks disagree about
//! which step they are in.

use super::error::{DistributedError, Result};

/// Blocking, ordered, tagged byte transport between ranks of one job.
pub trait Transport: Send + Sync {
    /// Global rank of this endpoint.
    fn rank(&self) -> usize;

    /// Number of ranks in the job.
    fn world_size(&self) -> usize;

    /// Send one frame to `dst`. Returns once the frame is handed off.
    fn send_frame(&self, dst: usize, tag: u32, payload: Vec<u8>) -> Result<()>;

    /// Block until the next frame from `src` arrives and check its tag and
    /// that its payload is exactly `len` bytes.
    fn recv_frame(&self, src: usize, tag: u32, len: usize) -> Result<Vec<u8>>;
}

pub(crate) fn check_peer(peer: usize, world_size: usize) -> Result<()> {
    if peer >= world_size {
        return Err(DistributedError::InvalidRank {
            rank: peer,
            world_size,
        });
    }
    Ok(())
}

pub(crate) fn encode_f32(data: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_f32(bytes: &[u8], out: &mut [f32]) -> Result<()> {
    if bytes.len() != out.len() * 4 {
        return Err(DistributedError::LengthMismatch {
            expected: out.len(),
            actual: bytes.len() / 4,
        });
    }
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

pub(crate) fn encode_u32(data: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for v in data {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_u32(bytes: &[u8], out: &mut [u32]) -> Result<()> {
    if bytes.len() != out.len() * 4 {
        return Err(DistributedError::LengthMismatch {
            expected: out.len(),
            actual: bytes.len() / 4,
        });
    }
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

/// Send a float buffer as one frame.
pub fn send_f32(transport: &dyn Transport, dst: usize, tag: u32, data: &[f32]) -> Result<()> {
    transport.send_frame(dst, tag, encode_f32(data))
}

/// Receive one frame into a float buffer of the exact expected length.
pub fn recv_f32(transport: &dyn Transport, src: usize, tag: u32, out: &mut [f32]) -> Result<()> {
    let bytes = transport.recv_frame(src, tag, out.len() * 4)?;
    decode_f32(&bytes, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_codec_preserves_bits() {
        let data = [1.5f32, -0.0, f32::MIN_POSITIVE, 3.25e7];
        let bytes = encode_f32(&data);
        let mut out = [0f32; 4];
        decode_f32(&bytes, &mut out).unwrap();
        for (a, b) in data.iter().zip(out.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let bytes = encode_f32(&[1.0, 2.0, 3.0]);
        let mut out = [0f32; 2];
        let err = decode_f32(&bytes, &mut out).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::LengthMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn u32_codec() {
        let mut out = [0u32; 3];
        decode_u32(&encode_u32(&[7, 0, u32::MAX]), &mut out).unwrap();
        assert_eq!(out, [7, 0, u32::MAX]);
    }
}
