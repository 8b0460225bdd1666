use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::distributed::{CollectiveChannel, DistributedError, PipelineLink, Result};

/// Collective that counts calls and forwards them to an inner channel, or
/// acts as a one-member group when there is none.
#[derive(Default)]
pub struct RecordingChannel {
    inner: Option<Arc<dyn CollectiveChannel>>,
    reduces: AtomicUsize,
    broadcasts: AtomicUsize,
}

impl RecordingChannel {
    pub fn wrap(inner: Arc<dyn CollectiveChannel>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::default()
        }
    }

    pub fn reduce_count(&self) -> usize {
        self.reduces.load(Ordering::SeqCst)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }
}

impl CollectiveChannel for RecordingChannel {
    fn size(&self) -> usize {
        self.inner.as_ref().map_or(1, |c| c.size())
    }

    fn rank(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.rank())
    }

    fn color(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.color())
    }

    fn reduce_add(&self, buf: &mut [f32]) -> Result<()> {
        self.reduces.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.reduce_add(buf),
            None => Ok(()),
        }
    }

    fn broadcast(&self, buf: &mut [f32]) -> Result<()> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.broadcast(buf),
            None => Ok(()),
        }
    }

    fn broadcast_ids(&self, buf: &mut [u32]) -> Result<()> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        match &self.inner {
            Some(inner) => inner.broadcast_ids(buf),
            None => Ok(()),
        }
    }
}

/// Pipeline link for single-stage setups; any use is an error.
pub struct NullLink;

impl PipelineLink for NullLink {
    fn send(&self, _buf: &[f32], dst: usize, _tag: u32) -> Result<()> {
        Err(DistributedError::Disconnected { peer: dst })
    }

    fn recv(&self, _buf: &mut [f32], src: usize, _tag: u32) -> Result<()> {
        Err(DistributedError::Disconnected { peer: src })
    }
}
