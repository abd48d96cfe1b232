//! Downstream session handles for the broadcast layer.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::Channel;
use crate::completion::Completion;

/// Cheap-to-clone handle to one live downstream peer.
///
/// A session references its channel, never owns it; the reactor keeps the
/// channel alive while it is registered. A session belongs to at most one
/// registry at a time, keyed by the channel id.
#[derive(Clone)]
pub struct Session {
    channel: Arc<Channel>,
}

impl Session {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Session { channel }
    }

    pub fn id(&self) -> u64 {
        self.channel.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer_addr()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Enqueues a frame on this session's write pipeline.
    pub fn write(&self, frame: Bytes) -> Completion {
        self.channel.write(frame)
    }

    pub fn close(&self) -> Completion {
        self.channel.close()
    }

    /// Bytes queued on this session but not yet accepted by the kernel.
    /// Dispatch compares this against the configured backpressure
    /// threshold when shedding slow consumers.
    pub fn scheduled_write_bytes(&self) -> usize {
        self.channel.scheduled_write_bytes()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("peer", &self.peer_addr())
            .field("open", &self.is_open())
            .finish()
    }
}
