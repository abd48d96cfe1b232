//! Channel lifecycle notifications.
//!
//! The reactor knows nothing about framing or codecs; it reports lifecycle
//! and data events through [`ChannelHandler`] and leaves interpretation to
//! the layer that attached the handler. Delivery is two-mode: callbacks fire
//! synchronously when the emitting code already runs on the reactor thread,
//! and are deferred through the task queue otherwise, so application
//! callbacks never reenter from an arbitrary thread.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::WriteError;

/// Callbacks attached to a channel at registration.
///
/// All methods default to no-ops; implement the ones the layer cares about.
pub trait ChannelHandler: Send + Sync {
    /// The channel is registered and connected.
    fn on_open(&self, _channel: &Arc<Channel>) {}

    /// Inbound bytes. Always invoked on the reactor thread; the handler may
    /// submit writes from inside the callback.
    fn on_data(&self, _channel: &Arc<Channel>, _data: &[u8]) {}

    /// A drain cycle moved `_bytes` bytes into the kernel.
    fn on_write_complete(&self, _channel: &Arc<Channel>, _bytes: u64) {}

    /// The effective interest mask changed.
    fn on_interest_changed(&self, _channel: &Arc<Channel>) {}

    /// An unexpected failure surfaced; the failed write's completion handle
    /// carries the same cause.
    fn on_exception(&self, _channel: &Arc<Channel>, _cause: &WriteError) {}

    /// The channel transitioned from open to closed. Fires exactly once.
    fn on_close(&self, _channel: &Arc<Channel>) {}
}

/// Callbacks for a listening socket registered with the reactor.
pub trait Acceptor: Send + Sync {
    /// A downstream connection was accepted. The stream is already
    /// non-blocking; the acceptor decides how to tune and register it.
    fn on_accept(&self, stream: mio::net::TcpStream, addr: SocketAddr);

    /// Accept failed with a non-transient error.
    fn on_accept_error(&self, _err: &io::Error) {}
}

/// A notification queued for delivery on the reactor thread.
#[derive(Debug)]
pub(crate) enum Deferred {
    Open,
    WriteComplete(u64),
    InterestChanged,
    Exception(WriteError),
    Closed,
}
