//! Reactor and broadcast-service configuration.
//!
//! Two configuration surfaces live here:
//!
//! - [`ReactorConfig`] tunes one event loop: event batch capacity, poll
//!   timeout, the write spin count bounding transfer retries per drain
//!   cycle, the read buffer, and the shape of the send-buffer pool.
//! - [`BroadcastConfig`] describes one broadcast fan-out service: the accept
//!   address for downstream peers, the optional upstream producer address,
//!   the producer-reconnect policy, and the advisory per-session
//!   scheduled-write-bytes threshold.
//!
//! All parameters have working defaults; builder-style methods allow
//! selective overrides.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a single reactor event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Capacity of the readiness event batch per poll call.
    ///
    /// **Default**: `1024`
    pub event_capacity: usize,

    /// Maximum time one readiness wait may block. `None` waits
    /// indefinitely; cross-thread task submission wakes the poll either
    /// way, so the timeout only matters for callers that want a periodic
    /// heartbeat out of the loop.
    ///
    /// **Default**: `None`
    pub poll_timeout: Option<Duration>,

    /// Bounded number of transfer attempts per drain iteration used to
    /// absorb transient zero-byte writes without yielding the loop.
    ///
    /// **Default**: `16`
    pub write_spin_count: u32,

    /// Size of the reusable inbound read buffer.
    ///
    /// **Default**: `64 KiB`
    pub read_buffer_size: usize,

    /// Number of send buffers pre-allocated in the pool.
    ///
    /// **Default**: `64`
    pub pool_buffers: usize,

    /// Capacity of each pooled send buffer in bytes.
    ///
    /// **Default**: `8 KiB`
    pub pool_buffer_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            poll_timeout: None,
            write_spin_count: 16,
            read_buffer_size: 64 * 1024,
            pool_buffers: 64,
            pool_buffer_capacity: 8 * 1024,
        }
    }
}

impl ReactorConfig {
    /// Set the poll timeout.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the write spin count. Values below 1 are clamped to 1.
    pub fn write_spin_count(mut self, count: u32) -> Self {
        self.write_spin_count = count.max(1);
        self
    }

    /// Set the readiness event batch capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the inbound read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

/// Per-socket options applied to accepted and dialed connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketTuning {
    /// Disable Nagle's algorithm for immediate sends.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Reduce ACK delay (Linux only; ignored elsewhere).
    ///
    /// **Default**: `true`
    pub tcp_quickack: bool,

    /// Kernel receive buffer size, `None` for the OS default.
    pub recv_buf: Option<usize>,

    /// Kernel send buffer size, `None` for the OS default.
    pub send_buf: Option<usize>,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            recv_buf: None,
            send_buf: None,
        }
    }
}

/// Configuration for one broadcast fan-out service.
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Address downstream peers connect to.
    pub accept_addr: SocketAddr,

    /// Upstream producer address. When set, `connect_producer` dials it
    /// through the reactor; when `None` the producer connection is attached
    /// explicitly.
    pub connect_addr: Option<SocketAddr>,

    /// Force-close every registered downstream session when a new producer
    /// connection establishes itself, before any of its frames dispatch.
    ///
    /// **Default**: `false`
    pub disconnect_clients_on_reconnect: bool,

    /// Advisory backpressure threshold: a downstream session whose
    /// outstanding queued bytes exceed this value is shed during dispatch.
    /// `0` disables shedding.
    ///
    /// **Default**: `0` (unlimited)
    pub maximum_scheduled_write_bytes: usize,

    /// Socket tuning applied to every downstream and producer connection.
    pub socket: SocketTuning,

    /// Reactor tuning for the service's event loop.
    pub reactor: ReactorConfig,
}

impl BroadcastConfig {
    /// Config with the given accept address and defaults everywhere else.
    pub fn with_addr(accept_addr: SocketAddr) -> Self {
        Self {
            accept_addr,
            connect_addr: None,
            disconnect_clients_on_reconnect: false,
            maximum_scheduled_write_bytes: 0,
            socket: SocketTuning::default(),
            reactor: ReactorConfig::default(),
        }
    }

    /// Set the upstream producer address.
    pub fn connect_addr(mut self, addr: SocketAddr) -> Self {
        self.connect_addr = Some(addr);
        self
    }

    /// Set the producer-reconnect eviction policy.
    pub fn disconnect_clients_on_reconnect(mut self, on: bool) -> Self {
        self.disconnect_clients_on_reconnect = on;
        self
    }

    /// Set the advisory scheduled-write-bytes threshold.
    pub fn maximum_scheduled_write_bytes(mut self, bytes: usize) -> Self {
        self.maximum_scheduled_write_bytes = bytes;
        self
    }

    /// Override the socket tuning.
    pub fn socket(mut self, tuning: SocketTuning) -> Self {
        self.socket = tuning;
        self
    }

    /// Override the reactor tuning.
    pub fn reactor(mut self, config: ReactorConfig) -> Self {
        self.reactor = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.poll_timeout, None);
        assert_eq!(config.write_spin_count, 16);
        assert_eq!(config.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn spin_count_clamped_to_one() {
        let config = ReactorConfig::default().write_spin_count(0);
        assert_eq!(config.write_spin_count, 1);
    }

    #[test]
    fn broadcast_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let origin: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let config = BroadcastConfig::with_addr(addr)
            .connect_addr(origin)
            .disconnect_clients_on_reconnect(true)
            .maximum_scheduled_write_bytes(1 << 20);

        assert_eq!(config.accept_addr, addr);
        assert_eq!(config.connect_addr, Some(origin));
        assert!(config.disconnect_clients_on_reconnect);
        assert_eq!(config.maximum_scheduled_write_bytes, 1 << 20);
    }

    #[test]
    fn socket_tuning_defaults() {
        let tuning = SocketTuning::default();
        assert!(tuning.tcp_nodelay);
        assert!(tuning.tcp_quickack);
        assert_eq!(tuning.recv_buf, None);
        assert_eq!(tuning.send_buf, None);
    }
}
