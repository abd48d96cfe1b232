//! Broadcast fan-out service.
//!
//! One upstream producer connection feeds frames to a dynamic set of
//! downstream peer sessions. The service owns a reactor (run on its own
//! thread), a listening socket for the downstream side, and the shared
//! session registry. Each inbound producer frame is dispatched against a
//! point-in-time snapshot of the registry: members joining after the
//! snapshot miss that frame, members leaving mid-dispatch receive it at
//! most once. The `maximum_scheduled_write_bytes` threshold is enforced
//! here, not in the reactor: dispatch sheds a member whose outstanding
//! queued bytes exceed it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::completion::Completion;
use crate::config::{BroadcastConfig, SocketTuning};
use crate::error::WriteError;
use crate::handler::{Acceptor, ChannelHandler};
use crate::reactor::{Handle, Reactor};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::sockopt;

/// A running broadcast fan-out service.
pub struct BroadcastService {
    config: BroadcastConfig,
    handle: Handle,
    registry: SessionRegistry,
    connect_session: Arc<Mutex<Option<Session>>>,
    local_addr: SocketAddr,
    reactor_thread: Option<JoinHandle<()>>,
}

impl BroadcastService {
    /// Binds the accept address, starts the reactor thread and begins
    /// accepting downstream peers.
    pub fn start(config: BroadcastConfig) -> io::Result<BroadcastService> {
        let mut reactor = Reactor::new(config.reactor.clone())?;
        let handle = reactor.handle();

        let listener = std::net::TcpListener::bind(config.accept_addr)?;
        let local_addr = listener.local_addr()?;

        let registry = SessionRegistry::new();
        let connect_session = Arc::new(Mutex::new(None));
        let acceptor = Arc::new(PeerAcceptor {
            handle: handle.clone(),
            registry: registry.clone(),
            tuning: config.socket.clone(),
        });
        let listening = handle.listen(listener, acceptor)?;

        let reactor_thread = std::thread::Builder::new()
            .name("relaycast-reactor".into())
            .spawn(move || {
                if let Err(e) = reactor.run() {
                    warn!("reactor loop exited with error: {}", e);
                }
            })?;

        if let Err(cause) = listening.wait() {
            handle.shutdown();
            let _ = reactor_thread.join();
            return Err(io::Error::new(io::ErrorKind::Other, cause.to_string()));
        }
        info!("broadcast service listening on {}", local_addr);

        Ok(BroadcastService {
            config,
            handle,
            registry,
            connect_session,
            local_addr,
            reactor_thread: Some(reactor_thread),
        })
    }

    /// Address downstream peers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The current upstream producer session, if one is established.
    pub fn connect_session(&self) -> Option<Session> {
        self.connect_session.lock().clone()
    }

    /// Dials the configured producer address through the reactor. The
    /// channel becomes the connect session once the connection establishes.
    pub fn connect_producer(&self) -> io::Result<(Arc<Channel>, Completion)> {
        let addr = self.config.connect_addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no producer address configured")
        })?;
        self.handle.connect(addr, self.producer_handler())
    }

    /// Adopts an already-established connection as the upstream producer.
    pub fn attach_producer(
        &self,
        stream: std::net::TcpStream,
    ) -> io::Result<(Arc<Channel>, Completion)> {
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_std(stream);
        if let Err(e) = sockopt::apply(&stream, &self.config.socket) {
            debug!("producer socket tuning failed: {}", e);
        }
        Ok(self.handle.register(stream, self.producer_handler()))
    }

    fn producer_handler(&self) -> Arc<ProducerHandler> {
        Arc::new(ProducerHandler {
            registry: self.registry.clone(),
            connect_session: self.connect_session.clone(),
            disconnect_clients_on_reconnect: self.config.disconnect_clients_on_reconnect,
            maximum_scheduled_write_bytes: self.config.maximum_scheduled_write_bytes,
            tuning: self.config.socket.clone(),
        })
    }

    /// Stops the reactor, force-closing every session.
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.reactor_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for BroadcastService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastService")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.registry.len())
            .field("producer", &self.connect_session.lock().is_some())
            .finish()
    }
}

/// Accept-side: tunes and registers every downstream connection.
struct PeerAcceptor {
    handle: Handle,
    registry: SessionRegistry,
    tuning: SocketTuning,
}

impl Acceptor for PeerAcceptor {
    fn on_accept(&self, stream: mio::net::TcpStream, addr: SocketAddr) {
        if let Err(e) = sockopt::apply(&stream, &self.tuning) {
            debug!("socket tuning for {} failed: {}", addr, e);
        }
        let handler = Arc::new(PeerHandler {
            registry: self.registry.clone(),
        });
        let (_channel, _registered) = self.handle.register(stream, handler);
        debug!("downstream peer connected from {}", addr);
    }

    fn on_accept_error(&self, err: &io::Error) {
        warn!("downstream accept failed: {}", err);
    }
}

/// Downstream side: registry membership tracking plus the shutdown-time
/// exception policy.
struct PeerHandler {
    registry: SessionRegistry,
}

impl ChannelHandler for PeerHandler {
    fn on_open(&self, channel: &Arc<Channel>) {
        self.registry.insert(Session::new(channel.clone()));
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        self.registry.remove(channel.id());
    }

    fn on_data(&self, channel: &Arc<Channel>, data: &[u8]) {
        // Downstream peers are consumers; anything they send is ignored.
        trace!(
            "ignoring {} inbound bytes from downstream session {}",
            data.len(),
            channel.id()
        );
    }

    fn on_exception(&self, channel: &Arc<Channel>, cause: &WriteError) {
        log_session_failure(channel, cause);
    }
}

/// Upstream side: connect-session tracking, reconnect policy, fan-out.
struct ProducerHandler {
    registry: SessionRegistry,
    connect_session: Arc<Mutex<Option<Session>>>,
    disconnect_clients_on_reconnect: bool,
    maximum_scheduled_write_bytes: usize,
    tuning: SocketTuning,
}

impl ChannelHandler for ProducerHandler {
    fn on_open(&self, channel: &Arc<Channel>) {
        if let Err(e) = channel.apply_tuning(&self.tuning) {
            debug!("producer socket tuning failed: {}", e);
        }
        let session = Session::new(channel.clone());
        let previous = {
            let mut slot = self.connect_session.lock();
            slot.replace(session)
        };
        if let Some(previous) = previous {
            debug!("replacing producer session {}", previous.id());
            previous.close();
        }
        if self.disconnect_clients_on_reconnect && !self.registry.is_empty() {
            info!(
                "producer connected; disconnecting {} downstream sessions",
                self.registry.len()
            );
            self.registry.close_all();
        }
        info!("producer session {} established", channel.id());
    }

    fn on_data(&self, channel: &Arc<Channel>, data: &[u8]) {
        {
            let slot = self.connect_session.lock();
            match slot.as_ref() {
                Some(current) if current.id() == channel.id() => {}
                _ => {
                    // A replaced producer kept talking; its frames no
                    // longer dispatch.
                    debug!(
                        "dropping {} bytes from stale producer session {}",
                        data.len(),
                        channel.id()
                    );
                    return;
                }
            }
        }
        self.dispatch(Bytes::copy_from_slice(data));
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        let mut slot = self.connect_session.lock();
        if slot.as_ref().map(Session::id) == Some(channel.id()) {
            *slot = None;
            info!("producer session {} disconnected", channel.id());
        }
    }

    fn on_exception(&self, channel: &Arc<Channel>, cause: &WriteError) {
        log_session_failure(channel, cause);
    }
}

impl ProducerHandler {
    /// Routes one frame to every member of the registry snapshot, shedding
    /// members over the scheduled-write-bytes threshold.
    fn dispatch(&self, frame: Bytes) {
        for session in self.registry.snapshot() {
            if !session.is_open() {
                continue;
            }
            if self.maximum_scheduled_write_bytes > 0
                && session.scheduled_write_bytes() > self.maximum_scheduled_write_bytes
            {
                warn!(
                    "session {} has {} scheduled write bytes (limit {}); disconnecting slow consumer",
                    session.id(),
                    session.scheduled_write_bytes(),
                    self.maximum_scheduled_write_bytes
                );
                session.close();
                continue;
            }
            session.write(frame.clone());
        }
    }
}

/// A session already tearing down that fails on a closed connection is
/// ordinary shutdown noise; anything else deserves a warning.
fn log_session_failure(channel: &Arc<Channel>, cause: &WriteError) {
    if !channel.is_open() && matches!(cause, WriteError::Closed) {
        debug!(
            "session {} failed while closing, probably pending writes: {}",
            channel.id(),
            cause
        );
    } else {
        warn!("unexpected failure on session {}: {}", channel.id(), cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BroadcastConfig;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn service(config: BroadcastConfig) -> BroadcastService {
        BroadcastService::start(config).unwrap()
    }

    fn default_config() -> BroadcastConfig {
        BroadcastConfig::with_addr("127.0.0.1:0".parse().unwrap())
    }

    /// Produces a connected (producer-peer, service-side) pair and attaches
    /// the service side as the upstream producer.
    fn attach_producer(svc: &BroadcastService) -> TcpStream {
        let rendezvous = TcpListener::bind("127.0.0.1:0").unwrap();
        let producer_peer = TcpStream::connect(rendezvous.local_addr().unwrap()).unwrap();
        let (service_side, _) = rendezvous.accept().unwrap();
        svc.attach_producer(service_side).unwrap();
        assert!(wait_until(
            || svc.connect_session().is_some(),
            Duration::from_secs(5)
        ));
        producer_peer
    }

    #[test]
    fn frame_fans_out_to_every_registered_session() {
        let svc = service(default_config());

        let mut clients: Vec<TcpStream> = (0..3)
            .map(|_| TcpStream::connect(svc.local_addr()).unwrap())
            .collect();
        assert!(wait_until(
            || svc.registry().len() == 3,
            Duration::from_secs(5)
        ));

        let mut producer = attach_producer(&svc);
        producer.write_all(b"frame-1").unwrap();

        for client in &mut clients {
            let mut buf = [0u8; 7];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"frame-1");
        }
    }

    #[test]
    fn late_joiner_misses_earlier_frames() {
        let svc = service(default_config());

        let mut early = TcpStream::connect(svc.local_addr()).unwrap();
        assert!(wait_until(
            || svc.registry().len() == 1,
            Duration::from_secs(5)
        ));

        let mut producer = attach_producer(&svc);
        producer.write_all(b"frame-1").unwrap();
        let mut buf = [0u8; 7];
        early.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame-1");

        // Joins after frame-1 was dispatched: receives frame-2 first.
        let mut late = TcpStream::connect(svc.local_addr()).unwrap();
        assert!(wait_until(
            || svc.registry().len() == 2,
            Duration::from_secs(5)
        ));
        producer.write_all(b"frame-2").unwrap();

        let mut buf = [0u8; 7];
        late.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame-2");
        early.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame-2");
    }

    #[test]
    fn reconnect_policy_evicts_downstream_sessions() {
        let config = default_config().disconnect_clients_on_reconnect(true);
        let svc = service(config);

        let mut clients: Vec<TcpStream> = (0..2)
            .map(|_| TcpStream::connect(svc.local_addr()).unwrap())
            .collect();
        assert!(wait_until(
            || svc.registry().len() == 2,
            Duration::from_secs(5)
        ));

        let first = attach_producer(&svc);
        let first_id = svc.connect_session().map(|s| s.id());

        // A new producer connection replaces the old one and force-closes
        // every downstream session before its frames dispatch.
        let _second = attach_producer(&svc);
        assert!(wait_until(
            || svc.connect_session().map(|s| s.id()) != first_id,
            Duration::from_secs(5)
        ));
        assert!(wait_until(
            || svc.registry().is_empty(),
            Duration::from_secs(5)
        ));

        // Evicted clients observe EOF.
        for client in &mut clients {
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
        drop(first);
    }

    #[test]
    fn without_policy_sessions_survive_producer_reconnect() {
        let svc = service(default_config());

        let _client = TcpStream::connect(svc.local_addr()).unwrap();
        assert!(wait_until(
            || svc.registry().len() == 1,
            Duration::from_secs(5)
        ));

        let _first = attach_producer(&svc);
        let _second = attach_producer(&svc);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(svc.registry().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn slow_consumer_is_shed_past_the_byte_threshold() {
        let tuning = SocketTuning {
            send_buf: Some(16 * 1024),
            ..SocketTuning::default()
        };
        let config = default_config()
            .maximum_scheduled_write_bytes(256 * 1024)
            .socket(tuning);
        let svc = service(config);

        // This client never reads.
        let _slow = TcpStream::connect(svc.local_addr()).unwrap();
        assert!(wait_until(
            || svc.registry().len() == 1,
            Duration::from_secs(5)
        ));

        let mut producer = attach_producer(&svc);
        let frame = vec![0x5Au8; 64 * 1024];
        // Keep feeding until the queued-byte check trips and dispatch
        // disconnects the consumer.
        let shed = (0..256).any(|_| {
            if producer.write_all(&frame).is_err() {
                return svc.registry().is_empty();
            }
            std::thread::sleep(Duration::from_millis(10));
            svc.registry().is_empty()
        });
        assert!(shed, "slow consumer was never disconnected");
    }

    #[test]
    fn shutdown_closes_everything() {
        let mut svc = service(default_config());
        let mut client = TcpStream::connect(svc.local_addr()).unwrap();
        assert!(wait_until(
            || svc.registry().len() == 1,
            Duration::from_secs(5)
        ));

        svc.shutdown();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
