//! The live set of downstream broadcast sessions.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::session::Session;

/// Concurrent registry of open downstream sessions.
///
/// The registry is an explicitly shared handle: cloning it shares the same
/// underlying set, and both the session bookkeeping (insert on open, remove
/// on close) and broadcast dispatch hold one. Insert and remove are
/// idempotent; [`SessionRegistry::snapshot`] hands dispatch a read-only view
/// that is unaffected by concurrent membership changes.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<u64, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session on its open notification. Returns false when the
    /// session is already present.
    pub fn insert(&self, session: Session) -> bool {
        let mut sessions = self.inner.write();
        let added = !sessions.contains_key(&session.id());
        if added {
            debug!("session {} joined the broadcast set", session.id());
            sessions.insert(session.id(), session);
        }
        added
    }

    /// Removes a session on its close notification. Removing an absent
    /// session is a no-op.
    pub fn remove(&self, id: u64) -> bool {
        let removed = self.inner.write().remove(&id).is_some();
        if removed {
            debug!("session {} left the broadcast set", id);
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Point-in-time membership view for one dispatch pass. Members that
    /// join afterwards are not in it; members that leave keep resolving
    /// their own teardown independently.
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.read().values().cloned().collect()
    }

    /// Force-closes every registered session. Close notifications remove
    /// each from the set as they land.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.close();
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use crate::handler::ChannelHandler;
    use crate::reactor::Reactor;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    struct Quiet;
    impl ChannelHandler for Quiet {}

    fn live_session(handle: &crate::reactor::Handle) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let (ch, reg) = handle.register_std(stream, Arc::new(Quiet)).unwrap();
        assert!(reg.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
        (Session::new(ch), server)
    }

    #[test]
    fn insert_and_remove_are_idempotent() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let handle = reactor.handle();
        let t = std::thread::spawn(move || {
            let _ = reactor.run();
        });

        let registry = SessionRegistry::new();
        let (session, _peer) = live_session(&handle);
        let id = session.id();

        assert!(registry.insert(session.clone()));
        assert!(!registry.insert(session));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(id));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());

        handle.shutdown();
        t.join().unwrap();
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let handle = reactor.handle();
        let t = std::thread::spawn(move || {
            let _ = reactor.run();
        });

        let registry = SessionRegistry::new();
        let (a, _peer_a) = live_session(&handle);
        let (b, _peer_b) = live_session(&handle);
        registry.insert(a);
        let snap = registry.snapshot();
        registry.insert(b);

        assert_eq!(snap.len(), 1);
        assert_eq!(registry.len(), 2);

        handle.shutdown();
        t.join().unwrap();
    }
}
