//! Completion handles for writes, interest changes and closes.
//!
//! Every operation submitted to the reactor yields a [`Completion`]: a
//! cloneable handle that any collaborator can observe. A handle transitions
//! to exactly one terminal state — success or failure with a cause — and for
//! writes it additionally reports intermediate progress while a partial
//! transfer is parked on the kernel buffer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::WriteError;

/// Cloneable handle to the outcome of a submitted operation.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    outcome: Option<Result<(), WriteError>>,
    written: u64,
    total: u64,
}

impl Completion {
    pub fn new() -> Self {
        Completion {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    written: 0,
                    total: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Whether a terminal state has been reached.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Ok(())))
    }

    /// Terminal outcome, if one has been set.
    pub fn result(&self) -> Option<Result<(), WriteError>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Bytes moved so far and the total size of the message, for writes.
    pub fn progress(&self) -> (u64, u64) {
        let s = self.inner.state.lock();
        (s.written, s.total)
    }

    /// Blocks until the operation resolves.
    pub fn wait(&self) -> Result<(), WriteError> {
        let mut s = self.inner.state.lock();
        while s.outcome.is_none() {
            self.inner.cond.wait(&mut s);
        }
        s.outcome.clone().unwrap_or(Err(WriteError::Closed))
    }

    /// Blocks until the operation resolves or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), WriteError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut s = self.inner.state.lock();
        while s.outcome.is_none() {
            if self.inner.cond.wait_until(&mut s, deadline).timed_out() {
                return s.outcome.clone();
            }
        }
        s.outcome.clone()
    }

    /// First resolution wins; later calls are no-ops.
    pub(crate) fn succeed(&self) {
        let mut s = self.inner.state.lock();
        if s.outcome.is_none() {
            s.written = s.total.max(s.written);
            s.outcome = Some(Ok(()));
            self.inner.cond.notify_all();
        }
    }

    /// First resolution wins; later calls are no-ops.
    pub(crate) fn fail(&self, cause: WriteError) {
        let mut s = self.inner.state.lock();
        if s.outcome.is_none() {
            s.outcome = Some(Err(cause));
            self.inner.cond.notify_all();
        }
    }

    /// Records partial progress. Ignored once a terminal state is set.
    pub(crate) fn set_progress(&self, written: u64, total: u64) {
        let mut s = self.inner.state.lock();
        if s.outcome.is_none() {
            s.written = written;
            s.total = total;
        }
    }

    /// Marks the message size before the first transfer attempt.
    pub(crate) fn set_total(&self, total: u64) {
        let mut s = self.inner.state.lock();
        if s.outcome.is_none() {
            s.total = total;
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.state.lock();
        f.debug_struct("Completion")
            .field("outcome", &s.outcome)
            .field("written", &s.written)
            .field("total", &s.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exactly_once() {
        let c = Completion::new();
        assert!(!c.is_done());

        c.succeed();
        assert!(c.is_success());

        // A later failure must not overwrite the terminal state.
        c.fail(WriteError::Closed);
        assert!(c.is_success());
    }

    #[test]
    fn failure_keeps_its_cause() {
        let c = Completion::new();
        c.fail(WriteError::NotYetConnected);
        c.succeed();
        assert!(matches!(
            c.result(),
            Some(Err(WriteError::NotYetConnected))
        ));
    }

    #[test]
    fn progress_is_visible_before_resolution() {
        let c = Completion::new();
        c.set_total(100);
        c.set_progress(40, 100);
        assert_eq!(c.progress(), (40, 100));

        c.succeed();
        assert_eq!(c.progress(), (100, 100));
    }

    #[test]
    fn progress_frozen_after_resolution() {
        let c = Completion::new();
        c.fail(WriteError::Closed);
        c.set_progress(10, 20);
        assert_eq!(c.progress(), (0, 0));
    }

    #[test]
    fn wait_unblocks_on_resolution_from_another_thread() {
        let c = Completion::new();
        let waiter = c.clone();
        let t = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        c.succeed();
        assert!(t.join().unwrap().is_ok());
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let c = Completion::new();
        assert!(c.wait_timeout(Duration::from_millis(10)).is_none());
    }
}
