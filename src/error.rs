//! Failure causes surfaced through completion handles.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Cause attached to a failed write, interest change or close.
///
/// `Io` wraps the underlying error in an `Arc` so the same cause can be
/// observed through every clone of a completion handle.
#[derive(Debug, Clone)]
pub enum WriteError {
    /// The channel never reached the connected state; queued writes were
    /// purged before a single byte could move.
    NotYetConnected,
    /// The channel was open and has been closed; queued writes were purged.
    Closed,
    /// A transfer failed with an I/O error. The channel is force-closed.
    Io(Arc<io::Error>),
}

impl WriteError {
    /// Purge cause for a channel teardown, computed once per close and
    /// reused for every purged event.
    pub(crate) fn purge_cause(open: bool) -> Self {
        if open {
            WriteError::NotYetConnected
        } else {
            WriteError::Closed
        }
    }

    pub(crate) fn from_io(err: io::Error) -> Self {
        WriteError::Io(Arc::new(err))
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::NotYetConnected => write!(f, "channel not yet connected"),
            WriteError::Closed => write!(f, "channel closed"),
            WriteError::Io(e) => write!(f, "transfer failed: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_cause_depends_on_open_state() {
        assert!(matches!(
            WriteError::purge_cause(true),
            WriteError::NotYetConnected
        ));
        assert!(matches!(WriteError::purge_cause(false), WriteError::Closed));
    }

    #[test]
    fn io_cause_clones_share_the_error() {
        let cause = WriteError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = cause.clone();
        assert_eq!(cause.to_string(), copy.to_string());
    }
}
