//! Send-buffer pool for outbound transfers.
//!
//! The pool keeps a bounded free list of pre-allocated byte vectors that are
//! reused across outbound messages, so draining a write pipeline does not
//! allocate per message. [`SendBufferPool::acquire`] stages an outbound
//! payload into a pooled vector and returns a [`SendBuffer`] that tracks
//! transfer position; the storage returns to the pool when the buffer drops,
//! on every exit path including purge and failure.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Thread-safe pool of staging buffers for socket writes.
///
/// Cloning the pool is cheap; clones share the same free list.
#[derive(Clone)]
pub struct SendBufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<VecDeque<Vec<u8>>>,
    buffer_capacity: usize,
    max_buffers: usize,
}

impl SendBufferPool {
    /// Creates a pool with `initial_count` pre-allocated buffers of
    /// `buffer_capacity` bytes each. The free list may grow to twice the
    /// initial count before released buffers are dropped instead of kept.
    pub fn new(initial_count: usize, buffer_capacity: usize) -> Self {
        let mut free = VecDeque::with_capacity(initial_count * 2);
        for _ in 0..initial_count {
            free.push_back(Vec::with_capacity(buffer_capacity));
        }
        SendBufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_capacity,
                max_buffers: initial_count * 2,
            }),
        }
    }

    /// Stages `payload` into a pooled buffer and returns the transfer
    /// wrapper. Falls back to a fresh allocation when the pool is empty, so
    /// acquisition never blocks on pool pressure.
    pub fn acquire(&self, payload: &Bytes) -> SendBuffer {
        let mut data = {
            let mut free = self.inner.free.lock();
            free.pop_front()
                .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_capacity))
        };
        data.clear();
        data.extend_from_slice(payload);
        SendBuffer {
            data,
            pos: 0,
            pool: self.clone(),
        }
    }

    fn release(&self, mut data: Vec<u8>) {
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.max_buffers {
            data.clear();
            free.push_back(data);
        }
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Default capacity of buffers created by this pool.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }
}

impl Default for SendBufferPool {
    /// 64 buffers of 8 KiB, sized for typical frame fan-out workloads.
    fn default() -> Self {
        SendBufferPool::new(64, 8 * 1024)
    }
}

impl std::fmt::Debug for SendBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBufferPool")
            .field("available", &self.available())
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .finish()
    }
}

/// One staged outbound message with a transfer position.
///
/// At most one `SendBuffer` is in flight per channel at any instant; the
/// write pipeline holds it across partial transfers until the kernel accepts
/// the remainder.
pub struct SendBuffer {
    data: Vec<u8>,
    pos: usize,
    pool: SendBufferPool,
}

impl SendBuffer {
    /// Attempts to move pending bytes into `w`.
    ///
    /// Returns the number of bytes accepted. A full kernel buffer
    /// (`WouldBlock`) reports as zero bytes moved rather than an error, so
    /// the caller's spin loop can decide when to suspend.
    pub fn transfer_to<W: io::Write>(&mut self, w: &mut W) -> io::Result<usize> {
        if self.is_finished() {
            return Ok(0);
        }
        match w.write(&self.data[self.pos..]) {
            Ok(n) => {
                self.pos += n;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn written_bytes(&self) -> u64 {
        self.pos as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Bytes still waiting for the kernel.
    pub fn pending_bytes(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

impl std::fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBuffer")
            .field("written", &self.pos)
            .field("total", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Accepts at most `limit` bytes per write, then reports WouldBlock.
    struct Throttled {
        sink: Vec<u8>,
        limit: usize,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(self.limit).min(self.budget);
            self.sink.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pool_reuses_released_buffers() {
        let pool = SendBufferPool::new(2, 64);
        assert_eq!(pool.available(), 2);

        let buf = pool.acquire(&Bytes::from_static(b"hello"));
        assert_eq!(pool.available(), 1);
        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_caps_growth_at_twice_initial() {
        let pool = SendBufferPool::new(1, 16);
        let a = pool.acquire(&Bytes::from_static(b"a"));
        let b = pool.acquire(&Bytes::from_static(b"b"));
        let c = pool.acquire(&Bytes::from_static(b"c"));
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn transfer_tracks_position_across_partial_writes() {
        let pool = SendBufferPool::new(1, 64);
        let mut buf = pool.acquire(&Bytes::from_static(b"abcdefgh"));
        let mut w = Throttled {
            sink: Vec::new(),
            limit: 3,
            budget: usize::MAX,
        };

        assert_eq!(buf.transfer_to(&mut w).unwrap(), 3);
        assert!(!buf.is_finished());
        assert_eq!(buf.written_bytes(), 3);
        assert_eq!(buf.pending_bytes(), 5);

        assert_eq!(buf.transfer_to(&mut w).unwrap(), 3);
        assert_eq!(buf.transfer_to(&mut w).unwrap(), 2);
        assert!(buf.is_finished());
        assert_eq!(w.sink, b"abcdefgh");
    }

    #[test]
    fn would_block_reports_zero_bytes() {
        let pool = SendBufferPool::new(1, 64);
        let mut buf = pool.acquire(&Bytes::from_static(b"data"));
        let mut w = Throttled {
            sink: Vec::new(),
            limit: 4,
            budget: 0,
        };
        assert_eq!(buf.transfer_to(&mut w).unwrap(), 0);
        assert!(!buf.is_finished());
    }

    #[test]
    fn empty_payload_is_finished_immediately() {
        let pool = SendBufferPool::new(1, 64);
        let buf = pool.acquire(&Bytes::new());
        assert!(buf.is_finished());
        assert_eq!(buf.total_bytes(), 0);
    }
}
