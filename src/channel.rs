//! Channels and the per-channel write pipeline.
//!
//! A [`Channel`] is one non-blocking socket owned by a reactor. Its outbound
//! side is a FIFO queue plus a single in-flight send buffer, both guarded by
//! the channel's pipeline lock. Three admission paths converge on one drain
//! routine: a producer submitting a write (marshaled onto the reactor thread
//! when necessary), a marshaled task resuming a write, and a writability
//! readiness event. The drain arms the writability interest bit when the
//! kernel buffer fills and clears it when the queue empties, which is the
//! crate's backpressure signal.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::buffer_pool::SendBuffer;
use crate::completion::Completion;
use crate::error::WriteError;
use crate::handler::{ChannelHandler, Deferred};
use crate::reactor::{Shared, Task};

pub(crate) const INVALID_TOKEN: usize = usize::MAX;

/// Interest bitmask as applied to the readiness multiplexer.
///
/// The writability bit is owned by the write pipeline; callers requesting it
/// through [`Channel::set_interest`] are overridden by the channel's current
/// state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterestOps(pub(crate) u8);

impl InterestOps {
    pub const NONE: InterestOps = InterestOps(0);
    pub const READ: InterestOps = InterestOps(0b01);
    pub const WRITE: InterestOps = InterestOps(0b10);

    pub fn contains(self, other: InterestOps) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InterestOps {
    type Output = InterestOps;

    fn bitor(self, rhs: InterestOps) -> InterestOps {
        InterestOps(self.0 | rhs.0)
    }
}

/// Masks the writability bit out of a caller-requested interest set and
/// merges it back from the channel's currently-applied raw state.
pub(crate) fn merge_requested(requested: u8, raw: u8) -> u8 {
    (requested & !InterestOps::WRITE.0) | (raw & InterestOps::WRITE.0)
}

/// Translates the raw bitmask into a poll interest. The empty mask is
/// inexpressible to the multiplexer and maps to `None` (detached).
pub(crate) fn to_mio_interest(ops: u8) -> Option<Interest> {
    let read = ops & InterestOps::READ.0 != 0;
    let write = ops & InterestOps::WRITE.0 != 0;
    match (read, write) {
        (false, false) => None,
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
    }
}

struct PendingWrite {
    payload: Bytes,
    completion: Completion,
}

struct InFlight {
    buffer: SendBuffer,
    completion: Completion,
}

/// Queue, in-flight buffer and stream, all mutated only under this lock.
pub(crate) struct Pipeline {
    pub(crate) stream: Option<TcpStream>,
    queue: VecDeque<PendingWrite>,
    in_flight: Option<InFlight>,
    /// Whether the stream is currently attached to the poll.
    pub(crate) polled: bool,
}

/// One reactor-managed non-blocking socket connection.
pub struct Channel {
    id: u64,
    me: Weak<Channel>,
    shared: Arc<Shared>,
    handler: Arc<dyn ChannelHandler>,
    token: AtomicUsize,
    open: AtomicBool,
    connected: AtomicBool,
    connecting: AtomicBool,
    raw_interest: AtomicU8,
    write_suspended: AtomicBool,
    in_write_loop: AtomicBool,
    scheduled_write_bytes: AtomicUsize,
    peer: Mutex<Option<SocketAddr>>,
    pub(crate) pipeline: Mutex<Pipeline>,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        stream: TcpStream,
        handler: Arc<dyn ChannelHandler>,
        connected: bool,
    ) -> Arc<Channel> {
        let peer = stream.peer_addr().ok();
        let id = shared.next_channel_id();
        Arc::new_cyclic(|me| Channel {
            id,
            me: me.clone(),
            shared,
            handler,
            token: AtomicUsize::new(INVALID_TOKEN),
            open: AtomicBool::new(true),
            connected: AtomicBool::new(connected),
            connecting: AtomicBool::new(!connected),
            raw_interest: AtomicU8::new(InterestOps::READ.0),
            write_suspended: AtomicBool::new(false),
            in_write_loop: AtomicBool::new(false),
            scheduled_write_bytes: AtomicUsize::new(0),
            peer: Mutex::new(peer),
            pipeline: Mutex::new(Pipeline {
                stream: Some(stream),
                queue: VecDeque::new(),
                in_flight: None,
                polled: false,
            }),
        })
    }

    fn arc(&self) -> Option<Arc<Channel>> {
        self.me.upgrade()
    }

    /// Process-wide unique channel id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Bytes accepted by [`Channel::write`] but not yet handed to the
    /// kernel. Callers enforcing a backpressure threshold read this.
    pub fn scheduled_write_bytes(&self) -> usize {
        self.scheduled_write_bytes.load(Ordering::Relaxed)
    }

    /// The raw interest set last applied to the multiplexer.
    pub fn interest_ops(&self) -> InterestOps {
        InterestOps(self.raw_interest.load(Ordering::Acquire))
    }

    pub fn is_write_suspended(&self) -> bool {
        self.write_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn clear_token(&self) {
        self.token.store(INVALID_TOKEN, Ordering::Release);
    }

    // ---- producer path -------------------------------------------------

    /// Submits an outbound message.
    ///
    /// Writes on one channel are delivered and resolved in submission order
    /// regardless of the submitting thread. The returned handle resolves
    /// once: success after the full payload reaches the kernel, or failure
    /// with the cause (including a purge on close).
    pub fn write(&self, payload: Bytes) -> Completion {
        let completion = Completion::new();
        completion.set_total(payload.len() as u64);
        let len = payload.len();
        {
            let mut p = self.pipeline.lock();
            p.queue.push_back(PendingWrite {
                payload,
                completion: completion.clone(),
            });
        }
        self.scheduled_write_bytes.fetch_add(len, Ordering::Relaxed);

        if !self.is_connected() {
            self.purge_pending();
            return completion;
        }
        let Some(ch) = self.arc() else {
            completion.fail(WriteError::Closed);
            return completion;
        };
        if !self.shared.is_reactor_thread() {
            if self.shared.submit(Task::Write(ch)).is_err() {
                self.purge_with(Some(WriteError::Closed));
            }
            return completion;
        }
        if self.write_suspended.load(Ordering::Acquire) {
            return completion;
        }
        if self.in_write_loop.load(Ordering::Acquire) {
            return completion;
        }
        self.drain();
        completion
    }

    // ---- task-loop path ------------------------------------------------

    pub(crate) fn resume_write(&self) {
        if !self.write_suspended.load(Ordering::Acquire) {
            self.drain();
        }
    }

    // ---- selector-loop path --------------------------------------------

    pub(crate) fn handle_writable(&self) {
        self.write_suspended.store(false, Ordering::Release);
        self.drain();
    }

    // ---- drain ---------------------------------------------------------

    /// Moves queued messages into the kernel until the queue empties, the
    /// kernel buffer fills, or a transfer fails.
    fn drain(&self) {
        let mut open = true;
        let mut add_op_write = false;
        let mut remove_op_write = false;
        let mut needs_close = false;
        let mut written_total: u64 = 0;
        let mut failure: Option<WriteError> = None;
        let spin = self.shared.write_spin_count.max(1);

        {
            let mut p = self.pipeline.lock();
            self.in_write_loop.store(true, Ordering::Release);
            loop {
                if p.in_flight.is_none() {
                    match p.queue.pop_front() {
                        None => {
                            remove_op_write = true;
                            self.write_suspended.store(false, Ordering::Release);
                            break;
                        }
                        Some(pw) => {
                            let buffer = self.shared.pool.acquire(&pw.payload);
                            pw.completion.set_total(buffer.total_bytes());
                            p.in_flight = Some(InFlight {
                                buffer,
                                completion: pw.completion,
                            });
                        }
                    }
                }
                if p.stream.is_none() {
                    // Closed by another path mid-drain; the close's purge
                    // resolves whatever is left.
                    break;
                }

                let mut local_written = 0usize;
                let mut io_failure: Option<io::Error> = None;
                let mut finished = false;
                {
                    let Pipeline {
                        stream, in_flight, ..
                    } = &mut *p;
                    if let (Some(stream), Some(fl)) = (stream.as_mut(), in_flight.as_mut()) {
                        for _ in 0..spin {
                            match fl.buffer.transfer_to(stream) {
                                Ok(0) => {
                                    if fl.buffer.is_finished() {
                                        break;
                                    }
                                }
                                Ok(n) => {
                                    local_written = n;
                                    break;
                                }
                                Err(e) => {
                                    io_failure = Some(e);
                                    break;
                                }
                            }
                        }
                        finished = fl.buffer.is_finished();
                    }
                }
                if local_written > 0 {
                    written_total += local_written as u64;
                    self.scheduled_write_bytes
                        .fetch_sub(local_written, Ordering::Relaxed);
                }

                if let Some(e) = io_failure {
                    if !self.is_open() {
                        // The stream was closed asynchronously by another
                        // path; nothing the producer needs to hear about.
                        trace!("benign transfer failure on closing channel {}: {}", self.id, e);
                        break;
                    }
                    if let Some(fl) = p.in_flight.take() {
                        self.scheduled_write_bytes
                            .fetch_sub(fl.buffer.pending_bytes(), Ordering::Relaxed);
                        let cause = WriteError::from_io(e);
                        fl.completion.fail(cause.clone());
                        failure = Some(cause);
                    }
                    open = false;
                    needs_close = true;
                    break;
                }

                if finished {
                    if let Some(fl) = p.in_flight.take() {
                        fl.completion.succeed();
                    }
                } else {
                    // Kernel buffer full: park the remainder until the next
                    // writability event.
                    add_op_write = true;
                    self.write_suspended.store(true, Ordering::Release);
                    if local_written > 0 {
                        if let Some(fl) = p.in_flight.as_ref() {
                            fl.completion
                                .set_progress(fl.buffer.written_bytes(), fl.buffer.total_bytes());
                        }
                    }
                    break;
                }
            }
            self.in_write_loop.store(false, Ordering::Release);

            // Interest updates must happen before the pipeline lock is
            // released, or a concurrent submission races the armed state.
            if open {
                if add_op_write {
                    needs_close |= self.arm_write_interest(&mut p);
                } else if remove_op_write {
                    needs_close |= self.clear_write_interest(&mut p);
                }
            }
        }

        if needs_close {
            self.close();
        }
        if let Some(cause) = failure {
            self.notify(Deferred::Exception(cause));
        }
        if written_total > 0 {
            self.notify(Deferred::WriteComplete(written_total));
        }
    }

    // ---- interest-op control -------------------------------------------

    /// Arms the writability bit unless already armed. Returns true when the
    /// registration proved invalid and the channel must close.
    fn arm_write_interest(&self, p: &mut Pipeline) -> bool {
        let raw = self.raw_interest.load(Ordering::Acquire);
        if raw & InterestOps::WRITE.0 != 0 {
            return false;
        }
        self.update_interest(p, raw | InterestOps::WRITE.0)
    }

    /// Clears the writability bit unless already clear. Returns true when
    /// the registration proved invalid and the channel must close.
    fn clear_write_interest(&self, p: &mut Pipeline) -> bool {
        let raw = self.raw_interest.load(Ordering::Acquire);
        if raw & InterestOps::WRITE.0 == 0 {
            return false;
        }
        self.update_interest(p, raw & !InterestOps::WRITE.0)
    }

    /// Applies `ops` to the poll registration and records it as the raw
    /// interest. Before registration (or once closing) it only records; the
    /// register task applies the combined mask. Returns true when the
    /// registration is invalid.
    fn update_interest(&self, p: &mut Pipeline, ops: u8) -> bool {
        let token = self.token.load(Ordering::Acquire);
        let stream = match p.stream.as_mut() {
            Some(s) => s,
            None => {
                self.raw_interest.store(ops, Ordering::Release);
                return false;
            }
        };
        if token == INVALID_TOKEN {
            self.raw_interest.store(ops, Ordering::Release);
            return false;
        }

        let result = match to_mio_interest(ops) {
            Some(interest) => {
                if p.polled {
                    self.shared.registry.reregister(stream, Token(token), interest)
                } else {
                    let r = self.shared.registry.register(stream, Token(token), interest);
                    if r.is_ok() {
                        p.polled = true;
                    }
                    r
                }
            }
            None => {
                let r = if p.polled {
                    self.shared.registry.deregister(stream)
                } else {
                    Ok(())
                };
                if r.is_ok() {
                    p.polled = false;
                }
                r
            }
        };
        match result {
            Ok(()) => {
                self.raw_interest.store(ops, Ordering::Release);
                false
            }
            Err(e) => {
                debug!("invalid registration on channel {}: {}", self.id, e);
                true
            }
        }
    }

    /// Requests a change of this channel's interest set. The writability
    /// bit is owned by the write pipeline; whatever the caller passes for
    /// it is replaced with the channel's current state. The handle resolves
    /// once the change is applied on the reactor thread; the
    /// interest-changed notification fires only if the effective mask
    /// actually changed.
    pub fn set_interest(&self, ops: InterestOps) -> Completion {
        let completion = Completion::new();
        let Some(ch) = self.arc() else {
            completion.fail(WriteError::Closed);
            return completion;
        };
        if !self.shared.is_reactor_thread() {
            if self
                .shared
                .submit(Task::SetInterest(ch, ops, completion.clone()))
                .is_err()
            {
                completion.fail(WriteError::Closed);
            }
            return completion;
        }
        self.set_interest_on_loop(ops, &completion);
        completion
    }

    pub(crate) fn set_interest_on_loop(&self, ops: InterestOps, completion: &Completion) {
        let raw = self.raw_interest.load(Ordering::Acquire);
        let merged = merge_requested(ops.0, raw);
        let changed = merged != raw;
        let invalid = if changed {
            let mut p = self.pipeline.lock();
            self.update_interest(&mut p, merged)
        } else {
            false
        };

        if invalid {
            completion.fail(WriteError::Closed);
            self.notify(Deferred::Exception(WriteError::Closed));
            self.close();
            return;
        }
        completion.succeed();
        if changed {
            self.notify(Deferred::InterestChanged);
        }
    }

    // ---- registration --------------------------------------------------

    /// Registers the stream with the poll under the combined interest mask.
    /// The writability bit starts armed so a write submitted before
    /// registration cannot be silently dropped; the first writability event
    /// drains or clears it.
    pub(crate) fn register_with_poll(&self, token: usize) -> io::Result<()> {
        self.token.store(token, Ordering::Release);
        let ops = self.raw_interest.load(Ordering::Acquire) | InterestOps::WRITE.0;
        let mut p = self.pipeline.lock();
        let stream = p.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "channel closed before registration")
        })?;
        if let Some(interest) = to_mio_interest(ops) {
            self.shared.registry.register(stream, Token(token), interest)?;
            p.polled = true;
            self.raw_interest.store(ops, Ordering::Release);
        }
        Ok(())
    }

    // ---- connect -------------------------------------------------------

    /// Completes a non-blocking connect on the first writability event.
    /// Returns true once the channel is connected.
    pub(crate) fn finish_connect(&self) -> bool {
        let result = {
            let mut p = self.pipeline.lock();
            match p.stream.as_mut() {
                None => return false,
                Some(s) => match s.take_error() {
                    Ok(Some(e)) | Err(e) => Err(e),
                    Ok(None) => match s.peer_addr() {
                        Ok(addr) => Ok(Some(addr)),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
                        Err(e) => Err(e),
                    },
                },
            }
        };
        match result {
            Ok(Some(addr)) => {
                self.connecting.store(false, Ordering::Release);
                self.connected.store(true, Ordering::Release);
                *self.peer.lock() = Some(addr);
                debug!("channel {} connected to {}", self.id, addr);
                self.notify(Deferred::Open);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("connect failed on channel {}: {}", self.id, e);
                self.notify(Deferred::Exception(WriteError::from_io(e)));
                self.close();
                false
            }
        }
    }

    // ---- close & cleanup -----------------------------------------------

    /// Requests closing this channel. Idempotent and safe from any thread;
    /// side effects run on the reactor thread. The handle resolves success
    /// even when the channel is already closed.
    pub fn close(&self) -> Completion {
        let completion = Completion::new();
        let Some(ch) = self.arc() else {
            completion.succeed();
            return completion;
        };
        if self.shared.is_reactor_thread() {
            self.close_on_loop(&completion);
        } else if let Err(Task::Close(_, completion)) =
            self.shared.submit(Task::Close(ch, completion.clone()))
        {
            // Reactor already stopped; finish the teardown inline.
            self.close_on_loop(&completion);
        }
        completion
    }

    pub(crate) fn close_on_loop(&self, completion: &Completion) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.connecting.store(false, Ordering::Release);
        let first = self.open.swap(false, Ordering::AcqRel);

        // Detach from the poll and release the OS resource.
        {
            let mut p = self.pipeline.lock();
            if let Some(mut stream) = p.stream.take() {
                if p.polled {
                    if let Err(e) = self.shared.registry.deregister(&mut stream) {
                        trace!("deregister during close of channel {}: {}", self.id, e);
                    }
                    p.polled = false;
                }
            }
        }
        let token = self.token.swap(INVALID_TOKEN, Ordering::AcqRel);
        if token != INVALID_TOKEN {
            let mut entries = self.shared.entries.lock();
            if entries.contains(token) {
                entries.remove(token);
            }
        }

        if first {
            debug!(
                "channel {} closed (was_connected={})",
                self.id, was_connected
            );
            self.purge_pending();
            self.notify(Deferred::Closed);
        }
        completion.succeed();
    }

    /// Fails the in-flight buffer and every queued event. The cause is
    /// computed once per purge and reused for all purged events; one
    /// exception notification fires if anything was purged.
    pub(crate) fn purge_pending(&self) {
        self.purge_with(None);
    }

    fn purge_with(&self, fixed: Option<WriteError>) {
        let mut cause = fixed;
        let mut purged = false;
        {
            let mut p = self.pipeline.lock();
            if let Some(fl) = p.in_flight.take() {
                let c = cause
                    .get_or_insert_with(|| WriteError::purge_cause(self.is_open()))
                    .clone();
                fl.completion.fail(c);
                purged = true;
            }
            while let Some(pw) = p.queue.pop_front() {
                let c = cause
                    .get_or_insert_with(|| WriteError::purge_cause(self.is_open()))
                    .clone();
                pw.completion.fail(c);
                purged = true;
            }
        }
        self.scheduled_write_bytes.store(0, Ordering::Relaxed);
        if purged {
            if let Some(cause) = cause {
                self.notify(Deferred::Exception(cause));
            }
        }
    }

    // ---- notification dispatch -----------------------------------------

    /// Synchronous on the reactor thread, deferred through the task queue
    /// from anywhere else.
    pub(crate) fn notify(&self, event: Deferred) {
        if self.shared.is_reactor_thread() {
            self.deliver(event);
            return;
        }
        let Some(ch) = self.arc() else { return };
        if let Err(Task::Notify(_, event)) = self.shared.submit(Task::Notify(ch, event)) {
            // Reactor stopped; deliver inline rather than dropping it.
            self.deliver(event);
        }
    }

    pub(crate) fn deliver(&self, event: Deferred) {
        let Some(ch) = self.arc() else { return };
        match event {
            Deferred::Open => self.handler.on_open(&ch),
            Deferred::WriteComplete(n) => self.handler.on_write_complete(&ch, n),
            Deferred::InterestChanged => self.handler.on_interest_changed(&ch),
            Deferred::Exception(cause) => self.handler.on_exception(&ch, &cause),
            Deferred::Closed => self.handler.on_close(&ch),
        }
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    /// Applies socket tuning to the underlying stream.
    pub fn apply_tuning(&self, tuning: &crate::config::SocketTuning) -> io::Result<()> {
        let p = self.pipeline.lock();
        match p.stream.as_ref() {
            Some(s) => crate::sockopt::apply(s, tuning),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel closed",
            )),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("connected", &self.is_connected())
            .field("interest", &self.interest_ops())
            .field("scheduled_write_bytes", &self.scheduled_write_bytes())
            .finish()
    }
}
