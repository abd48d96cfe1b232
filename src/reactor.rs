//! The reactor event loop.
//!
//! One dedicated thread per [`Reactor`] runs the loop: block on the
//! readiness poll, dispatch read and write availability to the owning
//! channels, then execute tasks marshaled in from other threads (register,
//! deregister, resumed writes, interest changes, closes, deferred
//! notifications). Submitting a task wakes a blocked poll, so cross-thread
//! operations are never delayed indefinitely. Any number of reactor
//! instances may run concurrently; each is fully independent.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, RwLock};
use slab::Slab;

use crate::buffer_pool::SendBufferPool;
use crate::channel::{Channel, InterestOps, INVALID_TOKEN};
use crate::completion::Completion;
use crate::config::ReactorConfig;
use crate::error::WriteError;
use crate::handler::{Acceptor, ChannelHandler, Deferred};

const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Operation marshaled onto the reactor thread.
pub(crate) enum Task {
    Register(Arc<Channel>, Completion),
    Deregister(Arc<Channel>, Completion),
    Write(Arc<Channel>),
    SetInterest(Arc<Channel>, InterestOps, Completion),
    Close(Arc<Channel>, Completion),
    Notify(Arc<Channel>, Deferred),
    Listen(std::net::TcpListener, Arc<dyn Acceptor>, Completion),
}

/// Slab slot: a stream channel or a listening socket.
#[derive(Clone)]
pub(crate) enum Entry {
    Channel(Arc<Channel>),
    Listener(Arc<ListenerEntry>),
}

pub(crate) struct ListenerEntry {
    listener: Mutex<mio::net::TcpListener>,
    acceptor: Arc<dyn Acceptor>,
}

/// State shared between the reactor thread and every handle and channel.
///
/// Channels hold this as a non-owning back-reference: lookup and task
/// submission only, never ownership of a channel's lifetime.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    waker: Waker,
    tasks: Sender<Task>,
    wakened: AtomicBool,
    owner: RwLock<Option<ThreadId>>,
    shutdown: AtomicBool,
    pub(crate) entries: Mutex<Slab<Entry>>,
    pub(crate) pool: SendBufferPool,
    pub(crate) write_spin_count: u32,
    next_id: AtomicU64,
}

impl Shared {
    /// Whether the calling thread is the thread running this reactor's
    /// loop. Decides synchronous versus deferred notification delivery.
    pub(crate) fn is_reactor_thread(&self) -> bool {
        *self.owner.read() == Some(std::thread::current().id())
    }

    /// Enqueues a task for the reactor thread, waking a blocked poll.
    /// Returns the task back when the reactor is shut down or gone.
    pub(crate) fn submit(&self, task: Task) -> Result<(), Task> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        match self.tasks.send(task) {
            Ok(()) => {
                self.wake();
                Ok(())
            }
            Err(e) => Err(e.0),
        }
    }

    fn wake(&self) {
        if !self.is_reactor_thread()
            && self
                .wakened
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if let Err(e) = self.waker.wake() {
                warn!("failed to wake reactor poll: {}", e);
            }
        }
    }

    pub(crate) fn next_channel_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Cloneable submitter for a reactor: registration, connecting, listening,
/// deregistration and shutdown, all usable from any thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Registers an established non-blocking stream with the reactor and
    /// attaches `handler`. The returned completion resolves once the
    /// registration is applied on the reactor thread.
    pub fn register(
        &self,
        stream: mio::net::TcpStream,
        handler: Arc<dyn ChannelHandler>,
    ) -> (Arc<Channel>, Completion) {
        self.register_inner(stream, handler, true)
    }

    /// Convenience wrapper over [`Handle::register`] for a blocking
    /// standard-library stream.
    pub fn register_std(
        &self,
        stream: std::net::TcpStream,
        handler: Arc<dyn ChannelHandler>,
    ) -> io::Result<(Arc<Channel>, Completion)> {
        stream.set_nonblocking(true)?;
        Ok(self.register_inner(mio::net::TcpStream::from_std(stream), handler, true))
    }

    /// Starts a non-blocking connect. The channel reports `on_open` once
    /// the connection establishes; writes submitted before that fail with
    /// `NotYetConnected`.
    pub fn connect(
        &self,
        addr: std::net::SocketAddr,
        handler: Arc<dyn ChannelHandler>,
    ) -> io::Result<(Arc<Channel>, Completion)> {
        let stream = mio::net::TcpStream::connect(addr)?;
        Ok(self.register_inner(stream, handler, false))
    }

    fn register_inner(
        &self,
        stream: mio::net::TcpStream,
        handler: Arc<dyn ChannelHandler>,
        connected: bool,
    ) -> (Arc<Channel>, Completion) {
        let channel = Channel::new(self.shared.clone(), stream, handler, connected);
        let completion = Completion::new();
        if self
            .shared
            .submit(Task::Register(channel.clone(), completion.clone()))
            .is_err()
        {
            completion.fail(WriteError::Closed);
            channel.close();
        }
        (channel, completion)
    }

    /// Registers a listening socket; accepted connections are handed to
    /// `acceptor` on the reactor thread.
    pub fn listen(
        &self,
        listener: std::net::TcpListener,
        acceptor: Arc<dyn Acceptor>,
    ) -> io::Result<Completion> {
        listener.set_nonblocking(true)?;
        let completion = Completion::new();
        if self
            .shared
            .submit(Task::Listen(listener, acceptor, completion.clone()))
            .is_err()
        {
            completion.fail(WriteError::Closed);
        }
        Ok(completion)
    }

    /// Detaches a channel from the poll without closing it.
    pub fn deregister(&self, channel: &Arc<Channel>) -> Completion {
        let completion = Completion::new();
        if self
            .shared
            .submit(Task::Deregister(channel.clone(), completion.clone()))
            .is_err()
        {
            completion.fail(WriteError::Closed);
        }
        completion
    }

    /// Stops the loop. Remaining channels are force-closed with their
    /// pipelines purged, so every pending completion resolves.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            trace!("wake during shutdown: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// A single-threaded readiness event loop multiplexing many channels.
pub struct Reactor {
    poll: Poll,
    shared: Arc<Shared>,
    tasks: Receiver<Task>,
    config: ReactorConfig,
    read_buf: Vec<u8>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            registry,
            waker,
            tasks: tx,
            wakened: AtomicBool::new(false),
            owner: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            entries: Mutex::new(Slab::new()),
            pool: SendBufferPool::new(config.pool_buffers, config.pool_buffer_capacity),
            write_spin_count: config.write_spin_count,
            next_id: AtomicU64::new(1),
        });
        let read_buf = vec![0u8; config.read_buffer_size.max(1)];
        Ok(Reactor {
            poll,
            shared,
            tasks: rx,
            config,
            read_buf,
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the loop on the calling thread until shut down.
    pub fn run(&mut self) -> io::Result<()> {
        *self.shared.owner.write() = Some(std::thread::current().id());
        debug!("reactor loop started");
        let mut events = Events::with_capacity(self.config.event_capacity.max(1));
        let result = loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            self.shared.wakened.store(false, Ordering::SeqCst);
            if let Err(e) = self.poll.poll(&mut events, self.config.poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("readiness poll failed: {}", e);
                break Err(e);
            }
            // Skip the sweep entirely on an empty batch.
            if !events.is_empty() {
                for ev in events.iter() {
                    let token = ev.token();
                    if token == WAKER_TOKEN {
                        continue;
                    }
                    let readable = ev.is_readable();
                    let writable = ev.is_writable();
                    self.dispatch(token, readable || !writable, writable);
                }
            }
            self.run_tasks();
        };
        self.teardown();
        *self.shared.owner.write() = None;
        debug!("reactor loop stopped");
        result
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let entry = {
            let entries = self.shared.entries.lock();
            entries.get(token.0).cloned()
        };
        match entry {
            // Readiness for a source deregistered earlier in this sweep.
            None => {}
            Some(Entry::Listener(listener)) => self.accept_ready(&listener),
            Some(Entry::Channel(ch)) => {
                if readable && !self.read_channel(&ch) {
                    // Connection fully closed; no write branch for this key.
                    return;
                }
                if writable {
                    if ch.is_connecting() && !ch.finish_connect() {
                        return;
                    }
                    ch.handle_writable();
                }
            }
        }
    }

    /// Drains inbound bytes until the socket would block. Returns false
    /// when the channel was closed by this read.
    fn read_channel(&mut self, ch: &Arc<Channel>) -> bool {
        loop {
            let result = {
                let mut p = ch.pipeline.lock();
                match p.stream.as_mut() {
                    None => return false,
                    Some(s) => s.read(&mut self.read_buf),
                }
            };
            match result {
                Ok(0) => {
                    ch.close();
                    return false;
                }
                Ok(n) => {
                    // Handler runs with the pipeline lock released so it
                    // may submit writes from inside the callback.
                    let handler = ch.handler().clone();
                    handler.on_data(ch, &self.read_buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if ch.is_open() {
                        warn!("read failed on channel {}: {}", ch.id(), e);
                        ch.notify(Deferred::Exception(WriteError::from_io(e)));
                    }
                    ch.close();
                    return false;
                }
            }
        }
    }

    fn accept_ready(&mut self, entry: &Arc<ListenerEntry>) {
        loop {
            let result = entry.listener.lock().accept();
            match result {
                Ok((stream, addr)) => entry.acceptor.on_accept(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    entry.acceptor.on_accept_error(&e);
                    break;
                }
            }
        }
    }

    fn run_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            self.handle_task(task);
        }
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::Register(ch, completion) => self.register_channel(ch, completion),
            Task::Deregister(ch, completion) => self.deregister_channel(ch, completion),
            Task::Write(ch) => ch.resume_write(),
            Task::SetInterest(ch, ops, completion) => ch.set_interest_on_loop(ops, &completion),
            Task::Close(ch, completion) => ch.close_on_loop(&completion),
            Task::Notify(ch, event) => ch.deliver(event),
            Task::Listen(listener, acceptor, completion) => {
                self.register_listener(listener, acceptor, completion)
            }
        }
    }

    fn register_channel(&mut self, ch: Arc<Channel>, completion: Completion) {
        if !ch.is_open() {
            // Lost the race with a concurrent close.
            ch.close_on_loop(&Completion::new());
            completion.fail(WriteError::Closed);
            return;
        }
        let token = {
            let mut entries = self.shared.entries.lock();
            entries.insert(Entry::Channel(ch.clone()))
        };
        match ch.register_with_poll(token) {
            Ok(()) => {
                completion.succeed();
                if ch.is_connected() {
                    ch.deliver(Deferred::Open);
                }
            }
            Err(e) => {
                debug!("registration failed for channel {}: {}", ch.id(), e);
                let mut entries = self.shared.entries.lock();
                if entries.contains(token) {
                    entries.remove(token);
                }
                drop(entries);
                completion.fail(WriteError::from_io(e));
                ch.close_on_loop(&Completion::new());
            }
        }
    }

    fn deregister_channel(&mut self, ch: Arc<Channel>, completion: Completion) {
        let token = ch.token();
        if token != INVALID_TOKEN {
            let mut entries = self.shared.entries.lock();
            if entries.contains(token) {
                entries.remove(token);
            }
        }
        {
            let mut p = ch.pipeline.lock();
            if p.polled {
                if let Some(s) = p.stream.as_mut() {
                    if let Err(e) = self.shared.registry.deregister(s) {
                        trace!("deregister of channel {}: {}", ch.id(), e);
                    }
                }
                p.polled = false;
            }
        }
        ch.clear_token();

        // Immediate non-blocking re-poll so readiness harvested for the
        // old registration is consumed now instead of going stale.
        let mut scratch = Events::with_capacity(64);
        if self.poll.poll(&mut scratch, Some(Duration::ZERO)).is_ok() {
            let ready: Vec<(Token, bool, bool)> = scratch
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable || !writable, writable);
            }
        }
        completion.succeed();
    }

    fn register_listener(
        &mut self,
        listener: std::net::TcpListener,
        acceptor: Arc<dyn Acceptor>,
        completion: Completion,
    ) {
        let mut mio_listener = mio::net::TcpListener::from_std(listener);
        let mut entries = self.shared.entries.lock();
        let slot = entries.vacant_entry();
        let token = slot.key();
        match self
            .shared
            .registry
            .register(&mut mio_listener, Token(token), Interest::READABLE)
        {
            Ok(()) => {
                slot.insert(Entry::Listener(Arc::new(ListenerEntry {
                    listener: Mutex::new(mio_listener),
                    acceptor,
                })));
                drop(entries);
                completion.succeed();
            }
            Err(e) => {
                drop(entries);
                warn!("listener registration failed: {}", e);
                completion.fail(WriteError::from_io(e));
            }
        }
    }

    /// Force-closes every remaining source and fails tasks still queued,
    /// so exactly-once completion resolution holds under shutdown too.
    fn teardown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let entries: Vec<Entry> = {
            let mut entries = self.shared.entries.lock();
            entries.drain().collect()
        };
        for entry in entries {
            match entry {
                Entry::Channel(ch) => ch.close_on_loop(&Completion::new()),
                Entry::Listener(l) => {
                    let mut listener = l.listener.lock();
                    if let Err(e) = self.shared.registry.deregister(&mut *listener) {
                        trace!("listener deregister during teardown: {}", e);
                    }
                }
            }
        }
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                Task::Register(ch, completion) => {
                    completion.fail(WriteError::Closed);
                    ch.close_on_loop(&Completion::new());
                }
                Task::Deregister(_, completion) => completion.succeed(),
                Task::Write(ch) => ch.close_on_loop(&Completion::new()),
                Task::SetInterest(_, _, completion) => completion.fail(WriteError::Closed),
                Task::Close(ch, completion) => ch.close_on_loop(&completion),
                Task::Notify(ch, event) => ch.deliver(event),
                Task::Listen(_, _, completion) => completion.fail(WriteError::Closed),
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("channels", &self.shared.entries.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
