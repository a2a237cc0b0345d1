//! The event-loop façade: listeners, connection I/O, and timers dispatched
//! through epoll readiness and io_uring completions.
//!
//! Data flow: readiness events wake [`EventLoop::poll`]; accepts drain the
//! listener backlog; readable conns produce message events; the eventfd
//! registered against the ring wakes the loop for completion reaping, which
//! surfaces written and closed notifications. With `parallel >= 1`, handler
//! invocations are fanned out to worker threads over this crate's bounded
//! ring queues.

use crate::buffers::BufferClass;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::net::{Conn, Listener};
use crate::poll::{Eventfd, Interest, PollEvent, Poller, Timerfd};
use crate::sync::ring_queue::{RingQueueOptions, SpscRingQueue};
use crate::uring::{Ring, RingConfig};
use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Handles accepted connections.
pub trait AcceptedHandler: Send + Sync {
    fn serve_accepted(&self, conn: Arc<dyn Conn>, listener: &dyn Listener);
}

/// Chooses the worker that will handle an incoming message.
pub trait DispatchHandler: Send + Sync {
    fn serve_dispatch(&self, ctx: &Context, conn: &dyn Conn) -> usize;
}

/// Handles incoming request messages.
pub trait MessageHandler: Send + Sync {
    fn serve_message(&self, ctx: &Context, reply: &dyn Conn, request: Bytes);
}

/// Handles completed writes submitted through
/// [`EventLoop::submit_write`].
pub trait WrittenHandler: Send + Sync {
    fn serve_written(&self, ctx: &Context, fd: RawFd, written: usize);
}

/// Handles connection teardown.
pub trait ClosedHandler: Send + Sync {
    fn serve_closed(&self, local_fd: RawFd, remote_fd: RawFd);
}

/// Handles timer ticks.
pub trait TickedHandler: Send + Sync {
    fn serve_ticked(&self, at: Instant);
}

/// Event-loop options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// The caller drives [`EventLoop::poll`] manually instead of running
    /// [`EventLoop::serve`].
    pub user_poll: bool,
    /// Number of handler workers. `<= 0` handles events on the polling
    /// thread; `1` uses a single worker; `>= 2` dispatches per-event via
    /// the user's [`DispatchHandler`].
    pub parallel: i32,
}

impl Options {
    #[must_use]
    pub fn user_poll(mut self) -> Self {
        self.user_poll = true;
        self
    }

    #[must_use]
    pub fn parallel(mut self, workers: i32) -> Self {
        self.parallel = workers;
        self
    }
}

// Tags write submissions in their completion contexts so the reaper knows
// which handler to invoke.
struct WriteOp;

struct ListenEntry {
    listener: Arc<dyn Listener>,
    handler: Arc<dyn AcceptedHandler>,
}

struct IoHandlers {
    dispatch: Option<Arc<dyn DispatchHandler>>,
    message: Arc<dyn MessageHandler>,
    written: Option<Arc<dyn WrittenHandler>>,
    closed: Option<Arc<dyn ClosedHandler>>,
}

struct TimerEntry {
    timer: Mutex<Timerfd>,
    handler: Arc<dyn TickedHandler>,
}

type Job = Box<dyn FnOnce() + Send>;

struct Worker {
    queue: Arc<SpscRingQueue<Job>>,
    handle: Option<JoinHandle<()>>,
}

/// The events-notification interface: a readiness poller, an io_uring ring
/// with its wake eventfd, and the handler tables.
pub struct EventLoop {
    opts: Options,
    poller: Mutex<Poller>,
    ring: Arc<Ring>,
    ring_efd: Eventfd,
    listeners: Mutex<HashMap<RawFd, ListenEntry>>,
    conns: Mutex<HashMap<RawFd, Arc<dyn Conn>>>,
    io: Mutex<Option<IoHandlers>>,
    timers: Mutex<HashMap<RawFd, TimerEntry>>,
    workers: Vec<Worker>,
    round_robin: AtomicUsize,
}

impl EventLoop {
    pub fn new(opts: Options) -> Result<Self> {
        let poller = Poller::new(1 << 10)?;
        let ring = Arc::new(Ring::new(RingConfig::default())?);
        let ring_efd = ring.register_eventfd_async(&poller)?;

        let workers = (0..opts.parallel.max(0))
            .map(|i| {
                let queue = Arc::new(
                    SpscRingQueue::<Job>::with_options(RingQueueOptions {
                        capacity: 0x3FF,
                        nonblocking: false,
                    })
                    .expect("worker queue capacity is valid"),
                );
                let consumer = Arc::clone(&queue);
                let handle = std::thread::Builder::new()
                    .name(format!("sockring-worker-{}", i))
                    .spawn(move || loop {
                        match consumer.consume() {
                            Ok(job) => job(),
                            Err(_) => return,
                        }
                    })
                    .expect("spawn worker");
                Worker {
                    queue,
                    handle: Some(handle),
                }
            })
            .collect();

        Ok(Self {
            opts,
            poller: Mutex::new(poller),
            ring,
            ring_efd,
            listeners: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            io: Mutex::new(None),
            timers: Mutex::new(HashMap::new()),
            workers,
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Adds a listen event on `listener` with the given handler.
    pub fn add_listen(
        &self,
        listener: Arc<dyn Listener>,
        handler: Arc<dyn AcceptedHandler>,
    ) -> Result<()> {
        self.poller
            .lock()
            .add(listener.fd(), Interest::IN | Interest::ET)?;
        self.listeners
            .lock()
            .insert(listener.fd(), ListenEntry { listener, handler });
        Ok(())
    }

    /// Installs the I/O handler set.
    pub fn add_io(
        &self,
        dispatch: Option<Arc<dyn DispatchHandler>>,
        message: Arc<dyn MessageHandler>,
        written: Option<Arc<dyn WrittenHandler>>,
        closed: Option<Arc<dyn ClosedHandler>>,
    ) {
        *self.io.lock() = Some(IoHandlers {
            dispatch,
            message,
            written,
            closed,
        });
    }

    /// Adds a repeating timer event.
    pub fn add_timer(&self, interval: Duration, handler: Arc<dyn TickedHandler>) -> Result<()> {
        let timer = Timerfd::new(interval)?;
        self.poller
            .lock()
            .add(timer.as_raw_fd(), Interest::IN | Interest::ET)?;
        self.timers.lock().insert(
            timer.as_raw_fd(),
            TimerEntry {
                timer: Mutex::new(timer),
                handler,
            },
        );
        Ok(())
    }

    /// Registers an established connection for message events.
    pub fn add_conn(&self, conn: Arc<dyn Conn>) -> Result<()> {
        self.poller
            .lock()
            .add(conn.fd(), Interest::IN | Interest::ET)?;
        self.conns.lock().insert(conn.fd(), conn);
        Ok(())
    }

    /// Queues an asynchronous write; its completion surfaces through the
    /// written handler.
    pub fn submit_write(&self, fd: RawFd, payload: Bytes) -> Result<()> {
        let ctx = Context::new().with_value(WriteOp);
        self.ring.write_owned(ctx, fd, payload)?;
        self.ring.enter()
    }

    /// Runs the loop until a fatal error. Nonfatal availability errors are
    /// absorbed into the next poll. Not available when the loop was built
    /// with [`Options::user_poll`]; drive [`poll`](EventLoop::poll)
    /// directly instead.
    pub fn serve(&self) -> Result<()> {
        if self.opts.user_poll {
            return Err(Error::InvalidParam);
        }
        loop {
            match self.poll(None) {
                Ok(()) => {}
                Err(e) if e.is_unavailable() || e.is_interrupted() => {}
                Err(e) => {
                    tracing::warn!(error = %e, "event loop stopping");
                    return Err(e);
                }
            }
        }
    }

    /// Advances the loop by at most `timeout`: `Some(0)` polls without
    /// blocking, `None` blocks until events arrive.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let events: SmallVec<[PollEvent; 32]> = {
            let mut poller = self.poller.lock();
            poller.wait(timeout)?.iter().copied().collect()
        };
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&self, event: PollEvent) -> Result<()> {
        if event.fd == self.ring_efd.as_raw_fd() {
            // Drain the wake counter, then reap everything the ring has.
            let _ = self.ring_efd.read_u64();
            return self.reap_completions();
        }
        if self.listeners.lock().contains_key(&event.fd) {
            return self.drain_accepts(event.fd);
        }
        if self.timers.lock().contains_key(&event.fd) {
            return self.fire_timer(event.fd);
        }
        if self.conns.lock().contains_key(&event.fd) {
            return self.drain_conn(event.fd);
        }
        tracing::trace!(fd = event.fd, "readiness event without an owner");
        Ok(())
    }

    fn drain_accepts(&self, fd: RawFd) -> Result<()> {
        loop {
            let (listener, handler) = {
                let listeners = self.listeners.lock();
                let Some(entry) = listeners.get(&fd) else {
                    return Ok(());
                };
                (Arc::clone(&entry.listener), Arc::clone(&entry.handler))
            };
            match listener.try_accept() {
                Ok(conn) => {
                    let conn: Arc<dyn Conn> = Arc::from(conn);
                    self.add_conn(Arc::clone(&conn))?;
                    let worker = self.next_worker();
                    self.dispatch(worker, Box::new(move || {
                        handler.serve_accepted(conn, listener.as_ref());
                    }));
                }
                Err(Error::TemporarilyUnavailable) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn fire_timer(&self, fd: RawFd) -> Result<()> {
        let timers = self.timers.lock();
        let Some(entry) = timers.get(&fd) else {
            return Ok(());
        };
        let at = {
            let mut timer = entry.timer.lock();
            match timer.read_ticks() {
                Ok(_missed) => timer.now(),
                Err(Error::TemporarilyUnavailable) => return Ok(()),
                Err(e) => return Err(e),
            }
        };
        let handler = Arc::clone(&entry.handler);
        drop(timers);
        let worker = self.next_worker();
        self.dispatch(worker, Box::new(move || handler.serve_ticked(at)));
        Ok(())
    }

    fn drain_conn(&self, fd: RawFd) -> Result<()> {
        let Some(conn) = self.conns.lock().get(&fd).map(Arc::clone) else {
            return Ok(());
        };
        let (dispatch, message) = {
            let io = self.io.lock();
            match io.as_ref() {
                Some(io) => (io.dispatch.clone(), Arc::clone(&io.message)),
                None => return Ok(()),
            }
        };
        let mut buf = vec![0u8; BufferClass::Small.size()];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => return self.teardown_conn(fd),
                Ok(n) => {
                    let ctx = Context::new().with_fd(fd);
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    let worker = match &dispatch {
                        Some(dispatch) => dispatch.serve_dispatch(&ctx, conn.as_ref()),
                        None => self.next_worker(),
                    };
                    let handler = Arc::clone(&message);
                    let conn = Arc::clone(&conn);
                    self.dispatch(worker, Box::new(move || {
                        handler.serve_message(&ctx, conn.as_ref(), payload);
                    }));
                }
                Err(Error::TemporarilyUnavailable) => return Ok(()),
                Err(e) => {
                    tracing::warn!(fd, error = %e, "conn read failed");
                    return self.teardown_conn(fd);
                }
            }
        }
    }

    fn teardown_conn(&self, fd: RawFd) -> Result<()> {
        let _ = self.poller.lock().del(fd);
        let conn = self.conns.lock().remove(&fd);
        if let Some(io) = self.io.lock().as_ref() {
            if let Some(closed) = &io.closed {
                let closed = Arc::clone(closed);
                let remote = conn.map(|c| c.fd()).unwrap_or(-1);
                let worker = self.next_worker();
                self.dispatch(worker, Box::new(move || closed.serve_closed(fd, remote)));
            }
        }
        Ok(())
    }

    fn reap_completions(&self) -> Result<()> {
        loop {
            match self.ring.next_completion() {
                Ok(completion) => {
                    if completion.context.value::<WriteOp>().is_none() {
                        continue;
                    }
                    let written = {
                        let io = self.io.lock();
                        io.as_ref().and_then(|io| io.written.clone())
                    };
                    if let Some(written) = written {
                        let fd = completion.fd();
                        let n = completion.result().unwrap_or(0) as usize;
                        let ctx = completion.context;
                        let worker = self.next_worker();
                        self.dispatch(worker, Box::new(move || {
                            written.serve_written(&ctx, fd, n);
                        }));
                    }
                }
                Err(Error::TemporarilyUnavailable) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn next_worker(&self) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, worker: usize, job: Job) {
        if self.workers.is_empty() {
            job();
            return;
        }
        let queue = &self.workers[worker % self.workers.len()].queue;
        if queue.produce(job).is_err() {
            tracing::warn!("worker queue closed; event dropped");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.queue.close();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{dial_tcp, TcpListener};
    use nix::errno::Errno;

    fn try_event_loop(opts: Options) -> Option<EventLoop> {
        crate::test_utils::init_tracing();
        match EventLoop::new(opts) {
            Ok(ev) => Some(ev),
            Err(Error::NoPermission)
            | Err(Error::NoAvailableMemory)
            | Err(Error::Os(Errno::ENOSYS)) => {
                eprintln!("skipping: io_uring is not available in this environment");
                None
            }
            Err(e) => panic!("event loop: {}", e),
        }
    }

    struct CountTicks(AtomicUsize);

    impl TickedHandler for CountTicks {
        fn serve_ticked(&self, _at: Instant) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_timer_ticks_through_poll() {
        let Some(ev) = try_event_loop(Options::default().user_poll()) else {
            return;
        };
        let ticks = Arc::new(CountTicks(AtomicUsize::new(0)));
        ev.add_timer(Duration::from_millis(10), Arc::clone(&ticks) as Arc<dyn TickedHandler>)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while ticks.0.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "no tick within deadline");
            ev.poll(Some(Duration::from_millis(100))).unwrap();
        }
    }

    struct CountAccepts(AtomicUsize);

    impl AcceptedHandler for CountAccepts {
        fn serve_accepted(&self, conn: Arc<dyn Conn>, listener: &dyn Listener) {
            assert_eq!(conn.local_addr(), listener.addr());
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct CollectMessages(Mutex<Vec<Bytes>>);

    impl MessageHandler for CollectMessages {
        fn serve_message(&self, ctx: &Context, reply: &dyn Conn, request: Bytes) {
            assert_eq!(ctx.fd(), reply.fd());
            self.0.lock().push(request);
        }
    }

    #[test]
    fn test_accept_and_message_dispatch() -> anyhow::Result<()> {
        let Some(ev) = try_event_loop(Options::default().user_poll()) else {
            return Ok(());
        };
        let accepts = Arc::new(CountAccepts(AtomicUsize::new(0)));
        let messages = Arc::new(CollectMessages(Mutex::new(Vec::new())));
        ev.add_io(None, Arc::clone(&messages) as Arc<dyn MessageHandler>, None, None);

        let listener = Arc::new(TcpListener::bind("127.0.0.1:0".parse()?)?);
        let laddr = listener.local_addr();
        ev.add_listen(listener, Arc::clone(&accepts) as Arc<dyn AcceptedHandler>)?;

        let client = dial_tcp(None, laddr)?;
        let deadline = Instant::now() + Duration::from_secs(2);
        while accepts.0.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "no accept within deadline");
            ev.poll(Some(Duration::from_millis(50)))?;
        }

        client.write(b"hello loop")?;
        while messages.0.lock().is_empty() {
            assert!(Instant::now() < deadline, "no message within deadline");
            ev.poll(Some(Duration::from_millis(50)))?;
        }
        assert_eq!(&messages.0.lock()[0][..], b"hello loop");
        Ok(())
    }

    #[test]
    fn test_parallel_worker_dispatch() {
        let Some(ev) = try_event_loop(Options::default().user_poll().parallel(2)) else {
            return;
        };
        let ticks = Arc::new(CountTicks(AtomicUsize::new(0)));
        ev.add_timer(Duration::from_millis(5), Arc::clone(&ticks) as Arc<dyn TickedHandler>)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while ticks.0.load(Ordering::Relaxed) < 3 {
            assert!(Instant::now() < deadline, "workers did not run handlers");
            ev.poll(Some(Duration::from_millis(50))).unwrap();
        }
    }
}
