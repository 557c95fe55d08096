// src/server.rs
//
// The reactor: one thread that owns the listener, the epoll instance and
// every idle connection. It does all socket I/O and is the only code that
// arms, re-arms or removes descriptors. Parsing and file resolution run on
// the worker pool; connections travel there and back by value.
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::connection::{Connection, Flush, Phase};
use crate::error::{ServerError, ServerResult};
use crate::files::DocumentRoot;
use crate::http::HttpCode;
use crate::metrics::ServerMetrics;
use crate::poller::{Epoll, Event, Events, Interest, Waker};
use crate::pool::{PoolOptions, WorkerPool};
use crate::slab::{Key, Slab};

const LISTENER: u64 = u64::MAX;
const WAKER: u64 = u64::MAX - 1;
const EVENT_CAPACITY: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A connection in transit to or from a worker, with the slot it came from.
type Job = (Key, Box<Connection>);

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    listener: TcpListener,
    config: Config,
    docs: Arc<DocumentRoot>,
    metrics: Arc<ServerMetrics>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Validate `config` and bind the listening socket. Nothing is served
    /// until `serve` is called.
    pub fn bind(config: Config) -> ServerResult<Self> {
        config.validate()?;

        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        listener.set_nonblocking(true)?;
        let docs = Arc::new(DocumentRoot::new(config.root.clone(), config.index.clone()));

        info!(
            addr = %listener.local_addr()?,
            root = %config.root.display(),
            "listening"
        );

        Ok(Self {
            listener,
            config,
            docs,
            metrics: Arc::new(ServerMetrics::new()),
            waker: Arc::new(Waker::new()?),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Run the event loop on the calling thread until shut down.
    pub fn serve(self) -> ServerResult<()> {
        let epoll = Epoll::new()?;
        epoll.register(self.listener.as_raw_fd(), LISTENER, Interest::Read, false)?;
        epoll.register(self.waker.fd(), WAKER, Interest::Read, false)?;

        let (done_tx, done_rx) = mpsc::channel();
        let pool = WorkerPool::spawn(
            PoolOptions {
                threads: self.config.workers,
                max_requests: self.config.max_requests,
                pin_cores: self.config.pin_workers,
            },
            completion_handler(done_tx, self.waker.clone(), self.metrics.clone()),
        )?;

        let mut reactor = Reactor {
            epoll,
            listener: self.listener,
            waker: self.waker,
            shutdown: self.shutdown,
            docs: self.docs,
            metrics: self.metrics,
            conns: Slab::new(self.config.max_connections),
            fds: HashMap::new(),
            pool,
            done: done_rx,
            idle_timeout: self.config.idle_timeout(),
        };
        info!(
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            "server started"
        );
        reactor.run()
    }
}

/// What a worker does with a connection: parse, resolve, build the response,
/// then hand it back to the reactor.
fn completion_handler(
    done: Sender<Job>,
    waker: Arc<Waker>,
    metrics: Arc<ServerMetrics>,
) -> impl Fn(Job) + Send + Sync + 'static {
    move |(key, mut conn): Job| {
        conn.set_phase(Phase::Processing);
        match catch_unwind(AssertUnwindSafe(|| conn.process())) {
            Ok(HttpCode::NoRequest) => {}
            Ok(_) => metrics.inc_req(),
            Err(_) => {
                error!(peer = %conn.peer(), "request processing panicked");
                conn.set_phase(Phase::Closing);
            }
        }
        if done.send((key, conn)).is_ok() {
            waker.wake();
        }
    }
}

struct Reactor {
    epoll: Epoll,
    listener: TcpListener,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    docs: Arc<DocumentRoot>,
    metrics: Arc<ServerMetrics>,
    conns: Slab<Box<Connection>>,
    /// Descriptor of every live slot, lent ones included.
    fds: HashMap<Key, RawFd>,
    pool: WorkerPool<Job>,
    done: Receiver<Job>,
    idle_timeout: Option<Duration>,
}

impl Reactor {
    fn run(&mut self) -> ServerResult<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let tick = self.idle_timeout.map(|_| SWEEP_INTERVAL);
        let mut last_sweep = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.epoll.wait(&mut events, tick) {
                error!(error = %e, "epoll_wait failed");
                self.stop();
                return Err(e);
            }

            for event in events.iter() {
                match event.token {
                    LISTENER => self.accept(),
                    WAKER => {
                        self.waker.drain();
                        self.drain_completions();
                    }
                    token => self.dispatch(Key::from_token(token), event),
                }
            }

            if let Some(timeout) = self.idle_timeout {
                if last_sweep.elapsed() >= SWEEP_INTERVAL {
                    self.sweep_idle(timeout);
                    last_sweep = Instant::now();
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        if self.conns.is_full() {
            self.metrics.inc_rejected();
            warn!(%peer, live = self.conns.len(), "connection limit reached, rejecting");
            return;
        }

        let conn = match Connection::new(stream, peer, self.docs.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, error = %e, "failed to set up connection");
                return;
            }
        };
        let fd = conn.fd();
        let Some(key) = self.conns.insert(Box::new(conn)) else {
            return;
        };
        self.metrics.inc_conn();
        self.fds.insert(key, fd);

        if let Err(e) = self.epoll.register(fd, key.to_token(), Interest::Read, true) {
            warn!(%peer, error = %e, "failed to register connection");
            self.close(key);
            return;
        }
        if let Some(conn) = self.conns.get_mut(key) {
            conn.set_phase(Phase::Reading);
        }
        self.metrics.inc_accepted();
        debug!(%peer, fd, "accepted");
    }

    fn dispatch(&mut self, key: Key, event: Event) {
        let Some(conn) = self.conns.get_mut(key) else {
            trace!(token = event.token, "event for a stale or lent slot");
            return;
        };

        if event.is_hangup() {
            debug!(peer = %conn.peer(), "peer hung up");
            self.close(key);
            return;
        }

        match conn.phase() {
            Phase::Reading if event.is_readable() => self.on_readable(key),
            Phase::Writing if event.is_writable() => self.on_writable(key),
            phase => {
                trace!(?phase, "unexpected readiness, re-arming");
                let interest = if phase == Phase::Writing {
                    Interest::Write
                } else {
                    Interest::Read
                };
                self.rearm(key, interest);
            }
        }
    }

    fn on_readable(&mut self, key: Key) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        conn.touch();

        match conn.read() {
            Ok(0) => {
                self.rearm(key, Interest::Read);
                return;
            }
            Ok(n) => trace!(peer = %conn.peer(), bytes = n, "read"),
            Err(e) => {
                log_teardown(conn, &e);
                self.close(key);
                return;
            }
        }

        let Some(mut conn) = self.conns.lend(key) else {
            return;
        };
        conn.set_phase(Phase::Queued);
        if let Err((key, mut conn)) = self.pool.append((key, conn)) {
            warn!(
                peer = %conn.peer(),
                queued = self.pool.queued(),
                "worker queue full, closing connection"
            );
            conn.set_phase(Phase::Closing);
            // The slot is still reserved for it; put it back so `close`
            // releases everything in one place.
            let _ = self.conns.restore(key, conn);
            self.close(key);
        }
    }

    fn on_writable(&mut self, key: Key) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        conn.touch();

        let result = conn.write();
        self.metrics.add_bytes(conn.take_written());
        match result {
            Ok(Flush::Pending) => self.rearm(key, Interest::Write),
            Ok(Flush::Complete) if conn.phase() == Phase::Reading => {
                self.rearm(key, Interest::Read)
            }
            Ok(Flush::Complete) => self.close(key),
            Err(e) => {
                log_teardown(conn, &e);
                self.close(key);
            }
        }
    }

    /// Take back every connection the workers have finished with.
    fn drain_completions(&mut self) {
        while let Ok((key, mut conn)) = self.done.try_recv() {
            conn.touch();
            let phase = conn.phase();
            if let Err(conn) = self.conns.restore(key, conn) {
                debug!(peer = %conn.peer(), "connection returned after its slot was freed");
                continue;
            }
            match phase {
                Phase::Reading => self.rearm(key, Interest::Read),
                Phase::Writing => self.rearm(key, Interest::Write),
                _ => self.close(key),
            }
        }
    }

    fn rearm(&mut self, key: Key, interest: Interest) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        if let Err(e) = self.epoll.modify(conn.fd(), key.to_token(), interest) {
            warn!(peer = %conn.peer(), error = %e, "failed to re-arm connection");
            self.close(key);
        }
    }

    /// Deregister and free the slot. A lent connection is dropped when it
    /// comes back from its worker.
    fn close(&mut self, key: Key) {
        if !self.conns.contains(key) {
            return;
        }
        if let Some(fd) = self.fds.remove(&key) {
            if let Err(e) = self.epoll.deregister(fd) {
                debug!(fd, error = %e, "deregister failed");
            }
        }
        if let Some(conn) = self.conns.remove(key) {
            debug!(
                peer = %conn.peer(),
                requests = conn.requests_served(),
                "connection closed"
            );
        }
        self.metrics.dec_conn();
    }

    fn sweep_idle(&mut self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<Key> = self
            .conns
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_active()) >= timeout)
            .map(|(key, _)| key)
            .collect();

        for key in expired {
            debug!(slot = key.index(), "closing idle connection");
            self.close(key);
        }
    }

    fn stop(&mut self) {
        info!(live = self.conns.len(), "shutting down");
        self.pool.shutdown();
        while self.done.try_recv().is_ok() {}

        let keys: Vec<Key> = self.fds.keys().copied().collect();
        for key in keys {
            self.close(key);
        }

        let stats = self.metrics.snapshot();
        info!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            requests = stats.req_count,
            bytes_sent = stats.bytes_sent,
            "server stopped"
        );
    }
}

fn log_teardown(conn: &Connection, e: &ServerError) {
    if e.is_disconnect() {
        debug!(peer = %conn.peer(), "peer disconnected");
    } else {
        warn!(peer = %conn.peer(), error = %e, "connection error");
    }
}
