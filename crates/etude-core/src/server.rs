// src/server.rs
//! The readiness loop: one dispatch thread owning every idle connection,
//! handing ready ones to the thread pool and taking them back when done.
//!
//! A connection is either idle in the slab (armed in epoll with
//! `EPOLLONESHOT`) or in flight (moved into a [`ConnTask`], not armed).
//! Workers return connections through a completion list and poke the
//! dispatcher through a pipe; only the dispatch thread touches epoll, the
//! slab and the socket I/O.

use crate::backend::{BackendPool, NoBackend};
use crate::config::{ServerConfig, Trigger};
use crate::conn::HttpConnection;
use crate::docroot::DocRoot;
use crate::error::{EtudeError, EtudeResult};
use crate::http::Next;
use crate::metrics::Stats;
use crate::pool::{PoolConfig, Processable, ThreadPool};
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const LISTEN_TOKEN: u64 = u64::MAX;
const WAKE_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;

const BUSY_REPLY: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 20\r\nConnection: close\r\n\r\nInternal server busy";

struct Completion {
    token: usize,
    conn: Box<HttpConnection>,
    next: Next,
}

/// Connections handed back by workers, plus the pipe that announces them.
struct Completions {
    done: Mutex<Vec<Completion>>,
    wake: OwnedFd,
}

impl Completions {
    fn push(&self, completion: Completion) {
        self.done.lock().push(completion);
        if let Err(e) = syscalls::notify_pipe(self.wake.as_raw_fd()) {
            tracing::warn!(error = %e, "failed to wake dispatcher");
        }
    }
}

/// A connection travelling through the thread pool.
///
/// If the task is dropped without finishing (a panic in `process`, or the
/// pool abandoning its queue) the connection is still returned, marked for
/// closing, so its slot is freed.
pub struct ConnTask {
    token: usize,
    conn: Option<Box<HttpConnection>>,
    completions: Arc<Completions>,
}

impl ConnTask {
    fn take_conn(mut self) -> Option<Box<HttpConnection>> {
        self.conn.take()
    }
}

impl<H> Processable<H> for ConnTask {
    fn process(mut self, _handle: &mut H) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let next = conn.process();
        if let Some(conn) = self.conn.take() {
            self.completions.push(Completion {
                token: self.token,
                conn,
                next,
            });
        }
    }
}

impl Drop for ConnTask {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.completions.push(Completion {
                token: self.token,
                conn,
                next: Next::Close,
            });
        }
    }
}

pub struct Server<B = NoBackend> {
    config: ServerConfig,
    backend: Arc<B>,
}

impl Server<NoBackend> {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            backend: Arc::new(NoBackend),
        }
    }
}

impl<B: BackendPool> Server<B> {
    pub fn with_backend(config: ServerConfig, backend: Arc<B>) -> Self {
        Self { config, backend }
    }

    /// Validate the configuration, open the document root, bind the listener
    /// and start the worker pool.
    pub fn bind(self) -> EtudeResult<Dispatcher<B>> {
        let config = self.config;
        config.validate()?;

        let root = DocRoot::new(&config.root)?
            .index(config.index.clone())
            .content_type(config.content_type.clone());

        let listener = TcpListener::bind(config.addr).map_err(|e| {
            EtudeError::config(format!("cannot listen on {}: {e}", config.addr))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let epoll = Epoll::new()?;
        epoll.add(
            listener.as_raw_fd(),
            LISTEN_TOKEN,
            EPOLLIN | config.trigger.listen.epoll_flags(),
        )?;

        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (wake_rx, wake_tx) = unsafe { (OwnedFd::from_raw_fd(wake_rx), OwnedFd::from_raw_fd(wake_tx)) };
        epoll.add(wake_rx.as_raw_fd(), WAKE_TOKEN, EPOLLIN)?;

        let pool = ThreadPool::with_config(
            self.backend,
            PoolConfig::default()
                .threads(config.threads)
                .max_queue_depth(config.max_queue_depth)
                .pin_to_cores(config.pin_workers),
        )?;

        tracing::info!(
            addr = %local_addr,
            root = %root.root().display(),
            trigger = ?config.trigger,
            "listening"
        );

        Ok(Dispatcher {
            listener,
            local_addr,
            epoll,
            wake_rx,
            completions: Arc::new(Completions {
                done: Mutex::new(Vec::new()),
                wake: wake_tx,
            }),
            slab: ConnectionSlab::new(config.max_connections),
            pool,
            root: Arc::new(root),
            stats: Arc::new(Stats::new()),
            config,
        })
    }

    /// Bind and run until Ctrl-C, then give the workers the configured grace
    /// period to finish.
    pub fn serve(self) -> EtudeResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received interrupt, shutting down");
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| EtudeError::config(format!("cannot install signal handler: {e}")))?;

        let mut dispatcher = self.bind()?;
        dispatcher.run(shutdown)?;

        let grace = dispatcher.config.shutdown_grace;
        if !dispatcher.shutdown(grace) {
            tracing::warn!(?grace, "workers still busy after grace period");
        }
        tracing::info!("server shut down");
        Ok(())
    }
}

pub struct Dispatcher<B: BackendPool = NoBackend> {
    listener: TcpListener,
    local_addr: SocketAddr,
    epoll: Epoll,
    wake_rx: OwnedFd,
    completions: Arc<Completions>,
    slab: ConnectionSlab<Box<HttpConnection>>,
    pool: ThreadPool<ConnTask, B>,
    root: Arc<DocRoot>,
    stats: Arc<Stats>,
    config: ServerConfig,
}

impl<B: BackendPool> Dispatcher<B> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live connections, idle and in flight.
    pub fn connections(&self) -> usize {
        self.slab.len()
    }

    /// Stop the worker pool; see [`ThreadPool::shutdown`].
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.pool.shutdown(grace)
    }

    /// Run the event loop until `shutdown` is set. Idle connections are
    /// closed on the way out.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> EtudeResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let sweep_every = (self.config.idle_timeout / 2).min(Duration::from_secs(1));
        let timeout_ms = sweep_every.as_millis().clamp(1, 500) as i32;
        let mut last_sweep = Instant::now();

        while !shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, timeout_ms)?;

            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                match token {
                    LISTEN_TOKEN => self.accept_ready(),
                    WAKE_TOKEN => self.drain_completions(),
                    token => self.conn_ready(token as usize, flags),
                }
            }

            if last_sweep.elapsed() >= sweep_every {
                self.prune_idle();
                last_sweep = Instant::now();
            }
        }

        for token in self.slab.tokens() {
            if !self.slab.is_in_flight(token) {
                self.close(token, "server stopping");
            }
        }
        tracing::info!(stats = ?self.stats.snapshot(), "dispatcher stopped");
        Ok(())
    }

    fn conn_interest(&self, base: u32) -> u32 {
        base | EPOLLRDHUP | EPOLLONESHOT | self.config.trigger.conn.epoll_flags()
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
            if self.config.trigger.listen == Trigger::Level {
                break;
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(peer = %addr, error = %e, "cannot make socket non-blocking");
            return;
        }
        let _ = stream.set_nodelay(true);

        let fd = stream.into_raw_fd();
        let conn = Box::new(HttpConnection::new(
            fd,
            addr,
            Arc::clone(&self.root),
            self.config.trigger.conn,
        ));

        match self.slab.insert(conn) {
            Ok(token) => {
                if let Err(e) = self.epoll.add(fd, token as u64, self.conn_interest(EPOLLIN)) {
                    tracing::warn!(peer = %addr, error = %e, "cannot register connection");
                    drop(self.slab.remove(token));
                    return;
                }
                self.stats.inc_conn();
                tracing::debug!(peer = %addr, token, "accepted");
            }
            Err(conn) => {
                let _ = syscalls::write_nonblocking(conn.fd(), BUSY_REPLY);
                self.stats.inc_refused();
                tracing::warn!(
                    peer = %addr,
                    limit = self.slab.capacity(),
                    "connection limit reached, refusing"
                );
            }
        }
    }

    fn conn_ready(&mut self, token: usize, flags: u32) {
        // Hang-up wins over readable data: a peer that half-closes after
        // sending its request is dropped without a response.
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.close(token, "peer hung up");
        } else if flags & EPOLLIN != 0 {
            self.on_readable(token);
        } else if flags & EPOLLOUT != 0 {
            self.on_writable(token);
        }
    }

    fn on_readable(&mut self, token: usize) {
        let Some(conn) = self.slab.get_mut(token) else {
            return;
        };
        if !conn.read_once() {
            self.close(token, "read side closed");
            return;
        }
        let Some(conn) = self.slab.check_out(token) else {
            return;
        };
        let task = ConnTask {
            token,
            conn: Some(conn),
            completions: Arc::clone(&self.completions),
        };
        if let Err(rejected) = self.pool.submit(task) {
            self.stats.inc_rejected();
            tracing::warn!(token, reason = ?rejected.reason(), "work queue rejected connection");
            if let Some(mut conn) = rejected.into_inner().take_conn() {
                let _ = self.epoll.delete(conn.fd());
                if conn.close_conn(true) {
                    self.stats.dec_conn();
                }
            }
            self.slab.remove(token);
        }
    }

    fn on_writable(&mut self, token: usize) {
        let Some(conn) = self.slab.get_mut(token) else {
            return;
        };
        let fd = conn.fd();
        let pending = conn.bytes_to_send();
        match conn.write() {
            Next::Write => self.rearm(fd, token, EPOLLOUT),
            Next::Read => {
                self.stats.inc_served(pending);
                self.rearm(fd, token, EPOLLIN);
            }
            Next::Close => {
                if pending > 0 && conn.bytes_have_send() >= pending {
                    self.stats.inc_served(pending);
                }
                self.close(token, "response complete");
            }
        }
    }

    fn drain_completions(&mut self) {
        if let Err(e) = syscalls::drain_pipe(self.wake_rx.as_raw_fd()) {
            tracing::error!(error = %e, "failed to drain wake pipe");
        }
        let done = std::mem::take(&mut *self.completions.done.lock());
        for Completion { token, conn, next } in done {
            let fd = conn.fd();
            if let Err(conn) = self.slab.check_in(token, conn) {
                tracing::error!(token, peer = %conn.address(), "completion for a slot not in flight");
                continue;
            }
            match next {
                Next::Read => self.rearm(fd, token, EPOLLIN),
                Next::Write => self.rearm(fd, token, EPOLLOUT),
                Next::Close => self.close(token, "request failed"),
            }
        }
    }

    fn rearm(&mut self, fd: RawFd, token: usize, base: u32) {
        if let Err(e) = self.epoll.modify(fd, token as u64, self.conn_interest(base)) {
            tracing::warn!(token, error = %e, "cannot re-arm connection");
            self.close(token, "re-arm failed");
        }
    }

    fn prune_idle(&mut self) {
        for token in self.slab.expired(Instant::now(), self.config.idle_timeout) {
            self.stats.inc_pruned();
            self.close(token, "idle timeout");
        }
    }

    fn close(&mut self, token: usize, reason: &'static str) {
        let Some(mut conn) = self.slab.remove(token) else {
            return;
        };
        let _ = self.epoll.delete(conn.fd());
        if conn.close_conn(true) {
            self.stats.dec_conn();
        }
        tracing::debug!(peer = %conn.address(), token, reason, "connection closed");
    }
}
