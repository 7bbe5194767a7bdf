// src/pool.rs
//! Bounded producer/consumer thread pool.
//!
//! A fixed set of detached workers drains one shared FIFO queue. Producers
//! never block: `submit` either queues the task or hands it straight back.
//! Each task runs with a backend handle borrowed for exactly that task.
//!
//! Shutdown is best-effort. Workers finish the task they are running, queued
//! tasks are dropped, and `shutdown` waits at most `grace` for the threads to
//! leave their loop.

use crate::backend::{BackendGuard, BackendPool};
use crate::error::{EtudeError, EtudeResult};
use crate::sync::Semaphore;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_MAX_QUEUE: usize = 10_000;

/// Unit of work accepted by [`ThreadPool`].
///
/// `H` is the backend handle type; the pool acquires one before calling
/// `process` and releases it afterwards.
pub trait Processable<H>: Send + 'static {
    fn process(self, handle: &mut H);
}

impl<H, F> Processable<H> for F
where
    F: FnOnce(&mut H) + Send + 'static,
{
    fn process(self, handle: &mut H) {
        self(handle)
    }
}

/// Boxed closure task, handy when one pool runs heterogeneous jobs.
pub type Job<H> = Box<dyn FnOnce(&mut H) + Send + 'static>;

/// FIFO queue bounded by `max_depth`. Rejects once `len() == max_depth`,
/// so the depth never exceeds the configured maximum.
pub struct WorkQueue<T> {
    tasks: Mutex<VecDeque<T>>,
    max_depth: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    pub fn push(&self, task: T) -> Result<(), T> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.max_depth {
            return Err(task);
        }
        tasks.push_back(task);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.tasks.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Drop every queued task. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = self.tasks.lock().drain(..).collect();
        // Tasks are dropped outside the lock.
        drained.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    ShuttingDown,
}

/// A task the pool refused, returned untouched to the caller.
pub struct Rejected<T> {
    task: T,
    reason: RejectReason,
}

impl<T> Rejected<T> {
    pub fn reason(&self) -> RejectReason {
        self.reason
    }

    pub fn into_inner(self) -> T {
        self.task
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("reason", &self.reason).finish()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub threads: usize,
    pub max_queue_depth: usize,
    /// Pin worker `i` to core `i % cores`.
    pub pin_to_cores: bool,
    /// Thread name prefix; workers are named `{name}-{i}`.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            max_queue_depth: DEFAULT_MAX_QUEUE,
            pin_to_cores: false,
            name: "etude-worker".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn pin_to_cores(mut self, pin: bool) -> Self {
        self.pin_to_cores = pin;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.threads == 0 {
            return Err(EtudeError::config("thread pool needs at least one worker"));
        }
        if self.max_queue_depth == 0 {
            return Err(EtudeError::config("max queue depth must be positive"));
        }
        Ok(())
    }
}

/// Number of workers still inside their loop.
struct Liveness {
    running: Mutex<usize>,
    exited: Condvar,
}

struct ExitGuard<'a>(&'a Liveness);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        *self.0.running.lock() -= 1;
        self.0.exited.notify_all();
    }
}

struct Shared<T, B> {
    queue: WorkQueue<T>,
    pending: Semaphore,
    stop: AtomicBool,
    live: Liveness,
    backend: Arc<B>,
}

pub struct ThreadPool<T, B> {
    shared: Arc<Shared<T, B>>,
    threads: usize,
}

impl<T, B> ThreadPool<T, B>
where
    B: BackendPool,
    T: Processable<B::Handle>,
{
    pub fn new(backend: Arc<B>, thread_count: usize, max_queue_depth: usize) -> EtudeResult<Self> {
        let config = PoolConfig::default()
            .threads(thread_count)
            .max_queue_depth(max_queue_depth);
        Self::with_config(backend, config)
    }

    pub fn with_config(backend: Arc<B>, config: PoolConfig) -> EtudeResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: WorkQueue::new(config.max_queue_depth),
            pending: Semaphore::new(0),
            stop: AtomicBool::new(false),
            live: Liveness {
                running: Mutex::new(0),
                exited: Condvar::new(),
            },
            backend,
        });

        let core_ids = if config.pin_to_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for i in 0..config.threads {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let worker_shared = Arc::clone(&shared);

            *shared.live.running.lock() += 1;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(&worker_shared);
                });

            // Workers are detached: the join handle is dropped right away.
            if let Err(e) = spawned {
                *shared.live.running.lock() -= 1;
                shared.stop.store(true, Ordering::Release);
                shared.pending.post_many(i);
                return Err(e.into());
            }
        }

        tracing::info!(
            threads = config.threads,
            max_queue_depth = config.max_queue_depth,
            "thread pool started"
        );

        Ok(Self {
            shared,
            threads: config.threads,
        })
    }

    /// Queue a task. Never waits for a worker; a full queue or a stopping
    /// pool hands the task back inside [`Rejected`].
    pub fn submit(&self, task: T) -> Result<(), Rejected<T>> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(Rejected {
                task,
                reason: RejectReason::ShuttingDown,
            });
        }
        match self.shared.queue.push(task) {
            Ok(()) => {
                self.shared.pending.post();
                Ok(())
            }
            Err(task) => Err(Rejected {
                task,
                reason: RejectReason::QueueFull,
            }),
        }
    }
}

impl<T, B> ThreadPool<T, B> {
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    pub fn max_queue_depth(&self) -> usize {
        self.shared.queue.max_depth()
    }

    /// Workers that have not yet left their loop.
    pub fn running(&self) -> usize {
        *self.shared.live.running.lock()
    }

    /// Signal stop, drop queued tasks and wait up to `grace` for the workers
    /// to exit. Returns `true` when every worker is gone.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending.post_many(self.threads);

        let abandoned = self.shared.queue.clear();
        if abandoned > 0 {
            tracing::warn!(abandoned, "thread pool stopped with queued tasks");
        }

        let deadline = Instant::now() + grace;
        let mut running = self.shared.live.running.lock();
        while *running > 0 {
            if self
                .shared
                .live
                .exited
                .wait_until(&mut running, deadline)
                .timed_out()
            {
                break;
            }
        }
        *running == 0
    }
}

impl<T, B> Drop for ThreadPool<T, B> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending.post_many(self.threads);
    }
}

fn run_worker<T, B>(shared: &Shared<T, B>)
where
    B: BackendPool,
    T: Processable<B::Handle>,
{
    let _exit = ExitGuard(&shared.live);

    loop {
        shared.pending.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // Another worker may have taken the task this permit was posted for.
        let Some(task) = shared.queue.pop() else {
            continue;
        };

        let mut handle = BackendGuard::acquire(&*shared.backend);
        run_task(task, &mut *handle);
    }

    let current = thread::current();
    tracing::debug!(worker = current.name().unwrap_or("?"), "worker exiting");
}

#[cfg(feature = "catch-panic")]
fn run_task<T: Processable<H>, H>(task: T, handle: &mut H) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.process(handle)));
    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        tracing::error!(panic = msg, "task panicked; worker continues");
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_task<T: Processable<H>, H>(task: T, handle: &mut H) {
    task.process(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FixedPool, NoBackend};
    use crate::backend::BackendPool as _;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_rejects_zero_threads_or_depth() {
        let zero_threads = ThreadPool::<Job<()>, _>::new(Arc::new(NoBackend), 0, 10);
        assert!(matches!(zero_threads, Err(EtudeError::Config(_))));

        let zero_depth = ThreadPool::<Job<()>, _>::new(Arc::new(NoBackend), 2, 0);
        assert!(matches!(zero_depth, Err(EtudeError::Config(_))));
    }

    #[test]
    fn test_work_queue_is_fifo_and_bounded() {
        let queue = WorkQueue::new(2);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_runs_every_task_with_a_backend_handle() {
        let backend = Arc::new(FixedPool::new(vec![0usize, 0]));
        let pool: ThreadPool<Job<usize>, _> = ThreadPool::new(backend.clone(), 4, 100).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..20 {
            let done = done.clone();
            let tx = tx.clone();
            pool.submit(Box::new(move |uses: &mut usize| {
                *uses += 1;
                done.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..20 {
            rx.recv_timeout(WAIT).unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(pool.shutdown(WAIT));
        assert_eq!(backend.idle(), 2);
        let (a, b) = (backend.acquire(), backend.acquire());
        assert_eq!(a + b, 20);
    }

    #[test]
    fn test_submit_rejects_once_queue_is_full() {
        let pool: ThreadPool<Job<()>, _> = ThreadPool::new(Arc::new(NoBackend), 2, 4).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        // Park both workers so nothing drains the queue.
        for _ in 0..2 {
            let started_tx = started_tx.clone();
            let release_rx = release_rx.clone();
            pool.submit(Box::new(move |_: &mut ()| {
                started_tx.send(()).unwrap();
                let _ = release_rx.lock().recv();
            }))
            .unwrap();
        }
        started_rx.recv_timeout(WAIT).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        for _ in 0..4 {
            assert!(pool.submit(Box::new(|_: &mut ()| {})).is_ok());
        }
        let rejected = pool.submit(Box::new(|_: &mut ()| {})).unwrap_err();
        assert_eq!(rejected.reason(), RejectReason::QueueFull);
        assert_eq!(pool.queued(), 4);

        drop(release_tx);
        assert!(pool.shutdown(WAIT));
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn test_panicking_task_releases_handle_and_worker_survives() {
        let backend = Arc::new(FixedPool::new(vec!["only-conn"]));
        let pool: ThreadPool<Job<&'static str>, _> =
            ThreadPool::new(backend.clone(), 1, 10).unwrap();
        let (tx, rx) = mpsc::channel();

        fn explode(_: &mut &'static str) {
            panic!("boom");
        }

        pool.submit(Box::new(explode)).unwrap();
        pool.submit(Box::new(move |conn: &mut &'static str| {
            tx.send(*conn).unwrap();
        }))
        .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "only-conn");
        assert!(pool.shutdown(WAIT));
        assert_eq!(backend.idle(), 1);
    }

    #[test]
    fn test_shutdown_abandons_queue_and_refuses_new_work() {
        let pool: ThreadPool<Job<()>, _> = ThreadPool::new(Arc::new(NoBackend), 1, 8).unwrap();
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(pool.max_queue_depth(), 8);

        assert!(pool.shutdown(WAIT));
        assert_eq!(pool.running(), 0);

        let rejected = pool.submit(Box::new(|_: &mut ()| {})).unwrap_err();
        assert_eq!(rejected.reason(), RejectReason::ShuttingDown);
    }
}
