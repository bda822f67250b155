//! Fixed-size asynchronous worker pool.
//!
//! A [`WorkerPool`] executes submitted jobs on a fixed set of workers fed by
//! a bounded queue. It supports graceful shutdown (drain the queue, then
//! join), abortive stop (cancel in-flight work, drop queued work), panic
//! isolation per job, and aggregation of job errors.
//!
//! ```rust
//! use bulkhead::{PoolConfig, WorkerPool};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bulkhead::Result<()> {
//! let pool = WorkerPool::new(PoolConfig::new().with_workers(4))?;
//! pool.start()?;
//!
//! pool.submit(|_cancel| async move {
//!     // do the work
//!     Ok(())
//! })
//! .await?;
//!
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Jobs receive the pool's cancellation token; [`stop`] and an expired
//! [`shutdown_with_context`] cancel it, and a job that wants to be abortable
//! must observe it. The `on_error` and panic-handler callbacks run on pool
//! tasks and must not call back into the same pool.
//!
//! [`stop`]: WorkerPool::stop
//! [`shutdown_with_context`]: WorkerPool::shutdown_with_context

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Error, Result};

/// A unit of work: a function of the pool's cancellation token returning an
/// optional error.
pub type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Pool lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    New,
    Running,
    ShuttingDown,
    Stopped,
}

/// Configuration for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Capacity of the bounded job queue.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 100,
        }
    }
}

impl PoolConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the job queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

/// Fixed-size job executor with shutdown and error aggregation.
pub struct WorkerPool {
    config: PoolConfig,
    /// Cancelled on abortive stop; parent of every job's observation point.
    cancel: CancellationToken,
    job_tx: StdMutex<Option<mpsc::Sender<Job>>>,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    error_tx: StdMutex<Option<mpsc::Sender<Error>>>,
    error_rx: StdMutex<Option<mpsc::Receiver<Error>>>,
    errors: Arc<StdMutex<Vec<Error>>>,
    pending: Arc<AtomicUsize>,
    workers: TaskTracker,
    collector: TaskTracker,
    lifecycle: watch::Sender<PoolState>,
    on_error: Option<ErrorCallback>,
    panic_handler: Option<PanicHandler>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.workers < 1 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if config.queue_capacity < 1 {
            return Err(Error::InvalidConfig(
                "queue_capacity must be at least 1".into(),
            ));
        }
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity);
        // Error reporting is bounded to the worker count; a worker may block
        // briefly while reporting under bursty error rates.
        let (error_tx, error_rx) = mpsc::channel(config.workers);
        let (lifecycle, _) = watch::channel(PoolState::New);
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            job_tx: StdMutex::new(Some(job_tx)),
            job_rx: Arc::new(Mutex::new(job_rx)),
            error_tx: StdMutex::new(Some(error_tx)),
            error_rx: StdMutex::new(Some(error_rx)),
            errors: Arc::new(StdMutex::new(Vec::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            workers: TaskTracker::new(),
            collector: TaskTracker::new(),
            lifecycle,
            on_error: None,
            panic_handler: None,
        })
    }

    /// Register a callback invoked for every collected error. Must be set
    /// before [`start`](WorkerPool::start).
    pub fn with_on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Register a handler for job panics. When set, panics are handed to the
    /// handler instead of being recorded as [`Error::WorkerPanic`].
    pub fn with_panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Spawn the workers and the error collector.
    ///
    /// Idempotent while running; returns `Err(PoolShuttingDown)` once
    /// shutdown has begun.
    pub fn start(&self) -> Result<()> {
        let mut started = false;
        self.lifecycle.send_if_modified(|state| {
            if *state == PoolState::New {
                *state = PoolState::Running;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return match *self.lifecycle.borrow() {
                PoolState::Running => Ok(()),
                _ => Err(Error::PoolShuttingDown),
            };
        }

        if let Some(mut error_rx) = lock(&self.error_rx).take() {
            let errors = Arc::clone(&self.errors);
            let on_error = self.on_error.clone();
            self.collector.spawn(async move {
                while let Some(err) = error_rx.recv().await {
                    if let Some(callback) = &on_error {
                        callback(&err);
                    }
                    lock_vec(&errors).push(err);
                }
            });
        }

        let error_tx = lock(&self.error_tx)
            .as_ref()
            .map(|tx| tx.clone());
        for id in 0..self.config.workers {
            if let Some(error_tx) = error_tx.clone() {
                self.workers.spawn(worker_loop(
                    id,
                    Arc::clone(&self.job_rx),
                    self.cancel.clone(),
                    error_tx,
                    Arc::clone(&self.pending),
                    self.panic_handler.clone(),
                ));
            }
        }
        tracing::debug!(workers = self.config.workers, "worker pool started");
        Ok(())
    }

    /// Enqueue a job, blocking while the queue is full.
    ///
    /// Returns `Err(PoolShuttingDown)` once shutdown or stop has begun.
    pub async fn submit<F, Fut>(&self, job: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit_job(Box::new(move |cancel| job(cancel).boxed()))
            .await
    }

    /// Enqueue a job whose execution observes both the pool's cancellation
    /// and the caller's `ctx`; cancellation of `ctx` resolves the job to
    /// `Err(Cancelled)`.
    pub async fn submit_with_context<F, Fut>(&self, ctx: CancellationToken, job: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit_job(Box::new(move |cancel| {
            async move {
                tokio::select! {
                    outcome = job(cancel) => outcome,
                    _ = ctx.cancelled() => Err(Error::Cancelled),
                }
            }
            .boxed()
        }))
        .await
    }

    async fn submit_job(&self, job: Job) -> Result<()> {
        if !matches!(
            *self.lifecycle.borrow(),
            PoolState::New | PoolState::Running
        ) {
            return Err(Error::PoolShuttingDown);
        }
        let sender = match lock(&self.job_tx).as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Error::PoolShuttingDown),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        let sent = tokio::select! {
            sent = sender.send(job) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        };
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::PoolShuttingDown);
        }
        Ok(())
    }

    /// Graceful shutdown: close the queue, let the workers drain it, then
    /// join the workers and the error collector. Idempotent; a concurrent
    /// call waits for the first to finish.
    pub async fn shutdown(&self) -> Result<()> {
        if self.begin_shutdown() {
            self.drain().await;
        } else {
            self.wait_stopped().await;
        }
        Ok(())
    }

    /// Graceful shutdown bounded by `ctx`. If `ctx` fires before the drain
    /// completes, the pool's cancellation token is cancelled (aborting
    /// in-flight jobs that observe it), the workers are still joined, and
    /// `Err(Cancelled)` is returned.
    pub async fn shutdown_with_context(&self, ctx: CancellationToken) -> Result<()> {
        let driver = self.begin_shutdown();
        let wait = async {
            if driver {
                self.drain().await;
            } else {
                self.wait_stopped().await;
            }
        };
        tokio::select! {
            _ = wait => Ok(()),
            _ = ctx.cancelled() => {
                self.cancel.cancel();
                if driver {
                    self.drain().await;
                } else {
                    self.wait_stopped().await;
                }
                Err(Error::Cancelled)
            }
        }
    }

    /// Abortive stop: cancel the pool's token and join the workers without
    /// waiting for queued-but-unstarted jobs. Workers finish the job they
    /// already dequeued; the token is observably cancelled before return.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if self.begin_shutdown() {
            self.drain().await;
        } else {
            self.wait_stopped().await;
        }
        self.pending.store(0, Ordering::SeqCst);
    }

    /// Snapshot of the errors collected so far.
    pub fn errors(&self) -> Vec<Error> {
        lock_vec(&self.errors).clone()
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Configured queue capacity.
    pub fn queue_size(&self) -> usize {
        self.config.queue_capacity
    }

    /// Jobs submitted but not yet dequeued by a worker.
    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        *self.lifecycle.borrow()
    }

    /// Single-shot transition into ShuttingDown; true for the caller that
    /// drives the drain.
    fn begin_shutdown(&self) -> bool {
        self.lifecycle.send_if_modified(|state| {
            if matches!(state, PoolState::New | PoolState::Running) {
                *state = PoolState::ShuttingDown;
                true
            } else {
                false
            }
        })
    }

    async fn drain(&self) {
        // Dropping the queue sender lets workers exit once the queue is
        // empty. Tolerates being re-entered after a dropped first attempt.
        drop(lock(&self.job_tx).take());
        self.workers.close();
        self.workers.wait().await;
        // Workers have joined, so their error sender clones are gone;
        // dropping ours closes the collector's channel.
        drop(lock(&self.error_tx).take());
        self.collector.close();
        self.collector.wait().await;
        self.lifecycle.send_replace(PoolState::Stopped);
        tracing::debug!("worker pool stopped");
    }

    async fn wait_stopped(&self) {
        let mut rx = self.lifecycle.subscribe();
        while *rx.borrow_and_update() != PoolState::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    cancel: CancellationToken,
    error_tx: mpsc::Sender<Error>,
    pending: Arc<AtomicUsize>,
    panic_handler: Option<PanicHandler>,
) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };
        pending.fetch_sub(1, Ordering::SeqCst);

        let token = cancel.clone();
        let outcome = AssertUnwindSafe(async move { job(token).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = error_tx.send(err).await;
            }
            Err(payload) => {
                if let Some(handler) = &panic_handler {
                    handler(payload);
                } else {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(worker = id, %message, "job panicked");
                    let _ = error_tx.send(Error::WorkerPanic { message }).await;
                }
            }
        }
    }
    tracing::debug!(worker = id, "worker exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn lock<T>(mutex: &StdMutex<Option<T>>) -> std::sync::MutexGuard<'_, Option<T>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_vec(mutex: &StdMutex<Vec<Error>>) -> std::sync::MutexGuard<'_, Vec<Error>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
