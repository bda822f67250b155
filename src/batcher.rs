//! Automatic batching of items with size and time triggers.
//!
//! A [`Batcher`] accumulates items and hands them to a caller-supplied
//! [`BatchProcessor`] when either the batch reaches `max_size` or `max_wait`
//! has elapsed since the batch started filling. Dispatch happens on a
//! background task, so `add` never blocks on the processor.
//!
//! ```rust
//! use bulkhead::{Batcher, BatcherConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bulkhead::Result<()> {
//! let batcher = Batcher::new(
//!     |_cancel, items: Vec<u32>| async move {
//!         println!("processing {} items", items.len());
//!         Ok(())
//!     },
//!     BatcherConfig::new()
//!         .with_max_size(50)
//!         .with_max_wait(Duration::from_millis(200)),
//! )?;
//!
//! batcher.add(1).await?;
//! batcher.add(2).await?;
//! batcher.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Processor errors are captured and logged, not surfaced through `add`; a
//! processor that needs its errors observed must record them itself. The
//! processor must not call `flush` or `close` on its own batcher: `close`
//! waits for every in-flight processor invocation, so a reentrant call
//! deadlocks the drain.

use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Error, Result};

/// Caller-supplied handler for dispatched batches.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process(&self, cancel: &CancellationToken, items: Vec<T>) -> Result<()>;
}

#[async_trait]
impl<T, F, Fut> BatchProcessor<T> for F
where
    T: Send + 'static,
    F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn process(&self, cancel: &CancellationToken, items: Vec<T>) -> Result<()> {
        self(cancel.clone(), items).await
    }
}

/// Configuration for [`Batcher`].
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Batch size that triggers an immediate dispatch.
    pub max_size: usize,
    /// Longest an item may sit in the buffer before a time-triggered dispatch.
    pub max_wait: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_wait: Duration::from_secs(1),
        }
    }
}

impl BatcherConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size trigger.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the time trigger.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

struct Buffer<T> {
    items: Vec<T>,
    /// At most one pending wake; aborted by any dispatch.
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner<T> {
    config: BatcherConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    cancel: CancellationToken,
    /// Tracks in-flight processor invocations; `close` joins it.
    dispatches: TaskTracker,
    buffer: Mutex<Buffer<T>>,
}

/// Accumulates items and dispatches them in batches.
pub struct Batcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Create a batcher with the given processor and thresholds.
    pub fn new<P>(processor: P, config: BatcherConfig) -> Result<Self>
    where
        P: BatchProcessor<T> + 'static,
    {
        if config.max_size < 1 {
            return Err(Error::InvalidConfig("max_size must be at least 1".into()));
        }
        if config.max_wait.is_zero() {
            return Err(Error::InvalidConfig("max_wait must be positive".into()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                processor: Arc::new(processor),
                cancel: CancellationToken::new(),
                dispatches: TaskTracker::new(),
                buffer: Mutex::new(Buffer {
                    items: Vec::new(),
                    timer: None,
                    closed: false,
                }),
            }),
        })
    }

    /// Append an item.
    ///
    /// Reaching `max_size` dispatches the batch immediately; otherwise a wake
    /// is scheduled `max_wait` ahead if none is pending. Returns
    /// `Err(BatcherClosed)` after [`close`](Batcher::close).
    pub async fn add(&self, item: T) -> Result<()> {
        let mut buf = self.inner.buffer.lock().await;
        if buf.closed {
            return Err(Error::BatcherClosed);
        }
        buf.items.push(item);
        if buf.items.len() >= self.inner.config.max_size {
            self.inner.dispatch_locked(&mut buf);
        } else if buf.timer.is_none() {
            buf.timer = Some(self.spawn_timer());
        }
        Ok(())
    }

    /// Dispatch whatever is buffered right now. No-op when empty.
    pub async fn flush(&self) {
        let mut buf = self.inner.buffer.lock().await;
        self.inner.dispatch_locked(&mut buf);
    }

    /// Flush pending items, refuse further adds, and wait for every
    /// in-flight processor invocation to return. Idempotent.
    pub async fn close(&self) {
        {
            let mut buf = self.inner.buffer.lock().await;
            if !buf.closed {
                self.inner.dispatch_locked(&mut buf);
                buf.closed = true;
            }
        }
        self.inner.dispatches.close();
        self.inner.dispatches.wait().await;
    }

    /// Number of currently buffered items.
    pub async fn size(&self) -> usize {
        self.inner.buffer.lock().await.items.len()
    }

    /// True once [`close`](Batcher::close) has begun.
    pub async fn is_closed(&self) -> bool {
        self.inner.buffer.lock().await.closed
    }

    fn spawn_timer(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let max_wait = self.inner.config.max_wait;
        tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            let Some(inner) = Weak::upgrade(&inner) else { return };
            let mut buf = inner.buffer.lock().await;
            buf.timer = None;
            inner.dispatch_locked(&mut buf);
        })
    }
}

impl<T: Send + 'static> Inner<T> {
    /// Snapshot and clear the buffer, cancel the pending wake, and run the
    /// processor on a tracked background task.
    fn dispatch_locked(&self, buf: &mut Buffer<T>) {
        if let Some(timer) = buf.timer.take() {
            timer.abort();
        }
        if buf.items.is_empty() {
            return;
        }
        let batch = mem::take(&mut buf.items);
        let processor = Arc::clone(&self.processor);
        let cancel = self.cancel.clone();
        self.dispatches.spawn(async move {
            if let Err(err) = processor.process(&cancel, batch).await {
                // Background semantics: observed, not propagated.
                tracing::warn!(error = %err, "batch processor failed");
            }
        });
    }
}
