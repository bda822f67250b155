//! # bulkhead
//!
//! Concurrency and resilience primitives for back-end services: small,
//! independent state machines that interleave time, cancellation, shared
//! state, and cooperating tasks.
//!
//! ## Key Components
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batcher`] | Auto-batcher: buffer items, flush on size or elapsed time |
//! | [`breaker`] | Three-state circuit breaker with timed recovery probes |
//! | [`limiter`] | Token-bucket rate limiter, single-bucket and per-key |
//! | [`pool`] | Fixed-size worker pool with graceful/abortive shutdown |
//! | [`shutdown`] | Shutdown-hook interface for process-wide teardown |
//!
//! The four primitives are independent; compose them as the application
//! requires. Each owns its background tasks and joins them before its
//! `close`/`shutdown`/`stop` returns. Cancellation is propagated with
//! [`tokio_util::sync::CancellationToken`].
//!
//! ## Quick Start
//!
//! ```rust
//! use bulkhead::{PoolConfig, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> bulkhead::Result<()> {
//!     let pool = WorkerPool::new(PoolConfig::new().with_workers(4))?;
//!     pool.start()?;
//!
//!     for i in 0..16 {
//!         pool.submit(move |_cancel| async move {
//!             tracing::info!(job = i, "processing");
//!             Ok(())
//!         })
//!         .await?;
//!     }
//!
//!     pool.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Callbacks registered on a component (state change, on-error, panic
//! handler) run on that component's tasks and must not call back into the
//! same instance.

pub mod batcher;
pub mod breaker;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod shutdown;

pub use batcher::{BatchProcessor, Batcher, BatcherConfig};
pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use error::{Error, Result};
pub use limiter::keyed::KeyedRateLimiter;
pub use limiter::RateLimiter;
pub use pool::{Job, PoolConfig, PoolState, WorkerPool};
pub use shutdown::ShutdownHook;
