//! Shutdown-hook interface.
//!
//! A process-wide shutdown dispatcher runs a list of hooks in order under a
//! global timeout. This crate only defines the hook surface; [`WorkerPool`]
//! implements it with [`WorkerPool::shutdown_with_context`] as the canonical
//! callback.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pool::WorkerPool;
use crate::Result;

/// A shutdown callback: drain or release resources, observing `ctx` as the
/// dispatcher's deadline.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn shutdown(&self, ctx: CancellationToken) -> Result<()>;
}

#[async_trait]
impl ShutdownHook for WorkerPool {
    async fn shutdown(&self, ctx: CancellationToken) -> Result<()> {
        self.shutdown_with_context(ctx).await
    }
}
