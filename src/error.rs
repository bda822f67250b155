use thiserror::Error;

/// Unified error type for all bulkhead primitives.
///
/// Each component substitutes its own rejection kinds when gating; errors
/// produced by caller-supplied actions and jobs pass through unchanged
/// wherever the contract says so.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The circuit breaker is open; the action was not invoked.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The circuit breaker is half-open and its probe capacity is exhausted.
    #[error("circuit breaker is half-open with too many in-flight probes")]
    TooManyProbes,

    /// Submit was called after pool shutdown began.
    #[error("worker pool is shutting down")]
    PoolShuttingDown,

    /// A job panicked inside a worker; the panic payload is carried as text.
    #[error("worker panic: {message}")]
    WorkerPanic { message: String },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Add was called on a closed batcher.
    #[error("batcher is closed")]
    BatcherClosed,

    /// A constructor was given a parameter outside its valid domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error produced by a caller-supplied action, job, or processor.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an arbitrary caller-side failure message.
    pub fn other(message: impl Into<String>) -> Self {
        Error::Other(message.into())
    }

    /// True when the error is a cancellation (as opposed to a component
    /// rejection or an action failure).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
