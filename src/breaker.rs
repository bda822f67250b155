//! Circuit breaker for failure isolation.
//!
//! The breaker gates calls through a three-state machine:
//!
//! - **Closed**: normal operation; consecutive failures are counted.
//! - **Open**: the failure threshold was reached; calls fail fast until the
//!   recovery timeout elapses.
//! - **Half-Open**: a bounded number of probe calls test recovery; enough
//!   successes close the breaker, any failure re-opens it.
//!
//! ```rust
//! use bulkhead::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_max_failures(3)
//!         .with_timeout(Duration::from_secs(30)),
//! );
//!
//! let result = breaker.execute(|| async { Ok::<_, bulkhead::Error>(42) }).await;
//! # let _ = result;
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Observable breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed mode that open the breaker.
    pub max_failures: u32,
    /// How long the breaker stays open before admitting probes.
    pub timeout: Duration,
    /// Probe capacity in Half-Open mode; also the number of consecutive
    /// probe successes required to close.
    pub max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
            max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold (clamped to at least 1).
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Set the open-state recovery timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the half-open probe capacity (clamped to at least 1).
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests.max(1);
        self
    }
}

type StateChangeCallback = Box<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug)]
struct Shared {
    state: BreakerState,
    /// Bumped on every transition; outcomes recorded against a stale
    /// generation are discarded.
    generation: u64,
    consecutive_failures: u32,
    half_open_requests: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Shared {
    fn transition(&mut self, to: BreakerState) -> (BreakerState, BreakerState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        match to {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
                self.half_open_requests = 0;
                self.half_open_successes = 0;
                self.opened_at = None;
            }
            BreakerState::Open => {
                self.half_open_requests = 0;
                self.half_open_successes = 0;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::HalfOpen => {
                self.half_open_requests = 0;
                self.half_open_successes = 0;
                self.opened_at = None;
            }
        }
        (from, to)
    }
}

/// Three-state circuit breaker.
///
/// Admission and outcome bookkeeping are serialized by an internal mutex; the
/// wrapped action itself runs with the lock released. The optional
/// state-change callback is invoked after the lock is released and must not
/// re-enter the same breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    shared: Mutex<Shared>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(Shared {
                state: BreakerState::Closed,
                generation: 0,
                consecutive_failures: 0,
                half_open_requests: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            on_state_change: None,
        }
    }

    /// Register a callback fired on every state transition with the
    /// `(from, to)` pair. The callback must be cheap and must not call back
    /// into this breaker.
    pub fn with_on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    /// Gate `action` through the breaker.
    ///
    /// Returns the action's outcome when admitted, `Err(CircuitOpen)` while
    /// the breaker is open, or `Err(TooManyProbes)` when half-open probe
    /// capacity is exhausted.
    pub async fn execute<F, Fut, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.admit()?;
        let outcome = action().await;
        match &outcome {
            Ok(_) => self.record_success(generation),
            Err(_) => self.record_failure(generation),
        }
        outcome
    }

    /// Current mode. Performs the lazy Open to Half-Open transition when the
    /// recovery timeout has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut shared = self.lock();
        let change = self.maybe_enter_half_open(&mut shared);
        let state = shared.state;
        drop(shared);
        self.notify(change);
        state
    }

    /// Current consecutive-failure count.
    pub fn failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Force the breaker Closed and clear all counters.
    pub fn reset(&self) {
        let mut shared = self.lock();
        let change = if shared.state != BreakerState::Closed {
            Some(shared.transition(BreakerState::Closed))
        } else {
            shared.consecutive_failures = 0;
            None
        };
        drop(shared);
        self.notify(change);
    }

    /// Decide admission; returns the generation the outcome must be recorded
    /// against.
    fn admit(&self) -> Result<u64> {
        let mut shared = self.lock();
        let change = self.maybe_enter_half_open(&mut shared);

        let decision = match shared.state {
            BreakerState::Closed => Ok(shared.generation),
            BreakerState::Open => Err(Error::CircuitOpen),
            BreakerState::HalfOpen => {
                if shared.half_open_requests < self.config.max_requests {
                    shared.half_open_requests += 1;
                    Ok(shared.generation)
                } else {
                    Err(Error::TooManyProbes)
                }
            }
        };
        drop(shared);
        self.notify(change);
        decision
    }

    fn record_success(&self, generation: u64) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        let change = match shared.state {
            BreakerState::Closed => {
                shared.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                shared.half_open_successes += 1;
                if shared.half_open_successes >= self.config.max_requests {
                    Some(shared.transition(BreakerState::Closed))
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        };
        drop(shared);
        self.notify(change);
    }

    fn record_failure(&self, generation: u64) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        let change = match shared.state {
            BreakerState::Closed => {
                shared.consecutive_failures += 1;
                if shared.consecutive_failures >= self.config.max_failures {
                    Some(shared.transition(BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => Some(shared.transition(BreakerState::Open)),
            BreakerState::Open => None,
        };
        drop(shared);
        self.notify(change);
    }

    /// Lazy Open to Half-Open transition, performed under the exclusive lock.
    fn maybe_enter_half_open(
        &self,
        shared: &mut Shared,
    ) -> Option<(BreakerState, BreakerState)> {
        if shared.state == BreakerState::Open {
            if let Some(opened_at) = shared.opened_at {
                if opened_at.elapsed() > self.config.timeout {
                    return Some(shared.transition(BreakerState::HalfOpen));
                }
            }
        }
        None
    }

    fn notify(&self, change: Option<(BreakerState, BreakerState)>) {
        if let Some((from, to)) = change {
            tracing::debug!(%from, %to, "circuit breaker state change");
            if let Some(callback) = &self.on_state_change {
                callback(from, to);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
