//! Token-bucket rate limiting.
//!
//! # Rate Limiter Module
//!
//! This module provides throughput control using the token bucket algorithm:
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RateLimiter`] | Single-bucket limiter with non-blocking and waiting acquisition |
//! | [`keyed::KeyedRateLimiter`] | Per-key limiter map with background idle eviction |
//!
//! ## Example
//!
//! ```rust
//! use bulkhead::RateLimiter;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bulkhead::Result<()> {
//! let limiter = RateLimiter::new(10.0, 5)?; // 10 tokens/sec, burst of 5
//!
//! if limiter.allow().await {
//!     // proceed with the operation
//! }
//! # Ok(())
//! # }
//! ```

pub mod keyed;

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[derive(Debug)]
struct Bucket {
    /// Tokens per second.
    rate: f64,
    /// Maximum number of tokens the bucket can hold.
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Credit elapsed time at the current rate, saturating at `burst`.
    /// Every public method applies this before reading the balance.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.last_refill = now;
    }
}

/// Token-bucket rate limiter.
///
/// Tokens accrue continuously at `rate` per second up to `burst`. [`allow`]
/// never blocks; [`wait`] suspends until a token is available or the caller's
/// cancellation token fires.
///
/// [`allow`]: RateLimiter::allow
/// [`wait`]: RateLimiter::wait
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with `rate` tokens per second and a capacity of
    /// `burst` tokens. The bucket starts full.
    pub fn new(rate: f64, burst: usize) -> Result<Self> {
        validate(rate, burst)?;
        Ok(Self::unchecked(rate, burst))
    }

    /// Constructor for pre-validated parameters (used by the keyed limiter).
    pub(crate) fn unchecked(rate: f64, burst: usize) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                burst: burst as f64,
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume one token without waiting. Returns `true` if admitted.
    pub async fn allow(&self) -> bool {
        let mut b = self.bucket.lock().await;
        b.refill();
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Consume one token, sleeping until one is available.
    ///
    /// The projected wait is recomputed after every sleep, so concurrent
    /// consumers and rate changes are observed. Returns `Err(Cancelled)` if
    /// `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut b = self.bucket.lock().await;
                b.refill();
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - b.tokens) / b.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Unconditionally consume one token and return how long the caller must
    /// sleep for the consumption to be within rate.
    ///
    /// Returns `Duration::ZERO` when a whole token was available; otherwise
    /// the fractional balance is consumed down to zero and the returned
    /// duration covers the deficit. Because the consumption is unconditional,
    /// repeated reservations queue sequentially in real time.
    pub async fn reserve(&self) -> Duration {
        let mut b = self.bucket.lock().await;
        b.refill();
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - b.tokens;
            b.tokens = 0.0;
            Duration::from_secs_f64(deficit / b.rate)
        }
    }

    /// Current (possibly fractional) token balance after refill.
    pub async fn tokens(&self) -> f64 {
        let mut b = self.bucket.lock().await;
        b.refill();
        b.tokens
    }

    /// Replace the refill rate. Elapsed time is credited at the old rate
    /// first; already-accrued tokens are not re-priced.
    pub async fn set_rate(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "rate must be positive and finite, got {rate}"
            )));
        }
        let mut b = self.bucket.lock().await;
        b.refill();
        b.rate = rate;
        Ok(())
    }

    /// Replace the burst capacity, clamping the current balance if it now
    /// exceeds the new capacity.
    pub async fn set_burst(&self, burst: usize) -> Result<()> {
        if burst < 1 {
            return Err(Error::InvalidConfig("burst must be at least 1".into()));
        }
        let mut b = self.bucket.lock().await;
        b.refill();
        b.burst = burst as f64;
        if b.tokens > b.burst {
            b.tokens = b.burst;
        }
        Ok(())
    }

    /// Time since the last refill, i.e. since the last call touching this
    /// limiter. Used by the keyed limiter's idle sweep.
    pub(crate) async fn idle_for(&self) -> Duration {
        let b = self.bucket.lock().await;
        b.last_refill.elapsed()
    }
}

fn validate(rate: f64, burst: usize) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::InvalidConfig(format!(
            "rate must be positive and finite, got {rate}"
        )));
    }
    if burst < 1 {
        return Err(Error::InvalidConfig("burst must be at least 1".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_rejects_invalid_params() {
        assert!(RateLimiter::new(0.0, 5).is_err());
        assert!(RateLimiter::new(-1.0, 5).is_err());
        assert!(RateLimiter::new(f64::NAN, 5).is_err());
        assert!(RateLimiter::new(f64::INFINITY, 5).is_err());
        assert!(RateLimiter::new(10.0, 0).is_err());
    }

    #[tokio::test]
    async fn test_limiter_burst_then_denied() {
        let limiter = RateLimiter::new(10.0, 5).unwrap();

        for _ in 0..5 {
            assert!(limiter.allow().await);
        }
        assert!(!limiter.allow().await);

        // One token refills in 100ms at rate 10.
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
    }

    #[tokio::test]
    async fn test_limiter_tokens_saturate_at_burst() {
        let limiter = RateLimiter::new(1000.0, 3).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tokens = limiter.tokens().await;
        assert!(tokens <= 3.0, "balance {tokens} exceeded burst");
    }

    #[tokio::test]
    async fn test_limiter_wait_succeeds_after_refill() {
        let limiter = RateLimiter::new(50.0, 1).unwrap();
        let cancel = CancellationToken::new();

        assert!(limiter.allow().await);
        // Bucket is empty; wait should sleep ~20ms and then admit.
        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_limiter_wait_cancelled() {
        let limiter = RateLimiter::new(0.1, 1).unwrap();
        let cancel = CancellationToken::new();

        assert!(limiter.allow().await);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        // Next token is 10 seconds away; cancellation must win.
        let err = limiter.wait(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_limiter_reserve_consumes_unconditionally() {
        let limiter = RateLimiter::new(10.0, 1).unwrap();

        assert_eq!(limiter.reserve().await, Duration::ZERO);

        // Bucket empty: reservation returns the deficit at 10/sec.
        let wait = limiter.reserve().await;
        assert!(wait > Duration::from_millis(50));
        assert!(wait <= Duration::from_millis(110));

        // Fractional balance was consumed to zero.
        assert!(limiter.tokens().await < 0.1);
    }

    #[tokio::test]
    async fn test_limiter_set_rate_credits_old_rate_first() {
        let limiter = RateLimiter::new(100.0, 10).unwrap();
        for _ in 0..10 {
            assert!(limiter.allow().await);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        // ~5 tokens accrued at the old rate; the new rate must not erase them.
        limiter.set_rate(1.0).await.unwrap();
        let tokens = limiter.tokens().await;
        assert!(tokens >= 2.0, "expected old-rate credit, got {tokens}");
    }

    #[tokio::test]
    async fn test_limiter_set_burst_clamps_balance() {
        let limiter = RateLimiter::new(10.0, 10).unwrap();
        limiter.set_burst(2).await.unwrap();
        assert!(limiter.tokens().await <= 2.0);

        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
    }

    #[tokio::test]
    async fn test_limiter_admissions_bounded_by_rate() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(100.0, 10).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if limiter.allow().await {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // burst + ceil(rate * T) with T generously bounded at one second.
        assert!(admitted.load(Ordering::SeqCst) <= 110);
    }
}
