//! Per-key rate limiting with idle eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::RateLimiter;
use crate::{Error, Result};

/// Default idle interval after which a key's bucket is evicted.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct Shared<K> {
    rate: f64,
    burst: usize,
    idle_threshold: Duration,
    limiters: Mutex<HashMap<K, Arc<RateLimiter>>>,
}

/// A map of [`RateLimiter`]s keyed by caller identity.
///
/// Buckets are created lazily on first use with the shared rate and burst.
/// A background sweeper evicts buckets that have been idle longer than the
/// idle threshold; a subsequent call on an evicted key starts from a fresh
/// full burst.
///
/// The sweeper stops when [`shutdown`] is called or the limiter is dropped.
///
/// [`shutdown`]: KeyedRateLimiter::shutdown
#[derive(Debug)]
pub struct KeyedRateLimiter<K> {
    shared: Arc<Shared<K>>,
    sweeper_cancel: CancellationToken,
}

impl<K> KeyedRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Create a per-key limiter with the default 10-minute idle threshold.
    pub fn new(rate: f64, burst: usize) -> Result<Self> {
        Self::with_idle_threshold(rate, burst, DEFAULT_IDLE_THRESHOLD)
    }

    /// Create a per-key limiter whose sweeper runs every `idle_threshold`
    /// and evicts buckets untouched for at least that long.
    pub fn with_idle_threshold(rate: f64, burst: usize, idle_threshold: Duration) -> Result<Self> {
        // Validate once; per-key buckets reuse the checked parameters.
        let _probe = RateLimiter::new(rate, burst)?;
        if idle_threshold.is_zero() {
            return Err(Error::InvalidConfig(
                "idle_threshold must be positive".into(),
            ));
        }

        let shared = Arc::new(Shared {
            rate,
            burst,
            idle_threshold,
            limiters: Mutex::new(HashMap::new()),
        });
        let sweeper_cancel = CancellationToken::new();

        tokio::spawn(sweep_loop(Arc::downgrade(&shared), sweeper_cancel.clone()));

        Ok(Self {
            shared,
            sweeper_cancel,
        })
    }

    /// Try to consume one token for `key` without waiting.
    pub async fn allow(&self, key: &K) -> bool {
        self.limiter_for(key).await.allow().await
    }

    /// Consume one token for `key`, sleeping until one is available or
    /// `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken, key: &K) -> Result<()> {
        self.limiter_for(key).await.wait(cancel).await
    }

    /// Number of keys currently tracked.
    pub async fn len(&self) -> usize {
        self.shared.limiters.lock().await.len()
    }

    /// True when no keys are tracked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop the background sweeper. Existing buckets keep working; they are
    /// simply no longer evicted. Called automatically on drop.
    pub fn shutdown(&self) {
        self.sweeper_cancel.cancel();
    }

    async fn limiter_for(&self, key: &K) -> Arc<RateLimiter> {
        let mut limiters = self.shared.limiters.lock().await;
        // The map lock arbitrates the creation race: one winner per key.
        Arc::clone(
            limiters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RateLimiter::unchecked(self.shared.rate, self.shared.burst))),
        )
    }
}

impl<K> Drop for KeyedRateLimiter<K> {
    fn drop(&mut self) {
        self.sweeper_cancel.cancel();
    }
}

async fn sweep_loop<K>(shared: Weak<Shared<K>>, cancel: CancellationToken)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    let period = match shared.upgrade() {
        Some(shared) => shared.idle_threshold,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it so a fresh map is not
    // swept before anything could go idle.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(shared) = shared.upgrade() else { return };
        let mut limiters = shared.limiters.lock().await;
        let mut idle_keys = Vec::new();
        for (key, limiter) in limiters.iter() {
            // Briefly locks the bucket; another task may be refilling it.
            if limiter.idle_for().await >= shared.idle_threshold {
                idle_keys.push(key.clone());
            }
        }
        if !idle_keys.is_empty() {
            tracing::debug!(evicted = idle_keys.len(), "evicting idle rate limiter keys");
            for key in idle_keys {
                limiters.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyed_limiter_rejects_zero_idle_threshold() {
        let err =
            KeyedRateLimiter::<u32>::with_idle_threshold(10.0, 1, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_keyed_limiter_independent_buckets() {
        let limiter: KeyedRateLimiter<&str> = KeyedRateLimiter::new(1.0, 2).unwrap();

        assert!(limiter.allow(&"a").await);
        assert!(limiter.allow(&"a").await);
        assert!(!limiter.allow(&"a").await);

        // Key "b" has its own full bucket.
        assert!(limiter.allow(&"b").await);
        assert_eq!(limiter.len().await, 2);
    }

    #[tokio::test]
    async fn test_keyed_limiter_concurrent_creation_single_bucket() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let limiter = Arc::new(KeyedRateLimiter::<String>::new(0.01, 10).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for key in ["a", "b", "c"] {
            for _ in 0..20 {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                let key = key.to_string();
                handles.push(tokio::spawn(async move {
                    if limiter.allow(&key).await {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        // Exactly burst admissions per key; losers of the creation race must
        // not have produced extra buckets.
        assert_eq!(admitted.load(Ordering::SeqCst), 30);
        assert_eq!(limiter.len().await, 3);
    }

    #[tokio::test]
    async fn test_keyed_limiter_evicts_idle_keys() {
        let limiter: KeyedRateLimiter<&str> =
            KeyedRateLimiter::with_idle_threshold(100.0, 1, Duration::from_millis(50)).unwrap();

        assert!(limiter.allow(&"stale").await);
        assert_eq!(limiter.len().await, 1);

        // Two sweep periods with no activity.
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert_eq!(limiter.len().await, 0);

        // A fresh bucket starts from a full burst.
        assert!(limiter.allow(&"stale").await);
    }

    #[tokio::test]
    async fn test_keyed_limiter_active_keys_survive_sweep() {
        let limiter: KeyedRateLimiter<&str> =
            KeyedRateLimiter::with_idle_threshold(1000.0, 5, Duration::from_millis(60)).unwrap();

        for _ in 0..5 {
            limiter.allow(&"busy").await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        // Touched more recently than the threshold on every sweep.
        assert_eq!(limiter.len().await, 1);
    }

    #[tokio::test]
    async fn test_keyed_limiter_wait_delegates() {
        let limiter: KeyedRateLimiter<u32> = KeyedRateLimiter::new(100.0, 1).unwrap();
        let cancel = CancellationToken::new();

        limiter.wait(&cancel, &7).await.unwrap();
        // Bucket drained; the second wait has to sleep for the refill.
        let start = std::time::Instant::now();
        limiter.wait(&cancel, &7).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_keyed_limiter_shutdown_stops_sweeper() {
        let limiter: KeyedRateLimiter<&str> =
            KeyedRateLimiter::with_idle_threshold(100.0, 1, Duration::from_millis(30)).unwrap();

        assert!(limiter.allow(&"k").await);
        limiter.shutdown();

        // Idle well past the threshold, but no sweeper remains to evict.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.len().await, 1);
    }
}
