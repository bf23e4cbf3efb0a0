//! Throttle handle shared by every caller of a key.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::configuration::ThrottleConfiguration;
use super::state::ThrottleState;
use crate::clock::{Clock, SystemClock};
use crate::error::{LockgateError, Result};
use crate::lock::{exchange, DistributedLock};

/// At most `executions` calls per rolling interval for a key.
///
/// The handle holds only the lock service, the key and an immutable
/// configuration; the window itself lives under the key in the lock
/// service. Any number of handles, in any number of processes, that use the
/// same key and configuration share one budget.
#[derive(Clone)]
pub struct Throttle {
    lock: Arc<dyn DistributedLock>,
    key: String,
    config: ThrottleConfiguration,
    clock: Arc<dyn Clock>,
}

impl Throttle {
    /// Create a throttle for `key` using the system clock.
    ///
    /// Nothing is read from the lock service until the first attempt.
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        key: impl Into<String>,
        config: ThrottleConfiguration,
    ) -> Result<Self> {
        Self::with_clock(lock, key, config, Arc::new(SystemClock))
    }

    /// Create a throttle that reads time from `clock`.
    pub fn with_clock(
        lock: Arc<dyn DistributedLock>,
        key: impl Into<String>,
        config: ThrottleConfiguration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lock,
            key: key.into(),
            config,
            clock,
        })
    }

    /// Run `f` if the window has room.
    ///
    /// Returns `Ok(true)` when `f` ran and succeeded, `Ok(false)` when the
    /// attempt was throttled. A permitted attempt consumes its slot before
    /// `f` runs, so an `f` that fails still counts against the budget; its
    /// error is returned as [`LockgateError::Execution`]. `f` runs after the
    /// key's lock has been released.
    pub async fn attempt<F, Fut, E>(&self, f: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<anyhow::Error>,
    {
        let permitted = self.decide().await?;

        if permitted {
            f().await.map_err(|e| {
                let error: anyhow::Error = e.into();
                warn!(key = %self.key, error = %error, "Throttled execution failed");
                LockgateError::Execution(error)
            })?;
        }

        Ok(permitted)
    }

    /// Count the executions the window would permit right now.
    pub async fn remaining(&self) -> Result<u64> {
        let config = self.config;
        let now = self.clock.now_ms();

        exchange(&*self.lock, &self.key, self.lease(), move |prior| {
            ThrottleState::inspect(prior, &config, now)
        })
        .await
    }

    /// Record one attempt under the key's lock.
    async fn decide(&self) -> Result<bool> {
        let config = self.config;
        let clock = Arc::clone(&self.clock);
        let key = self.key.as_str();

        let permitted = exchange(&*self.lock, key, self.lease(), move |prior| {
            if prior.is_none() {
                debug!(key = %key, config = %config, "Creating throttle window");
            }
            // Read the clock only once the lock is held.
            ThrottleState::transition(prior, &config, clock.now_ms())
        })
        .await
        .map_err(|e| {
            if let LockgateError::ConfigurationMismatch { .. } = e {
                warn!(key = %self.key, error = %e, "Throttle configuration disagrees with stored window");
            }
            e
        })?;

        if permitted {
            trace!(key = %self.key, "Throttle attempt permitted");
        } else {
            debug!(key = %self.key, config = %self.config, "Throttle limit reached");
        }

        Ok(permitted)
    }

    /// Get the key this throttle coordinates on.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the configuration.
    pub fn configuration(&self) -> ThrottleConfiguration {
        self.config
    }

    /// Lease held for each decision.
    pub fn lease(&self) -> Duration {
        self.config.lease()
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::{InMemoryLock, LockError, StateMutator};
    use crate::throttle::{per_minute, per_second};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const T0: i64 = 1_700_000_000_000;

    fn test_lock() -> Arc<InMemoryLock> {
        Arc::new(InMemoryLock::new())
    }

    fn throttle_on(
        lock: &Arc<InMemoryLock>,
        key: &str,
        config: ThrottleConfiguration,
        clock: &Arc<ManualClock>,
    ) -> Throttle {
        Throttle::with_clock(lock.clone(), key, config, clock.clone()).unwrap()
    }

    fn counting(calls: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<anyhow::Result<()>> {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    /// A lock service that cannot be reached.
    struct UnreachableLock;

    #[async_trait]
    impl DistributedLock for UnreachableLock {
        async fn with_lock(&self, _key: &str, _lease: Duration, _mutator: StateMutator<'_>) -> Result<()> {
            Err(LockError::Unavailable("connection refused".to_string()).into())
        }
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let lock: Arc<dyn DistributedLock> = test_lock();

        let zero_executions = Throttle::new(lock.clone(), "key", ThrottleConfiguration::new(0, 1_000));
        assert!(matches!(zero_executions, Err(LockgateError::InvalidConfiguration(_))));

        let zero_interval = Throttle::new(lock, "key", ThrottleConfiguration::new(1, 0));
        assert!(matches!(zero_interval, Err(LockgateError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_construction_does_not_touch_lock() {
        let lock = test_lock();
        let _throttle = Throttle::new(lock.clone(), "key", per_second(2, 1)).unwrap();
        assert_eq!(lock.key_count(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_attempts() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "burst", per_second(2, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(throttle.attempt(counting(&calls)).await.unwrap());
        }

        assert_eq!(results, vec![true, true, false]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_window_rolls_forward() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "rolling", per_second(2, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        assert!(!throttle.attempt(counting(&calls)).await.unwrap());

        clock.advance(Duration::from_millis(1_100));

        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_partial_window_roll() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "partial", per_second(2, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        clock.advance(Duration::from_millis(500));
        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        clock.advance(Duration::from_millis(600));

        // The first slot has left the window, the second has not.
        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        assert!(!throttle.attempt(counting(&calls)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_share_budget() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "concurrent", per_second(2, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let results =
            futures::future::join_all((0..5).map(|_| throttle.attempt(counting(&calls)))).await;

        let permitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(permitted, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handles_on_same_key_share_budget() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let first = throttle_on(&lock, "shared", per_second(2, 1), &clock);
        let second = throttle_on(&lock, "shared", per_second(2, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let attempts = (0..5)
            .map(|_| first.attempt(counting(&calls)))
            .chain((0..5).map(|_| second.attempt(counting(&calls))));
        let results = futures::future::join_all(attempts).await;

        let permitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(permitted, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_configuration_mismatch() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let original = throttle_on(&lock, "mismatch", per_second(2, 1), &clock);
        let conflicting = throttle_on(&lock, "mismatch", per_second(3, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(original.attempt(counting(&calls)).await.unwrap());
        let stored = lock.snapshot("mismatch").await;

        let result = conflicting.attempt(counting(&calls)).await;
        assert!(matches!(result, Err(LockgateError::ConfigurationMismatch { .. })));
        assert!(result.unwrap_err().to_string().contains("Configuration mismatch"));

        // Nothing ran and the stored window is untouched.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(lock.snapshot("mismatch").await, stored);

        // The original handle keeps its budget.
        assert!(original.attempt(counting(&calls)).await.unwrap());
        assert!(!original.attempt(counting(&calls)).await.unwrap());
    }

    #[tokio::test]
    async fn test_interval_mismatch() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let per_sec = throttle_on(&lock, "interval", per_second(2, 1), &clock);
        let per_min = throttle_on(&lock, "interval", per_minute(2, 1), &clock);

        tokio_test::assert_ok!(per_sec.remaining().await);
        tokio_test::assert_err!(per_min.remaining().await);
    }

    #[tokio::test]
    async fn test_failed_execution_consumes_slot() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "failing", per_second(1, 1), &clock);

        let result = throttle
            .attempt(|| async { Err::<(), _>(anyhow::anyhow!("Test error")) })
            .await;

        match result {
            Err(LockgateError::Execution(e)) => assert_eq!(e.to_string(), "Test error"),
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(throttle.remaining().await.unwrap(), 0);
        let executed = throttle
            .attempt(|| async { Ok::<(), anyhow::Error>(()) })
            .await
            .unwrap();
        assert!(!executed);
    }

    #[tokio::test]
    async fn test_remaining_tracks_budget() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "remaining", per_second(3, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(throttle.remaining().await.unwrap(), 3);
        throttle.attempt(counting(&calls)).await.unwrap();
        throttle.attempt(counting(&calls)).await.unwrap();
        assert_eq!(throttle.remaining().await.unwrap(), 1);

        clock.advance(Duration::from_millis(1_001));
        assert_eq!(throttle.remaining().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_long_execution_does_not_block_decisions() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "long", per_second(2, 1), &clock);
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        let slow = {
            let throttle = throttle.clone();
            let release = release.clone();
            let started = started.clone();
            tokio::spawn(async move {
                throttle
                    .attempt(|| async move {
                        started.notify_one();
                        release.notified().await;
                        Ok::<(), anyhow::Error>(())
                    })
                    .await
            })
        };

        started.notified().await;

        // The slow execution is still running; decisions keep flowing.
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(throttle.attempt(counting(&calls)).await.unwrap());
        assert!(!throttle.attempt(counting(&calls)).await.unwrap());
        assert!(!slow.is_finished());

        release.notify_one();
        assert!(slow.await.unwrap().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_failure_propagates() {
        let throttle = Throttle::new(Arc::new(UnreachableLock), "key", per_second(2, 1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = throttle.attempt(counting(&calls)).await;

        assert!(matches!(
            result,
            Err(LockgateError::Lock(LockError::Unavailable(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fresh_keys_repeat_outcomes() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut runs = Vec::new();
        for key in ["run-a", "run-b"] {
            let throttle = throttle_on(&lock, key, per_second(2, 1), &clock);
            let mut outcomes = Vec::new();
            for _ in 0..3 {
                outcomes.push(throttle.attempt(counting(&calls)).await.unwrap());
            }
            runs.push(outcomes);
        }

        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[0], vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_high_rate_window_permits_attempts() {
        // Encoding a 200k-slot ring can outlast its 1ms lease.
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "firehose", per_second(200_000, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(throttle.lease(), Duration::from_millis(1));

        for _ in 0..5 {
            assert!(throttle.attempt(counting(&calls)).await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(throttle.remaining().await.unwrap(), 199_995);
    }

    #[tokio::test]
    async fn test_oversized_window_fails_attempt() {
        let lock = test_lock();
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = throttle_on(&lock, "huge", per_second(1 << 62, 1), &clock);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = throttle.attempt(counting(&calls)).await;

        assert!(matches!(result, Err(LockgateError::InvalidConfiguration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(lock.snapshot("huge").await.is_none());
    }
}
