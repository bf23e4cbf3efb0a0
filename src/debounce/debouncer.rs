//! Debounce handle and its delayed check.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use super::token::{check_token, register_token, DebounceOutcome, DebounceToken};
use crate::error::{LockgateError, Result};
use crate::lock::{exchange, DistributedLock};

/// Run only the last of a burst of calls, `interval` after it was made.
///
/// Calls on the same key from any process coalesce: each call registers its
/// own token under the key and, once the interval has passed, runs its
/// function only if that token is still the stored one.
#[derive(Clone)]
pub struct Debounce {
    lock: Arc<dyn DistributedLock>,
    key: String,
    interval: Duration,
}

impl Debounce {
    /// Create a debounce for `key` with a quiet period of `interval_ms`.
    pub fn new(lock: Arc<dyn DistributedLock>, key: impl Into<String>, interval_ms: u64) -> Result<Self> {
        if interval_ms < 1 {
            return Err(LockgateError::InvalidConfiguration(
                "Interval must be at least 1ms".to_string(),
            ));
        }

        Ok(Self {
            lock,
            key: key.into(),
            interval: Duration::from_millis(interval_ms),
        })
    }

    /// Register a call and arrange for `f` to run if no later call arrives.
    ///
    /// Returns once the call is registered; the check and `f` run on a
    /// spawned task. Failures are logged rather than returned: a failed
    /// registration schedules nothing, and neither a failed check nor a
    /// failing `f` is retried.
    pub async fn schedule<F, Fut, E>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        match self.register().await {
            Ok(token) => PendingCheck::new(self.clone(), token).spawn(f),
            Err(e) => {
                error!(key = %self.key, error = %e, "Failed to register debounced call");
            }
        }
    }

    /// Make a fresh token the most recent call on the key.
    pub async fn register(&self) -> Result<DebounceToken> {
        let token = DebounceToken::generate();

        exchange(&*self.lock, &self.key, self.interval, move |prior| {
            Ok((register_token(prior, token), ()))
        })
        .await?;

        trace!(key = %self.key, token = %token, "Registered debounced call");
        Ok(token)
    }

    /// Check whether `token` is still the most recent call on the key.
    pub async fn check(&self, token: &DebounceToken) -> Result<DebounceOutcome> {
        let token = *token;

        exchange(&*self.lock, &self.key, self.interval, move |prior| {
            Ok(check_token(prior, token))
        })
        .await
    }

    /// Get the key this debounce coordinates on.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the quiet period.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl std::fmt::Debug for Debounce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debounce")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .finish()
    }
}

/// A registered call waiting out its quiet period.
struct PendingCheck {
    debounce: Debounce,
    token: DebounceToken,
}

impl PendingCheck {
    fn new(debounce: Debounce, token: DebounceToken) -> Self {
        Self { debounce, token }
    }

    /// Run the check on its own task. It cannot be withdrawn.
    fn spawn<F, Fut, E>(self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(self.debounce.interval).await;
            self.run(f).await;
        });
    }

    async fn run<F, Fut, E>(self, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<anyhow::Error>,
    {
        let key = self.debounce.key();

        match self.debounce.check(&self.token).await {
            Ok(DebounceOutcome::Fired) => {
                debug!(key = %key, token = %self.token, "Debounced call firing");
                if let Err(e) = f().await {
                    let e: anyhow::Error = e.into();
                    error!(key = %key, token = %self.token, error = %e, "Debounced call failed");
                }
            }
            Ok(DebounceOutcome::Superseded) => {
                debug!(key = %key, token = %self.token, "Debounced call superseded");
            }
            Err(e) => {
                error!(key = %key, token = %self.token, error = %e, "Error checking debounce key");
            }
        }
    }
}
