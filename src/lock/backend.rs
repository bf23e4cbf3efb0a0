//! Lock service trait and the typed state exchange built on it.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::error::{LockgateError, Result};

/// Errors raised by a lock service.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock on {key}")]
    AcquireTimeout { key: String, timeout: Duration },
    #[error("lease of {lease:?} on {key} expired before the state was stored")]
    LeaseExpired { key: String, lease: Duration },
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
    #[error("lock service completed without invoking the mutator for {0}")]
    MutatorSkipped(String),
}

/// Transition applied to a key's stored blob while its lock is held.
///
/// Receives the last stored bytes (or `None` when nothing is stored) and
/// returns the bytes to store. An `Err` must leave the stored blob untouched.
pub type StateMutator<'a> = Box<dyn FnOnce(Option<Vec<u8>>) -> Result<Vec<u8>> + Send + 'a>;

/// Trait for lock service implementations.
///
/// Implementations must guarantee that no two holders of the same key overlap
/// in time, that a lease is released once `lease` has elapsed even if the
/// holder stalls, and that a failing mutator is surfaced to the caller
/// without any partial update.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire `key` for up to `lease`, replace its state with the mutator's
    /// result, and release it.
    async fn with_lock(&self, key: &str, lease: Duration, mutator: StateMutator<'_>) -> Result<()>;
}

/// Run a typed transition over the JSON-encoded state stored under `key`.
///
/// The transition returns the next state together with a value that is
/// handed back to the caller once the state has been stored.
pub async fn exchange<S, R, F>(
    lock: &dyn DistributedLock,
    key: &str,
    lease: Duration,
    transition: F,
) -> Result<R>
where
    S: Serialize + DeserializeOwned,
    R: Send,
    F: FnOnce(Option<S>) -> Result<(S, R)> + Send,
{
    let mut outcome = None;
    let slot = &mut outcome;

    lock.with_lock(
        key,
        lease,
        Box::new(move |prior: Option<Vec<u8>>| {
            let prior = prior
                .map(|bytes| serde_json::from_slice::<S>(&bytes))
                .transpose()
                .map_err(|e| LockgateError::CorruptState(e.to_string()))?;
            let (next, value) = transition(prior)?;
            let encoded = serde_json::to_vec(&next)?;
            *slot = Some(value);
            Ok(encoded)
        }),
    )
    .await?;

    trace!(key = %key, lease_ms = lease.as_millis() as u64, "State exchange complete");

    outcome.ok_or_else(|| LockError::MutatorSkipped(key.to_string()).into())
}
