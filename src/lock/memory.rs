//! In-process lock service.
//!
//! Serializes holders of a key with a per-key async mutex. Useful when every
//! caller sharing a key lives in one process, and as the reference
//! collaborator for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::{DistributedLock, LockError, StateMutator};
use crate::error::Result;

/// How long a caller waits for a held key before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

type Slot = Arc<Mutex<Option<Vec<u8>>>>;

/// A lock service whose state lives in this process's memory.
pub struct InMemoryLock {
    /// Prefix applied to every key
    namespace: String,
    /// Stored blobs, one async mutex per namespaced key
    slots: DashMap<String, Slot>,
    /// Upper bound on waiting for a key held by someone else
    acquire_timeout: Duration,
    /// Discard updates from mutators that overran their lease
    strict_leases: bool,
}

impl InMemoryLock {
    /// Create a lock service with the default namespace and acquire timeout.
    pub fn new() -> Self {
        Self::with_namespace("lockgate")
    }

    /// Create a lock service whose keys are prefixed with `namespace`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            slots: DashMap::new(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            strict_leases: false,
        }
    }

    /// Set how long `with_lock` waits for a held key.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Reject updates from mutators that ran past their lease.
    ///
    /// Holders of a key in this process cannot be preempted, so by default an
    /// overrun is only logged and the update is kept. Strict mode behaves
    /// like a fencing lock service, where an expired holder's write is lost.
    pub fn strict_leases(mut self, strict: bool) -> Self {
        self.strict_leases = strict;
        self
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read the blob currently stored under `key`, waiting for any holder.
    pub async fn snapshot(&self, key: &str) -> Option<Vec<u8>> {
        let slot = self.slots.get(&self.namespaced(key)).map(|s| s.clone())?;
        let stored = slot.lock().await;
        stored.clone()
    }

    /// Get the number of keys that have been touched.
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots.entry(key.to_string()).or_default().clone()
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLock")
            .field("namespace", &self.namespace)
            .field("keys", &self.slots.len())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("strict_leases", &self.strict_leases)
            .finish()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn with_lock(&self, key: &str, lease: Duration, mutator: StateMutator<'_>) -> Result<()> {
        let key = self.namespaced(key);
        let slot = self.slot(&key);

        let mut stored = tokio::time::timeout(self.acquire_timeout, slot.lock())
            .await
            .map_err(|_| LockError::AcquireTimeout {
                key: key.clone(),
                timeout: self.acquire_timeout,
            })?;

        let acquired = Instant::now();
        let next = mutator(stored.clone())?;

        let held = acquired.elapsed();
        if held > lease {
            if self.strict_leases {
                warn!(key = %key, lease_ms = lease.as_millis() as u64, held_ms = held.as_millis() as u64, "Lease expired, discarding update");
                return Err(LockError::LeaseExpired { key, lease }.into());
            }
            warn!(key = %key, lease_ms = lease.as_millis() as u64, held_ms = held.as_millis() as u64, "Mutator overran its lease");
        }

        debug!(key = %key, bytes = next.len(), "Stored state");
        *stored = Some(next);
        Ok(())
    }
}
