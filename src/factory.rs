//! Gate constructors hung off a shared lock service.

use std::sync::Arc;

use crate::debounce::Debounce;
use crate::error::Result;
use crate::lock::DistributedLock;
use crate::throttle::{Throttle, ThrottleConfiguration};

/// Build throttles and debounces directly from a lock service handle.
pub trait GateFactory {
    /// Create a [`Throttle`] for `key`.
    fn throttler(&self, key: &str, config: ThrottleConfiguration) -> Result<Throttle>;

    /// Create a [`Debounce`] for `key`.
    fn debouncer(&self, key: &str, interval_ms: u64) -> Result<Debounce>;
}

impl GateFactory for Arc<dyn DistributedLock> {
    fn throttler(&self, key: &str, config: ThrottleConfiguration) -> Result<Throttle> {
        Throttle::new(Arc::clone(self), key, config)
    }

    fn debouncer(&self, key: &str, interval_ms: u64) -> Result<Debounce> {
        Debounce::new(Arc::clone(self), key, interval_ms)
    }
}
