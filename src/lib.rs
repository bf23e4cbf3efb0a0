//! Lockgate - Distributed throttle and debounce primitives
//!
//! This crate coordinates call-gating decisions across processes that share
//! nothing but a distributed lock service. A [`Throttle`] permits at most N
//! executions per rolling interval for a key; a [`Debounce`] runs only the
//! last of a burst of calls once the key has been quiet for an interval.

pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod factory;
pub mod lock;
pub mod throttle;

pub use debounce::{Debounce, DebounceOutcome, DebounceToken};
pub use error::{LockgateError, Result};
pub use factory::GateFactory;
pub use lock::{DistributedLock, InMemoryLock};
pub use throttle::{per_day, per_hour, per_minute, per_second, Throttle, ThrottleConfiguration};
