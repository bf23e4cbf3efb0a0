//! The distributed lock collaborator.
//!
//! Every coordinated decision in this crate is a single read-modify-write of
//! an opaque per-key blob performed while holding the key's lock. This module
//! defines that contract, a typed helper over it, and an in-process
//! implementation.

mod backend;
mod memory;

pub use backend::{exchange, DistributedLock, LockError, StateMutator};
pub use memory::{InMemoryLock, DEFAULT_ACQUIRE_TIMEOUT};
