//! Latest-call-wins debouncing across processes.

mod debouncer;
mod token;

pub use debouncer::Debounce;
pub use token::{DebounceOutcome, DebounceToken};
