//! Error types for Lockgate.

use thiserror::Error;

use crate::lock::LockError;
use crate::throttle::ThrottleConfiguration;

/// Main error type for Lockgate operations.
#[derive(Error, Debug)]
pub enum LockgateError {
    /// A throttle or debounce was constructed with out-of-range parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The configuration stored under a key disagrees with the caller's
    #[error("Configuration mismatch: requested {requested}, but existing config has {stored}")]
    ConfigurationMismatch {
        /// Configuration of the calling handle
        requested: ThrottleConfiguration,
        /// Configuration recorded in the stored state
        stored: ThrottleConfiguration,
    },

    /// Lock service errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Stored state that decodes but violates its own invariants
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// State encoding errors
    #[error("State codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The gated user function failed
    #[error("Execution failed: {0}")]
    Execution(anyhow::Error),

    /// Application configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Lockgate operations.
pub type Result<T> = std::result::Result<T, LockgateError>;
