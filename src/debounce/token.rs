//! Identity tokens and the transitions applied to them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one debounced call.
///
/// The token stored under a key names the most recent pending call. It is
/// only ever compared for identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebounceToken(Uuid);

impl DebounceToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DebounceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a delayed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceOutcome {
    /// The call was still the most recent one; its function runs
    Fired,
    /// A later call replaced it; nothing runs
    Superseded,
}

/// Registration overwrites whatever was stored.
pub(crate) fn register_token(_prior: Option<DebounceToken>, token: DebounceToken) -> DebounceToken {
    token
}

/// Decide whether `token` survived its quiet period.
///
/// Returns the token to store and the outcome. A superseding token is kept
/// as it is; an empty key is claimed by `token` without firing.
pub(crate) fn check_token(
    prior: Option<DebounceToken>,
    token: DebounceToken,
) -> (DebounceToken, DebounceOutcome) {
    match prior {
        Some(current) if current == token => (current, DebounceOutcome::Fired),
        Some(current) => (current, DebounceOutcome::Superseded),
        None => (token, DebounceOutcome::Superseded),
    }
}
