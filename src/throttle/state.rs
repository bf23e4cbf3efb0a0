//! Sliding-window ring buffer stored under a throttle key.

use serde::{Deserialize, Serialize};

use super::configuration::ThrottleConfiguration;
use crate::error::{LockgateError, Result};

/// The state blob shared by every throttle handle on a key.
///
/// `timestamps` holds the epoch-millisecond times of the most recent
/// `executions` permitted attempts. `timestamps[cursor]` is always the oldest
/// of them, so it is the slot the next permitted attempt replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleState {
    /// Configuration of the caller that created the state
    pub config: ThrottleConfiguration,
    /// Ring buffer of execution times
    #[serde(rename = "executionTimestamps")]
    pub timestamps: Vec<i64>,
    /// Index of the oldest execution time
    pub cursor: usize,
}

impl ThrottleState {
    /// Create an empty window: every slot at epoch 0.
    ///
    /// Fails with `InvalidConfiguration` when the window cannot be allocated.
    pub fn new(config: ThrottleConfiguration) -> Result<Self> {
        let too_large =
            || LockgateError::InvalidConfiguration(format!("{} is too large to track", config));
        let slots = usize::try_from(config.executions).map_err(|_| too_large())?;

        let mut timestamps = Vec::new();
        timestamps.try_reserve_exact(slots).map_err(|_| too_large())?;
        timestamps.resize(slots, 0);

        Ok(Self {
            config,
            timestamps,
            cursor: 0,
        })
    }

    /// Apply one attempt made at `now` by a caller holding `config`.
    ///
    /// Returns the state to store and whether the attempt was permitted. A
    /// stored configuration that differs from `config` fails the attempt.
    pub fn transition(
        prior: Option<Self>,
        config: &ThrottleConfiguration,
        now: i64,
    ) -> Result<(Self, bool)> {
        let mut state = Self::resume(prior, config)?;
        let permitted = state.try_record(now);
        Ok((state, permitted))
    }

    /// Count free slots at `now` without recording anything.
    pub fn inspect(
        prior: Option<Self>,
        config: &ThrottleConfiguration,
        now: i64,
    ) -> Result<(Self, u64)> {
        let state = Self::resume(prior, config)?;
        let free = state.available(now);
        Ok((state, free))
    }

    /// Replace the oldest slot with `now` if it has left the window.
    pub fn try_record(&mut self, now: i64) -> bool {
        if !self.is_expired(self.timestamps[self.cursor], now) {
            return false;
        }

        self.timestamps[self.cursor] = now;
        self.cursor = (self.cursor + 1) % self.timestamps.len();
        true
    }

    /// Number of slots that have left the window at `now`.
    pub fn available(&self, now: i64) -> u64 {
        self.timestamps
            .iter()
            .filter(|&&at| self.is_expired(at, now))
            .count() as u64
    }

    /// Get the oldest execution time still held in the buffer.
    pub fn oldest(&self) -> i64 {
        self.timestamps[self.cursor]
    }

    fn is_expired(&self, recorded: i64, now: i64) -> bool {
        // A clock running behind a recorded slot never frees it.
        u64::try_from(now.saturating_sub(recorded))
            .map(|elapsed| elapsed > self.config.interval_ms)
            .unwrap_or(false)
    }

    fn resume(prior: Option<Self>, config: &ThrottleConfiguration) -> Result<Self> {
        match prior {
            None => Self::new(*config),
            Some(state) => {
                if state.config != *config {
                    return Err(LockgateError::ConfigurationMismatch {
                        requested: *config,
                        stored: state.config,
                    });
                }
                state.check_shape()?;
                Ok(state)
            }
        }
    }

    fn check_shape(&self) -> Result<()> {
        if self.timestamps.len() as u64 != self.config.executions {
            return Err(LockgateError::CorruptState(format!(
                "window holds {} slots for {}",
                self.timestamps.len(),
                self.config
            )));
        }
        if self.cursor >= self.timestamps.len() {
            return Err(LockgateError::CorruptState(format!(
                "cursor {} outside window of {} slots",
                self.cursor,
                self.timestamps.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::per_second;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_new_state_is_empty_window() {
        let state = ThrottleState::new(per_second(3, 1)).unwrap();
        assert_eq!(state.timestamps, vec![0, 0, 0]);
        assert_eq!(state.cursor, 0);
        assert_eq!(state.available(T0), 3);
    }

    #[test]
    fn test_fills_then_rejects() {
        let config = per_second(2, 1);

        let (state, first) = ThrottleState::transition(None, &config, T0).unwrap();
        let (state, second) = ThrottleState::transition(Some(state), &config, T0 + 1).unwrap();
        let (state, third) = ThrottleState::transition(Some(state), &config, T0 + 2).unwrap();

        assert_eq!((first, second, third), (true, true, false));
        assert_eq!(state.timestamps, vec![T0, T0 + 1]);
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_rejected_attempt_leaves_window() {
        let config = per_second(1, 1);
        let (state, _) = ThrottleState::transition(None, &config, T0).unwrap();

        let (after, permitted) = ThrottleState::transition(Some(state.clone()), &config, T0 + 10).unwrap();

        assert!(!permitted);
        assert_eq!(after, state);
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let config = per_second(1, 1);
        let (state, _) = ThrottleState::transition(None, &config, T0).unwrap();

        let (state, at_boundary) = ThrottleState::transition(Some(state), &config, T0 + 1_000).unwrap();
        assert!(!at_boundary);

        let (_, past_boundary) = ThrottleState::transition(Some(state), &config, T0 + 1_001).unwrap();
        assert!(past_boundary);
    }

    #[test]
    fn test_rolling_window_frees_oldest_first() {
        let config = per_second(2, 1);
        let (state, _) = ThrottleState::transition(None, &config, T0).unwrap();
        let (state, _) = ThrottleState::transition(Some(state), &config, T0 + 500).unwrap();

        // Only the first slot has left the window.
        assert_eq!(state.available(T0 + 1_100), 1);
        let (state, permitted) = ThrottleState::transition(Some(state), &config, T0 + 1_100).unwrap();
        assert!(permitted);
        assert_eq!(state.oldest(), T0 + 500);

        let (_, permitted) = ThrottleState::transition(Some(state), &config, T0 + 1_200).unwrap();
        assert!(!permitted);
    }

    #[test]
    fn test_clock_behind_slot_is_rejected() {
        let config = per_second(1, 1);
        let (state, _) = ThrottleState::transition(None, &config, T0).unwrap();

        let (_, permitted) = ThrottleState::transition(Some(state), &config, T0 - 5_000).unwrap();
        assert!(!permitted);
    }

    #[test]
    fn test_mismatched_config_fails() {
        let (state, _) = ThrottleState::transition(None, &per_second(2, 1), T0).unwrap();

        let err = ThrottleState::transition(Some(state), &per_second(3, 1), T0).unwrap_err();

        match err {
            LockgateError::ConfigurationMismatch { requested, stored } => {
                assert_eq!(requested, per_second(3, 1));
                assert_eq!(stored, per_second(2, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_state_is_corrupt() {
        let config = per_second(2, 1);
        let short = ThrottleState {
            config,
            timestamps: vec![0],
            cursor: 0,
        };
        assert!(matches!(
            ThrottleState::transition(Some(short), &config, T0),
            Err(LockgateError::CorruptState(_))
        ));

        let wild_cursor = ThrottleState {
            config,
            timestamps: vec![0, 0],
            cursor: 2,
        };
        assert!(matches!(
            ThrottleState::inspect(Some(wild_cursor), &config, T0),
            Err(LockgateError::CorruptState(_))
        ));
    }

    #[test]
    fn test_encoded_shape() {
        let state = ThrottleState::new(per_second(2, 1)).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"config":{"executions":2,"intervalMs":1000},"executionTimestamps":[0,0],"cursor":0}"#
        );
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let config = per_second(1 << 62, 1);
        assert!(config.validate().is_ok());

        assert!(matches!(
            ThrottleState::new(config),
            Err(LockgateError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            ThrottleState::transition(None, &config, T0),
            Err(LockgateError::InvalidConfiguration(_))
        ));
    }
}
