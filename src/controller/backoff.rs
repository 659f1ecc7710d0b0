//! # Error Backoff
//!
//! Per-object exponential backoff used by the error policy when a reconcile
//! returns an error. Doubles from the start value up to the cap, and is reset
//! by the next successful reconcile of the same object.
//!
//! ```rust
//! use ansible_operator::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(20));
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start: Duration,
    current: Duration,
    max: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            current: start,
            max,
            attempts: 0,
        }
    }

    /// Return the current delay and double it for the next call
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        self.attempts += 1;
        delay
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.start;
        self.attempts = 0;
    }
}

/// Backoff state per object, keyed by `{namespace}/{name}`
#[derive(Debug)]
pub struct BackoffStates {
    start: Duration,
    max: Duration,
    states: Mutex<HashMap<String, ExponentialBackoff>>,
}

impl BackoffStates {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Next delay for `key`, plus how many errors it has seen so far
    pub fn next(&self, key: &str) -> (Duration, u32) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| ExponentialBackoff::new(self.start, self.max));
        let delay = state.next_backoff();
        (delay, state.attempts())
    }

    /// Forget `key`; returns true when it was backing off
    pub fn reset(&self, key: &str) -> bool {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_states_are_per_object() {
        let states = BackoffStates::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(states.next("default/a"), (Duration::from_secs(5), 1));
        assert_eq!(states.next("default/a"), (Duration::from_secs(10), 2));
        assert_eq!(states.next("default/b"), (Duration::from_secs(5), 1));

        assert!(states.reset("default/a"));
        assert!(!states.reset("default/a"));
        assert_eq!(states.next("default/a"), (Duration::from_secs(5), 1));
    }
}
