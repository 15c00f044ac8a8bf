//! Per-identifier activation rate limiting.
//!
//! Sliding window: at most [`MAX_ATTEMPTS`] recorded attempts per
//! `(scope, identifier)` in the trailing hour. The check and the record
//! happen under one lock so concurrent callers sharing an identifier
//! cannot both sneak under the limit. Denied calls are NOT recorded —
//! only allowed attempts count against the window. The caller is
//! responsible for audit-logging denials.
//!
//! Failure policy: fail OPEN. If the limiter's own state is unavailable
//! (a poisoned lock is the only way that happens here), the attempt is
//! allowed; blocking legitimate activations on an internal fault is the
//! worse trade than briefly relaxing abuse control.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

pub const MAX_ATTEMPTS: usize = 3;
pub const WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Device,
}

#[derive(Debug)]
pub struct RateLimiter {
    window_secs: i64,
    max_attempts: usize,
    attempts: Mutex<HashMap<(Scope, String), Vec<i64>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(WINDOW_SECS, MAX_ATTEMPTS)
    }

    pub fn with_limits(window_secs: i64, max_attempts: usize) -> Self {
        Self {
            window_secs,
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Returns true when the attempt is allowed (and records it).
    pub fn check_and_record(&self, scope: Scope, identifier: &str) -> bool {
        self.check_and_record_at(scope, identifier, Utc::now().timestamp())
    }

    fn check_and_record_at(&self, scope: Scope, identifier: &str, now: i64) -> bool {
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            // Fail open: recover whatever state survived the poisoning.
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = attempts
            .entry((scope, identifier.to_string()))
            .or_default();
        window.retain(|t| *t > now - self.window_secs);

        if window.len() < self.max_attempts {
            window.push(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_attempt_in_window_denied() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check_and_record_at(Scope::Device, "dev-1", 1000));
        }
        assert!(!limiter.check_and_record_at(Scope::Device, "dev-1", 1000));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new();
        for t in [0, 10, 20] {
            assert!(limiter.check_and_record_at(Scope::Device, "dev-1", t));
        }
        assert!(!limiter.check_and_record_at(Scope::Device, "dev-1", 30));
        // First attempt ages out after an hour; one slot opens.
        assert!(limiter.check_and_record_at(Scope::Device, "dev-1", 3601));
        assert!(!limiter.check_and_record_at(Scope::Device, "dev-1", 3602));
    }

    #[test]
    fn denied_attempts_do_not_consume() {
        let limiter = RateLimiter::new();
        for t in 0..3 {
            assert!(limiter.check_and_record_at(Scope::Device, "dev-1", t));
        }
        // Hammering while denied must not extend the lockout.
        for t in 100..200 {
            assert!(!limiter.check_and_record_at(Scope::Device, "dev-1", t));
        }
        // The original three age out together; the denials left no trace.
        assert!(limiter.check_and_record_at(Scope::Device, "dev-1", 3700));
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check_and_record_at(Scope::Device, "dev-1", 0));
        }
        assert!(limiter.check_and_record_at(Scope::Device, "dev-2", 0));
    }
}
