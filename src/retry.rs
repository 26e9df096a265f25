//! Retry policies for HTTP probes.
//!
//! Discovery talks to candidate servers that may be misconfigured or
//! unreachable, so the step machine uses a fail-fast policy that never
//! leaves us hanging on a single host. Callers can request a fault-tolerant
//! policy for the resolved EWS protocol instead.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Governs whether a connection error during a probe is retried, and how
/// long to back off between attempts.
#[derive(Debug)]
pub struct RetryPolicy {
    fail_fast: bool,
    max_wait: Duration,
    back_off_until: Mutex<Option<Instant>>,
}

impl RetryPolicy {
    /// No retries on connection errors. This is the policy used while
    /// probing candidate autodiscover endpoints.
    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            max_wait: Duration::ZERO,
            back_off_until: Mutex::new(None),
        }
    }

    /// Retry connection errors until `max_wait` has passed in total.
    pub fn fault_tolerant(max_wait: Duration) -> Self {
        Self {
            fail_fast: false,
            max_wait,
            back_off_until: Mutex::new(None),
        }
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Whether another attempt is allowed after having already waited
    /// `waited` in total.
    pub fn may_retry(&self, waited: Duration) -> bool {
        !self.fail_fast && waited < self.max_wait
    }

    /// Schedule the next attempt no earlier than `wait` from now.
    pub fn back_off(&self, wait: Duration) {
        let mut until = self.back_off_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = Some(Instant::now() + wait);
    }

    /// Sleep until the deadline set by a previous [`back_off`](Self::back_off),
    /// if any. Clears the deadline.
    pub fn back_off_if_needed(&self) {
        let deadline = {
            let mut until = self.back_off_until.lock().unwrap_or_else(|e| e.into_inner());
            until.take()
        };
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fail_fast()
    }
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        // The back-off deadline is transient state and not carried over.
        Self {
            fail_fast: self.fail_fast,
            max_wait: self.max_wait,
            back_off_until: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_fast_never_retries() {
        let policy = RetryPolicy::fail_fast();
        assert!(policy.is_fail_fast());
        assert!(!policy.may_retry(Duration::ZERO));
    }

    #[test]
    fn test_fault_tolerant_retries_within_window() {
        let policy = RetryPolicy::fault_tolerant(Duration::from_secs(60));
        assert!(policy.may_retry(Duration::from_secs(10)));
        assert!(!policy.may_retry(Duration::from_secs(60)));
    }

    #[test]
    fn test_back_off_deadline_is_honored_once() {
        let policy = RetryPolicy::fault_tolerant(Duration::from_secs(60));
        policy.back_off(Duration::from_millis(20));
        let start = Instant::now();
        policy.back_off_if_needed();
        assert!(start.elapsed() >= Duration::from_millis(20));
        // Deadline was consumed; a second call returns immediately.
        let start = Instant::now();
        policy.back_off_if_needed();
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
