// Rate limiting for authorization-initiation requests.
//
// Per-caller fixed window. The connect endpoint is authenticated but cheap
// to hammer, so each (user, source address) key gets at most N requests per
// window. State is in-memory only (resets on restart).

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// One caller's window: start instant and requests consumed since.
struct Window {
    started_at: Instant,
    count: u32,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; the window rolls over after `retry_after`.
    Limited { retry_after: Duration },
}

/// Per-caller fixed-window rate limiter.
///
/// Windows are created lazily on first request and reset in place when the
/// window duration has elapsed.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Check and consume one request slot for `caller_key`.
    pub fn check_and_consume(&self, caller_key: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(caller_key.to_string())
            .or_insert_with(|| Window {
                started_at: now,
                count: 0,
            });

        let elapsed = now.duration_since(entry.started_at);
        if elapsed >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            RateDecision::Allowed
        } else {
            RateDecision::Limited {
                retry_after: self.window.saturating_sub(now.duration_since(entry.started_at)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(10, Duration::from_secs(900));

        for i in 0..10 {
            assert_eq!(
                limiter.check_and_consume("u1:203.0.113.9"),
                RateDecision::Allowed,
                "request {} should be allowed",
                i + 1
            );
        }
    }

    #[test]
    fn test_rejects_past_limit() {
        let limiter = RateLimiter::new(10, Duration::from_secs(900));

        for _ in 0..10 {
            limiter.check_and_consume("u1:203.0.113.9");
        }

        // The 11th request is rejected with a positive retry hint
        match limiter.check_and_consume("u1:203.0.113.9") {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(900));
            }
            RateDecision::Allowed => panic!("11th request must be limited"),
        }
    }

    #[test]
    fn test_separate_windows_per_caller() {
        let limiter = RateLimiter::new(1, Duration::from_secs(900));

        assert_eq!(limiter.check_and_consume("u1:a"), RateDecision::Allowed);
        assert!(matches!(
            limiter.check_and_consume("u1:a"),
            RateDecision::Limited { .. }
        ));
        // A different caller key is unaffected
        assert_eq!(limiter.check_and_consume("u2:a"), RateDecision::Allowed);
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));

        assert_eq!(limiter.check_and_consume("u1"), RateDecision::Allowed);
        assert!(matches!(
            limiter.check_and_consume("u1"),
            RateDecision::Limited { .. }
        ));

        std::thread::sleep(Duration::from_millis(60));

        // Window elapsed, requests succeed again
        assert_eq!(limiter.check_and_consume("u1"), RateDecision::Allowed);
    }
}
