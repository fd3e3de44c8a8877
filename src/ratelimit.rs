//! Per-user submission rate limiting over a rolling window.
//!
//! The cap comes from a pluggable policy so a subscription-tier lookup can
//! be wired in without touching the limiter. Counting is in-memory; a
//! restart forgets the window, which errs in the user's favor.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{ForgeError, Result};

/// Maps a user to their generations-per-window cap.
pub trait RateLimitPolicy: Send + Sync {
    fn cap_for(&self, user_id: Uuid) -> u32;
}

/// Same cap for everyone.
pub struct FixedCap(pub u32);

impl RateLimitPolicy for FixedCap {
    fn cap_for(&self, _user_id: Uuid) -> u32 {
        self.0
    }
}

pub struct RateLimiter {
    window: Duration,
    policy: Arc<dyn RateLimitPolicy>,
    submissions: Mutex<HashMap<Uuid, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn rolling_hour(policy: Arc<dyn RateLimitPolicy>) -> Self {
        Self::with_window(Duration::from_secs(3600), policy)
    }

    pub fn with_window(window: Duration, policy: Arc<dyn RateLimitPolicy>) -> Self {
        Self {
            window,
            policy,
            submissions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one submission, or refuse if the user is at their cap.
    /// Refused submissions are not counted against the window.
    pub fn check_and_record(&self, user_id: Uuid) -> Result<()> {
        let cap = self.policy.cap_for(user_id);
        let now = Instant::now();
        let mut submissions = self.submissions.lock().unwrap();
        let window = submissions.entry(user_id).or_default();

        while window
            .front()
            .map(|t| now.duration_since(*t) >= self.window)
            .unwrap_or(false)
        {
            window.pop_front();
        }

        if window.len() as u32 >= cap {
            tracing::warn!(user_id = %user_id, cap, "rate limit reached");
            return Err(ForgeError::RateLimited { cap });
        }
        window.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_is_enforced_within_the_window() {
        let limiter = RateLimiter::rolling_hour(Arc::new(FixedCap(3)));
        let user = Uuid::new_v4();

        for _ in 0..3 {
            limiter.check_and_record(user).unwrap();
        }
        let err = limiter.check_and_record(user).unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::with_window(Duration::from_millis(20), Arc::new(FixedCap(1)));
        let user = Uuid::new_v4();

        limiter.check_and_record(user).unwrap();
        assert!(limiter.check_and_record(user).is_err());
        std::thread::sleep(Duration::from_millis(30));
        limiter.check_and_record(user).unwrap();
    }

    #[test]
    fn users_do_not_share_a_window() {
        let limiter = RateLimiter::rolling_hour(Arc::new(FixedCap(1)));
        limiter.check_and_record(Uuid::new_v4()).unwrap();
        limiter.check_and_record(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn refused_submissions_do_not_consume_capacity() {
        let limiter = RateLimiter::with_window(Duration::from_millis(50), Arc::new(FixedCap(1)));
        let user = Uuid::new_v4();

        limiter.check_and_record(user).unwrap();
        for _ in 0..5 {
            assert!(limiter.check_and_record(user).is_err());
        }
        std::thread::sleep(Duration::from_millis(60));
        // Only the accepted submission aged out; the refusals left no trace.
        limiter.check_and_record(user).unwrap();
    }
}
