//! Sliding-window attempt limiting for credential-sensitive operations.
//!
//! A client-side limiter is a deterrent, not a security boundary: it fails
//! open when the durable store misbehaves, because storage trouble must
//! never lock a legitimate operator out.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::storage::KeyValueStore;

/// Per-call-site limits; the default matches the login flow.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitQuota {
    pub max_attempts: usize,
    pub window: Duration,
}

impl Default for RateLimitQuota {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(15 * 60),
        }
    }
}

/// Sliding window of attempt timestamps per (operation, identity) key,
/// persisted in the durable store.
pub struct SlidingWindowLimiter {
    durable: Arc<dyn KeyValueStore>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self { durable }
    }

    /// Admit or reject an attempt. On admit, the attempt is recorded before
    /// returning; on reject, the stored window is left unchanged.
    #[must_use]
    pub fn check(&self, operation: &str, identity: &str, quota: &RateLimitQuota) -> bool {
        let key = window_key(operation, identity);
        let now_ms = Utc::now().timestamp_millis();
        let horizon_ms = now_ms - window_millis(quota.window);

        let mut stamps = self.load_window(&key);
        stamps.retain(|&stamp| stamp > horizon_ms);

        if stamps.len() >= quota.max_attempts {
            return false;
        }

        stamps.push(now_ms);
        match serde_json::to_string(&stamps) {
            Ok(raw) => {
                if let Err(err) = self.durable.put(&key, &raw) {
                    warn!("cannot record attempt for {key}: {err}");
                }
            }
            Err(err) => warn!("cannot serialize attempt window for {key}: {err}"),
        }
        true
    }

    /// Drop the window for `key`, e.g. after a successful login.
    pub fn clear(&self, operation: &str, identity: &str) {
        let key = window_key(operation, identity);
        if let Err(err) = self.durable.remove(&key) {
            warn!("cannot clear attempt window for {key}: {err}");
        }
    }

    fn load_window(&self, key: &str) -> Vec<i64> {
        match self.durable.get(key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<i64>>(&raw) {
                Ok(stamps) => stamps,
                Err(err) => {
                    // Fail open: a corrupt window never denies access.
                    warn!("discarding corrupt attempt window for {key}: {err}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("cannot read attempt window for {key}: {err}");
                Vec::new()
            }
        }
    }
}

fn window_key(operation: &str, identity: &str) -> String {
    format!("ratelimit:{operation}:{identity}")
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn sixth_attempt_in_window_is_rejected() {
        let limiter = limiter();
        let quota = RateLimitQuota::default();

        for attempt in 1..=5 {
            assert!(
                limiter.check("login", "ops@station.example", &quota),
                "attempt {attempt} should be admitted"
            );
        }
        assert!(!limiter.check("login", "ops@station.example", &quota));
        // Rejection leaves the window unchanged; still rejected.
        assert!(!limiter.check("login", "ops@station.example", &quota));
    }

    #[test]
    fn clear_admits_the_next_attempt() {
        let limiter = limiter();
        let quota = RateLimitQuota {
            max_attempts: 1,
            window: Duration::from_secs(60),
        };

        assert!(limiter.check("login", "ops@station.example", &quota));
        assert!(!limiter.check("login", "ops@station.example", &quota));

        limiter.clear("login", "ops@station.example");
        assert!(limiter.check("login", "ops@station.example", &quota));
    }

    #[test]
    fn keys_are_scoped_by_operation_and_identity() {
        let limiter = limiter();
        let quota = RateLimitQuota {
            max_attempts: 1,
            window: Duration::from_secs(60),
        };

        assert!(limiter.check("login", "a@station.example", &quota));
        assert!(!limiter.check("login", "a@station.example", &quota));

        // Different identity and different operation have their own windows.
        assert!(limiter.check("login", "b@station.example", &quota));
        assert!(limiter.check("forgot_password", "a@station.example", &quota));
    }

    #[test]
    fn expired_stamps_fall_out_of_the_window() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(Arc::clone(&store));
        let quota = RateLimitQuota {
            max_attempts: 1,
            window: Duration::from_secs(60),
        };

        // Plant an attempt two minutes in the past.
        let stale = Utc::now().timestamp_millis() - 120_000;
        store
            .put(
                "ratelimit:login:ops@station.example",
                &serde_json::to_string(&vec![stale]).unwrap(),
            )
            .unwrap();

        assert!(limiter.check("login", "ops@station.example", &quota));
    }

    #[test]
    fn corrupt_window_fails_open() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let limiter = SlidingWindowLimiter::new(Arc::clone(&store));

        store
            .put("ratelimit:login:ops@station.example", "][ nonsense")
            .unwrap();

        assert!(limiter.check(
            "login",
            "ops@station.example",
            &RateLimitQuota::default()
        ));
    }
}
