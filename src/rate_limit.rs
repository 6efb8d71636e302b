//! Fixed-window rate limiting per principal id.
//!
//! Each principal owns a `{count, reset}` window. The first request in a
//! window (or the first after the reset instant) starts a fresh window;
//! exceeding the ceiling rejects with the seconds left until reset.
//! Anonymous principals share the literal `"anonymous"` window. Stale
//! windows are removed by a periodic timer sweep, never probabilistically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::GatewayError;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: chrono::Duration,
    ceiling: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window: chrono::Duration::seconds(config.window_secs as i64),
            ceiling: config.max_requests,
        }
    }

    /// Count one request against `principal_id`, rejecting once the
    /// window ceiling is exceeded.
    pub fn check(&self, principal_id: &str) -> Result<(), GatewayError> {
        let now = Utc::now();
        let mut windows = self.windows.lock().expect("rate-limit lock poisoned");

        let window = windows
            .entry(principal_id.to_string())
            .or_insert(RateWindow {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        window.count += 1;
        if window.count > self.ceiling {
            let reset_in_seconds =
                ((window.reset_at - now).num_milliseconds() as f64 / 1000.0).ceil() as u64;
            return Err(GatewayError::RateLimited {
                reset_in_seconds: reset_in_seconds.max(1),
            });
        }
        Ok(())
    }

    /// Remaining requests in the current window, for status surfaces.
    pub fn remaining(&self, principal_id: &str) -> u32 {
        let now = Utc::now();
        let windows = self.windows.lock().expect("rate-limit lock poisoned");
        match windows.get(principal_id) {
            Some(w) if now < w.reset_at => self.ceiling.saturating_sub(w.count),
            _ => self.ceiling,
        }
    }

    /// Drop windows whose reset is more than one window length in the
    /// past.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.window;
        let mut windows = self.windows.lock().expect("rate-limit lock poisoned");
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > cutoff);
        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, "rate-limit sweep removed idle windows");
        }
        removed
    }

    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_secs: u64, max: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_secs,
            max_requests: max,
        })
    }

    #[test]
    fn test_under_ceiling_passes() {
        let limiter = limiter(60, 3);
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());
    }

    #[test]
    fn test_over_ceiling_rejects_with_reset() {
        let limiter = limiter(60, 2);
        limiter.check("u1").unwrap();
        limiter.check("u1").unwrap();

        match limiter.check("u1") {
            Err(GatewayError::RateLimited { reset_in_seconds }) => {
                assert!((1..=60).contains(&reset_in_seconds));
            }
            other => panic!("expected rate_limited, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_principals_are_independent() {
        let limiter = limiter(60, 1);
        limiter.check("u1").unwrap();
        assert!(limiter.check("u1").is_err());
        assert!(limiter.check("u2").is_ok());
    }

    #[test]
    fn test_window_rollover_starts_fresh() {
        let limiter = limiter(0, 1);
        limiter.check("u1").unwrap();
        // Zero-length window: the reset instant is already past, so the
        // next request starts a new window with count = 1.
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(limiter.check("u1").is_ok());
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter(60, 5);
        assert_eq!(limiter.remaining("u1"), 5);
        limiter.check("u1").unwrap();
        limiter.check("u1").unwrap();
        assert_eq!(limiter.remaining("u1"), 3);
        assert_eq!(limiter.remaining("unseen"), 5);
    }

    #[test]
    fn test_sweep_removes_stale_windows() {
        let limiter = limiter(0, 10);
        limiter.check("u1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(limiter.sweep(), 1);
    }

    #[test]
    fn test_anonymous_share_one_window() {
        let limiter = limiter(60, 2);
        limiter.check("anonymous").unwrap();
        limiter.check("anonymous").unwrap();
        assert!(limiter.check("anonymous").is_err());
    }
}
