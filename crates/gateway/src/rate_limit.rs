//! Per-connection message-budget enforcement.
//!
//! Fixed-window counter, default 20 messages per second. The check is a
//! single critical section per connection so concurrent inbound frames on
//! the same connection cannot race past the budget. Counters are
//! in-process: a single gateway process is the unit of deployment.

use chrono::Utc;
use std::sync::Mutex;
use std::time::Duration;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Messages allowed per window.
    pub budget: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            budget: 20,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Window {
    started_ms: i64,
    count: u32,
}

/// Fixed-window counter owned by one connection.
#[derive(Debug)]
pub struct MessageBudget {
    window: Mutex<Window>,
}

impl MessageBudget {
    pub fn new() -> Self {
        Self::new_at(Utc::now().timestamp_millis())
    }

    /// Start the first window at an explicit timestamp. The clock source
    /// is the caller's; `check` must be fed the same one.
    pub fn new_at(now_ms: i64) -> Self {
        Self {
            window: Mutex::new(Window {
                started_ms: now_ms,
                count: 0,
            }),
        }
    }

    /// Atomic check-and-increment against the current window.
    pub fn check(&self, now_ms: i64, config: &RateLimiterConfig) -> bool {
        let mut window = self.window.lock().unwrap();
        if now_ms - window.started_ms >= config.window.as_millis() as i64 {
            window.started_ms = now_ms;
            window.count = 0;
        }
        if window.count < config.budget {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for MessageBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared rate limiter applying one configuration to every connection's
/// budget.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self { config }
    }

    /// Whether the connection may process one more inbound message.
    pub fn allow(&self, budget: &MessageBudget) -> bool {
        budget.check(Utc::now().timestamp_millis(), &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(budget: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            budget,
            window: Duration::from_secs(1),
        }
    }

    #[test]
    fn exactly_one_rejection_at_budget_plus_one() {
        let budget = MessageBudget::new_at(1_000_000);
        let config = config(5);
        let now = 1_000_000;

        let mut rejections = 0;
        for _ in 0..6 {
            if !budget.check(now, &config) {
                rejections += 1;
            }
        }
        assert_eq!(rejections, 1);
    }

    #[test]
    fn fresh_window_resets_count() {
        let budget = MessageBudget::new_at(1_000_000);
        let config = config(2);

        assert!(budget.check(1_000_000, &config));
        assert!(budget.check(1_000_000, &config));
        assert!(!budget.check(1_000_500, &config));

        // Next window: budget restored.
        assert!(budget.check(1_001_000, &config));
        assert!(budget.check(1_001_001, &config));
        assert!(!budget.check(1_001_002, &config));
    }

    #[test]
    fn concurrent_checks_never_exceed_budget() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        let budget = Arc::new(MessageBudget::new_at(2_000_000));
        let config = Arc::new(config(100));
        let allowed = Arc::new(AtomicU32::new(0));
        let now = 2_000_000;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                let config = config.clone();
                let allowed = allowed.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if budget.check(now, &config) {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(allowed.load(Ordering::Relaxed), 100);
    }
}
