//! Circuit breaker guarding one logical broker dependency.
//!
//! One instance wraps the durable stream, another the pub/sub path, so a
//! failure on one path never blocks the other.

use crate::error::{BrokerError, Result};
use metrics::{counter, gauge};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state. Transitions are total-ordered per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_gauge(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Configuration for a circuit breaker instance.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker trips open.
    pub failure_threshold: u32,
    /// Time spent open before the next call is allowed through as a probe.
    pub recovery_timeout: Duration,
    /// Probe calls allowed while half-open.
    pub trial_budget: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            trial_budget: 3,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trials_started: u32,
    trials_succeeded: u32,
}

/// Stateful guard around a flaky broker dependency.
///
/// While open, every call fails immediately with
/// [`BrokerError::CircuitOpen`] instead of attempting I/O.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_started: 0,
                trials_succeeded: 0,
            }),
            trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: &'static str) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Run `op` through the breaker.
    ///
    /// The operation future is only constructed when the breaker admits the
    /// call; while open this returns without touching the broker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Check whether a call may proceed, transitioning OPEN → HALF_OPEN
    /// once the recovery timeout has elapsed.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.trials_started = 1;
                    Ok(())
                } else {
                    Err(BrokerError::CircuitOpen(self.name))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_started < self.config.trial_budget {
                    inner.trials_started += 1;
                    Ok(())
                } else {
                    // Trial budget exhausted; wait for outcomes.
                    Err(BrokerError::CircuitOpen(self.name))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.trials_succeeded += 1;
                if inner.trials_succeeded >= self.config.trial_budget
                    || inner.trials_succeeded >= inner.trials_started
                {
                    self.transition(&mut inner, BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            // Any probe failure reopens with the timeout restarted.
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        self.transition(inner, BreakerState::Open);
        inner.opened_at = Some(Instant::now());
        self.trips.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_breaker_trips_total", "breaker" => self.name).increment(1);
        tracing::warn!("Circuit breaker '{}' opened", self.name);
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        inner.state = to;
        inner.trials_started = 0;
        inner.trials_succeeded = 0;
        gauge!("gateway_breaker_state", "breaker" => self.name).set(to.as_gauge());
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Total times this breaker has tripped open.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
