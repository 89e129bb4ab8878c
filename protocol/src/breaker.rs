//! Circuit breaker (§4.3): Closed / Open / HalfOpen state machine.
//!
//! Grounded on the trip/reset bookkeeping in `aether-proxy`'s registration
//! retry path (`registration::client::send_with_retry`'s
//! `should_retry_status`), generalized here into a standalone state machine
//! since the teacher itself has no breaker type to reuse directly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_timeout: Duration,
    pub max_half_open_reqs: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(60),
            max_half_open_reqs: 1,
        }
    }
}

impl BreakerConfig {
    /// Normalize zero/negative-equivalent fields to the defaults (§4.3 edge
    /// case: a misconfigured `max_failures: 0` must not permanently trip).
    fn normalized(mut self) -> Self {
        let default = Self::default();
        if self.max_failures == 0 {
            self.max_failures = default.max_failures;
        }
        if self.reset_timeout.is_zero() {
            self.reset_timeout = default.reset_timeout;
        }
        if self.half_open_timeout.is_zero() {
            self.half_open_timeout = default.half_open_timeout;
        }
        if self.max_half_open_reqs == 0 {
            self.max_half_open_reqs = default.max_half_open_reqs;
        }
        self
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_started_at: Option<Instant>,
}

/// A single target's breaker. The Server keeps one per target host in a
/// `DashMap`; the Agent keeps a single global instance (SPEC_FULL.md "Agent
/// proxy engine").
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Returned by `try_acquire` to tell the caller whether to attempt the
/// call, and what to do with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed; proceed normally.
    Allowed,
    /// Breaker is half-open and this call is one of the limited probes.
    Probe,
    /// Breaker is open; reject without attempting the call.
    Rejected,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config: config.normalized(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_inflight: 0,
                half_open_started_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Decide whether a call may proceed, transitioning Open -> HalfOpen
    /// once `reset_timeout` has elapsed.
    pub fn try_acquire(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("Open implies opened_at set");
                if now.duration_since(opened_at) >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_inflight = 1;
                    inner.half_open_started_at = Some(now);
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                let started_at = inner
                    .half_open_started_at
                    .expect("HalfOpen implies half_open_started_at set");
                if now.duration_since(started_at) >= self.config.half_open_timeout {
                    // The trial window lapsed without a verdict; reopen and
                    // make the caller wait out reset_timeout again.
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.half_open_inflight = 0;
                    return Admission::Rejected;
                }
                if inner.half_open_inflight < self.config.max_half_open_reqs {
                    inner.half_open_inflight += 1;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call. In HalfOpen this closes the breaker; any
    /// other probes still in flight for this trial are implicitly voided
    /// (the next `try_acquire` after close is simply `Allowed`).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.half_open_inflight = 0;
                inner.half_open_started_at = None;
            }
        }
    }

    /// Record a failed call. Trips the breaker at exactly `max_failures`
    /// consecutive failures (§4.3 edge case); a failed probe in HalfOpen
    /// reopens immediately regardless of the failure counter.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_inflight = 0;
                inner.half_open_started_at = None;
                inner.consecutive_failures = self.config.max_failures;
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_millis(20),
            half_open_timeout: Duration::from_millis(50),
            max_half_open_reqs: 1,
        }
    }

    #[test]
    fn trips_at_exactly_max_failures() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..2 {
            assert_eq!(breaker.try_acquire(), Admission::Allowed);
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn rejects_while_open_then_probes_after_reset_timeout() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_half_open_reqs: 2,
            ..cfg()
        });
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn zero_max_failures_falls_back_to_default() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 0,
            ..cfg()
        });
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
