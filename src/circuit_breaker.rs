//! Failure-rate circuit breaker.
//!
//! The breaker sits between deduplication and retry, so one "request" from
//! its point of view is a full retry sequence: a transient blip that a
//! retry absorbs never counts against the circuit, only exhausted retries
//! and terminal failures do.
//!
//! State machine:
//!
//! - **Closed**: requests pass through; outcomes accumulate in a rolling
//!   window of `{requests, failures}` counts. When the window holds at
//!   least [`MIN_REQUESTS_TO_TRIP`] requests and the failure rate reaches
//!   [`FAILURE_RATE_THRESHOLD`], the circuit opens.
//! - **Open**: requests are rejected immediately with `CircuitOpen` (no
//!   upstream call). After the configured open timeout, the next request
//!   moves the circuit to half-open.
//! - **Half-open**: up to a configured number of trial requests pass
//!   through. One failure re-opens the circuit; the full trial quota
//!   succeeding closes it and resets all counters. Requests beyond the
//!   quota are rejected with `CircuitExhausted`.
//!
//! All counters reset on the rolling window boundary while closed, and on
//! every state transition. State lives under one mutex; the critical
//! sections are a few comparisons and never span an await point.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{ConfigValidationError, Error, Result, ValidationResult};
use crate::pipeline::{CallContext, Next, Stage};
use crate::request::RequestSpec;
use crate::response::Response;

/// Minimum requests in the window before the failure rate is considered.
pub const MIN_REQUESTS_TO_TRIP: u32 = 3;

/// Failure rate at or above which the circuit opens.
pub const FAILURE_RATE_THRESHOLD: f64 = 0.6;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Length of the rolling counting window while closed.
    pub interval: Duration,
    /// How long the circuit stays open before probing recovery.
    pub open_timeout: Duration,
    /// Trial requests admitted while half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            half_open_trials: 3,
        }
    }
}

impl BreakerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<ValidationResult, ConfigValidationError> {
        let mut result = ValidationResult::default();
        if self.interval.is_zero() {
            return Err(ConfigValidationError::invalid(
                "interval",
                "must be non-zero",
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigValidationError::invalid(
                "open_timeout",
                "must be non-zero",
            ));
        }
        if self.half_open_trials == 0 {
            return Err(ConfigValidationError::too_low(
                "half_open_trials",
                self.half_open_trials,
                1,
            ));
        }
        if self.half_open_trials > 100 {
            result
                .warnings
                .push("half_open_trials above 100 defeats the probing purpose".to_string());
        }
        Ok(result)
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Traffic flows; failures are being counted.
    Closed,
    /// Traffic is rejected without an upstream attempt.
    Open,
    /// A limited number of trial requests probe recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window_start: Instant,
    requests: u32,
    failures: u32,
    opened_at: Instant,
    trials_admitted: u32,
    trial_successes: u32,
}

/// Shared circuit breaker, one per pipeline.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window_start: now,
                requests: 0,
                failures: 0,
                opened_at: now,
                trials_admitted: 0,
                trial_successes: 0,
            }),
        }
    }

    /// Current state, for observability.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Forces the breaker back to closed with fresh counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        Self::to_closed(&mut inner);
        info!("circuit breaker manually reset");
    }

    /// Decides whether one request may proceed.
    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                if now.duration_since(inner.window_start) >= self.config.interval {
                    inner.window_start = now;
                    inner.requests = 0;
                    inner.failures = 0;
                }
                Ok(())
            }
            CircuitState::Open => {
                let reopen_at = inner.opened_at + self.config.open_timeout;
                if now < reopen_at {
                    return Err(Error::circuit_open(Some(reopen_at.duration_since(now))));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trials_admitted = 1;
                inner.trial_successes = 0;
                info!("circuit breaker half-open, probing recovery");
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted >= self.config.half_open_trials {
                    return Err(Error::CircuitExhausted);
                }
                inner.trials_admitted += 1;
                Ok(())
            }
        }
    }

    /// Scores the outcome of one admitted request.
    fn record(&self, success: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
                if !success {
                    inner.failures += 1;
                }
                if inner.requests >= MIN_REQUESTS_TO_TRIP
                    && f64::from(inner.failures) / f64::from(inner.requests)
                        >= FAILURE_RATE_THRESHOLD
                {
                    let (requests, failures) = (inner.requests, inner.failures);
                    Self::to_open(&mut inner);
                    warn!(requests, failures, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.half_open_trials {
                        Self::to_closed(&mut inner);
                        info!("circuit breaker closed after successful trials");
                    }
                } else {
                    Self::to_open(&mut inner);
                    warn!("circuit breaker re-opened after failed trial");
                }
            }
            // A late completion from before the trip; the open state
            // already accounts for the failure mass.
            CircuitState::Open => {}
        }
    }

    fn to_open(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Instant::now();
        inner.requests = 0;
        inner.failures = 0;
        inner.trials_admitted = 0;
        inner.trial_successes = 0;
    }

    fn to_closed(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.window_start = Instant::now();
        inner.requests = 0;
        inner.failures = 0;
        inner.trials_admitted = 0;
        inner.trial_successes = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Stage for CircuitBreaker {
    async fn handle(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        next: Next<'_>,
    ) -> Result<Response> {
        self.admit()?;
        let result = next.run(ctx, spec).await;
        self.record(result.is_ok());
        result
    }
}
