//! Retry with exponential backoff.
//!
//! [`RetryPolicy`] re-runs the downstream chain on transient failures.
//! Classification is by error kind: `Network`, `Timeout`, `RateLimited` and
//! `TooManyRequests` are retryable; everything else is terminal and
//! surfaces unchanged after the first attempt. On exhaustion the last
//! error is returned as-is, so callers can still inspect its kind.
//!
//! Backoff grows exponentially from a configurable initial interval, is
//! capped at a maximum interval, and carries jitter to decorrelate
//! replicas. A server-provided retry-after hint, when present on the
//! error, overrides the computed delay. Backoff sleeps observe the call
//! deadline; if the budget runs out mid-backoff the attempt's own error is
//! returned rather than a synthetic timeout.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use crate::error::{ConfigValidationError, Result, ValidationResult};
use crate::pipeline::{CallContext, Next, Stage};
use crate::request::RequestSpec;
use crate::response::Response;

/// Retry behavior configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_interval: Duration,
    /// Upper bound on any single backoff.
    pub max_interval: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<ValidationResult, ConfigValidationError> {
        let mut result = ValidationResult::default();
        if self.max_attempts == 0 {
            return Err(ConfigValidationError::too_low(
                "max_attempts",
                self.max_attempts,
                1,
            ));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigValidationError::invalid(
                "multiplier",
                "must be a finite value of at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigValidationError::invalid(
                "jitter_factor",
                "must be within [0.0, 1.0]",
            ));
        }
        if self.initial_interval > self.max_interval {
            return Err(ConfigValidationError::invalid(
                "initial_interval",
                "must not exceed max_interval",
            ));
        }
        if self.max_attempts > 10 {
            result
                .warnings
                .push("max_attempts above 10 can hold calls open for a long time".to_string());
        }
        Ok(result)
    }
}

/// Stage re-running the downstream chain on retryable failures.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before retry number `retry` (0-based), jittered and capped.
    fn backoff(&self, retry: u32) -> Duration {
        let base = self.config.initial_interval.as_secs_f64()
            * self.config.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let capped = base.min(self.config.max_interval.as_secs_f64());
        let jitter = self.config.jitter_factor;
        let factor = if jitter > 0.0 {
            rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).min(self.config.max_interval.as_secs_f64()))
    }
}

#[async_trait]
impl Stage for RetryPolicy {
    async fn handle(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match next.run(ctx, spec).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.config.max_attempts {
                return Err(err);
            }

            let delay = err.retry_after().unwrap_or_else(|| self.backoff(attempt - 1));
            debug!(
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            if ctx.sleep(delay).await.is_err() {
                // Budget ran out during backoff; the attempt's error is
                // more informative than a synthetic timeout.
                return Err(err);
            }
        }
    }
}
