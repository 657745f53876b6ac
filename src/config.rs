//! Pipeline configuration.
//!
//! [`PipelineConfig`] aggregates the per-stage configuration structs. Each
//! stage config lives next to its stage and validates itself; this module
//! stitches them together and adds the cross-cutting per-call timeout.

use std::time::Duration;

use crate::circuit_breaker::BreakerConfig;
use crate::credentials::CredentialConfig;
use crate::error::{ConfigValidationError, ValidationResult};
use crate::rate_limiter::RateConfig;
use crate::retry::RetryConfig;
use crate::transport::TransportConfig;

/// Default budget for one logical call, spanning every stage including
/// retries and waits.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Token bucket settings.
    pub rate: RateConfig,
    /// Retry and backoff settings.
    pub retry: RetryConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Credential and CSRF settings.
    pub credentials: CredentialConfig,
    /// HTTP transport settings.
    pub transport: TransportConfig,
    /// Deadline for one logical call, end to end.
    pub call_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate: RateConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            credentials: CredentialConfig::default(),
            transport: TransportConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    /// Validates every section, merging their warnings.
    pub fn validate(&self) -> std::result::Result<ValidationResult, ConfigValidationError> {
        if self.call_timeout.is_zero() {
            return Err(ConfigValidationError::invalid(
                "call_timeout",
                "must be non-zero",
            ));
        }
        let mut result = ValidationResult::default();
        result.merge(self.rate.validate()?);
        result.merge(self.retry.validate()?);
        result.merge(self.breaker.validate()?);
        result.merge(self.transport.validate()?);
        if self.call_timeout < self.retry.initial_interval {
            result.warnings.push(
                "call_timeout is shorter than the first retry backoff; retries will never run"
                    .to_string(),
            );
        }
        Ok(result)
    }
}
