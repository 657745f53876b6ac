//! Token-bucket rate limiting.
//!
//! One process-wide bucket shared by every call: a capped pool of permits
//! replenished at a fixed rate. [`RateLimiter::acquire`] blocks until a
//! permit is available or the call's deadline/cancellation fires, in which
//! case it fails without consuming a permit.
//!
//! The bucket is guarded by a plain mutex that is never held across an
//! await point; waiters sleep outside the lock for the time one permit
//! takes to accrue, then re-check. That keeps waits within one refill
//! period of a permit becoming available without a queue structure.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{ConfigValidationError, Result, ValidationResult};
use crate::pipeline::{CallContext, Next, Stage};
use crate::request::RequestSpec;
use crate::response::Response;

/// Rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Sustained permit refill rate, per second.
    pub rate_per_sec: f64,
    /// Burst capacity: permits available instantaneously from a full bucket.
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10.0,
            burst: 10,
        }
    }
}

impl RateConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<ValidationResult, ConfigValidationError> {
        let mut result = ValidationResult::default();
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(ConfigValidationError::invalid(
                "rate_per_sec",
                "must be positive and finite",
            ));
        }
        if self.burst == 0 {
            return Err(ConfigValidationError::too_low("burst", self.burst, 1));
        }
        if self.rate_per_sec > 10_000.0 {
            result
                .warnings
                .push("rate_per_sec above 10000 effectively disables rate limiting".to_string());
        }
        Ok(result)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token-bucket rate limiter.
///
/// Starts full, so a cold pipeline can issue a burst immediately.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    pub fn new(config: RateConfig) -> Self {
        let bucket = Bucket {
            tokens: f64::from(config.burst),
            last_refill: Instant::now(),
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    /// Acquires one permit, waiting for refill if the bucket is empty.
    ///
    /// Fails with a `Timeout`-classified error on deadline expiry or
    /// cancellation; a failed acquire never consumes a permit.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                // Sleep exactly as long as one permit takes to accrue.
                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.config.rate_per_sec)
            };
            trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for permit");
            ctx.sleep(wait).await?;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.config.rate_per_sec)
            .min(f64::from(self.config.burst));
        bucket.last_refill = now;
    }

    /// Permits currently available, after refill. For observability.
    pub fn available(&self) -> f64 {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }
}

#[async_trait]
impl Stage for RateLimiter {
    async fn handle(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        next: Next<'_>,
    ) -> Result<Response> {
        self.acquire(ctx).await?;
        next.run(ctx, spec).await
    }
}
