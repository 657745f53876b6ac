//! The composed request pipeline.
//!
//! One logical call flows through an explicit, ordered list of stages:
//!
//! ```text
//! caller → dedup → circuit breaker → retry → rate limiter → transport → upstream
//! ```
//!
//! Every stage shares the same signature: [`Stage::handle`] receives the
//! call context, the immutable spec, and a [`Next`] continuation. A stage
//! may short-circuit (circuit open, cancelled wait) or invoke the rest of the
//! chain multiple times (retry). The chain is assembled once at
//! construction; per-call state lives in the [`CallContext`] and inside the
//! stages' own synchronized internals.
//!
//! # Example
//!
//! ```rust,no_run
//! use pipeguard::pipeline::Pipeline;
//! use pipeguard::request::RequestSpec;
//!
//! # async fn example() -> pipeguard::error::Result<()> {
//! let pipeline = Pipeline::builder()
//!     .credentials(vec!["session-a".into(), "session-b".into()])
//!     .proxies(vec!["http://proxy-1:8080".into()])
//!     .build()?;
//!
//! let spec = RequestSpec::get("https://api.example.com/v1/account")
//!     .use_credential(true)
//!     .build()?;
//! let response = pipeline.execute(spec).await?;
//! let account: serde_json::Value = response.json()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::credentials::{CredentialRotator, TokenSource};
use crate::dedup::RequestDeduplicator;
use crate::error::{Error, Result};
use crate::proxy::ProxySelector;
use crate::rate_limiter::RateLimiter;
use crate::request::RequestSpec;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{HttpTransport, Transport, TransportStage};

/// Per-call deadline and cancellation state.
///
/// Created once per logical call and threaded through every stage. All
/// suspension points in the pipeline (rate-limit waits, backoff sleeps,
/// dedup waits, network I/O) observe it and fail with a `Timeout`-classified
/// error instead of blocking past the caller's budget.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    /// Creates a context whose deadline is `timeout` from now.
    #[must_use]
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Creates a context with an explicit deadline.
    #[must_use]
    pub fn with_deadline(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// The call deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The cancellation token for this call.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline.
    ///
    /// Fails with a `Timeout`-classified error if the deadline already
    /// elapsed or the call was cancelled.
    pub fn remaining(&self) -> Result<Duration> {
        if self.cancel.is_cancelled() {
            return Err(Error::timeout("call cancelled"));
        }
        let now = Instant::now();
        if now >= self.deadline {
            return Err(Error::timeout("call deadline elapsed"));
        }
        Ok(self.deadline - now)
    }

    /// Sleeps for `dur`, waking early on deadline expiry or cancellation.
    ///
    /// Returns `Ok(())` only if the full duration elapsed within the call's
    /// budget.
    pub async fn sleep(&self, dur: Duration) -> Result<()> {
        let wake = Instant::now() + dur;
        if wake >= self.deadline {
            tokio::select! {
                _ = tokio::time::sleep_until(self.deadline) => {
                    Err(Error::timeout("call deadline elapsed"))
                }
                _ = self.cancel.cancelled() => Err(Error::timeout("call cancelled")),
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => Ok(()),
                _ = self.cancel.cancelled() => Err(Error::timeout("call cancelled")),
            }
        }
    }
}

/// One stage of the pipeline.
///
/// Stages are composed into a chain at construction time; each receives the
/// continuation for the stages after it and decides whether (and how many
/// times) to invoke it.
#[async_trait]
pub trait Stage: Send + Sync + fmt::Debug {
    /// Handles one call, delegating to `next` for the rest of the chain.
    async fn handle(&self, ctx: &CallContext, spec: &RequestSpec, next: Next<'_>)
        -> Result<Response>;
}

/// Continuation over the remaining stages of the chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    /// Creates a continuation over an explicit stage list. Exposed for
    /// tests that exercise a single stage in isolation.
    #[must_use]
    pub fn new(stages: &'a [Arc<dyn Stage>]) -> Self {
        Self { stages }
    }

    /// Runs the remaining stages.
    pub async fn run(self, ctx: &CallContext, spec: &RequestSpec) -> Result<Response> {
        match self.stages.split_first() {
            Some((head, rest)) => head.handle(ctx, spec, Next { stages: rest }).await,
            None => Err(Error::internal("pipeline has no terminal stage")),
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.stages.len())
            .finish()
    }
}

/// The assembled outbound request pipeline.
///
/// Cheap to share: wrap in an [`Arc`] and clone across tasks. All internal
/// state (rotation cursors, bucket, breaker counters, dedup registry) is
/// synchronized internally; no external locking is required.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    stages: Vec<Arc<dyn Stage>>,
    rotator: Arc<CredentialRotator>,
    proxies: Arc<ProxySelector>,
    breaker: Arc<CircuitBreaker>,
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Executes one logical call through the full chain.
    ///
    /// The call is bounded by the configured per-call timeout. The result is
    /// either a classified success or a single error whose kind is
    /// inspectable down to its root cause.
    pub async fn execute(&self, spec: RequestSpec) -> Result<Response> {
        self.execute_with_cancel(spec, CancellationToken::new())
            .await
    }

    /// Executes one logical call that can additionally be cancelled through
    /// `cancel`. Cancellation surfaces as a `Timeout`-classified error.
    #[instrument(skip_all, fields(method = %spec.method(), url = %spec.url()))]
    pub async fn execute_with_cancel(
        &self,
        spec: RequestSpec,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let ctx = CallContext::new(self.config.call_timeout, cancel);
        debug!("pipeline call started");
        Next::new(&self.stages).run(&ctx, &spec).await
    }

    /// Atomically replaces the credential set. Safe to call concurrently
    /// with in-flight requests.
    pub fn update_credentials(&self, credentials: Vec<String>) {
        self.rotator.update_credentials(credentials);
    }

    /// Atomically replaces the proxy set. Safe to call concurrently with
    /// in-flight requests.
    pub fn update_proxies(&self, proxies: Vec<String>) {
        self.proxies.update(proxies);
    }

    /// The circuit breaker, for state inspection and manual reset.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Builder for [`Pipeline`].
///
/// Components are dependency-injected: the transport and token source can be
/// replaced (tests inject mocks here), and each policy layer is configured
/// through [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    credentials: Vec<String>,
    proxies: Vec<String>,
    transport: Option<Arc<dyn Transport>>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl PipelineBuilder {
    /// Sets the full configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Seeds the session credential set.
    #[must_use]
    pub fn credentials(mut self, credentials: Vec<String>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Seeds the egress proxy set. An empty set means direct egress.
    #[must_use]
    pub fn proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Replaces the transport executor.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the CSRF token source.
    #[must_use]
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Validates the configuration and assembles the stage chain.
    pub fn build(self) -> Result<Pipeline> {
        let validation = self
            .config
            .validate()
            .map_err(|e| Error::internal(format!("invalid pipeline configuration: {e}")))?;
        for warning in &validation.warnings {
            warn!(warning = %warning, "pipeline configuration warning");
        }

        let (transport, token_source) = match (self.transport, self.token_source) {
            (Some(t), Some(s)) => (t, Some(s)),
            (Some(t), None) => (t, None),
            (None, source) => {
                let http = Arc::new(HttpTransport::new(self.config.transport.clone())?);
                let tokens = source.unwrap_or_else(|| http.clone() as Arc<dyn TokenSource>);
                (http as Arc<dyn Transport>, Some(tokens))
            }
        };

        let rotator = Arc::new(CredentialRotator::new(
            self.credentials,
            self.config.credentials.clone(),
            token_source,
        ));
        let proxies = Arc::new(ProxySelector::new(self.proxies));
        let breaker = Arc::new(CircuitBreaker::new(self.config.breaker.clone()));

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RequestDeduplicator::new()),
            breaker.clone(),
            Arc::new(RetryPolicy::new(self.config.retry.clone())),
            Arc::new(RateLimiter::new(self.config.rate.clone())),
            Arc::new(TransportStage::new(
                transport,
                rotator.clone(),
                proxies.clone(),
            )),
        ];

        Ok(Pipeline {
            config: self.config,
            stages,
            rotator,
            proxies,
            breaker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remaining_before_deadline() {
        let ctx = CallContext::new(Duration::from_secs(5), CancellationToken::new());
        assert!(ctx.remaining().unwrap() > Duration::from_secs(4));
    }

    #[tokio::test]
    async fn remaining_fails_after_cancel() {
        let cancel = CancellationToken::new();
        let ctx = CallContext::new(Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        let err = ctx.remaining().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_within_budget() {
        let ctx = CallContext::new(Duration::from_secs(10), CancellationToken::new());
        ctx.sleep(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_fails_when_crossing_deadline() {
        let ctx = CallContext::new(Duration::from_millis(100), CancellationToken::new());
        let err = ctx.sleep(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn sleep_wakes_on_cancellation() {
        let cancel = CancellationToken::new();
        let ctx = CallContext::new(Duration::from_secs(60), cancel.clone());
        let handle = tokio::spawn(async move { ctx.sleep(Duration::from_secs(30)).await });
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn empty_chain_is_an_internal_error() {
        let ctx = CallContext::new(Duration::from_secs(1), CancellationToken::new());
        let spec = RequestSpec::get("https://api.example.com/x").build().unwrap();
        let err = Next::new(&[]).run(&ctx, &spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn builder_assembles_pipeline() {
        let pipeline = Pipeline::builder()
            .credentials(vec!["secret".into()])
            .build()
            .unwrap();
        assert_eq!(pipeline.stages.len(), 5);
    }
}
