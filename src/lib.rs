//! Resilient outbound HTTP request pipeline.
//!
//! `pipeguard` wraps every call to an upstream HTTP API in a fixed chain of
//! protective stages:
//!
//! 1. **Deduplication**: concurrent identical requests collapse into one
//!    upstream execution whose result is shared.
//! 2. **Circuit breaker**: a failure-rate breaker rejects traffic fast
//!    while the upstream is unhealthy, then probes recovery.
//! 3. **Retry**: transient failures are retried with capped exponential
//!    backoff; terminal failures surface immediately.
//! 4. **Rate limiting**: a shared token bucket smooths egress.
//! 5. **Transport**: credential and CSRF-token injection, round-robin
//!    proxy selection, and classified HTTP execution over `reqwest`.
//!
//! Every wait in the chain observes the caller's deadline and cancellation
//! token, and every failure carries a machine-inspectable
//! [`ErrorKind`](error::ErrorKind).
//!
//! # Example
//!
//! ```rust,no_run
//! use pipeguard::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let pipeline = Pipeline::builder()
//!     .credentials(vec!["session-a".into(), "session-b".into()])
//!     .proxies(vec!["http://proxy-1:8080".into()])
//!     .build()?;
//!
//! let spec = RequestSpec::get("https://api.example.com/v1/account")
//!     .use_credential(true)
//!     .build()?;
//! let account: serde_json::Value = pipeline.execute(spec).await?.json()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Global lint suppressions: these apply broadly and would otherwise need
// scattered local annotations.
// - module_name_repetitions: RetryPolicy in retry, BreakerConfig in
//   circuit_breaker, and similar are deliberate names
// - missing_errors_doc / missing_panics_doc: too verbose for every
//   Result-returning function
// - must_use_candidate: not every getter needs #[must_use]
// - cast_precision_loss: counter-to-f64 conversions in the breaker and
//   bucket are well within f64 range
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub use serde;
pub use serde_json;

pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod retry;
pub mod transport;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::PipelineConfig;
pub use credentials::{CredentialConfig, CredentialRotator, SecretString, TokenSource};
pub use error::{ContextExt, Error, ErrorKind, Result};
pub use pipeline::{CallContext, Pipeline, PipelineBuilder, Stage};
pub use request::{RequestSpec, RequestSpecBuilder};
pub use response::Response;
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpTransport, Transport};

/// Prelude for convenient imports.
///
/// ```rust
/// use pipeguard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
    pub use crate::config::PipelineConfig;
    pub use crate::credentials::{CredentialConfig, CredentialRotator, SecretString, TokenSource};
    pub use crate::error::{ContextExt, Error, ErrorKind, Result};
    pub use crate::logging::{init_logging, try_init_logging, LogConfig, LogFormat, LogLevel};
    pub use crate::pipeline::{CallContext, Pipeline, PipelineBuilder};
    pub use crate::rate_limiter::RateConfig;
    pub use crate::request::{RequestSpec, RequestSpecBuilder};
    pub use crate::response::Response;
    pub use crate::retry::RetryConfig;
    pub use crate::transport::{HttpTransport, Transport, TransportConfig};
    pub use serde::{Deserialize, Serialize};
    pub use tokio_util::sync::CancellationToken;
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_and_name() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "pipeguard");
    }
}
