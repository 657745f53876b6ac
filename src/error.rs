//! Error handling for the request pipeline.
//!
//! Every failure a caller can observe is expressed through the [`Error`]
//! enum, and every variant maps to exactly one [`ErrorKind`]. The kind is
//! what drives policy decisions elsewhere in the crate: the retry layer
//! retries only the kinds reported as retryable by [`Error::is_retryable`],
//! and the circuit breaker produces only its own two kinds while passing
//! everything else through untouched.
//!
//! Design notes:
//!
//! - All variants carry owned strings or JSON values, so `Error` is `Clone`.
//!   The deduplication layer relies on this to broadcast a single outcome to
//!   every waiting caller.
//! - Public enums are `#[non_exhaustive]` so new kinds can be added without
//!   a breaking release.
//! - A [`Error::Context`] wrapper preserves the chain; helper methods
//!   penetrate context layers so callers can always inspect the root kind.
//!
//! # Example
//!
//! ```rust
//! use pipeguard::error::{Error, ErrorKind};
//!
//! let err = Error::network("connection refused").context("fetching /v1/session");
//! assert_eq!(err.kind(), ErrorKind::Network);
//! assert!(err.is_retryable());
//! ```

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of an error message retained from an HTTP body.
const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Truncates a response body carried inside an error so a large upstream
/// payload cannot bloat error values that get cloned and logged.
pub(crate) fn truncate_message(mut msg: String) -> String {
    if msg.len() > MAX_ERROR_MESSAGE_LEN {
        msg.truncate(MAX_ERROR_MESSAGE_LEN);
        msg.push_str("... (truncated)");
    }
    msg
}

/// Coarse classification of an [`Error`].
///
/// Kinds are stable across context wrapping: `err.kind()` always reports the
/// kind of the underlying error, however many context layers were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transport-level failure (connect, DNS, TLS, broken pipe).
    Network,
    /// Deadline elapsed or the call was cancelled.
    Timeout,
    /// Upstream rejected the session credential.
    Auth,
    /// Structured business error reported by the upstream API.
    Api,
    /// Unclassified non-2xx HTTP response.
    Http,
    /// Local rate limiter reported saturation.
    RateLimited,
    /// Upstream returned HTTP 429.
    TooManyRequests,
    /// Response body could not be decoded into the caller's target type.
    Unmarshal,
    /// Invariant violation inside the pipeline itself.
    Internal,
    /// Circuit breaker is open; no upstream attempt was made.
    CircuitOpen,
    /// Circuit breaker is half-open and its trial quota is used up.
    CircuitExhausted,
    /// The credential set is empty.
    NoCredentialAvailable,
    /// The token endpoint response did not carry a CSRF token.
    TokenNotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::Api => "api",
            ErrorKind::Http => "http",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::Unmarshal => "unmarshal",
            ErrorKind::Internal => "internal",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::CircuitExhausted => "circuit_exhausted",
            ErrorKind::NoCredentialAvailable => "no_credential_available",
            ErrorKind::TokenNotFound => "token_not_found",
        };
        f.write_str(name)
    }
}

/// Details of a structured error payload returned by the upstream API.
///
/// Boxed inside [`Error::Api`] to keep the enum small.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct ApiErrorDetails {
    /// Upstream error code (numeric or alphanumeric, kept as a string).
    pub code: String,
    /// Human-readable message from the upstream.
    pub message: String,
    /// Raw error payload for debugging, when one was parseable.
    pub data: Option<serde_json::Value>,
}

impl ApiErrorDetails {
    /// Creates details from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Creates details carrying the raw response payload.
    pub fn with_data(
        code: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: Some(data),
        }
    }
}

impl fmt::Display for ApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

/// The primary error type of the pipeline.
///
/// Variants use `Cow<'static, str>` so constructing an error from a static
/// message allocates nothing.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(Cow<'static, str>),

    /// Deadline elapsed or the call was cancelled.
    #[error("timeout: {0}")]
    Timeout(Cow<'static, str>),

    /// Upstream rejected the session credential.
    #[error("authentication error: {0}")]
    Auth(Cow<'static, str>),

    /// Structured business error reported by the upstream API.
    #[error("upstream error: {0}")]
    Api(Box<ApiErrorDetails>),

    /// Unclassified non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Local rate limiter reported saturation.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Error message.
        message: Cow<'static, str>,
        /// Suggested wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Upstream returned HTTP 429.
    #[error("too many requests (HTTP 429)")]
    TooManyRequests {
        /// Value of the `Retry-After` header when given in seconds; the
        /// HTTP-date form is not parsed and yields `None`.
        retry_after: Option<Duration>,
    },

    /// Response body could not be decoded into the caller's target type.
    #[error("failed to decode response: {0}")]
    Unmarshal(Cow<'static, str>),

    /// Invariant violation inside the pipeline itself.
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),

    /// Circuit breaker is open; the request was rejected without an
    /// upstream attempt.
    #[error("circuit breaker is open")]
    CircuitOpen {
        /// Time remaining until the breaker probes recovery.
        retry_after: Option<Duration>,
    },

    /// Circuit breaker is half-open and its trial quota is used up.
    #[error("circuit breaker half-open quota exhausted")]
    CircuitExhausted,

    /// The credential set is empty.
    #[error("no credential available")]
    NoCredentialAvailable,

    /// The token endpoint response did not carry a CSRF token.
    #[error("CSRF token not found in upstream response")]
    TokenNotFound,

    /// Error with additional context, preserving the chain.
    #[error("{context}")]
    Context {
        /// Description of the operation that failed.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    // ==================== Constructors ====================

    /// Creates a network error.
    pub fn network(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a timeout error.
    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an authentication error.
    pub fn auth(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Auth(msg.into())
    }

    /// Creates a structured upstream API error.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api(Box::new(ApiErrorDetails::new(code, message)))
    }

    /// Creates a structured upstream API error carrying the raw payload.
    pub fn api_with_data(
        code: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::Api(Box::new(ApiErrorDetails::with_data(code, message, data)))
    }

    /// Creates an unclassified HTTP error from a status and body.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: truncate_message(body.into()),
        }
    }

    /// Creates a local rate limiter error.
    pub fn rate_limited(
        message: impl Into<Cow<'static, str>>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates an HTTP 429 error.
    pub fn too_many_requests(retry_after: Option<Duration>) -> Self {
        Self::TooManyRequests { retry_after }
    }

    /// Creates a decode error.
    pub fn unmarshal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Unmarshal(msg.into())
    }

    /// Creates an internal pipeline error.
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates a circuit-open rejection.
    pub fn circuit_open(retry_after: Option<Duration>) -> Self {
        Self::CircuitOpen { retry_after }
    }

    // ==================== Classification ====================

    /// Returns the kind of the underlying error, penetrating context layers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Api(_) => ErrorKind::Api,
            Error::Http { .. } => ErrorKind::Http,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::TooManyRequests { .. } => ErrorKind::TooManyRequests,
            Error::Unmarshal(_) => ErrorKind::Unmarshal,
            Error::Internal(_) => ErrorKind::Internal,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::CircuitExhausted => ErrorKind::CircuitExhausted,
            Error::NoCredentialAvailable => ErrorKind::NoCredentialAvailable,
            Error::TokenNotFound => ErrorKind::TokenNotFound,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Whether the retry layer may re-attempt after this error.
    ///
    /// Retryable kinds: `Network`, `Timeout`, `RateLimited`,
    /// `TooManyRequests`. Everything else is terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::TooManyRequests
        )
    }

    /// Suggested wait before retrying, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. }
            | Error::TooManyRequests { retry_after }
            | Error::CircuitOpen { retry_after } => *retry_after,
            Error::Context { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    // ==================== Context ====================

    /// Attaches context to an existing error.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    fn iter_chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |err| match err {
            Error::Context { source, .. } => Some(source.as_ref()),
            _ => None,
        })
    }

    /// Returns the root cause, skipping context layers.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        self.iter_chain().last().unwrap_or(self)
    }

    /// Renders the full error chain, one cause per line.
    #[must_use]
    pub fn report(&self) -> String {
        use std::fmt::Write;
        let mut report = self.to_string();
        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            let _ = write!(report, "\nCaused by: {err}");
            current = err.source();
        }
        report
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(Cow::Owned(truncate_message(e.to_string())))
        } else {
            Error::Network(Cow::Owned(truncate_message(e.to_string())))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Unmarshal(Cow::Owned(e.to_string()))
    }
}

/// Extension trait for attaching context to `Result` values.
pub trait ContextExt<T> {
    /// Attaches a static context message.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Attaches a lazily-built context message.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ContextExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

// ==================== Configuration validation ====================

/// A configuration validation error.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigValidationError {
    /// A field holds an invalid value.
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Description of the violation.
        message: String,
    },

    /// A numeric field exceeds its allowed maximum.
    #[error("'{field}' is {value}, must be at most {max}")]
    ValueTooHigh {
        /// Field name.
        field: &'static str,
        /// Configured value.
        value: u64,
        /// Allowed maximum.
        max: u64,
    },

    /// A numeric field is below its allowed minimum.
    #[error("'{field}' is {value}, must be at least {min}")]
    ValueTooLow {
        /// Field name.
        field: &'static str,
        /// Configured value.
        value: u64,
        /// Allowed minimum.
        min: u64,
    },
}

impl ConfigValidationError {
    /// Creates an `Invalid` error.
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }

    /// Creates a `ValueTooHigh` error.
    pub fn too_high(field: &'static str, value: impl Into<u64>, max: u64) -> Self {
        Self::ValueTooHigh {
            field,
            value: value.into(),
            max,
        }
    }

    /// Creates a `ValueTooLow` error.
    pub fn too_low(field: &'static str, value: impl Into<u64>, min: u64) -> Self {
        Self::ValueTooLow {
            field,
            value: value.into(),
            min,
        }
    }

    /// Returns the name of the offending field.
    #[must_use]
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Invalid { field, .. }
            | Self::ValueTooHigh { field, .. }
            | Self::ValueTooLow { field, .. } => field,
        }
    }
}

/// Outcome of a successful validation, possibly carrying warnings about
/// suboptimal but legal settings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Creates a validation result with the given warnings.
    #[must_use]
    pub fn with_warnings(warnings: Vec<String>) -> Self {
        Self { warnings }
    }

    /// Merges another result's warnings into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Error::network("x").kind(), ErrorKind::Network);
        assert_eq!(Error::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(Error::auth("x").kind(), ErrorKind::Auth);
        assert_eq!(Error::api("1", "x").kind(), ErrorKind::Api);
        assert_eq!(Error::http(500, "x").kind(), ErrorKind::Http);
        assert_eq!(
            Error::rate_limited("x", None).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            Error::too_many_requests(None).kind(),
            ErrorKind::TooManyRequests
        );
        assert_eq!(Error::unmarshal("x").kind(), ErrorKind::Unmarshal);
        assert_eq!(Error::internal("x").kind(), ErrorKind::Internal);
        assert_eq!(Error::circuit_open(None).kind(), ErrorKind::CircuitOpen);
        assert_eq!(Error::CircuitExhausted.kind(), ErrorKind::CircuitExhausted);
        assert_eq!(
            Error::NoCredentialAvailable.kind(),
            ErrorKind::NoCredentialAvailable
        );
        assert_eq!(Error::TokenNotFound.kind(), ErrorKind::TokenNotFound);
    }

    #[test]
    fn kind_penetrates_context() {
        let err = Error::auth("bad cookie")
            .context("fetching session headers")
            .context("executing request");
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::network("x").is_retryable());
        assert!(Error::timeout("x").is_retryable());
        assert!(Error::rate_limited("x", None).is_retryable());
        assert!(Error::too_many_requests(None).is_retryable());

        assert!(!Error::auth("x").is_retryable());
        assert!(!Error::api("1", "x").is_retryable());
        assert!(!Error::http(500, "x").is_retryable());
        assert!(!Error::unmarshal("x").is_retryable());
        assert!(!Error::internal("x").is_retryable());
        assert!(!Error::circuit_open(None).is_retryable());
        assert!(!Error::CircuitExhausted.is_retryable());
        assert!(!Error::NoCredentialAvailable.is_retryable());
        assert!(!Error::TokenNotFound.is_retryable());
    }

    #[test]
    fn retryable_penetrates_context() {
        let err = Error::network("reset").context("sending request");
        assert!(err.is_retryable());
    }

    #[test]
    fn root_cause_skips_context() {
        let err = Error::timeout("deadline").context("a").context("b");
        assert_eq!(err.root_cause().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn report_includes_chain() {
        let err = Error::network("connection refused").context("fetching token");
        let report = err.report();
        assert!(report.contains("fetching token"));
        assert!(report.contains("connection refused"));
    }

    #[test]
    fn retry_after_carried_through() {
        let err = Error::too_many_requests(Some(Duration::from_secs(7))).context("call");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn http_body_truncated() {
        let long = "x".repeat(5000);
        if let Error::Http { body, .. } = Error::http(500, long) {
            assert!(body.len() < 1100);
            assert!(body.ends_with("(truncated)"));
        } else {
            panic!("expected Http variant");
        }
    }

    #[test]
    fn errors_are_clone() {
        let err = Error::api_with_data("429", "slow down", serde_json::json!({"code": 429}));
        let cloned = err.clone();
        assert_eq!(cloned.kind(), ErrorKind::Api);
    }

    #[test]
    fn config_validation_field_name() {
        let err = ConfigValidationError::too_high("max_attempts", 20u32, 10);
        assert_eq!(err.field_name(), "max_attempts");
    }
}
