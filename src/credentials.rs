//! Session credential rotation and CSRF token caching.
//!
//! The upstream API authenticates with rotating cookie-style session
//! secrets, plus a short-lived CSRF token for state-changing endpoints. This
//! module owns both concerns:
//!
//! - [`CredentialRotator`] round-robins across a replaceable set of
//!   [`SecretString`] secrets and produces the authentication headers for
//!   one outbound request.
//! - A single cached CSRF token, refreshed on demand through a dedicated
//!   upstream call and valid for a fixed TTL. The refresh is serialized
//!   behind an async mutex, so N concurrent callers observing a stale token
//!   trigger exactly one upstream refresh.
//!
//! Secrets are zeroized on drop and redacted from `Debug`/`Display` output,
//! so an accidental log statement cannot leak them.
//!
//! Locking: the secret list sits behind a reader-writer lock (many
//! concurrent header reads, rare full replacement); the round-robin cursor
//! is an atomic counter reduced modulo the current length while the read
//! lock is held, which avoids racing a concurrent replacement that shrinks
//! the set. The lock is never held across an await point; the only
//! lock-across-IO in this module is the CSRF mutex, which is exactly what
//! serializes refreshes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::pipeline::CallContext;
use crate::response::Response;

/// Default TTL for a fetched CSRF token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// A session secret that is zeroed on drop and redacted in logs.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret. Use the reference immediately; do not persist it.
    #[inline]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Credential handling configuration.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Header carrying the session secret. Default: `cookie`.
    pub session_header: String,
    /// Header carrying the CSRF token, both on outgoing requests and on the
    /// token endpoint's response. Default: `x-csrf-token`.
    pub csrf_header: String,
    /// Endpoint POSTed to when the cached token is stale. Must be set
    /// before any call with the CSRF flag enabled.
    pub token_endpoint: String,
    /// How long a fetched token stays usable. Default: 5 minutes.
    pub token_ttl: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            session_header: "cookie".to_string(),
            csrf_header: "x-csrf-token".to_string(),
            token_endpoint: String::new(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

/// Issues the dedicated upstream call that yields a fresh CSRF token.
///
/// Implemented by the HTTP transport in production; tests inject mocks to
/// count refreshes.
#[async_trait]
pub trait TokenSource: Send + Sync + fmt::Debug {
    /// POSTs to `endpoint` with the given session header and returns the
    /// raw response. The rotator extracts the token from the response
    /// headers.
    async fn issue(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        session_header: (&str, &str),
    ) -> Result<Response>;
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Rotates session credentials and produces authentication headers.
///
/// Process-wide: one rotator is shared by every call in a pipeline. The set
/// can be replaced at runtime through [`CredentialRotator::update_credentials`]
/// without disturbing in-flight requests.
#[derive(Debug)]
pub struct CredentialRotator {
    config: CredentialConfig,
    secrets: RwLock<Vec<SecretString>>,
    cursor: AtomicUsize,
    csrf: tokio::sync::Mutex<Option<CachedToken>>,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl CredentialRotator {
    /// Creates a rotator over an initial credential set.
    pub fn new(
        credentials: Vec<String>,
        config: CredentialConfig,
        tokens: Option<Arc<dyn TokenSource>>,
    ) -> Self {
        Self {
            config,
            secrets: RwLock::new(credentials.into_iter().map(SecretString::new).collect()),
            cursor: AtomicUsize::new(0),
            csrf: tokio::sync::Mutex::new(None),
            tokens,
        }
    }

    /// Selects the next credential in round-robin order.
    ///
    /// Fails with `NoCredentialAvailable` when the set is empty.
    pub fn next_credential(&self) -> Result<String> {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if secrets.is_empty() {
            return Err(Error::NoCredentialAvailable);
        }
        // The modulo happens under the read lock so a concurrent
        // replacement cannot leave the index out of range.
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % secrets.len();
        Ok(secrets[idx].expose_secret().to_string())
    }

    /// Produces the authentication headers for one outbound request.
    ///
    /// With the credential flag set, the next secret in rotation is emitted
    /// as the session header. With the CSRF flag set, the cached token is
    /// reused while fresh; otherwise one refresh call is made against the
    /// token endpoint with the just-selected credential.
    pub async fn headers(
        &self,
        ctx: &CallContext,
        use_credential: bool,
        use_csrf_token: bool,
    ) -> Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        if !use_credential && !use_csrf_token {
            return Ok(headers);
        }

        let secret = self.next_credential()?;
        if use_credential {
            headers.insert(self.config.session_header.clone(), secret.clone());
        }
        if use_csrf_token {
            let token = self.csrf_token(ctx, &secret).await?;
            headers.insert(self.config.csrf_header.clone(), token);
        }
        Ok(headers)
    }

    /// Atomically replaces the credential set.
    ///
    /// The cursor is reseeded to a random index so replicas sharing a
    /// freshly-rotated pool spread their load instead of all starting from
    /// the first entry.
    pub fn update_credentials(&self, credentials: Vec<String>) {
        let replacement: Vec<SecretString> =
            credentials.into_iter().map(SecretString::new).collect();
        let count = replacement.len();
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *secrets = replacement;
        if count > 0 {
            self.cursor
                .store(rand::rng().random_range(0..count), Ordering::Relaxed);
        } else {
            self.cursor.store(0, Ordering::Relaxed);
        }
        info!(credentials = count, "credential set replaced");
    }

    /// Number of credentials currently held.
    pub fn len(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the credential set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached CSRF token, refreshing it if stale.
    ///
    /// The mutex is held for the duration of a refresh, so concurrent
    /// callers that all find the token stale produce one upstream call; the
    /// rest observe the freshly-cached value when the lock is released.
    /// Waiting for the lock is bounded by the caller's own deadline and
    /// cancellation token, so a slow refresh stalls only the leader.
    async fn csrf_token(&self, ctx: &CallContext, secret: &str) -> Result<String> {
        let mut guard = tokio::select! {
            guard = self.csrf.lock() => guard,
            _ = tokio::time::sleep_until(ctx.deadline()) => {
                return Err(Error::timeout("call deadline elapsed"));
            }
            _ = ctx.cancel_token().cancelled() => {
                return Err(Error::timeout("call cancelled"));
            }
        };
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        if self.config.token_endpoint.is_empty() {
            return Err(Error::internal("CSRF token endpoint not configured"));
        }
        let tokens = self
            .tokens
            .as_ref()
            .ok_or_else(|| Error::internal("no CSRF token source configured"))?;

        let response = tokens
            .issue(
                ctx,
                &self.config.token_endpoint,
                (&self.config.session_header, secret),
            )
            .await?;
        let value = response
            .header(&self.config.csrf_header)
            .ok_or(Error::TokenNotFound)?
            .to_string();

        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + self.config.token_ttl,
        });
        debug!(ttl_secs = self.config.token_ttl.as_secs(), "CSRF token refreshed");
        Ok(value)
    }
}
