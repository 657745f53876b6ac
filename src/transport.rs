//! HTTP transport execution.
//!
//! The terminal stage of the pipeline: [`TransportStage`] gathers the
//! authentication headers from the credential rotator, picks an egress
//! proxy (one selection per attempt, so a retry may leave on a different
//! proxy than the attempt before it), and hands the request to a
//! [`Transport`].
//!
//! [`HttpTransport`] is the production implementation over `reqwest`. It
//! keeps one direct client plus one cached client per proxy endpoint,
//! since a proxy is a client-level setting. Upstream responses are fully
//! read and classified here: transport failures map to `Network` or
//! `Timeout`, HTTP 429 to `TooManyRequests`, 401/403 to `Auth`, and other
//! non-2xx statuses to a structured `Api` error when the body parses as
//! an upstream error payload, otherwise to a generic `Http` error. The
//! body is handed back re-wrapped so callers can still read it after
//! classification.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::credentials::{CredentialRotator, TokenSource};
use crate::error::{ConfigValidationError, Error, Result, ValidationResult};
use crate::pipeline::{CallContext, Next, Stage};
use crate::proxy::ProxySelector;
use crate::request::RequestSpec;
use crate::response::Response;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout, independent of the per-call deadline.
    pub connect_timeout: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
            pool_max_idle_per_host: 8,
        }
    }
}

impl TransportConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<ValidationResult, ConfigValidationError> {
        let result = ValidationResult::default();
        if self.connect_timeout.is_zero() {
            return Err(ConfigValidationError::invalid(
                "connect_timeout",
                "must be non-zero",
            ));
        }
        if self.user_agent.is_empty() {
            return Err(ConfigValidationError::invalid(
                "user_agent",
                "must not be empty",
            ));
        }
        Ok(result)
    }
}

/// Executes one prepared request against the upstream.
///
/// Implemented by [`HttpTransport`] in production; tests inject mocks to
/// observe headers and proxy selection.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends the request with the given injected headers, optionally via a
    /// proxy, and returns the classified response.
    async fn send(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        headers: HashMap<String, String>,
        proxy: Option<&str>,
    ) -> Result<Response>;
}

/// Production transport over a pooled `reqwest` client.
#[derive(Debug)]
pub struct HttpTransport {
    config: TransportConfig,
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpTransport {
    /// Creates a transport with a direct (proxyless) client.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let direct = Self::client_builder(&config)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_builder(config: &TransportConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .gzip(true)
    }

    /// Returns the client for the given egress, building and caching a
    /// proxied client on first use of each endpoint.
    fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let Some(uri) = proxy else {
            return Ok(self.direct.clone());
        };
        let mut cache = self
            .proxied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(client) = cache.get(uri) {
            return Ok(client.clone());
        }
        let proxy = reqwest::Proxy::all(uri)
            .map_err(|e| Error::internal(format!("invalid proxy endpoint '{uri}': {e}")))?;
        let client = Self::client_builder(&self.config)
            .proxy(proxy)
            .build()
            .map_err(|e| Error::internal(format!("failed to build proxied client: {e}")))?;
        cache.insert(uri.to_string(), client.clone());
        Ok(client)
    }

    fn build_request(
        &self,
        client: &Client,
        spec: &RequestSpec,
        injected: HashMap<String, String>,
    ) -> Result<reqwest::Request> {
        let mut headers = HeaderMap::new();
        for (name, value) in spec.headers().iter().chain(injected.iter()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::internal(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::internal(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = client
            .request(spec.method().clone(), spec.url())
            .headers(headers);
        if !spec.query().is_empty() {
            builder = builder.query(spec.query());
        }
        if let Some(body) = spec.body() {
            builder = builder.body(body.clone());
        }
        builder
            .build()
            .map_err(|e| Error::internal(format!("failed to build request: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        headers: HashMap<String, String>,
        proxy: Option<&str>,
    ) -> Result<Response> {
        let client = self.client_for(proxy)?;
        let request = self.build_request(&client, spec, headers)?;
        let remaining = ctx.remaining()?;
        debug!(
            method = %spec.method(),
            url = %spec.url(),
            proxy = proxy.unwrap_or("direct"),
            budget_ms = remaining.as_millis() as u64,
            "sending upstream request"
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(remaining, client.execute(request)) => result,
            _ = ctx.cancel_token().cancelled() => {
                return Err(Error::timeout("call cancelled"));
            }
        };
        let response = match outcome {
            Err(_) => return Err(Error::timeout("request deadline elapsed")),
            Ok(Err(e)) => return Err(Error::from(e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Error::from)?;
        trace!(status, body_len = body.len(), "upstream response received");
        classify(status, headers, body)
    }
}

#[async_trait]
impl TokenSource for HttpTransport {
    async fn issue(
        &self,
        ctx: &CallContext,
        endpoint: &str,
        session_header: (&str, &str),
    ) -> Result<Response> {
        let spec = RequestSpec::post(endpoint)
            .header(session_header.0, session_header.1)
            .build()?;
        self.send(ctx, &spec, HashMap::new(), None).await
    }
}

/// Shape of the upstream's structured error payload.
#[derive(Debug, Deserialize)]
struct ApiErrorPayload {
    code: Option<serde_json::Value>,
    #[serde(alias = "msg")]
    message: Option<String>,
}

/// Maps an upstream status/body to a success or a classified error.
fn classify(status: u16, headers: HashMap<String, String>, body: Bytes) -> Result<Response> {
    if (200..300).contains(&status) {
        return Ok(Response::new(status, headers, body));
    }
    if status == 429 {
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(Error::too_many_requests(retry_after));
    }
    if status == 401 || status == 403 {
        return Err(Error::auth(format!(
            "upstream rejected credentials (HTTP {status})"
        )));
    }
    if let Ok(payload) = serde_json::from_slice::<ApiErrorPayload>(&body) {
        if payload.code.is_some() || payload.message.is_some() {
            let code = payload
                .code
                .map(|c| match c {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| status.to_string());
            let message = payload.message.unwrap_or_default();
            let raw = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
            return Err(Error::api_with_data(code, message, raw));
        }
    }
    Err(Error::http(status, String::from_utf8_lossy(&body).into_owned()))
}

/// Terminal stage: header injection, proxy selection, upstream execution.
#[derive(Debug)]
pub struct TransportStage {
    transport: Arc<dyn Transport>,
    rotator: Arc<CredentialRotator>,
    proxies: Arc<ProxySelector>,
}

impl TransportStage {
    /// Creates the terminal stage.
    pub fn new(
        transport: Arc<dyn Transport>,
        rotator: Arc<CredentialRotator>,
        proxies: Arc<ProxySelector>,
    ) -> Self {
        Self {
            transport,
            rotator,
            proxies,
        }
    }
}

#[async_trait]
impl Stage for TransportStage {
    async fn handle(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
        _next: Next<'_>,
    ) -> Result<Response> {
        let headers = self
            .rotator
            .headers(ctx, spec.use_credential(), spec.use_csrf_token())
            .await?;
        // An empty proxy set means direct egress, not an error.
        let proxy = if self.proxies.is_empty() {
            None
        } else {
            Some(self.proxies.next()?)
        };
        self.transport
            .send(ctx, spec, headers, proxy.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialConfig;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Transport recording what it was asked to send.
    #[derive(Debug, Default)]
    struct RecordingTransport {
        sends: Mutex<Vec<(HashMap<String, String>, Option<String>)>>,
        calls: AtomicUsize,
    }

    impl RecordingTransport {
        fn sends(&self) -> Vec<(HashMap<String, String>, Option<String>)> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            _ctx: &CallContext,
            _spec: &RequestSpec,
            headers: HashMap<String, String>,
            proxy: Option<&str>,
        ) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sends
                .lock()
                .unwrap()
                .push((headers, proxy.map(str::to_string)));
            Ok(Response::new(200, HashMap::new(), &b"{}"[..]))
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(Duration::from_secs(30), CancellationToken::new())
    }

    fn stage(
        transport: Arc<RecordingTransport>,
        credentials: &[&str],
        proxies: Vec<String>,
    ) -> TransportStage {
        let rotator = Arc::new(CredentialRotator::new(
            credentials.iter().map(|s| s.to_string()).collect(),
            CredentialConfig::default(),
            None,
        ));
        TransportStage::new(transport, rotator, Arc::new(ProxySelector::new(proxies)))
    }

    fn authed_spec() -> RequestSpec {
        RequestSpec::get("https://api.example.com/v1/account")
            .use_credential(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn injects_session_header() {
        let transport = Arc::new(RecordingTransport::default());
        let stage = stage(transport.clone(), &["session-a"], vec![]);
        stage
            .handle(&ctx(), &authed_spec(), Next::new(&[]))
            .await
            .unwrap();
        let sends = transport.sends();
        assert_eq!(sends[0].0.get("cookie").unwrap(), "session-a");
    }

    #[tokio::test]
    async fn empty_proxy_set_means_direct_egress() {
        let transport = Arc::new(RecordingTransport::default());
        let stage = stage(transport.clone(), &["s"], vec![]);
        stage
            .handle(&ctx(), &authed_spec(), Next::new(&[]))
            .await
            .unwrap();
        assert_eq!(transport.sends()[0].1, None);
    }

    #[tokio::test]
    async fn proxies_rotate_per_attempt() {
        let transport = Arc::new(RecordingTransport::default());
        let stage = stage(
            transport.clone(),
            &["s"],
            vec!["http://p1:8080".into(), "http://p2:8080".into()],
        );
        for _ in 0..3 {
            stage
                .handle(&ctx(), &authed_spec(), Next::new(&[]))
                .await
                .unwrap();
        }
        let proxies: Vec<Option<String>> =
            transport.sends().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            proxies,
            vec![
                Some("http://p1:8080".to_string()),
                Some("http://p2:8080".to_string()),
                Some("http://p1:8080".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_send() {
        let transport = Arc::new(RecordingTransport::default());
        let stage = stage(transport.clone(), &[], vec![]);
        let err = stage
            .handle(&ctx(), &authed_spec(), Next::new(&[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCredentialAvailable);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn classify_accepts_2xx() {
        let response = classify(204, HashMap::new(), Bytes::new()).unwrap();
        assert_eq!(response.status(), 204);
    }

    #[test]
    fn classify_maps_429_with_retry_after() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "17".to_string());
        let err = classify(429, headers, Bytes::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooManyRequests);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    }

    #[test]
    fn classify_maps_auth_statuses() {
        for status in [401, 403] {
            let err = classify(status, HashMap::new(), Bytes::new()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Auth);
        }
    }

    #[test]
    fn classify_parses_structured_api_error() {
        let body = Bytes::from_static(b"{\"code\":\"ORDER_REJECTED\",\"msg\":\"insufficient margin\"}");
        let err = classify(400, HashMap::new(), body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        assert!(err.to_string().contains("ORDER_REJECTED"));
    }

    #[test]
    fn classify_falls_back_to_generic_http() {
        let body = Bytes::from_static(b"<html>bad gateway</html>");
        let err = classify(502, HashMap::new(), body).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Http);
    }
}
