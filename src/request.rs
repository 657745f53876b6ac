//! Request specification.
//!
//! A [`RequestSpec`] describes one logical upstream call: method, URL,
//! ordered query parameters, headers, optional body, and two capability
//! flags controlling credential and CSRF-token injection. Specs are built
//! once via [`RequestSpecBuilder`] and never mutated by the pipeline; the
//! stages read from the spec and carry their own per-call state elsewhere.

use std::collections::HashMap;

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Fingerprint identifying duplicate in-flight requests.
///
/// Derived deterministically from method, URL, query string and body.
pub type Fingerprint = [u8; 32];

/// An immutable description of one logical upstream call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    use_credential: bool,
    use_csrf_token: bool,
}

impl RequestSpec {
    /// Starts building a spec with the given method and URL.
    pub fn builder(method: Method, url: impl Into<String>) -> RequestSpecBuilder {
        RequestSpecBuilder::new(method, url)
    }

    /// Starts building a GET request.
    pub fn get(url: impl Into<String>) -> RequestSpecBuilder {
        Self::builder(Method::GET, url)
    }

    /// Starts building a POST request.
    pub fn post(url: impl Into<String>) -> RequestSpecBuilder {
        Self::builder(Method::POST, url)
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL, without query parameters.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ordered query parameters.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Caller-supplied headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Request body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether a session credential header should be injected.
    pub fn use_credential(&self) -> bool {
        self.use_credential
    }

    /// Whether a CSRF token header should be injected.
    pub fn use_csrf_token(&self) -> bool {
        self.use_csrf_token
    }

    /// Computes the deduplication fingerprint for this spec.
    ///
    /// Two specs with the same method, URL, query parameters (in order) and
    /// body produce the same fingerprint. Headers and capability flags do
    /// not participate.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.url.as_bytes());
        hasher.update([0u8]);
        for (key, value) in &self.query {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([b'&']);
        }
        hasher.update([0u8]);
        if let Some(body) = &self.body {
            hasher.update(body);
        }
        hasher.finalize().into()
    }
}

/// Builder for [`RequestSpec`].
#[derive(Debug, Clone)]
pub struct RequestSpecBuilder {
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
    use_credential: bool,
    use_csrf_token: bool,
}

impl RequestSpecBuilder {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: HashMap::new(),
            body: None,
            use_credential: false,
            use_csrf_token: false,
        }
    }

    /// Appends a query parameter. Parameters keep insertion order and may
    /// repeat.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets a header, replacing any previous value for the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the raw request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON body and sets the content type.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| Error::internal(format!("failed to encode request body: {e}")))?;
        self.body = Some(Bytes::from(encoded));
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }

    /// Requests injection of a session credential header.
    #[must_use]
    pub fn use_credential(mut self, yes: bool) -> Self {
        self.use_credential = yes;
        self
    }

    /// Requests injection of a CSRF token header. Implies nothing about the
    /// credential flag; state-changing endpoints typically set both.
    #[must_use]
    pub fn use_csrf_token(mut self, yes: bool) -> Self {
        self.use_csrf_token = yes;
        self
    }

    /// Finalizes the spec.
    pub fn build(self) -> Result<RequestSpec> {
        if self.url.is_empty() {
            return Err(Error::internal("request URL must not be empty"));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(Error::internal(format!(
                "request URL must be absolute: {}",
                self.url
            )));
        }
        Ok(RequestSpec {
            method: self.method,
            url: self.url,
            query: self.query,
            headers: self.headers,
            body: self.body,
            use_credential: self.use_credential,
            use_csrf_token: self.use_csrf_token,
        })
    }
}
