//! Pipeline response type.
//!
//! The transport reads the whole upstream body once for classification and
//! logging, then hands the caller a [`Response`] holding the already-read
//! bytes, so the body remains fully readable (and cheaply cloneable) after
//! the pipeline is done with it.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A successful upstream response.
///
/// The transport treats every 2xx status as success, not only 200, so a
/// `Response` may carry e.g. 201 or 204; non-2xx statuses surface as
/// classified errors instead.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Response {
    /// Creates a response from its parts.
    pub fn new(status: u16, headers: HashMap<String, String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns a response header by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// All response headers, names lowercased.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Raw response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body interpreted as UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| Error::unmarshal(format!("response body is not valid UTF-8: {e}")))
    }

    /// Decodes the body into the caller's target type.
    ///
    /// A decode failure is classified as `Unmarshal`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::unmarshal(format!("failed to decode response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        id: u64,
        name: String,
    }

    fn response(body: &'static [u8]) -> Response {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Response::new(200, headers, body)
    }

    #[test]
    fn json_decodes_target_type() {
        let r = response(b"{\"id\":7,\"name\":\"probe\"}");
        let decoded: Payload = r.json().unwrap();
        assert_eq!(
            decoded,
            Payload {
                id: 7,
                name: "probe".to_string()
            }
        );
    }

    #[test]
    fn json_failure_is_unmarshal() {
        let r = response(b"not json");
        let err = r.json::<Payload>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unmarshal);
    }

    #[test]
    fn body_readable_after_decode() {
        let r = response(b"{\"id\":7,\"name\":\"probe\"}");
        let _: Payload = r.json().unwrap();
        // The body is still available for a second read.
        assert!(r.text().unwrap().contains("probe"));
    }

    #[test]
    fn header_lookup() {
        let r = response(b"{}");
        assert_eq!(r.header("content-type"), Some("application/json"));
        assert_eq!(r.header("x-missing"), None);
    }
}
