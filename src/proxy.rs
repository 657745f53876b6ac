//! Egress proxy selection.
//!
//! Outbound traffic fans out across a replaceable set of HTTP proxy
//! endpoints, one picked per attempt in round-robin order. An empty set is
//! a valid configuration meaning direct egress; the transport checks
//! [`ProxySelector::is_empty`] before asking for an endpoint.
//!
//! Selection and replacement use the same locking shape as credential
//! rotation: a reader-writer lock over the endpoint list and an atomic
//! cursor reduced modulo the current length under the read lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use rand::Rng;
use tracing::info;

use crate::error::{Error, Result};

/// Round-robin selector over egress proxy endpoints.
#[derive(Debug)]
pub struct ProxySelector {
    endpoints: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl ProxySelector {
    /// Creates a selector over an initial endpoint set.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Selects the next proxy endpoint in round-robin order.
    ///
    /// Fails when the set is empty; callers that want direct egress check
    /// [`ProxySelector::is_empty`] instead of calling this.
    pub fn next(&self) -> Result<String> {
        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if endpoints.is_empty() {
            return Err(Error::internal("no proxy endpoint available"));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Ok(endpoints[idx].clone())
    }

    /// Atomically replaces the endpoint set, reseeding the cursor to a
    /// random index.
    pub fn update(&self, replacement: Vec<String>) {
        let count = replacement.len();
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *endpoints = replacement;
        if count > 0 {
            self.cursor
                .store(rand::rng().random_range(0..count), Ordering::Relaxed);
        } else {
            self.cursor.store(0, Ordering::Relaxed);
        }
        info!(proxies = count, "proxy set replaced");
    }

    /// Number of endpoints currently held.
    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the set is empty (direct egress).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_in_order() {
        let s = ProxySelector::new(vec![
            "http://p1:8080".into(),
            "http://p2:8080".into(),
            "http://p3:8080".into(),
        ]);
        let picked: Vec<String> = (0..6).map(|_| s.next().unwrap()).collect();
        assert_eq!(
            picked,
            vec![
                "http://p1:8080",
                "http://p2:8080",
                "http://p3:8080",
                "http://p1:8080",
                "http://p2:8080",
                "http://p3:8080",
            ]
        );
    }

    #[test]
    fn empty_set_fails() {
        let s = ProxySelector::new(vec![]);
        assert!(s.is_empty());
        assert!(s.next().is_err());
    }

    #[test]
    fn update_replaces_endpoints() {
        let s = ProxySelector::new(vec!["http://old:1".into()]);
        s.update(vec!["http://new:1".into(), "http://new:2".into()]);
        assert_eq!(s.len(), 2);
        let picked = s.next().unwrap();
        assert!(picked.starts_with("http://new:"));
    }

    #[test]
    fn update_to_empty_enables_direct_egress() {
        let s = ProxySelector::new(vec!["http://old:1".into()]);
        s.update(vec![]);
        assert!(s.is_empty());
        assert!(s.next().is_err());
    }
}
