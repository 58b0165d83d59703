//! Transport collaborator interface and the bundled HTTP implementation.
//!
//! The queue never speaks HTTP itself. It builds a [`TransportRequest`]
//! (method, URL, headers including conditional validators, optional body)
//! and hands it to a [`Transport`] together with the per-attempt timeout
//! taken from the request's retry policy. The transport answers with the raw
//! status, headers and body, or a [`TransportError`].
//!
//! [`HttpTransport`] is a thin `reqwest`-backed implementation used by the
//! `courier` binary.

pub mod auth;
mod error;
mod http;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use auth::{Authenticator, CredentialError};
pub use error::TransportError;
pub use http::HttpTransport;

use crate::cache::CacheEntry;
use crate::request::Method;

/// Response or request header map. Names are stored lowercase.
pub type Headers = BTreeMap<String, String>;

/// Generic request descriptor handed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers to send, in order.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Bytes>,
}

impl TransportRequest {
    /// Returns the first header value with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw result of one request/response exchange.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercase names.
    pub headers: Headers,
    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Creates a response with the given status and body and no headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Adds a header, lowercasing its name.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

/// Performs one request/response exchange.
///
/// Implementations own connection handling, TLS and wire framing. They must
/// honour `timeout` as the deadline for the whole exchange and must not
/// follow up on a 304 themselves: the queue reconstructs the body from cache.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes `request`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when no HTTP response was obtained.
    /// Non-2xx statuses are *not* errors at this layer.
    async fn execute(
        &self,
        request: &TransportRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// Response as seen by parsers, shared by every request that waited on it.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    /// HTTP status code (200 for responses rebuilt from cache).
    pub status: u16,
    /// Response headers, lowercase names.
    pub headers: Headers,
    /// Response body.
    pub data: Bytes,
    /// True when the server answered 304 and the body came from cache.
    pub not_modified: bool,
    /// True when the response was served straight from the cache store.
    pub from_cache: bool,
}

impl NetworkResponse {
    /// Wraps a transport response.
    #[must_use]
    pub fn from_transport(response: TransportResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            data: response.body,
            not_modified: false,
            from_cache: false,
        }
    }

    /// Rebuilds a response from a cache entry.
    #[must_use]
    pub fn from_cache_entry(entry: &CacheEntry) -> Self {
        Self {
            status: 200,
            headers: entry.response_headers.clone(),
            data: entry.data.clone(),
            not_modified: false,
            from_cache: true,
        }
    }

    /// Rebuilds a response for a 304 answer: cached body, cached headers
    /// overlaid with the headers of the 304 itself.
    #[must_use]
    pub fn not_modified(entry: &CacheEntry, fresh_headers: &Headers) -> Self {
        let mut headers = entry.response_headers.clone();
        headers.extend(
            fresh_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        Self {
            status: 200,
            headers,
            data: entry.data.clone(),
            not_modified: true,
            from_cache: false,
        }
    }

    /// Returns a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
