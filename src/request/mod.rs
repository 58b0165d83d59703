//! Requests: what callers hand to the queue and what they get back.
//!
//! A [`Request`] is built with a fluent API and consumed by
//! [`RequestQueue::add`](crate::RequestQueue::add), which returns a
//! [`RequestHandle`] for cancellation and inspection. The parser turns the
//! shared [`NetworkResponse`] into the caller's payload type `T`; the
//! completion callback receives a [`Response<T>`] or a [`RequestError`].
//!
//! # Example
//!
//! ```
//! use courier_core::{Method, Priority, Request};
//!
//! let request = Request::bytes(Method::Get, "https://example.com/feed")
//!     .priority(Priority::High)
//!     .tag("feeds")
//!     .on_complete(|result| match result {
//!         Ok(response) => println!("{} bytes", response.result.len()),
//!         Err(error) => eprintln!("{error}"),
//!     });
//! assert_eq!(request.cache_key(), "https://example.com/feed");
//! ```

mod handle;
mod retry;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

pub(crate) use handle::RequestCore;
pub use handle::RequestHandle;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_status,
    classify_transport_error,
};

use crate::error::{ParseError, RequestError};
use crate::network::{Headers, NetworkResponse};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
    /// PATCH
    Patch,
    /// TRACE
    Trace,
}

impl Method {
    /// Uppercase method name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
        }
    }

    /// Methods whose responses are cached unless the request opts out.
    #[must_use]
    pub fn is_cacheable_by_default(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method plus URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
}

impl Target {
    /// Default cache key: the URL for GET, `"{METHOD}-{url}"` otherwise.
    #[must_use]
    pub fn default_cache_key(&self) -> String {
        match self.method {
            Method::Get => self.url.clone(),
            method => format!("{method}-{}", self.url),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Scheduling priority. Higher values are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// User-visible work.
    High,
    /// Served before everything else.
    Immediate,
}

/// Successful result handed to the completion callback.
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// Parsed payload.
    pub result: T,
    /// HTTP status (200 for cache hits and 304 reconstructions).
    pub status: u16,
    /// Response headers, lowercase names.
    pub headers: Headers,
    /// True when served from the cache store without a network call.
    pub from_cache: bool,
    /// True for a stale cache hit that will be followed by a refresh.
    pub intermediate: bool,
    /// True when the server answered 304 and the body came from cache.
    pub not_modified: bool,
}

pub(crate) type Parser<T> = Arc<dyn Fn(&NetworkResponse) -> Result<T, ParseError> + Send + Sync>;
pub(crate) type Completion<T> = Arc<dyn Fn(Result<Response<T>, RequestError>) + Send + Sync>;

/// A request under construction. Consumed by the queue on `add`.
pub struct Request<T> {
    pub(crate) target: Target,
    pub(crate) priority: Priority,
    pub(crate) should_cache: bool,
    pub(crate) cache_key: Option<String>,
    pub(crate) tag: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Bytes>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) parser: Parser<T>,
    pub(crate) on_complete: Completion<T>,
}

impl Request<Bytes> {
    /// A request whose payload is the raw response body.
    pub fn bytes(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, |response: &NetworkResponse| {
            Ok(response.data.clone())
        })
    }
}

impl Request<String> {
    /// A request whose payload is the body decoded as UTF-8.
    pub fn text(method: Method, url: impl Into<String>) -> Self {
        Self::new(method, url, |response: &NetworkResponse| {
            String::from_utf8(response.data.to_vec())
                .map_err(|e| ParseError::new(format!("body is not UTF-8: {e}")))
        })
    }
}

impl<T: Send + 'static> Request<T> {
    /// Creates a request parsed by `parser`.
    pub fn new<F>(method: Method, url: impl Into<String>, parser: F) -> Self
    where
        F: Fn(&NetworkResponse) -> Result<T, ParseError> + Send + Sync + 'static,
    {
        Self {
            target: Target {
                method,
                url: url.into(),
            },
            priority: Priority::default(),
            should_cache: method.is_cacheable_by_default(),
            cache_key: None,
            tag: None,
            headers: Vec::new(),
            body: None,
            retry_policy: None,
            parser: Arc::new(parser),
            on_complete: Arc::new(|_| {}),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the grouping tag used by [`RequestQueue::cancel_all_tagged`](crate::RequestQueue::cancel_all_tagged).
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Overrides whether the response cache is used.
    #[must_use]
    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    /// Overrides the cache key.
    #[must_use]
    pub fn cache_key_override(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches a retry policy; otherwise the queue default is used.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(Result<Response<T>, RequestError>) + Send + Sync + 'static,
    {
        self.on_complete = Arc::new(callback);
        self
    }

    /// Effective cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| self.target.default_cache_key())
    }

    /// Method and URL.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Splits the request into its shared state and typed callbacks.
    pub(crate) fn into_parts(self) -> (RequestHandle, Parser<T>, Completion<T>) {
        let cache_key = self.cache_key();
        let core = RequestCore::new(
            self.target,
            self.priority,
            self.should_cache,
            cache_key,
            self.tag,
            self.headers,
            self.body,
            self.retry_policy,
        );
        (
            RequestHandle(Arc::new(core)),
            self.parser,
            self.on_complete,
        )
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("should_cache", &self.should_cache)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Immediate);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_default_cache_key_by_method() {
        let get = Request::bytes(Method::Get, "https://example.com/a");
        assert_eq!(get.cache_key(), "https://example.com/a");

        let post = Request::bytes(Method::Post, "https://example.com/a");
        assert_eq!(post.cache_key(), "POST-https://example.com/a");

        let custom = Request::bytes(Method::Get, "https://example.com/a").cache_key_override("k");
        assert_eq!(custom.cache_key(), "k");
    }

    #[test]
    fn test_should_cache_defaults_follow_method() {
        assert!(Request::bytes(Method::Get, "u").should_cache);
        assert!(Request::bytes(Method::Head, "u").should_cache);
        assert!(!Request::bytes(Method::Post, "u").should_cache);
        assert!(!Request::bytes(Method::Delete, "u").should_cache);
        assert!(Request::bytes(Method::Post, "u").should_cache(true).should_cache);
    }

    #[test]
    fn test_into_parts_carries_builder_state() {
        let request = Request::bytes(Method::Put, "https://example.com/x")
            .priority(Priority::Immediate)
            .tag("t")
            .header("X-Trace", "1")
            .body("payload");
        let (handle, _, _) = request.into_parts();
        assert_eq!(handle.priority(), Priority::Immediate);
        assert_eq!(handle.tag(), Some("t"));
        assert_eq!(handle.cache_key(), "PUT-https://example.com/x");
        assert!(!handle.should_cache());
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_text_parser_rejects_invalid_utf8() {
        let (_, parser, _) = Request::text(Method::Get, "u").into_parts();
        let mut response =
            NetworkResponse::from_transport(crate::network::TransportResponse::new(200, "hi"));
        assert_eq!(parser(&response).unwrap(), "hi");
        response.data = Bytes::from_static(&[0xff, 0xfe]);
        assert!(parser(&response).is_err());
    }
}
