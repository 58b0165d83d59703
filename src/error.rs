//! Error types delivered to request callers.
//!
//! Every terminal failure reaches the caller as a [`RequestError`] carrying
//! the error kind, the URL, and where available the last HTTP status and the
//! number of retries attempted. Cancellation is never reported as an error,
//! and cache-layer corruption never reaches a caller at all.

use thiserror::Error;

use crate::network::TransportError;

/// Coarse classification of a [`RequestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection, timeout or protocol failure in the transport.
    Network,
    /// Server-side failure (5xx, 408, 429) that survived every retry.
    Server,
    /// Client-side HTTP failure (4xx other than auth, unexpected 3xx).
    Client,
    /// 401/403 with no way to refresh credentials.
    Authentication,
    /// Credential refresh was attempted and failed.
    Authenticator,
    /// The response body could not be parsed into the requested type.
    Parse,
}

impl ErrorKind {
    /// Returns a stable lowercase label for logs and display.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Server => "server",
            Self::Client => "client",
            Self::Authentication => "authentication",
            Self::Authenticator => "authenticator",
            Self::Parse => "parse",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response body that could not be turned into the requested payload type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    message: String,
}

impl ParseError {
    /// Creates a parse error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the parse failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Terminal failure of a request.
///
/// Clone-able so one failed fetch can be delivered to every request that was
/// waiting on the same cache key.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The transport failed and retries (if any) were exhausted or not allowed.
    #[error("network error requesting {url} after {retries} retries: {source}")]
    Network {
        /// Request URL.
        url: String,
        /// Last transport failure.
        #[source]
        source: TransportError,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// The server kept answering with a retryable failure status.
    #[error("HTTP {status} requesting {url} after {retries} retries")]
    Server {
        /// Request URL.
        url: String,
        /// Last HTTP status.
        status: u16,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// The server answered with a non-retryable status.
    #[error("HTTP {status} requesting {url}")]
    Client {
        /// Request URL.
        url: String,
        /// HTTP status.
        status: u16,
        /// Retries attempted before this response.
        retries: u32,
    },

    /// Authentication or authorization was refused.
    #[error(
        "[AUTH] authentication failed for {url} (HTTP {status})\n  Suggestion: configure an authenticator that can refresh credentials"
    )]
    Authentication {
        /// Request URL.
        url: String,
        /// HTTP status (401 or 403).
        status: u16,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// The configured authenticator could not refresh credentials.
    #[error("[AUTH] credential refresh failed for {url} (HTTP {status}): {message}")]
    Authenticator {
        /// Request URL.
        url: String,
        /// HTTP status that triggered the refresh.
        status: u16,
        /// Authenticator failure message.
        message: String,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// The response could not be parsed. Never retried.
    #[error("failed to parse response from {url}: {source}")]
    Parse {
        /// Request URL.
        url: String,
        /// Parser failure.
        #[source]
        source: ParseError,
        /// Retries attempted before the response arrived.
        retries: u32,
    },
}

impl RequestError {
    /// Creates a parse error for `url`.
    pub fn parse(url: impl Into<String>, source: ParseError, retries: u32) -> Self {
        Self::Parse {
            url: url.into(),
            source,
            retries,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::Client { .. } => ErrorKind::Client,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Authenticator { .. } => ErrorKind::Authenticator,
            Self::Parse { .. } => ErrorKind::Parse,
        }
    }

    /// Returns the last HTTP status, when the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. }
            | Self::Client { status, .. }
            | Self::Authentication { status, .. }
            | Self::Authenticator { status, .. } => Some(*status),
            Self::Network { .. } | Self::Parse { .. } => None,
        }
    }

    /// Returns how many retries were attempted.
    #[must_use]
    pub fn retries(&self) -> u32 {
        match self {
            Self::Network { retries, .. }
            | Self::Server { retries, .. }
            | Self::Client { retries, .. }
            | Self::Authentication { retries, .. }
            | Self::Authenticator { retries, .. }
            | Self::Parse { retries, .. } => *retries,
        }
    }

    /// Returns the URL of the failed request.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. }
            | Self::Server { url, .. }
            | Self::Client { url, .. }
            | Self::Authentication { url, .. }
            | Self::Authenticator { url, .. }
            | Self::Parse { url, .. } => url,
        }
    }
}
