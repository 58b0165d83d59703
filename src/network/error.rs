//! Error types for transport exchanges.

use thiserror::Error;

/// Failure to obtain any HTTP response from the transport.
///
/// Messages are captured as strings so the error stays `Clone` and can be
/// fanned out to every request waiting on the same fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The exchange did not complete before the per-attempt deadline.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// DNS, TCP connect or TLS handshake failure.
    #[error("connection error requesting {url}: {message}")]
    Connection {
        /// The URL that could not be reached.
        url: String,
        /// Underlying error text.
        message: String,
    },

    /// Malformed response, broken body stream, or other protocol failure.
    #[error("protocol error requesting {url}: {message}")]
    Protocol {
        /// The URL being requested.
        url: String,
        /// Underlying error text.
        message: String,
    },

    /// The request URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl TransportError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a connection error.
    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns the URL the error refers to.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Timeout { url }
            | Self::Connection { url, .. }
            | Self::Protocol { url, .. }
            | Self::InvalidUrl { url } => url,
        }
    }
}
