//! Credential refresh collaborator.
//!
//! When the server answers 401 or 403, the network dispatcher asks the
//! configured [`Authenticator`] for fresh credentials. On success the
//! returned headers are attached to the request and it is retried under its
//! normal retry budget; on failure the request ends with
//! [`RequestError::Authenticator`](crate::RequestError::Authenticator).
//! Without an authenticator, authentication failures are terminal.

use async_trait::async_trait;
use thiserror::Error;

use crate::request::RequestHandle;

/// Credentials could not be refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CredentialError(pub String);

/// Refreshes credentials for a request that was refused by the server.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the headers to attach to the retried request.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when no usable credentials can be obtained.
    async fn refresh(
        &self,
        request: &RequestHandle,
        status: u16,
    ) -> Result<Vec<(String, String)>, CredentialError>;
}
