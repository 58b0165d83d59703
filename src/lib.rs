//! Courier Core Library
//!
//! A client-side request scheduling engine: callers hand typed, prioritized
//! HTTP-like requests to a [`RequestQueue`], which resolves them against a
//! disk-backed response cache, collapses duplicate in-flight fetches, runs the
//! rest on a bounded pool of network workers with retry/backoff, and hands
//! results back through a pluggable [`Delivery`].
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`cache`] - Cache store trait, disk-backed store, cache header policy
//! - [`config`] - Queue configuration (defaults, TOML loading, validation)
//! - [`delivery`] - Completion delivery and request event listeners
//! - [`error`] - Errors delivered to request callers
//! - [`network`] - Transport and authenticator collaborators
//! - [`queue`] - The request queue facade and its dispatchers
//! - [`request`] - Request builder, handles, priorities, retry policy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod delivery;
pub mod error;
pub mod network;
pub mod queue;
pub mod request;
mod user_agent;

// Re-export commonly used types
pub use cache::{Cache, CacheEntry, DiskCache, NoCache};
pub use config::{ConfigError, QueueConfig};
pub use delivery::{
    Delivery, EventKind, ExecutorDelivery, ImmediateDelivery, ListenerId, RequestEvent,
};
pub use error::{ErrorKind, ParseError, RequestError};
pub use network::{
    Authenticator, CredentialError, Headers, HttpTransport, NetworkResponse, Transport,
    TransportError, TransportRequest, TransportResponse,
};
pub use queue::{RequestQueue, RequestQueueBuilder};
pub use request::{
    DEFAULT_MAX_RETRIES, FailureType, Method, Priority, Request, RequestHandle, Response,
    RetryDecision, RetryPolicy, Target,
};
