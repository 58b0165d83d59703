//! Retry policy with exponential backoff for failed network attempts.
//!
//! # Overview
//!
//! When a network attempt fails, the failure is classified into a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - 401/403; retried only after a credential refresh
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! The [`RetryPolicy`] attached to the request then decides whether another
//! attempt is made and after how long.
//!
//! # Example
//!
//! ```
//! use courier_core::{FailureType, RetryDecision, RetryPolicy};
//! use courier_core::request::classify_status;
//!
//! let policy = RetryPolicy::default();
//! let failure = classify_status(503);
//! assert_eq!(failure, FailureType::Transient);
//!
//! match policy.should_retry(failure, 0) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::network::TransportError;

/// Default maximum number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt timeout (2.5 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default maximum jitter added to delays (500ms).
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed network attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeout, connection refused, 5xx, 408.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, invalid URL.
    Permanent,

    /// Authentication or authorization required (401/403).
    NeedsAuth,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt this will be (1-indexed, so the first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Per-request retry behavior: attempt timeout, retry budget and backoff.
///
/// # Default Values
///
/// - `timeout`: 2.5 seconds
/// - `max_retries`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
/// - `max_jitter`: 500 ms
///
/// # Delay Calculation
///
/// ```text
/// delay(n) = min(base_delay * multiplier^(n-1), max_delay) + jitter
/// ```
///
/// where `n` is the retry number (1 for the first retry).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    timeout: Duration,

    /// Retries allowed after the initial attempt.
    max_retries: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each retry.
    backoff_multiplier: f32,

    /// Upper bound of the random jitter added to every delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy with custom settings and the default jitter.
    ///
    /// A multiplier below 1.0 is raised to 1.0 so delays never shrink.
    #[must_use]
    pub fn new(
        timeout: Duration,
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            timeout,
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier: backoff_multiplier.max(1.0),
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Creates a policy with a custom retry budget, using defaults otherwise.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Replaces the jitter bound.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Replaces the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deadline for a single attempt.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retries allowed after the initial attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides whether to retry after a failure.
    ///
    /// `retries_done` is the number of retries already performed for the
    /// request (0 after the initial attempt fails).
    ///
    /// [`FailureType::NeedsAuth`] is never retried here: the network
    /// dispatcher only retries it after a successful credential refresh,
    /// through [`RetryPolicy::next_attempt`].
    pub fn should_retry(&self, failure_type: FailureType, retries_done: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            },
            FailureType::NeedsAuth => RetryDecision::DoNotRetry {
                reason: "authentication required - retry without new credentials would not help"
                    .to_string(),
            },
            FailureType::Transient | FailureType::RateLimited => self.next_attempt(retries_done),
        }
    }

    /// Checks the retry budget only, regardless of failure type.
    pub fn next_attempt(&self, retries_done: u32) -> RetryDecision {
        if retries_done >= self.max_retries {
            debug!(retries_done, max = self.max_retries, "max retries reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let retry = retries_done + 1;
        let delay = self.calculate_delay(retry);

        debug!(
            retry,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: retry + 1,
        }
    }

    /// Backoff before retry number `retry` (1-indexed), jitter included.
    ///
    /// Formula: `min(base_delay * multiplier^(retry-1), max_delay) + jitter`
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        let exponent = f64::from(retry.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    /// Random jitter between 0 and `max_jitter`.
    fn calculate_jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max))
    }
}

/// Classifies a non-2xx HTTP status.
///
/// | Status | Type |
/// |--------|------|
/// | 401, 403 | `NeedsAuth` |
/// | 408 | `Transient` |
/// | 429 | `RateLimited` |
/// | 5xx | `Transient` |
/// | other | `Permanent` |
#[must_use]
#[allow(clippy::match_same_arms)]
pub fn classify_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::NeedsAuth,
        408 => FailureType::Transient, // Request Timeout
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Classifies a transport failure. Only a malformed URL is permanent.
#[must_use]
pub fn classify_transport_error(error: &TransportError) -> FailureType {
    match error {
        TransportError::InvalidUrl { .. } => FailureType::Permanent,
        TransportError::Timeout { .. }
        | TransportError::Connection { .. }
        | TransportError::Protocol { .. } => FailureType::Transient,
    }
}
