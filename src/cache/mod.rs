//! Response cache store.
//!
//! The queue talks to the cache through the [`Cache`] trait. Implementations
//! synchronize internally: the cache dispatcher reads while network workers
//! write, and a reader must never observe a half-written entry. Failures
//! never escape the trait; they are logged and downgraded (a corrupt or
//! unreadable entry is a miss, a failed write leaves the previous state).
//!
//! - [`DiskCache`] - one file per key, insertion-order eviction to a low watermark
//! - [`NoCache`] - stores nothing
//! - [`headers`] - derives freshness and validators from response headers

mod disk;
mod error;
pub mod headers;
mod record;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

pub use disk::{DEFAULT_CAPACITY_BYTES, DEFAULT_LOW_WATERMARK, DiskCache};
pub use error::CacheError;

use crate::network::Headers;

/// A cached response with its freshness metadata.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// Response body.
    pub data: Bytes,
    /// `ETag` validator.
    pub etag: Option<String>,
    /// `Last-Modified` validator.
    pub last_modified: Option<u64>,
    /// Server `Date` header.
    pub server_date: Option<u64>,
    /// Hard expiry: at or after this point the entry cannot be served.
    pub ttl: u64,
    /// Staleness point: at or after this point the entry is served and refreshed.
    pub soft_ttl: u64,
    /// Response headers, kept to rebuild responses and merge 304s.
    pub response_headers: Headers,
}

impl CacheEntry {
    /// True when the entry can no longer be served as a response.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.ttl
    }

    /// True when the entry should be refreshed from the network.
    #[must_use]
    pub fn refresh_needed(&self, now: u64) -> bool {
        now >= self.soft_ttl
    }

    /// True when the entry carries a validator usable for a conditional request.
    #[must_use]
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Durable key → entry store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Rebuilds in-memory state from durable storage. Called once by the
    /// cache dispatcher before it starts taking requests.
    async fn initialize(&self);

    /// Returns the entry for `key`, if present and readable.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Stores `entry` under `key`, replacing any previous entry.
    async fn put(&self, key: &str, entry: CacheEntry);

    /// Marks the entry stale (`soft_ttl = 0`), and expired too when
    /// `full_expire` is set. Validators are kept.
    async fn invalidate(&self, key: &str, full_expire: bool);

    /// Removes the entry for `key`.
    async fn remove(&self, key: &str);

    /// Removes every entry.
    async fn clear(&self);
}

/// A cache that never holds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn initialize(&self) {}

    async fn get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    async fn put(&self, _key: &str, _entry: CacheEntry) {}

    async fn invalidate(&self, _key: &str, _full_expire: bool) {}

    async fn remove(&self, _key: &str) {}

    async fn clear(&self) {}
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    to_millis(SystemTime::now())
}

/// Converts a system time into epoch milliseconds (0 for pre-epoch times).
#[must_use]
pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Converts epoch milliseconds back into a system time.
#[must_use]
pub fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
