//! Shared per-request state and the caller-facing [`RequestHandle`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Priority, RetryPolicy, Target};
use crate::cache::CacheEntry;

/// State shared by the queue stages and every handle of one request.
pub(crate) struct RequestCore {
    pub(crate) target: Target,
    pub(crate) priority: Priority,
    pub(crate) should_cache: bool,
    pub(crate) cache_key: String,
    pub(crate) tag: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Bytes>,
    pub(crate) sequence: AtomicU64,
    pub(crate) retry_policy: OnceLock<RetryPolicy>,
    pub(crate) retries: AtomicU32,
    cancelled: AtomicBool,
    /// Set while this request owns a waiting-table entry.
    pub(crate) owns_inflight: AtomicBool,
    /// Set once any response, intermediate included, reached the caller.
    pub(crate) response_delivered: AtomicBool,
    finished: AtomicBool,
    /// Entry attached for revalidation (stale or expired hit).
    pub(crate) cache_entry: Mutex<Option<CacheEntry>>,
    /// Headers returned by the last credential refresh.
    pub(crate) credentials: Mutex<Vec<(String, String)>>,
}

impl RequestCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        target: Target,
        priority: Priority,
        should_cache: bool,
        cache_key: String,
        tag: Option<String>,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        retry_policy: Option<RetryPolicy>,
    ) -> Self {
        let policy = OnceLock::new();
        if let Some(retry_policy) = retry_policy {
            let _ = policy.set(retry_policy);
        }
        Self {
            target,
            priority,
            should_cache,
            cache_key,
            tag,
            headers,
            body,
            sequence: AtomicU64::new(0),
            retry_policy: policy,
            retries: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            owns_inflight: AtomicBool::new(false),
            response_delivered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cache_entry: Mutex::new(None),
            credentials: Mutex::new(Vec::new()),
        }
    }
}

/// Cheap, clonable handle to a request that was added to a queue.
///
/// Cancellation is cooperative: it is observed at the cache stage, the
/// network stage (before and after the transport call) and right before
/// delivery. A cancelled request never has its callback invoked after the
/// flag is observed.
#[derive(Clone)]
pub struct RequestHandle(pub(crate) Arc<RequestCore>);

impl RequestHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Sequence number assigned when the request was added.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.0.sequence.load(Ordering::SeqCst)
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.0.priority
    }

    /// Grouping tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.0.tag.as_deref()
    }

    /// Method and URL.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.0.target
    }

    /// Key used for the cache store and in-flight deduplication.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.0.cache_key
    }

    /// Retries performed so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.0.retries.load(Ordering::SeqCst)
    }

    /// Whether the response cache is consulted for this request.
    #[must_use]
    pub fn should_cache(&self) -> bool {
        self.0.should_cache
    }

    /// True once a response (intermediate included) was delivered to the callback.
    #[must_use]
    pub fn has_response_delivered(&self) -> bool {
        self.0.response_delivered.load(Ordering::SeqCst)
    }

    /// True once the request left the queue (delivered, failed or discarded).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.0.retry_policy.get().cloned().unwrap_or_default()
    }

    pub(crate) fn attach_default_policy(&self, policy: &RetryPolicy) {
        let _ = self.0.retry_policy.set(policy.clone());
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.0.sequence.store(sequence, Ordering::SeqCst);
    }

    pub(crate) fn increment_retries(&self) -> u32 {
        self.0.retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn cache_entry(&self) -> Option<CacheEntry> {
        self.0.cache_entry.lock().clone()
    }

    pub(crate) fn set_cache_entry(&self, entry: CacheEntry) {
        *self.0.cache_entry.lock() = Some(entry);
    }

    pub(crate) fn credentials(&self) -> Vec<(String, String)> {
        self.0.credentials.lock().clone()
    }

    pub(crate) fn set_credentials(&self, headers: Vec<(String, String)>) {
        *self.0.credentials.lock() = headers;
    }

    pub(crate) fn set_owner(&self, owner: bool) {
        self.0.owns_inflight.store(owner, Ordering::SeqCst);
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.0.owns_inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_delivered(&self) {
        self.0.response_delivered.store(true, Ordering::SeqCst);
    }

    /// Marks the request finished; returns false if it already was.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.0.finished.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("sequence", &self.sequence())
            .field("priority", &self.priority())
            .field("target", &self.target())
            .field("tag", &self.tag())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RequestHandle {}
