//! In-flight deduplication by cache key.
//!
//! A key is present while exactly one request (the owner) is queued on or
//! executing in the network stage for it. Requests for the same key that
//! arrive meanwhile are parked here and answered from the owner's result.
//! All operations are O(1) amortized under a single lock and never do I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::dispatch::Dispatch;

/// Outcome of [`WaitingTable::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The caller owns the fetch and must forward it to the network queue.
    Owner,
    /// A fetch is already in flight; the request was parked.
    Waiting,
}

#[derive(Default)]
pub(crate) struct WaitingTable {
    entries: Mutex<HashMap<String, VecDeque<Arc<dyn Dispatch>>>>,
}

impl WaitingTable {
    pub(crate) fn claim(&self, dispatch: &Arc<dyn Dispatch>) -> Claim {
        let handle = dispatch.handle();
        let mut entries = self.entries.lock();
        if let Some(waiters) = entries.get_mut(handle.cache_key()) {
            waiters.push_back(Arc::clone(dispatch));
            return Claim::Waiting;
        }
        entries.insert(handle.cache_key().to_string(), VecDeque::new());
        handle.set_owner(true);
        Claim::Owner
    }

    /// Removes the entry, returning its waiters in arrival order.
    pub(crate) fn drain(&self, key: &str) -> Vec<Arc<dyn Dispatch>> {
        self.entries
            .lock()
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Promotes the first non-cancelled waiter to owner.
    ///
    /// Returns the new owner, if any, and the cancelled waiters that were
    /// skipped. The entry is removed when nobody is left to promote.
    pub(crate) fn hand_off(&self, key: &str) -> (Option<Arc<dyn Dispatch>>, Vec<Arc<dyn Dispatch>>) {
        let mut entries = self.entries.lock();
        let Some(waiters) = entries.get_mut(key) else {
            return (None, Vec::new());
        };
        let mut skipped = Vec::new();
        while let Some(next) = waiters.pop_front() {
            if next.handle().is_cancelled() {
                skipped.push(next);
                continue;
            }
            next.handle().set_owner(true);
            return (Some(next), skipped);
        }
        entries.remove(key);
        (None, skipped)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
