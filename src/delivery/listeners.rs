//! Observers of request lifecycle events.
//!
//! Listeners are registered on the queue with a filter and a callback. Every
//! event is offered to every listener whose filter accepts the request.
//! Response and error events are raised from inside the delivery task, so
//! they run wherever the [`Delivery`](super::Delivery) runs callbacks.
//! Markers are raised inline at the point they occur.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::RequestError;
use crate::network::NetworkResponse;
use crate::request::RequestHandle;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// What happened to a request.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A response is being delivered.
    Response {
        /// The shared raw response.
        response: Arc<NetworkResponse>,
        /// True for a stale cache hit that precedes a refresh.
        intermediate: bool,
    },
    /// A terminal error is being delivered.
    Error(RequestError),
    /// The request passed a named checkpoint (e.g. `"cache-hit"`).
    Marker(&'static str),
}

/// An event together with the request it concerns.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// The request.
    pub request: RequestHandle,
    /// The event.
    pub kind: EventKind,
}

type Filter = Arc<dyn Fn(&RequestHandle) -> bool + Send + Sync>;
type Callback = Arc<dyn Fn(&RequestEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Filter, Callback)>>,
}

impl ListenerRegistry {
    pub(crate) fn register<F, C>(&self, filter: F, callback: C) -> ListenerId
    where
        F: Fn(&RequestHandle) -> bool + Send + Sync + 'static,
        C: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .push((id, Arc::new(filter), Arc::new(callback)));
        id
    }

    /// Returns true if a listener was removed.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn notify(&self, request: &RequestHandle, kind: EventKind) {
        // Snapshot so callbacks run without the lock held and may (un)register.
        let listeners: Vec<(Filter, Callback)> = {
            let guard = self.listeners.lock();
            if guard.is_empty() {
                return;
            }
            guard
                .iter()
                .map(|(_, filter, callback)| (Arc::clone(filter), Arc::clone(callback)))
                .collect()
        };
        let event = RequestEvent {
            request: request.clone(),
            kind,
        };
        for (filter, callback) in listeners {
            if filter(request) {
                callback(&event);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
