//! Priority dispatch queue with suspending pop and a shutdown signal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::request::Priority;

/// Item with associated priority for queue ordering.
#[derive(Debug)]
struct PrioritizedItem<T> {
    priority: Priority,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for PrioritizedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for PrioritizedItem<T> {}

impl<T> PartialOrd for PrioritizedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PrioritizedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence), // Lower sequence = earlier
            ord => ord,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    heap: BinaryHeap<PrioritizedItem<T>>,
    closed: bool,
}

/// Multi-producer, multi-consumer priority queue.
///
/// `push` never blocks beyond a short lock. `pop` suspends while the queue
/// is empty and returns `None` once the queue is closed. Items left in a
/// closed queue stay there until it is reopened.
#[derive(Debug)]
pub(crate) struct DispatchQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> DispatchQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn push(&self, priority: Priority, sequence: u64, item: T) {
        self.state.lock().heap.push(PrioritizedItem {
            priority,
            sequence,
            item,
        });
        self.notify.notify_one();
    }

    /// Highest priority, then lowest sequence. `None` once closed.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            // Register interest before checking, so a push in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.item);
                }
            }

            notified.await;
        }
    }

    /// Wakes every consumer; subsequent pops return `None`.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }
}
