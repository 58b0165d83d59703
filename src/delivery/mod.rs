//! Completion delivery.
//!
//! Dispatchers never invoke caller callbacks directly. They package each
//! completion as a [`DeliveryTask`] and hand it to a [`Delivery`], which
//! decides where it runs. Implementations must run tasks posted from one
//! task in the order they were posted.

mod listeners;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error};

pub use listeners::{EventKind, ListenerId, RequestEvent};
pub(crate) use listeners::ListenerRegistry;

/// A unit of delivery work.
pub type DeliveryTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules completions in the execution context callers expect.
pub trait Delivery: Send + Sync {
    /// Schedules `task` to run.
    fn post(&self, task: DeliveryTask);
}

/// Runs every task inline, on the dispatcher task that posted it.
///
/// Useful in tests and when callbacks are cheap and thread-agnostic. A
/// panicking callback is logged and the dispatcher keeps running.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateDelivery;

impl Delivery for ImmediateDelivery {
    fn post(&self, task: DeliveryTask) {
        run_guarded(task);
    }
}

fn run_guarded(task: DeliveryTask) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("completion callback panicked");
    }
}

/// Runs tasks on one dedicated OS thread, in posting order.
///
/// Callbacks therefore never run on a runtime worker, and a slow callback
/// only delays other callbacks. A panicking callback is logged and does not
/// take the thread down. The thread exits once the delivery is dropped and
/// the backlog is drained.
#[derive(Debug)]
pub struct ExecutorDelivery {
    sender: mpsc::UnboundedSender<DeliveryTask>,
}

impl ExecutorDelivery {
    /// Spawns the delivery thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DeliveryTask>();
        thread::Builder::new()
            .name("courier-delivery".to_string())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    run_guarded(task);
                }
                debug!("delivery thread exiting");
            })
            .expect("failed to spawn delivery thread");
        Self { sender }
    }
}

impl Default for ExecutorDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl Delivery for ExecutorDelivery {
    fn post(&self, task: DeliveryTask) {
        if self.sender.send(task).is_err() {
            error!("delivery thread is gone, dropping completion");
        }
    }
}
