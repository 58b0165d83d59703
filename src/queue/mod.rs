//! The request queue and its dispatchers.
//!
//! # Overview
//!
//! A [`RequestQueue`] owns two priority queues and the tasks that drain them:
//! - the cache-intake queue, drained by a single cache dispatcher that
//!   answers from the [`Cache`] when it can
//! - the network queue, drained by a pool of network workers that call the
//!   [`Transport`], write the cache back and deliver results
//!
//! Requests for a cache key that is already being fetched are parked in a
//! waiting table and answered from that one fetch.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_core::{DiskCache, HttpTransport, Method, QueueConfig, Request, RequestQueue};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RequestQueue::builder(Arc::new(HttpTransport::new()))
//!     .cache(Arc::new(DiskCache::with_defaults("/tmp/courier")))
//!     .config(QueueConfig::default())
//!     .build()?;
//! queue.start();
//!
//! let handle = queue.add(
//!     Request::text(Method::Get, "https://example.com/")
//!         .on_complete(|result| println!("{:?}", result.map(|r| r.result.len()))),
//! );
//! # let _ = handle;
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

mod cache_dispatcher;
mod dispatch;
mod network_dispatcher;
mod priority;
mod waiting;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span, instrument, warn};

use crate::cache::{Cache, NoCache};
use crate::config::{ConfigError, QueueConfig};
use crate::delivery::{Delivery, ExecutorDelivery, ListenerId, ListenerRegistry, RequestEvent};
use crate::network::{Authenticator, Transport};
use crate::request::{Request, RequestHandle, RetryPolicy};

use dispatch::{DeliveryContext, Dispatch, TypedRequest};
use priority::DispatchQueue;
use waiting::WaitingTable;

/// State shared by the facade and every dispatcher task.
pub(crate) struct Shared {
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) cache_queue: DispatchQueue<Arc<dyn Dispatch>>,
    pub(crate) network_queue: DispatchQueue<Arc<dyn Dispatch>>,
    pub(crate) waiting: WaitingTable,
    pub(crate) ctx: DeliveryContext,
    pub(crate) default_ttl: Duration,
    pub(crate) default_retry: RetryPolicy,
}

impl Shared {
    pub(crate) fn forward_to_network(&self, dispatch: Arc<dyn Dispatch>) {
        let handle = dispatch.handle();
        let (priority, sequence) = (handle.priority(), handle.sequence());
        self.network_queue.push(priority, sequence, dispatch);
    }
}

/// Builder for [`RequestQueue`].
///
/// Only the transport is required. Defaults: [`NoCache`], an
/// [`ExecutorDelivery`], no authenticator, [`QueueConfig::default`] and an
/// `info_span!("request_queue")` parent span.
pub struct RequestQueueBuilder {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<dyn Cache>>,
    delivery: Option<Arc<dyn Delivery>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    config: QueueConfig,
    span: Option<Span>,
}

impl RequestQueueBuilder {
    /// Sets the cache store.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets where completions run.
    #[must_use]
    pub fn delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Enables credential refresh on 401/403.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets worker count, default retry policy and default TTL.
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent span for every dispatcher task.
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validates the configuration and builds the queue. Nothing runs until
    /// [`RequestQueue::start`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the config fails validation.
    pub fn build(self) -> Result<RequestQueue, ConfigError> {
        self.config.validate()?;

        let listeners = Arc::new(ListenerRegistry::default());
        let delivery = self
            .delivery
            .unwrap_or_else(|| Arc::new(ExecutorDelivery::new()));
        let shared = Shared {
            cache: self.cache.unwrap_or_else(|| Arc::new(NoCache)),
            transport: self.transport,
            authenticator: self.authenticator,
            cache_queue: DispatchQueue::new(),
            network_queue: DispatchQueue::new(),
            waiting: WaitingTable::default(),
            ctx: DeliveryContext::new(delivery, listeners),
            default_ttl: self.config.default_ttl(),
            default_retry: self.config.retry_policy(),
        };

        Ok(RequestQueue {
            shared: Arc::new(shared),
            sequence: AtomicU64::new(0),
            workers: self.config.network_workers,
            span: self.span.unwrap_or_else(|| info_span!("request_queue")),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Accepts requests and runs them through the cache and network stages.
pub struct RequestQueue {
    shared: Arc<Shared>,
    sequence: AtomicU64,
    workers: usize,
    span: Span,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestQueue {
    /// Starts building a queue around `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> RequestQueueBuilder {
        RequestQueueBuilder {
            transport,
            cache: None,
            delivery: None,
            authenticator: None,
            config: QueueConfig::default(),
            span: None,
        }
    }

    /// Shortcut for a queue with a cache, a transport and a config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the config fails validation.
    pub fn new(
        cache: Arc<dyn Cache>,
        transport: Arc<dyn Transport>,
        config: QueueConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(transport).cache(cache).config(config).build()
    }

    /// Enqueues `request` and returns its handle. Never blocks on I/O and
    /// may be called before [`start`](Self::start).
    pub fn add<T: Send + 'static>(&self, request: Request<T>) -> RequestHandle {
        let (handle, dispatch) = TypedRequest::from_request(request);
        handle.attach_default_policy(&self.shared.default_retry);

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        handle.set_sequence(sequence);

        let ctx = &self.shared.ctx;
        ctx.track(&handle);
        ctx.marker(&handle, "add-to-queue");
        self.shared
            .cache_queue
            .push(handle.priority(), sequence, dispatch);
        handle
    }

    /// Cancels every tracked request matching `predicate`. Returns how many
    /// were newly cancelled.
    pub fn cancel_all<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RequestHandle) -> bool,
    {
        let mut cancelled = 0;
        for entry in self.shared.ctx.tracked().iter() {
            let handle = entry.value();
            if !handle.is_cancelled() && predicate(handle) {
                handle.cancel();
                cancelled += 1;
            }
        }
        debug!(cancelled, "cancel_all");
        cancelled
    }

    /// Cancels every tracked request carrying `tag`.
    pub fn cancel_all_tagged(&self, tag: &str) -> usize {
        self.cancel_all(|handle| handle.tag() == Some(tag))
    }

    /// Spawns the cache dispatcher and the network workers on the current
    /// tokio runtime. Calling it while already running does nothing.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[instrument(skip(self), parent = &self.span, fields(workers = self.workers))]
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("request queue already running");
            return;
        }

        self.shared.cache_queue.reopen();
        self.shared.network_queue.reopen();

        let shared = Arc::clone(&self.shared);
        tasks.push(tokio::spawn(
            cache_dispatcher::run(shared).instrument(info_span!(parent: &self.span, "cache_dispatcher")),
        ));
        for worker in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            tasks.push(tokio::spawn(
                network_dispatcher::run(shared, worker)
                    .instrument(info_span!(parent: &self.span, "network_worker", worker)),
            ));
        }
        info!("request queue started");
    }

    /// Signals every dispatcher to exit and waits for them. Idempotent and
    /// safe without a prior [`start`](Self::start); the queue can be started
    /// again afterwards. Requests still queued stay queued.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.shared.cache_queue.close();
        self.shared.network_queue.close();
        if tasks.is_empty() {
            return;
        }

        for result in join_all(tasks).await {
            if let Err(error) = result {
                warn!(parent: &self.span, error = %error, "dispatcher task failed");
            }
        }
        info!(parent: &self.span, "request queue stopped");
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Registers a listener for events of requests accepted by `filter`.
    pub fn add_listener<F, C>(&self, filter: F, callback: C) -> ListenerId
    where
        F: Fn(&RequestHandle) -> bool + Send + Sync + 'static,
        C: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.shared.ctx.listeners.register(filter, callback)
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.ctx.listeners.remove(id)
    }

    /// Requests added and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.ctx.tracked().len()
    }

    /// The cache store, for explicit invalidation.
    #[must_use]
    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.shared.cache)
    }

    /// Requests waiting in the cache-intake and network queues.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        (
            self.shared.cache_queue.len(),
            self.shared.network_queue.len(),
        )
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("workers", &self.workers)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
