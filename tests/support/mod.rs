//! Test doubles shared by the integration tests: a scripted transport, an
//! in-memory cache that counts its calls, a callback collector, delivery
//! helpers and a polling wait helper.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::delivery::DeliveryTask;
use courier_core::{
    Cache, CacheEntry, Delivery, ImmediateDelivery, QueueConfig, RequestError, RequestQueue,
    Response, Transport, TransportError, TransportRequest, TransportResponse,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use wiremock::MockServer;

/// Set to `1` to fail instead of skip when localhost sockets are unavailable.
const STRICT_SOCKETS_ENV: &str = "COURIER_REQUIRE_SOCKET_TESTS";

/// Starts a wiremock server, or returns `None` when this sandbox cannot bind
/// a loopback port (unless strict mode asks for a hard failure).
#[track_caller]
pub fn mock_server() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = std::panic::Location::caller();
    async move {
        if TcpListener::bind("127.0.0.1:0").is_ok() {
            return Some(MockServer::start().await);
        }
        let strict = std::env::var(STRICT_SOCKETS_ENV)
            .is_ok_and(|value| matches!(value.trim(), "1" | "true" | "yes"));
        assert!(
            !strict,
            "{caller}: loopback bind failed and {STRICT_SOCKETS_ENV} is set"
        );
        eprintln!("{caller}: loopback bind failed, skipping mock-server test");
        None
    }
}

type Responder =
    dyn Fn(&TransportRequest, usize) -> Result<TransportResponse, TransportError> + Send + Sync;

/// Transport whose answers come from a closure given the request and the
/// zero-based call index.
pub struct MockTransport {
    responder: Box<Responder>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
}

impl MockTransport {
    pub fn new<F>(delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&TransportRequest, usize) -> Result<TransportResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers every call with a clone of `response`.
    pub fn always(response: TransportResponse) -> Arc<Self> {
        Self::new(Duration::ZERO, move |_, _| Ok(response.clone()))
    }

    /// Like [`always`](Self::always), but each call takes `delay`.
    pub fn slow(delay: Duration, response: TransportResponse) -> Arc<Self> {
        Self::new(delay, move |_, _| Ok(response.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        request: &TransportRequest,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(request, index)
    }
}

/// In-memory cache that counts lookups and writes.
#[derive(Default)]
pub struct RecordingCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().insert(key.to_string(), entry);
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cache for RecordingCache {
    async fn initialize(&self) {}

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.entry(key)
    }

    async fn put(&self, key: &str, entry: CacheEntry) {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.seed(key, entry);
    }

    async fn invalidate(&self, key: &str, full_expire: bool) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
        }
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Collects every completion callback invocation.
pub struct Collector<T> {
    results: Arc<Mutex<Vec<Result<Response<T>, RequestError>>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            results: Arc::clone(&self.results),
        }
    }
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A completion callback that records into this collector.
    pub fn callback(&self) -> impl Fn(Result<Response<T>, RequestError>) + Send + Sync + 'static {
        let results = Arc::clone(&self.results);
        move |result| results.lock().push(result)
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn results(&self) -> Vec<Result<Response<T>, RequestError>> {
        self.results.lock().clone()
    }
}

/// Polls `condition` every 5ms, panicking after 5 seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Config with instant retries so retry tests run without sleeping.
pub fn fast_config(network_workers: usize) -> QueueConfig {
    QueueConfig {
        network_workers,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
        jitter_ms: 0,
        ..QueueConfig::default()
    }
}

/// Queue delivering inline on the dispatcher tasks.
pub fn build_queue(
    transport: Arc<dyn Transport>,
    cache: Arc<dyn Cache>,
    network_workers: usize,
) -> RequestQueue {
    build_queue_with(transport, cache, network_workers, Arc::new(ImmediateDelivery))
}

/// Queue with a caller-chosen delivery.
pub fn build_queue_with(
    transport: Arc<dyn Transport>,
    cache: Arc<dyn Cache>,
    network_workers: usize,
    delivery: Arc<dyn Delivery>,
) -> RequestQueue {
    RequestQueue::builder(transport)
        .cache(cache)
        .delivery(delivery)
        .config(fast_config(network_workers))
        .build()
        .unwrap()
}

/// Delivery with one FIFO thread per posting tokio task.
///
/// Order holds within a lane but not across lanes. The first lane created
/// waits `first_lane_delay` before each task, so whatever the first poster
/// sends lands after work posted by later posters.
pub struct LaneDelivery {
    lanes: Mutex<HashMap<Option<tokio::task::Id>, mpsc::UnboundedSender<DeliveryTask>>>,
    first_lane_delay: Duration,
}

impl LaneDelivery {
    pub fn new(first_lane_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(HashMap::new()),
            first_lane_delay,
        })
    }
}

impl Delivery for LaneDelivery {
    fn post(&self, task: DeliveryTask) {
        let mut lanes = self.lanes.lock();
        let delay = if lanes.is_empty() {
            self.first_lane_delay
        } else {
            Duration::ZERO
        };
        let lane = lanes.entry(tokio::task::try_id()).or_insert_with(|| {
            let (sender, mut receiver) = mpsc::unbounded_channel::<DeliveryTask>();
            thread::spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    thread::sleep(delay);
                    task();
                }
            });
            sender
        });
        lane.send(task).unwrap();
    }
}

/// A 200 response the cache keeps fresh for a minute.
pub fn cacheable(body: &'static str) -> TransportResponse {
    TransportResponse::new(200, body).with_header("Cache-Control", "max-age=60")
}
