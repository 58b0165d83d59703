//! Integration tests for the request queue.
//!
//! These drive a real RequestQueue (cache dispatcher plus network workers)
//! against a scripted transport and an in-memory recording cache. Most tests
//! deliver completions inline; the executor and lane tests deliver them on
//! separate threads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::cache::now_millis;
use courier_core::{
    Authenticator, CacheEntry, CredentialError, ErrorKind, EventKind, ExecutorDelivery, Headers,
    Method, NoCache, Priority, Request, RequestHandle, RequestQueue, RetryPolicy,
    TransportError, TransportResponse,
};
use parking_lot::Mutex;

mod support;
use support::{
    Collector, LaneDelivery, MockTransport, RecordingCache, build_queue, build_queue_with,
    cacheable, fast_config, wait_for,
};

const URL: &str = "https://example.test/resource";

// ==================== Helper Functions ====================

fn no_retries() -> RetryPolicy {
    RetryPolicy::with_max_retries(0)
}

fn stale_entry(body: &'static str) -> CacheEntry {
    let now = now_millis();
    let mut response_headers = Headers::new();
    response_headers.insert("etag".to_string(), "\"v1\"".to_string());
    response_headers.insert("cache-control".to_string(), "max-age=60".to_string());
    CacheEntry {
        data: Bytes::from_static(body.as_bytes()),
        etag: Some("\"v1\"".to_string()),
        soft_ttl: now.saturating_sub(1_000),
        ttl: now + 60_000,
        response_headers,
        ..CacheEntry::default()
    }
}

fn bodies(collector: &Collector<Bytes>) -> Vec<Bytes> {
    collector
        .results()
        .into_iter()
        .map(|result| result.unwrap().result)
        .collect()
}

// ==================== Cache bypass ====================

#[tokio::test]
async fn test_should_cache_false_never_touches_cache() {
    let transport = MockTransport::always(cacheable("fresh"));
    let cache = RecordingCache::new();
    let queue = build_queue(transport.clone(), cache.clone(), 2);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(
        Request::bytes(Method::Get, URL)
            .should_cache(false)
            .on_complete(collector.callback()),
    );
    wait_for("delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"fresh")]);
    assert_eq!(transport.calls(), 1);
    assert_eq!(cache.gets(), 0);
    assert_eq!(cache.puts(), 0);
}

#[tokio::test]
async fn test_post_is_not_cached_by_default() {
    let transport = MockTransport::always(cacheable("created"));
    let cache = RecordingCache::new();
    let queue = build_queue(transport.clone(), cache.clone(), 1);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(
        Request::bytes(Method::Post, URL)
            .body("payload")
            .on_complete(collector.callback()),
    );
    wait_for("delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(collector.len(), 1);
    assert_eq!(cache.gets(), 0);
    assert_eq!(cache.puts(), 0);
    let sent = transport.requests();
    assert_eq!(sent[0].method, Method::Post);
    assert_eq!(sent[0].body, Some(Bytes::from_static(b"payload")));
}

#[tokio::test]
async fn test_fresh_cache_hit_skips_network() {
    let transport = MockTransport::always(cacheable("network"));
    let cache = RecordingCache::new();
    let queue = build_queue(transport.clone(), cache.clone(), 1);

    let first = Collector::new();
    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(first.callback()));
    wait_for("first delivery", || handle.is_finished()).await;
    assert_eq!(cache.puts(), 1);

    let second = Collector::new();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(second.callback()));
    wait_for("second delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    let response = second.results().remove(0).unwrap();
    assert!(response.from_cache);
    assert!(!response.intermediate);
    assert_eq!(response.result, Bytes::from_static(b"network"));
}

// ==================== In-flight deduplication ====================

#[tokio::test]
async fn test_duplicate_requests_share_one_network_call() {
    let transport = MockTransport::slow(Duration::from_millis(100), cacheable("shared"));
    let queue = build_queue(transport.clone(), RecordingCache::new(), 4);
    let collector = Collector::new();

    let handles: Vec<RequestHandle> = (0..3)
        .map(|_| queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback())))
        .collect();
    queue.start();
    wait_for("all deliveries", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"shared"); 3]);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_duplicate_requests_share_one_error() {
    let transport = MockTransport::slow(
        Duration::from_millis(100),
        TransportResponse::new(404, "missing"),
    );
    let queue = build_queue(transport.clone(), RecordingCache::new(), 4);
    let collector: Collector<Bytes> = Collector::new();

    let handles: Vec<RequestHandle> = (0..3)
        .map(|_| queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback())))
        .collect();
    queue.start();
    wait_for("all errors", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    let results = collector.results();
    assert_eq!(results.len(), 3);
    for result in results {
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Client);
        assert_eq!(error.status(), Some(404));
    }
}

#[tokio::test]
async fn test_cancelled_owner_hands_fetch_to_waiter() {
    let transport = MockTransport::slow(
        Duration::from_millis(200),
        TransportResponse::new(200, "handed-off"),
    );
    let queue = build_queue(transport.clone(), RecordingCache::new(), 2);
    let owner_results = Collector::new();
    let waiter_results = Collector::new();

    let owner = queue.add(Request::bytes(Method::Get, URL).on_complete(owner_results.callback()));
    let waiter =
        queue.add(Request::bytes(Method::Get, URL).on_complete(waiter_results.callback()));
    queue.start();

    wait_for("owner in flight", || transport.calls() == 1).await;
    owner.cancel();
    wait_for("waiter delivery", || waiter.is_finished()).await;
    queue.stop().await;

    assert!(owner.is_finished());
    assert_eq!(owner_results.len(), 0);
    assert_eq!(bodies(&waiter_results), vec![Bytes::from_static(b"handed-off")]);
    assert_eq!(transport.calls(), 2);
}

// ==================== Ordering ====================

#[tokio::test]
async fn test_priority_then_sequence_order() {
    let transport = MockTransport::always(TransportResponse::new(200, "ok"));
    let queue = build_queue(transport, Arc::new(NoCache), 1);
    let taken = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&taken);
    queue.add_listener(
        |_| true,
        move |event| {
            if matches!(event.kind, EventKind::Marker("cache-queue-take")) {
                sink.lock().push(event.request.sequence());
            }
        },
    );

    let handles: Vec<RequestHandle> = [Priority::Low, Priority::High, Priority::Low, Priority::High]
        .into_iter()
        .enumerate()
        .map(|(i, priority)| {
            queue.add(Request::bytes(Method::Get, format!("{URL}/{i}")).priority(priority))
        })
        .collect();
    queue.start();
    wait_for("all deliveries", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(*taken.lock(), vec![1, 3, 0, 2]);
}

#[tokio::test]
async fn test_sequence_numbers_are_monotonic() {
    let queue = build_queue(
        MockTransport::always(TransportResponse::new(200, "")),
        Arc::new(NoCache),
        1,
    );
    let a = queue.add(Request::bytes(Method::Get, URL));
    let b = queue.add(Request::bytes(Method::Get, URL));
    let c = queue.add(Request::bytes(Method::Get, URL));
    assert!(a.sequence() < b.sequence());
    assert!(b.sequence() < c.sequence());
    assert_eq!(queue.pending(), (3, 0));
}

// ==================== Stale-while-revalidate ====================

#[tokio::test]
async fn test_stale_hit_delivers_intermediate_then_refresh() {
    let transport = MockTransport::always(cacheable("new"));
    let cache = RecordingCache::new();
    cache.seed(URL, stale_entry("old"));
    let queue = build_queue(transport.clone(), cache.clone(), 1);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("refresh", || handle.is_finished()).await;
    queue.stop().await;

    let results = collector.results();
    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    assert!(first.intermediate);
    assert!(first.from_cache);
    assert_eq!(first.result, Bytes::from_static(b"old"));
    let second = results[1].as_ref().unwrap();
    assert!(!second.intermediate);
    assert_eq!(second.result, Bytes::from_static(b"new"));

    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.requests()[0].header("if-none-match"), Some("\"v1\""));
    assert_eq!(
        cache.entry(URL).map(|entry| entry.data),
        Some(Bytes::from_static(b"new"))
    );
}

#[tokio::test]
async fn test_stale_hit_not_modified_still_delivers_final_response() {
    let transport = MockTransport::always(TransportResponse::new(304, ""));
    let cache = RecordingCache::new();
    cache.seed(URL, stale_entry("old"));
    let queue = build_queue(transport.clone(), cache.clone(), 1);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("revalidation", || handle.is_finished()).await;
    queue.stop().await;

    let results = collector.results();
    assert_eq!(results.len(), 2);
    assert!(results[0].as_ref().unwrap().intermediate);
    let last = results[1].as_ref().unwrap();
    assert!(!last.intermediate);
    assert!(last.not_modified);
    assert_eq!(last.result, Bytes::from_static(b"old"));
    assert_eq!(transport.calls(), 1);
    assert_eq!(cache.puts(), 1);
    assert!(cache.entry(URL).unwrap().soft_ttl > now_millis());
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_refresh_outrunning_stale_delivery_ends_on_fresh_data() {
    let transport = MockTransport::always(cacheable("new"));
    let cache = RecordingCache::new();
    cache.seed(URL, stale_entry("old"));
    // The cache stage posts first, so its lane runs behind the network worker's.
    let delivery = LaneDelivery::new(Duration::from_millis(100));
    let queue = build_queue_with(transport.clone(), cache, 1, delivery);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("refresh", || handle.is_finished()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    queue.stop().await;

    let results = collector.results();
    assert_eq!(results.len(), 1);
    let last = results[0].as_ref().unwrap();
    assert!(!last.intermediate);
    assert_eq!(last.result, Bytes::from_static(b"new"));
    assert_eq!(transport.calls(), 1);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_expired_entry_revalidates_with_304() {
    let transport = MockTransport::always(TransportResponse::new(304, ""));
    let cache = RecordingCache::new();
    let mut entry = stale_entry("cached-body");
    entry.ttl = 0;
    cache.seed(URL, entry);
    let queue = build_queue(transport.clone(), cache, 1);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("revalidation", || handle.is_finished()).await;
    queue.stop().await;

    let response = collector.results().remove(0).unwrap();
    assert!(response.not_modified);
    assert!(!response.intermediate);
    assert_eq!(response.result, Bytes::from_static(b"cached-body"));
}

// ==================== Executor delivery ====================

#[tokio::test]
async fn test_executor_delivery_dedups_stale_refresh_off_runtime() {
    let transport = MockTransport::slow(Duration::from_millis(100), cacheable("new"));
    let cache = RecordingCache::new();
    cache.seed(URL, stale_entry("old"));
    let queue = build_queue_with(
        transport.clone(),
        cache,
        2,
        Arc::new(ExecutorDelivery::new()),
    );
    let seen: Arc<Mutex<Vec<(u64, bool, Bytes, Option<String>)>>> = Arc::default();

    queue.start();
    let handles: Vec<RequestHandle> = (0..3u64)
        .map(|id| {
            let sink = Arc::clone(&seen);
            queue.add(Request::bytes(Method::Get, URL).on_complete(move |result| {
                let response = result.unwrap();
                let thread = std::thread::current().name().map(str::to_string);
                sink.lock()
                    .push((id, response.intermediate, response.result, thread));
            }))
        })
        .collect();
    wait_for("all refreshes", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(queue.in_flight(), 0);
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 6);
    assert!(
        seen.iter()
            .all(|(_, _, _, thread)| thread.as_deref() == Some("courier-delivery"))
    );
    for id in 0..3u64 {
        let per_request: Vec<(bool, Bytes)> = seen
            .iter()
            .filter(|(owner, ..)| *owner == id)
            .map(|(_, intermediate, body, _)| (*intermediate, body.clone()))
            .collect();
        assert_eq!(
            per_request,
            vec![
                (true, Bytes::from_static(b"old")),
                (false, Bytes::from_static(b"new")),
            ]
        );
    }
}

// ==================== Retry ====================

#[tokio::test]
async fn test_duplicates_wait_out_owner_retries_then_share_response() {
    let transport = MockTransport::new(Duration::from_millis(50), |_, call| {
        if call == 0 {
            Ok(TransportResponse::new(503, "busy"))
        } else {
            Ok(cacheable("recovered"))
        }
    });
    let queue = build_queue(transport.clone(), RecordingCache::new(), 4);
    let collector = Collector::new();

    let handles: Vec<RequestHandle> = (0..3)
        .map(|_| queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback())))
        .collect();
    queue.start();
    wait_for("all deliveries", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(handles[0].retries(), 1);
    assert_eq!(transport.calls(), 1 + handles[0].retries() as usize);
    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"recovered"); 3]);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_duplicates_share_error_after_owner_exhausts_retries() {
    let transport = MockTransport::slow(
        Duration::from_millis(50),
        TransportResponse::new(503, "busy"),
    );
    let queue = build_queue(transport.clone(), RecordingCache::new(), 4);
    let collector: Collector<Bytes> = Collector::new();

    let handles: Vec<RequestHandle> = (0..3)
        .map(|_| queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback())))
        .collect();
    queue.start();
    wait_for("all errors", || handles.iter().all(RequestHandle::is_finished)).await;
    queue.stop().await;

    assert_eq!(handles[0].retries(), 3);
    assert_eq!(transport.calls(), 4);
    let results = collector.results();
    assert_eq!(results.len(), 3);
    for result in results {
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Server);
        assert_eq!(error.status(), Some(503));
        assert_eq!(error.retries(), 3);
    }
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_transient_failure_exhausts_retries() {
    let transport = MockTransport::always(TransportResponse::new(503, "busy"));
    let queue = build_queue(transport.clone(), Arc::new(NoCache), 1);
    let collector: Collector<Bytes> = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("terminal error", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 4);
    assert_eq!(handle.retries(), 3);
    let error = collector.results().remove(0).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Server);
    assert_eq!(error.retries(), 3);
}

#[tokio::test]
async fn test_retry_recovers_after_transport_errors() {
    let transport = MockTransport::new(Duration::ZERO, |request, call| {
        if call < 2 {
            Err(TransportError::connection(&request.url, "connection reset"))
        } else {
            Ok(TransportResponse::new(200, "third time"))
        }
    });
    let queue = build_queue(transport.clone(), Arc::new(NoCache), 1);
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"third time")]);
}

#[tokio::test]
async fn test_network_error_without_retries_is_terminal() {
    let transport = MockTransport::new(Duration::ZERO, |request, _| {
        Err(TransportError::timeout(&request.url))
    });
    let queue = build_queue(transport.clone(), Arc::new(NoCache), 1);
    let collector: Collector<Bytes> = Collector::new();

    queue.start();
    let handle = queue.add(
        Request::bytes(Method::Get, URL)
            .retry_policy(no_retries())
            .on_complete(collector.callback()),
    );
    wait_for("terminal error", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(
        collector.results().remove(0).unwrap_err().kind(),
        ErrorKind::Network
    );
}

#[tokio::test]
async fn test_parse_failure_is_not_retried() {
    let transport = MockTransport::always(TransportResponse::new(200, vec![0xff, 0xfe]));
    let queue = build_queue(transport.clone(), RecordingCache::new(), 1);
    let collector: Collector<String> = Collector::new();

    queue.start();
    let handle = queue.add(Request::text(Method::Get, URL).on_complete(collector.callback()));
    wait_for("parse error", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(
        collector.results().remove(0).unwrap_err().kind(),
        ErrorKind::Parse
    );
}

// ==================== Authentication ====================

struct StaticAuthenticator {
    token: Option<&'static str>,
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn refresh(
        &self,
        _request: &RequestHandle,
        _status: u16,
    ) -> Result<Vec<(String, String)>, CredentialError> {
        match self.token {
            Some(token) => Ok(vec![(
                "Authorization".to_string(),
                format!("Bearer {token}"),
            )]),
            None => Err(CredentialError("token endpoint unavailable".to_string())),
        }
    }
}

fn auth_guarded_transport() -> Arc<MockTransport> {
    MockTransport::new(Duration::ZERO, |request, _| {
        if request.header("authorization") == Some("Bearer fresh") {
            Ok(TransportResponse::new(200, "secret"))
        } else {
            Ok(TransportResponse::new(401, ""))
        }
    })
}

fn auth_queue(transport: Arc<MockTransport>, token: Option<&'static str>) -> RequestQueue {
    RequestQueue::builder(transport)
        .delivery(Arc::new(courier_core::ImmediateDelivery))
        .authenticator(Arc::new(StaticAuthenticator { token }))
        .config(fast_config(1))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_auth_refresh_retries_with_new_credentials() {
    let transport = auth_guarded_transport();
    let queue = auth_queue(transport.clone(), Some("fresh"));
    let collector = Collector::new();

    queue.start();
    let handle = queue.add(
        Request::bytes(Method::Get, URL)
            .header("Authorization", "Bearer expired")
            .on_complete(collector.callback()),
    );
    wait_for("delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"secret")]);
    assert_eq!(transport.calls(), 2);
    assert_eq!(handle.retries(), 1);
    let retried = &transport.requests()[1];
    let auth_headers: Vec<_> = retried
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .collect();
    assert_eq!(auth_headers.len(), 1);
}

#[tokio::test]
async fn test_auth_refresh_failure_is_terminal() {
    let transport = auth_guarded_transport();
    let queue = auth_queue(transport.clone(), None);
    let collector: Collector<Bytes> = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("terminal error", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    let error = collector.results().remove(0).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Authenticator);
    assert_eq!(error.status(), Some(401));
}

#[tokio::test]
async fn test_auth_failure_without_authenticator() {
    let transport = auth_guarded_transport();
    let queue = build_queue(transport.clone(), Arc::new(NoCache), 1);
    let collector: Collector<Bytes> = Collector::new();

    queue.start();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("terminal error", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(
        collector.results().remove(0).unwrap_err().kind(),
        ErrorKind::Authentication
    );
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_before_start_never_calls_transport() {
    let transport = MockTransport::always(TransportResponse::new(200, "unused"));
    let queue = build_queue(transport.clone(), RecordingCache::new(), 1);
    let collector: Collector<Bytes> = Collector::new();

    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    handle.cancel();
    queue.start();
    wait_for("discard", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(transport.calls(), 0);
    assert_eq!(collector.len(), 0);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_all_tagged_only_hits_tag() {
    let queue = build_queue(
        MockTransport::always(TransportResponse::new(200, "")),
        Arc::new(NoCache),
        1,
    );
    let a = queue.add(Request::bytes(Method::Get, format!("{URL}/a")).tag("screen-1"));
    let b = queue.add(Request::bytes(Method::Get, format!("{URL}/b")).tag("screen-2"));
    let c = queue.add(Request::bytes(Method::Get, format!("{URL}/c")).tag("screen-1"));

    assert_eq!(queue.cancel_all_tagged("screen-1"), 2);
    assert_eq!(queue.cancel_all_tagged("screen-1"), 0);
    assert!(a.is_cancelled());
    assert!(!b.is_cancelled());
    assert!(c.is_cancelled());
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_stop_is_idempotent_and_safe_without_start() {
    let queue = build_queue(
        MockTransport::always(TransportResponse::new(200, "")),
        Arc::new(NoCache),
        2,
    );
    queue.stop().await;
    queue.stop().await;
    assert!(!queue.is_running());

    queue.start();
    assert!(queue.is_running());
    queue.stop().await;
    queue.stop().await;
    assert!(!queue.is_running());
}

#[tokio::test]
async fn test_panicking_callback_does_not_stall_queue() {
    let transport = MockTransport::always(cacheable("ok"));
    let queue = build_queue(transport, Arc::new(NoCache), 1);
    let collector = Collector::new();

    queue.start();
    let panicking = queue.add(
        Request::bytes(Method::Get, "https://example.test/panics")
            .on_complete(|_| panic!("callback failure")),
    );
    let normal = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    wait_for("both requests", || panicking.is_finished() && normal.is_finished()).await;
    queue.stop().await;

    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"ok")]);
    assert_eq!(queue.in_flight(), 0);
}

#[tokio::test]
async fn test_queue_restarts_after_stop() {
    let transport = MockTransport::always(TransportResponse::new(200, "again"));
    let queue = build_queue(transport.clone(), Arc::new(NoCache), 1);
    queue.start();
    queue.stop().await;

    let collector = Collector::new();
    let handle = queue.add(Request::bytes(Method::Get, URL).on_complete(collector.callback()));
    queue.start();
    wait_for("delivery", || handle.is_finished()).await;
    queue.stop().await;

    assert_eq!(bodies(&collector), vec![Bytes::from_static(b"again")]);
}

#[tokio::test]
async fn test_listener_sees_lifecycle_markers() {
    let transport = MockTransport::always(cacheable("body"));
    let queue = build_queue(transport, RecordingCache::new(), 1);
    let markers = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&markers);
    let id = queue.add_listener(
        |request| request.target().url == URL,
        move |event| {
            if let EventKind::Marker(name) = event.kind {
                sink.lock().push(name);
            }
        },
    );

    let other = queue.add(Request::bytes(Method::Get, format!("{URL}/other")));
    let handle = queue.add(Request::bytes(Method::Get, URL));
    queue.start();
    wait_for("delivery", || handle.is_finished() && other.is_finished()).await;
    queue.stop().await;

    let markers = markers.lock().clone();
    assert_eq!(markers.first(), Some(&"add-to-queue"));
    assert_eq!(markers.last(), Some(&"done"));
    for expected in [
        "cache-queue-take",
        "cache-miss",
        "network-queue-take",
        "network-http-complete",
        "network-parse-complete",
        "network-cache-written",
        "post-response",
    ] {
        assert!(markers.contains(&expected), "missing {expected} in {markers:?}");
    }
    assert!(queue.remove_listener(id));
    assert!(!queue.remove_listener(id));
}
