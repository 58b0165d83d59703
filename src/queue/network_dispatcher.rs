//! Network stage: a pool of workers sharing the network queue.
//!
//! Each worker runs one request at a time: transport call, 304 merge, cache
//! write-back, fan-out to waiters, delivery. Failures are classified and
//! either retried in place (after a backoff sleep on a detached task, never
//! through the cache stage again) or delivered to the owner and every waiter.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use super::Shared;
use super::dispatch::{Dispatch, deliver_response};
use crate::cache::headers::{conditional_headers, parse_cache_headers};
use crate::cache::now_millis;
use crate::error::RequestError;
use crate::network::{NetworkResponse, TransportError, TransportRequest};
use crate::request::{
    FailureType, RequestHandle, RetryDecision, classify_status, classify_transport_error,
};

/// Why an attempt failed.
#[derive(Debug)]
enum Failure {
    Status(u16),
    Transport(TransportError),
}

pub(crate) async fn run(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "network worker started");

    while let Some(dispatch) = shared.network_queue.pop().await {
        process(&shared, dispatch).await;
    }

    debug!(worker, "network worker stopped");
}

#[instrument(
    skip_all,
    fields(
        sequence = dispatch.handle().sequence(),
        url = %dispatch.handle().target().url,
        retries = dispatch.handle().retries()
    )
)]
async fn process(shared: &Arc<Shared>, dispatch: Arc<dyn Dispatch>) {
    let handle = dispatch.handle().clone();
    let ctx = &shared.ctx;
    ctx.marker(&handle, "network-queue-take");

    if handle.is_cancelled() {
        discard_cancelled(shared, &dispatch);
        return;
    }

    let request = build_transport_request(&handle);
    let timeout = handle.retry_policy().timeout();
    let started = Instant::now();
    let outcome = shared.transport.execute(&request, timeout).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if handle.is_cancelled() {
        discard_cancelled(shared, &dispatch);
        return;
    }

    let response = match outcome {
        Ok(response) => response,
        Err(error) => {
            debug!(elapsed_ms, error = %error, "transport failed");
            handle_failure(shared, dispatch, Failure::Transport(error)).await;
            return;
        }
    };

    ctx.marker(&handle, "network-http-complete");
    debug!(elapsed_ms, status = response.status, "transport complete");

    if response.status == 304
        && let Some(entry) = handle.cache_entry()
    {
        ctx.marker(&handle, "not-modified");
        let merged = NetworkResponse::not_modified(&entry, &response.headers);
        complete(shared, &dispatch, merged).await;
        return;
    }

    if (200..300).contains(&response.status) {
        complete(shared, &dispatch, NetworkResponse::from_transport(response)).await;
        return;
    }

    handle_failure(shared, dispatch, Failure::Status(response.status)).await;
}

fn build_transport_request(handle: &RequestHandle) -> TransportRequest {
    let core = &handle.0;
    let credentials = handle.credentials();
    let mut headers: Vec<(String, String)> = core
        .headers
        .iter()
        .filter(|(name, _)| {
            !credentials
                .iter()
                .any(|(credential, _)| credential.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect();
    headers.extend(credentials);
    if let Some(entry) = handle.cache_entry() {
        headers.extend(conditional_headers(&entry));
    }

    TransportRequest {
        method: core.target.method,
        url: core.target.url.clone(),
        headers,
        body: core.body.clone(),
    }
}

/// Success path: cache write-back, waiter fan-out, owner delivery.
///
/// A refresh after a stale hit is delivered as a second, final response even
/// when the server answered 304.
async fn complete(shared: &Shared, dispatch: &Arc<dyn Dispatch>, response: NetworkResponse) {
    let handle = dispatch.handle();
    let ctx = &shared.ctx;
    let response = Arc::new(response);

    let owner_task = dispatch.prepare(Arc::clone(&response), false, ctx);
    if owner_task.is_ok() {
        ctx.marker(handle, "network-parse-complete");
        if handle.should_cache()
            && let Some(entry) = parse_cache_headers(&response, now_millis(), shared.default_ttl)
        {
            shared.cache.put(handle.cache_key(), entry).await;
            ctx.marker(handle, "network-cache-written");
        }
    }

    // Drain only after the cache write, so later arrivals hit the cache.
    if handle.is_owner() {
        handle.set_owner(false);
        for waiter in shared.waiting.drain(handle.cache_key()) {
            deliver_response(waiter.as_ref(), Arc::clone(&response), false, ctx);
        }
    }

    match owner_task {
        Ok(task) => ctx.post(task),
        Err(error) => dispatch.deliver_error(
            RequestError::parse(&handle.target().url, error, handle.retries()),
            ctx,
        ),
    }
}

async fn handle_failure(shared: &Arc<Shared>, dispatch: Arc<dyn Dispatch>, failure: Failure) {
    let handle = dispatch.handle().clone();
    let policy = handle.retry_policy();
    let retries = handle.retries();
    let failure_type = match &failure {
        Failure::Status(status) => classify_status(*status),
        Failure::Transport(error) => classify_transport_error(error),
    };

    if let (FailureType::NeedsAuth, Failure::Status(status), Some(authenticator)) =
        (failure_type, &failure, &shared.authenticator)
        && matches!(policy.next_attempt(retries), RetryDecision::Retry { .. })
    {
        match authenticator.refresh(&handle, *status).await {
            Ok(headers) => {
                handle.set_credentials(headers);
                shared.ctx.marker(&handle, "auth-refreshed");
                handle.increment_retries();
                shared.ctx.marker(&handle, "retry");
                info!(status, "credentials refreshed, retrying");
                shared.forward_to_network(dispatch);
            }
            Err(error) => {
                warn!(status, error = %error, "credential refresh failed");
                let terminal = RequestError::Authenticator {
                    url: handle.target().url.clone(),
                    status: *status,
                    message: error.to_string(),
                    retries,
                };
                fail(shared, &dispatch, terminal);
            }
        }
        return;
    }

    match policy.should_retry(failure_type, retries) {
        RetryDecision::Retry { delay, attempt } => {
            handle.increment_retries();
            shared.ctx.marker(&handle, "retry");
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                ?failure,
                "scheduling retry"
            );
            if delay.is_zero() {
                shared.forward_to_network(dispatch);
            } else {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.forward_to_network(dispatch);
                });
            }
        }
        RetryDecision::DoNotRetry { reason } => {
            debug!(reason = %reason, ?failure, "giving up");
            let url = handle.target().url.clone();
            let terminal = match failure {
                Failure::Transport(source) => RequestError::Network {
                    url,
                    source,
                    retries,
                },
                Failure::Status(status) => match failure_type {
                    FailureType::NeedsAuth => RequestError::Authentication {
                        url,
                        status,
                        retries,
                    },
                    FailureType::Transient | FailureType::RateLimited => RequestError::Server {
                        url,
                        status,
                        retries,
                    },
                    FailureType::Permanent => RequestError::Client {
                        url,
                        status,
                        retries,
                    },
                },
            };
            fail(shared, &dispatch, terminal);
        }
    }
}

/// Delivers a terminal error to every waiter and then to the owner.
fn fail(shared: &Shared, dispatch: &Arc<dyn Dispatch>, error: RequestError) {
    let handle = dispatch.handle();
    warn!(kind = %error.kind(), error = %error, "request failed");
    if handle.is_owner() {
        handle.set_owner(false);
        for waiter in shared.waiting.drain(handle.cache_key()) {
            waiter.deliver_error(error.clone(), &shared.ctx);
        }
    }
    dispatch.deliver_error(error, &shared.ctx);
}

/// Drops a cancelled request and hands its in-flight fetch to the next waiter.
fn discard_cancelled(shared: &Shared, dispatch: &Arc<dyn Dispatch>) {
    let handle = dispatch.handle();
    shared.ctx.finish(handle, "network-discard-cancelled");
    if !handle.is_owner() {
        return;
    }
    handle.set_owner(false);

    let (next, skipped) = shared.waiting.hand_off(handle.cache_key());
    for waiter in skipped {
        shared
            .ctx
            .finish(waiter.handle(), "network-discard-cancelled");
    }
    if let Some(next) = next {
        debug!(
            next_sequence = next.handle().sequence(),
            "owner cancelled, promoting waiter"
        );
        shared.forward_to_network(next);
    }
}
