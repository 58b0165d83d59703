//! Cache stage: resolves each request against the cache store.
//!
//! | Lookup | Action |
//! |--------|--------|
//! | `should_cache = false` | straight to the network queue |
//! | miss | claim key: owner → network queue, otherwise park as waiter |
//! | expired (`now >= ttl`) | attach entry for validators, then claim |
//! | fresh (`now < soft_ttl`) | deliver from cache, done |
//! | stale (`soft_ttl <= now < ttl`) | deliver as intermediate, attach entry, then claim |

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::Shared;
use super::dispatch::{Dispatch, deliver_response};
use super::waiting::Claim;
use crate::cache::now_millis;
use crate::network::NetworkResponse;

pub(crate) async fn run(shared: Arc<Shared>) {
    shared.cache.initialize().await;
    info!("cache dispatcher started");

    while let Some(dispatch) = shared.cache_queue.pop().await {
        process(&shared, dispatch).await;
    }

    info!("cache dispatcher stopped");
}

#[instrument(
    skip_all,
    fields(sequence = dispatch.handle().sequence(), key = %dispatch.handle().cache_key())
)]
async fn process(shared: &Shared, dispatch: Arc<dyn Dispatch>) {
    let handle = dispatch.handle();
    let ctx = &shared.ctx;
    ctx.marker(handle, "cache-queue-take");

    if handle.is_cancelled() {
        ctx.finish(handle, "cache-discard-canceled");
        return;
    }

    if !handle.should_cache() {
        shared.forward_to_network(dispatch);
        return;
    }

    let Some(entry) = shared.cache.get(handle.cache_key()).await else {
        ctx.marker(handle, "cache-miss");
        claim_and_forward(shared, dispatch);
        return;
    };

    let now = now_millis();
    if entry.is_expired(now) {
        ctx.marker(handle, "cache-hit-expired");
        handle.set_cache_entry(entry);
        claim_and_forward(shared, dispatch);
        return;
    }

    ctx.marker(handle, "cache-hit");
    let response = Arc::new(NetworkResponse::from_cache_entry(&entry));

    if !entry.refresh_needed(now) {
        deliver_response(dispatch.as_ref(), response, false, ctx);
        return;
    }

    ctx.marker(handle, "cache-hit-refresh-needed");
    handle.set_cache_entry(entry);
    if deliver_response(dispatch.as_ref(), response, true, ctx) {
        claim_and_forward(shared, dispatch);
    } else {
        debug!("stale entry failed to parse, not refreshing");
    }
}

fn claim_and_forward(shared: &Shared, dispatch: Arc<dyn Dispatch>) {
    match shared.waiting.claim(&dispatch) {
        Claim::Owner => shared.forward_to_network(dispatch),
        Claim::Waiting => {
            shared
                .ctx
                .marker(dispatch.handle(), "waiting-for-response");
        }
    }
}
