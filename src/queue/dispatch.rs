//! Type-erased requests as seen by the dispatchers.
//!
//! Queues, the waiting table and the workers handle `Arc<dyn Dispatch>`;
//! only [`TypedRequest`] knows the payload type. Parsing happens on the
//! worker that produced the response, delivery happens wherever the
//! [`Delivery`] runs tasks.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::delivery::{Delivery, DeliveryTask, EventKind, ListenerRegistry};
use crate::error::{ParseError, RequestError};
use crate::network::NetworkResponse;
use crate::request::{Completion, Parser, Request, RequestHandle, Response};

/// Shared plumbing every stage uses to report progress and deliver results.
#[derive(Clone)]
pub(crate) struct DeliveryContext {
    delivery: Arc<dyn Delivery>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    tracked: Arc<DashMap<u64, RequestHandle>>,
}

impl DeliveryContext {
    pub(crate) fn new(delivery: Arc<dyn Delivery>, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            delivery,
            listeners,
            tracked: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn tracked(&self) -> &DashMap<u64, RequestHandle> {
        &self.tracked
    }

    pub(crate) fn track(&self, handle: &RequestHandle) {
        self.tracked.insert(handle.sequence(), handle.clone());
    }

    /// Records a named checkpoint.
    pub(crate) fn marker(&self, handle: &RequestHandle, name: &'static str) {
        trace!(
            sequence = handle.sequence(),
            key = %handle.cache_key(),
            marker = name,
            "request event"
        );
        self.listeners.notify(handle, EventKind::Marker(name));
    }

    /// Ends the request's life in the queue. Later calls are no-ops.
    pub(crate) fn finish(&self, handle: &RequestHandle, reason: &'static str) {
        if handle.mark_finished() {
            self.tracked.remove(&handle.sequence());
            self.marker(handle, reason);
        }
    }

    pub(crate) fn post(&self, task: DeliveryTask) {
        self.delivery.post(task);
    }
}

/// A request whose payload type has been erased.
pub(crate) trait Dispatch: Send + Sync {
    fn handle(&self) -> &RequestHandle;

    /// Parses `response` now and returns the task that delivers the result.
    fn prepare(
        &self,
        response: Arc<NetworkResponse>,
        intermediate: bool,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryTask, ParseError>;

    /// Posts a terminal error.
    fn deliver_error(&self, error: RequestError, ctx: &DeliveryContext);
}

pub(crate) struct TypedRequest<T> {
    handle: RequestHandle,
    parser: Parser<T>,
    on_complete: Completion<T>,
}

impl<T: Send + 'static> TypedRequest<T> {
    pub(crate) fn from_request(request: Request<T>) -> (RequestHandle, Arc<dyn Dispatch>) {
        let (handle, parser, on_complete) = request.into_parts();
        let typed = Self {
            handle: handle.clone(),
            parser,
            on_complete,
        };
        (handle, Arc::new(typed))
    }
}

impl<T: Send + 'static> Dispatch for TypedRequest<T> {
    fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    fn prepare(
        &self,
        response: Arc<NetworkResponse>,
        intermediate: bool,
        ctx: &DeliveryContext,
    ) -> Result<DeliveryTask, ParseError> {
        let result = (self.parser)(&response)?;
        ctx.marker(&self.handle, "post-response");

        let handle = self.handle.clone();
        let on_complete = Arc::clone(&self.on_complete);
        let ctx = ctx.clone();
        Ok(Box::new(move || {
            // Tasks from different dispatchers may run out of posting order;
            // nothing reaches the caller once the final result has.
            if handle.is_finished() {
                trace!(sequence = handle.sequence(), intermediate, "late response dropped");
                return;
            }
            if handle.is_cancelled() {
                ctx.finish(&handle, "canceled-at-delivery");
                return;
            }
            handle.mark_delivered();
            ctx.listeners.notify(
                &handle,
                EventKind::Response {
                    response: Arc::clone(&response),
                    intermediate,
                },
            );
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                on_complete(Ok(Response {
                    result,
                    status: response.status,
                    headers: response.headers.clone(),
                    from_cache: response.from_cache,
                    intermediate,
                    not_modified: response.not_modified,
                }));
            }));
            if !intermediate {
                ctx.finish(&handle, "done");
            }
            if let Err(panic) = delivered {
                resume_unwind(panic);
            }
        }))
    }

    fn deliver_error(&self, error: RequestError, ctx: &DeliveryContext) {
        ctx.marker(&self.handle, "post-error");

        let handle = self.handle.clone();
        let on_complete = Arc::clone(&self.on_complete);
        let task_ctx = ctx.clone();
        ctx.post(Box::new(move || {
            if handle.is_finished() {
                trace!(sequence = handle.sequence(), "late error dropped");
                return;
            }
            if handle.is_cancelled() {
                task_ctx.finish(&handle, "canceled-at-delivery");
                return;
            }
            task_ctx
                .listeners
                .notify(&handle, EventKind::Error(error.clone()));
            let delivered = catch_unwind(AssertUnwindSafe(|| on_complete(Err(error))));
            task_ctx.finish(&handle, "done");
            if let Err(panic) = delivered {
                resume_unwind(panic);
            }
        }));
    }
}

/// Parses and posts `response` for `dispatch`; a parse failure is delivered
/// as a terminal error instead. Returns true when a response was posted.
pub(crate) fn deliver_response(
    dispatch: &dyn Dispatch,
    response: Arc<NetworkResponse>,
    intermediate: bool,
    ctx: &DeliveryContext,
) -> bool {
    match dispatch.prepare(response, intermediate, ctx) {
        Ok(task) => {
            ctx.post(task);
            true
        }
        Err(error) => {
            let handle = dispatch.handle();
            dispatch.deliver_error(
                RequestError::parse(&handle.target().url, error, handle.retries()),
                ctx,
            );
            false
        }
    }
}
