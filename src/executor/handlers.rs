//! Tokio executor running registered handlers.
//!
//! Each accepted call gets one spawned task holding a semaphore permit, so at
//! most `max_concurrent` handlers run at once. When no permit is free the call
//! is handed back to the engine instead of queueing. A call whose client sent
//! a timeout runs under `tokio::time::timeout`, measured from the moment the
//! frame was received.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{CallContext, CallExecutor, DispatchRejected, Handler, HandlerRegistry};
use crate::call::InFlightCall;
use crate::protocol::messages::ExceptionResponse;

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Runs calls on tokio tasks.
pub struct HandlerExecutor {
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    runtime: Option<Handle>,
}

impl HandlerExecutor {
    /// Create an executor that spawns on the current runtime at dispatch time.
    pub fn new(registry: HandlerRegistry, max_concurrent: usize) -> Self {
        Self {
            registry: Arc::new(registry),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            runtime: None,
        }
    }

    /// Spawn on `runtime`, so calls can be dispatched from non-tokio threads.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Permits not currently held by running calls.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl CallExecutor for HandlerExecutor {
    fn dispatch(&self, call: InFlightCall) -> std::result::Result<(), DispatchRejected> {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => return Err(DispatchRejected::new(call, "No async runtime available")),
        };

        let Some(handler) = self
            .registry
            .get(call.service().name(), call.method().name())
        else {
            let exception =
                ExceptionResponse::unknown_method(call.service().name(), call.method().name());
            if let Err(e) = call.respond_error(exception) {
                tracing::debug!("Could not answer call without handler: {}", e);
            }
            return Ok(());
        };

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    "Handler capacity reached, rejecting call {} for method {}",
                    call.id(),
                    call.method().name()
                );
                return Err(DispatchRejected::new(
                    call,
                    format!("Too many concurrent calls (limit {})", self.max_concurrent),
                ));
            }
        };

        runtime.spawn(run_call(handler, call, permit));
        Ok(())
    }
}

/// Run one call to completion and write its response.
async fn run_call(handler: Arc<dyn Handler>, call: InFlightCall, _permit: OwnedSemaphorePermit) {
    let call_id = call.id();
    let conn = call.connection().id();

    if !call.is_connection_open() {
        tracing::debug!(%conn, call_id, "connection closed before call ran, skipping");
        return;
    }

    let remaining = match call.timeout() {
        Some(limit) => {
            let elapsed = call.received_at().elapsed().unwrap_or_default();
            let remaining = limit.saturating_sub(elapsed);
            if remaining.is_zero() {
                tracing::debug!(%conn, call_id, "call expired in queue");
                respond_timeout(call, limit);
                return;
            }
            Some((limit, remaining))
        }
        None => None,
    };

    let ctx = CallContext::from_call(&call);
    let fut = handler.call(call.param(), ctx);

    let outcome = match remaining {
        Some((limit, remaining)) => match tokio::time::timeout(remaining, fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(%conn, call_id, "call timed out");
                respond_timeout(call, limit);
                return;
            }
        },
        None => fut.await,
    };

    let sent = match outcome {
        Ok(result) => call.respond(result),
        Err(e) => {
            tracing::debug!(%conn, call_id, error = %e, "handler failed");
            call.respond_error(e.into_exception())
        }
    };
    if let Err(e) = sent {
        tracing::debug!(%conn, call_id, "Response not delivered: {}", e);
    }
}

fn respond_timeout(call: InFlightCall, limit: Duration) {
    let exception = ExceptionResponse::call_timeout(limit.as_millis() as u64);
    if let Err(e) = call.respond_error(exception) {
        tracing::debug!("Timeout response not delivered: {}", e);
    }
}
