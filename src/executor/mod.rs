//! Execution collaborator - where decoded calls go.
//!
//! The engine hands every call to a [`CallExecutor`]. The executor must not
//! block the read loop: it either accepts the call (and later answers it) or
//! gives it straight back in a [`DispatchRejected`], which the engine answers
//! with `CallQueueTooBigException`.
//!
//! Provides:
//! - [`HandlerExecutor`] - typed async handlers on tokio, with a concurrency
//!   limit and per-call timeouts
//! - [`ChannelExecutor`] - bounded queue for thread-pool style workers
//!
//! # Example
//!
//! ```
//! use rpcwire_server::executor::{HandlerExecutor, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("Kv", "get", |key: String, _ctx| async move {
//!     Ok(format!("value-of-{key}"))
//! });
//! let executor = HandlerExecutor::new(registry, 64);
//! assert_eq!(executor.available_permits(), 64);
//! ```

mod context;
mod handlers;
mod registry;

use std::sync::mpsc;

use crate::call::InFlightCall;

pub use context::CallContext;
pub use handlers::{HandlerExecutor, DEFAULT_MAX_CONCURRENT_CALLS};
pub use registry::{BoxFuture, Handler, HandlerError, HandlerRegistry, HandlerResult, TypedHandler};

/// A call the executor refused, handed back to the engine.
#[derive(Debug)]
pub struct DispatchRejected {
    pub call: InFlightCall,
    /// Why the call was refused; sent to the client.
    pub reason: String,
}

impl DispatchRejected {
    pub fn new(call: InFlightCall, reason: impl Into<String>) -> Self {
        Self {
            call,
            reason: reason.into(),
        }
    }
}

/// Accepts decoded calls without blocking the caller.
pub trait CallExecutor: Send + Sync + 'static {
    /// Take ownership of `call`, or give it back.
    fn dispatch(&self, call: InFlightCall) -> std::result::Result<(), DispatchRejected>;
}

/// Queues calls on a bounded std channel for worker threads.
pub struct ChannelExecutor {
    tx: mpsc::SyncSender<InFlightCall>,
}

impl ChannelExecutor {
    /// Create an executor and the receiver workers pull calls from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InFlightCall>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self { tx }, rx)
    }
}

impl CallExecutor for ChannelExecutor {
    fn dispatch(&self, call: InFlightCall) -> std::result::Result<(), DispatchRejected> {
        self.tx.try_send(call).map_err(|e| match e {
            mpsc::TrySendError::Full(call) => DispatchRejected::new(call, "Call queue is full"),
            mpsc::TrySendError::Disconnected(call) => {
                DispatchRejected::new(call, "Call queue is shut down")
            }
        })
    }
}
