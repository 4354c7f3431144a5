//! Per-call context passed to handlers.
//!
//! Handlers return their result; the executor writes it. The context only
//! carries what a handler may want to know about the call it is serving.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::call::InFlightCall;
use crate::connection::Connection;
use crate::protocol::messages::TraceInfo;
use crate::reservoir::Reservoir;

/// Context passed to call handlers.
///
/// `CallContext` is `Clone` and can be moved into spawned tasks.
#[derive(Clone, Debug)]
pub struct CallContext {
    call_id: u32,
    service: String,
    method: String,
    user: Option<String>,
    remote_addr: Option<SocketAddr>,
    received_at: SystemTime,
    timeout: Option<Duration>,
    trace: Option<TraceInfo>,
    cell_block: Option<Bytes>,
    reservoir: Reservoir,
    connection: Option<Arc<Connection>>,
}

impl CallContext {
    /// Capture the context of `call`.
    pub fn from_call(call: &InFlightCall) -> Self {
        Self {
            call_id: call.id(),
            service: call.service().name().to_string(),
            method: call.method().name().to_string(),
            user: call.user().map(str::to_string),
            remote_addr: call.remote_addr(),
            received_at: call.received_at(),
            timeout: call.timeout(),
            trace: call.trace().copied(),
            cell_block: call.cell_block().map(|c| c.to_bytes()),
            reservoir: call.reservoir().clone(),
            connection: Some(call.connection().clone()),
        }
    }

    /// Context not bound to any connection (for testing handlers).
    pub fn detached(call_id: u32) -> Self {
        Self {
            call_id,
            service: String::new(),
            method: String::new(),
            user: None,
            remote_addr: None,
            received_at: SystemTime::now(),
            timeout: None,
            trace: None,
            cell_block: None,
            reservoir: Reservoir::default(),
            connection: None,
        }
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// User the call runs as.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn trace(&self) -> Option<&TraceInfo> {
        self.trace.as_ref()
    }

    /// Request cell block, if the client sent one.
    pub fn cell_block(&self) -> Option<&Bytes> {
        self.cell_block.as_ref()
    }

    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    /// Whether the client is still there. Long handlers may poll this.
    pub fn is_connection_open(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_open())
    }
}
