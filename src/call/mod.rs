//! In-flight calls and the buffer release that travels with them.
//!
//! - [`CallCleanup`] - single-use release token for an inbound buffer
//! - [`InFlightCall`] - one decoded request bound to its connection
//!
//! An `InFlightCall` owns the cleanup for the frame it was decoded from. The
//! request param and cell block may borrow that frame's regions, so the
//! release runs only when the call is answered and dropped, or when the
//! executor calls [`InFlightCall::release_request`] after it has finished
//! reading the request.

mod cleanup;

pub use cleanup::CallCleanup;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::codec::CallResponse;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::messages::{ExceptionResponse, RequestHeader, TraceInfo};
use crate::protocol::FrameBuffer;
use crate::reservoir::Reservoir;
use crate::service::{MethodDescriptor, ServiceDescriptor};

/// Everything the engine gathers to build a call.
pub(crate) struct CallParts {
    pub service: Arc<ServiceDescriptor>,
    pub method: Arc<MethodDescriptor>,
    pub header: RequestHeader,
    pub param: Bytes,
    pub cell_block: Option<FrameBuffer>,
    pub size: usize,
    pub connection: Arc<Connection>,
    pub user: Option<String>,
    pub reservoir: Reservoir,
    pub cleanup: CallCleanup,
}

/// One request waiting for, or running in, the executor.
pub struct InFlightCall {
    id: u32,
    service: Arc<ServiceDescriptor>,
    method: Arc<MethodDescriptor>,
    header: RequestHeader,
    param: Bytes,
    cell_block: Option<FrameBuffer>,
    size: usize,
    connection: Arc<Connection>,
    remote_addr: Option<SocketAddr>,
    user: Option<String>,
    received_at: SystemTime,
    timeout: Option<Duration>,
    reservoir: Reservoir,
    cleanup: Option<CallCleanup>,
}

impl InFlightCall {
    pub(crate) fn from_parts(parts: CallParts) -> Self {
        let timeout = parts
            .header
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(u64::from(ms)));
        Self {
            id: parts.header.call_id,
            remote_addr: parts.connection.info().remote_addr(),
            service: parts.service,
            method: parts.method,
            header: parts.header,
            param: parts.param,
            cell_block: parts.cell_block,
            size: parts.size,
            connection: parts.connection,
            user: parts.user,
            received_at: SystemTime::now(),
            timeout,
            reservoir: parts.reservoir,
            cleanup: Some(parts.cleanup),
        }
    }

    /// Client-chosen call id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    pub fn method(&self) -> &Arc<MethodDescriptor> {
        &self.method
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// Request param bytes (empty if the client sent none).
    pub fn param(&self) -> &Bytes {
        &self.param
    }

    pub fn cell_block(&self) -> Option<&FrameBuffer> {
        self.cell_block.as_ref()
    }

    /// Take the cell block out of the call.
    pub fn take_cell_block(&mut self) -> Option<FrameBuffer> {
        self.cell_block.take()
    }

    /// Size of the request frame in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn trace(&self) -> Option<&TraceInfo> {
        self.header.trace_info.as_ref()
    }

    pub fn priority(&self) -> Option<u32> {
        self.header.priority
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// User the call runs as.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Client deadline, measured from [`received_at`](Self::received_at).
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Shared buffer budget, for handlers building large responses.
    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    /// Whether a response can still reach the client.
    pub fn is_connection_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Release the request buffers now, keeping the call alive.
    ///
    /// Drops the param and cell block first, since they may share the
    /// released regions. Calling it again does nothing.
    pub fn release_request(&mut self) {
        self.param = Bytes::new();
        self.cell_block = None;
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run();
        }
    }

    /// Whether the request buffers are still held.
    pub fn holds_request(&self) -> bool {
        self.cleanup.as_ref().is_some_and(CallCleanup::is_armed)
    }

    /// Answer with a result.
    pub fn respond(self, result: Bytes) -> Result<()> {
        let response = CallResponse::ok(self.id, result);
        self.send(response)
    }

    /// Answer with a result and a cell block.
    pub fn respond_with_cell_block(self, result: Bytes, cell_block: Bytes) -> Result<()> {
        let response = CallResponse::ok(self.id, result).with_cell_block(cell_block);
        self.send(response)
    }

    /// Answer with an exception.
    pub fn respond_error(self, exception: ExceptionResponse) -> Result<()> {
        let response = CallResponse::error(self.id, exception);
        self.send(response)
    }

    fn send(mut self, response: CallResponse) -> Result<()> {
        let result = self.connection.respond(&response);
        self.release_request();
        result
    }
}

impl fmt::Debug for InFlightCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCall")
            .field("id", &self.id)
            .field("service", &self.service.name())
            .field("method", &self.method.name())
            .field("size", &self.size)
            .field("conn", &self.connection.id())
            .finish()
    }
}
