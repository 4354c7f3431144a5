//! One server-side connection.
//!
//! A connection has two halves:
//! - [`Connection`] - the shared half (identity, transport, security layer,
//!   closed flag). It sits behind an `Arc` and is used by the read loop, every
//!   in-flight call, and whoever wants to close the connection.
//! - [`ConnectionEngine`] - the read-side state machine. It is owned by the
//!   read loop and takes `&mut self`, so inbound units are processed one at a
//!   time.

mod engine;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::codec::{CallResponse, RpcCodec};
use crate::error::{Result, RpcwireError};
use crate::protocol::build_frame;
use crate::security::{SecurityLayer, SecurityState};
use crate::transport::Transport;

pub use engine::{ConnectionEngine, Processed};

/// Placeholder host when the transport cannot report a peer address.
pub const UNKNOWN_HOST: &str = "*Unknown*";

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, shown as `conn-N` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Peer identity, fixed when the connection is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_ip: Option<IpAddr>,
    /// Remote port, 0 when unknown.
    pub remote_port: u16,
    /// Printable peer host, [`UNKNOWN_HOST`] when unknown.
    pub host_address: String,
}

impl ConnectionInfo {
    /// Build from whatever the transport reports.
    pub fn from_addr(addr: Option<SocketAddr>) -> Self {
        match addr {
            Some(addr) => Self {
                id: ConnectionId::next(),
                remote_ip: Some(addr.ip()),
                remote_port: addr.port(),
                host_address: addr.ip().to_string(),
            },
            None => Self::unknown(),
        }
    }

    /// Info for a peer with no known address.
    pub fn unknown() -> Self {
        Self {
            id: ConnectionId::next(),
            remote_ip: None,
            remote_port: 0,
            host_address: UNKNOWN_HOST.to_string(),
        }
    }

    /// Remote socket address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_ip
            .map(|ip| SocketAddr::new(ip, self.remote_port))
    }
}

/// Shared half of a connection.
pub struct Connection {
    info: ConnectionInfo,
    transport: Arc<dyn Transport>,
    security: Mutex<SecurityLayer>,
    codec: Arc<dyn RpcCodec>,
    closed: AtomicBool,
}

impl Connection {
    /// Create an open connection over `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        security: SecurityLayer,
        codec: Arc<dyn RpcCodec>,
    ) -> Self {
        Self {
            info: ConnectionInfo::from_addr(transport.remote_addr()),
            transport,
            security: Mutex::new(security),
            codec,
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Printable peer host.
    pub fn host_address(&self) -> &str {
        &self.info.host_address
    }

    pub fn codec(&self) -> &Arc<dyn RpcCodec> {
        &self.codec
    }

    /// Encode, protect and write one call response.
    ///
    /// Wrapping and writing happen under the security lock, so wrap sequence
    /// numbers match write order.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` after [`close`](Self::close); otherwise codec,
    /// security or transport errors. A failed transport write closes the
    /// connection.
    pub fn respond(&self, response: &CallResponse) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcwireError::ConnectionClosed);
        }
        let body = self.codec.encode_response(response)?;
        let frame = build_frame(&body);

        let sent = {
            let mut security = self.security();
            let out = if security.is_wrapping() {
                let wrapped = security.wrap(frame)?;
                build_frame(&wrapped)
            } else {
                frame
            };
            self.transport.write(out)
        };

        // An unsent response must not leave the peer waiting on an open connection.
        if let Err(e) = &sent {
            if e.is_connection_fatal() {
                tracing::warn!(
                    conn = %self.info.id,
                    call_id = response.call_id,
                    "Response not sent, closing connection: {}",
                    e
                );
                self.close();
            }
        }
        sent
    }

    /// Write pre-encoded bytes (SASL replies) without wrapping.
    ///
    /// Called with the security lock held, so a failure is left to the engine,
    /// which closes the connection once the lock is released.
    pub(crate) fn write_raw(&self, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcwireError::ConnectionClosed);
        }
        self.transport.write(bytes)
    }

    /// Close the connection. Idempotent.
    ///
    /// Closes the transport, then disposes the security layer. The transport
    /// goes first: a `respond` stuck in a transport write holds the security
    /// lock, and closing the transport is what unblocks it. Buffers owned by
    /// an in-progress `process` or by in-flight calls are released by their
    /// own guards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(conn = %self.info.id, host = %self.info.host_address, "closing connection");
        self.transport.close();
        self.security().dispose();
    }

    /// Open until closed locally or by the transport.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.is_open()
    }

    pub fn security_state(&self) -> SecurityState {
        self.security().state()
    }

    /// User authenticated by SASL, if any.
    pub fn authorized_user(&self) -> Option<String> {
        self.security().authorized_user().map(str::to_string)
    }

    /// Lock the security layer, recovering from poisoning.
    pub(crate) fn security(&self) -> MutexGuard<'_, SecurityLayer> {
        self.security.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
