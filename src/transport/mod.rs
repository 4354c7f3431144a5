//! Transport boundary - where frames leave and bytes arrive.
//!
//! The engine only sees [`Transport`]: an open flag, a peer address, a
//! non-blocking `write` of whole frames, and `close`. Reading is done by a
//! driver that owns the socket's read half and feeds the engine.
//!
//! Provides:
//! - [`TokioTransport`] with [`drive`] - async writer task plus read loop
//! - [`BlockingTransport`] with [`drive_blocking`] - `std::net::TcpStream`
//! - [`MemoryTransport`] - records writes, for tests and embedding

mod blocking;
mod memory;
mod stream;

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Result;

pub use blocking::{drive_blocking, BlockingTransport};
pub use memory::MemoryTransport;
pub use stream::{
    drive, TokioTransport, WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES,
};

/// Outbound side of one connection.
pub trait Transport: Send + Sync + 'static {
    /// Peer address, if the transport knows it.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Send one complete frame, or queue it for sending.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once closed, `Backpressure` when the outbound queue
    /// is full, or an I/O error from a synchronous transport.
    fn write(&self, frame: Bytes) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the transport. Idempotent.
    ///
    /// May be called while another thread is inside `write`, and must not
    /// wait for that write to finish.
    fn close(&self);
}
