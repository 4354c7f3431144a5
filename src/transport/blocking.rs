//! Blocking transport over `std::net::TcpStream`.
//!
//! For thread-per-connection servers. Writes happen on the caller's thread
//! under a mutex, so concurrent responders never interleave frames.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;

use super::stream::feed;
use super::Transport;
use crate::connection::ConnectionEngine;
use crate::error::{Result, RpcwireError};
use crate::protocol::FrameDecoder;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Transport writing straight to a TCP socket.
#[derive(Debug)]
pub struct BlockingTransport {
    stream: Mutex<TcpStream>,
    /// Clone of the socket used only for `shutdown`, outside the write lock.
    control: TcpStream,
    remote_addr: Option<SocketAddr>,
    open: AtomicBool,
}

impl BlockingTransport {
    /// Wrap the write side of `stream`.
    ///
    /// Closing the transport shuts the socket down in both directions. That
    /// wakes a reader blocked on a clone of the same socket and fails a write
    /// stuck on a peer that stopped reading.
    pub fn new(stream: TcpStream) -> Result<Self> {
        Ok(Self {
            remote_addr: stream.peer_addr().ok(),
            control: stream.try_clone()?,
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        })
    }
}

impl Transport for BlockingTransport {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RpcwireError::ConnectionClosed);
        }
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = stream.write_all(&frame).and_then(|_| stream.flush()) {
            self.open.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.control.shutdown(Shutdown::Both) {
                tracing::debug!("socket shutdown failed: {}", e);
            }
        }
    }
}

/// Blocking read loop. Runs until EOF, close, or a fatal error.
///
/// The connection is closed on every exit path.
pub fn drive_blocking<R>(
    mut reader: R,
    mut engine: ConnectionEngine,
    mut decoder: FrameDecoder,
) -> Result<()>
where
    R: Read,
{
    let conn = engine.connection().id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let result = loop {
        if !engine.is_open() {
            break Ok(());
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(%conn, "peer closed connection");
                break Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // A local close shuts the socket down under a blocked reader.
            Err(_) if !engine.is_open() => break Ok(()),
            Err(e) => break Err(RpcwireError::Io(e)),
        };

        let units = match decoder.push(&buf[..n]) {
            Ok(units) => units,
            Err(e) => break Err(e),
        };
        if let Err(e) = feed(&mut engine, units) {
            break Err(e);
        }
    };

    if let Err(e) = &result {
        tracing::error!(%conn, "Read loop error: {}", e);
    }
    engine.close();
    result
}
