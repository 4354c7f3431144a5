//! In-memory transport that records every frame written to it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::Transport;
use crate::error::{Result, RpcwireError};

/// Transport that keeps written frames in memory.
///
/// Useful for driving a `ConnectionEngine` without sockets, or for embedding
/// the engine where the caller moves bytes itself.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    remote_addr: Option<SocketAddr>,
    writes: Mutex<Vec<Bytes>>,
    full: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `addr` as the peer.
    pub fn with_remote_addr(addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(addr),
            ..Self::default()
        }
    }

    /// Frames written so far, in order.
    pub fn writes(&self) -> Vec<Bytes> {
        self.lock().clone()
    }

    /// Frames written so far, clearing the record.
    pub fn take_writes(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.lock())
    }

    /// While set, `write` reports `Backpressure` the way a transport with a
    /// full outbound queue does.
    pub fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::Release);
    }

    /// How many times `close` actually closed the transport.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Bytes>> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcwireError::ConnectionClosed);
        }
        let mut writes = self.lock();
        if self.full.load(Ordering::Acquire) {
            return Err(RpcwireError::Backpressure {
                pending: writes.len(),
            });
        }
        writes.push(frame);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_count.fetch_add(1, Ordering::AcqRel);
        }
    }
}
