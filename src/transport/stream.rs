//! Tokio transport: dedicated writer task plus async read loop.
//!
//! Responses are produced on handler tasks, SASL replies on the read loop.
//! Both hand finished frames to a bounded mpsc channel; one writer task per
//! connection drains it, batching ready frames into a single `write_vectored`.
//!
//! ```text
//! read loop ──┐
//! call 1    ──┼─► mpsc::Sender<Bytes> ─► writer task ─► socket write half
//! call N    ──┘
//! ```
//!
//! `write` never waits: a full queue is reported as `Backpressure`. A frame
//! that could not be queued is lost, so the connection closes on it. `close` lets the writer flush what is already
//! queued, then shuts the write half down and stops the read loop.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::Transport;
use crate::connection::ConnectionEngine;
use crate::error::{Result, RpcwireError};
use crate::protocol::FrameDecoder;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Async transport over any `AsyncWrite`.
pub struct TokioTransport {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    open: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    remote_addr: Option<SocketAddr>,
}

impl TokioTransport {
    /// Spawn the writer task for `writer` and return the transport.
    ///
    /// The join handle resolves when the writer has flushed and shut down,
    /// either after `close` or after a write error.
    pub fn spawn<W>(
        writer: W,
        remote_addr: Option<SocketAddr>,
        config: WriterConfig,
    ) -> (Arc<Self>, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(writer_loop(
            rx,
            writer,
            pending.clone(),
            open.clone(),
            shutdown_rx,
        ));

        let transport = Arc::new(Self {
            tx,
            pending,
            max_pending: config.max_pending_frames,
            open,
            shutdown,
            remote_addr,
        });
        (transport, task)
    }

    /// Receiver that changes to `true` when the transport closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }
}

impl Transport for TokioTransport {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RpcwireError::ConnectionClosed);
        }

        let current = self.pending.load(Ordering::Acquire);
        if current >= self.max_pending {
            return Err(RpcwireError::Backpressure { pending: current });
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            let pending = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
            match e {
                mpsc::error::TrySendError::Full(_) => RpcwireError::Backpressure { pending },
                mpsc::error::TrySendError::Closed(_) => RpcwireError::ConnectionClosed,
            }
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.shutdown.send_replace(true);
        }
    }
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = flush_batch(&mut writer, &mut batch, &pending).await {
            open.store(false, Ordering::Release);
            return Err(e);
        }
    }

    // Closing: whatever was queued before close still goes out.
    rx.close();
    while let Some(frame) = rx.recv().await {
        batch.push(frame);
        if batch.len() == MAX_BATCH_SIZE {
            flush_batch(&mut writer, &mut batch, &pending).await?;
        }
    }
    flush_batch(&mut writer, &mut batch, &pending).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn flush_batch<W>(
    writer: &mut W,
    batch: &mut Vec<Bytes>,
    pending: &AtomicUsize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let count = batch.len();
    let result = write_batch(writer, batch).await;
    batch.clear();
    pending.fetch_sub(count, Ordering::AcqRel);
    result
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}

/// Read loop: split `reader` into units and feed them to `engine`.
///
/// Returns when the peer disconnects, the transport is closed, or a fatal
/// error occurs. The connection is closed on every exit path.
pub async fn drive<R>(
    mut reader: R,
    mut engine: ConnectionEngine,
    mut decoder: FrameDecoder,
    mut closed: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let conn = engine.connection().id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let result = loop {
        if !engine.is_open() {
            break Ok(());
        }

        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(%conn, "peer closed connection");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(RpcwireError::Io(e)),
            },
            _ = closed.changed() => break Ok(()),
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

/// Hand decoded units to the engine in order.
///
/// Units left over after a fatal error are dropped, which releases them.
pub(crate) fn feed(
    engine: &mut ConnectionEngine,
    units: Vec<crate::protocol::FrameBuffer>,
) -> Result<()> {
    for unit in units {
        let unit = engine.reservoir().attach(unit);
        match engine.process(unit) {
            Ok(outcome) => {
                tracing::trace!(conn = %engine.connection().id(), ?outcome, "unit processed");
            }
            Err(e) if !e.is_connection_fatal() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
