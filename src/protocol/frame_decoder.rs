//! Splits a connection's byte stream into inbound units.
//!
//! Uses `bytes::BytesMut` for buffer management and a state machine for
//! fragmented input:
//! - `WaitingForPreamble`: need the 6-byte preamble plus the 4-byte header length
//! - `WaitingForHeader`: preamble parsed, need the rest of the connection header
//! - `WaitingForLength`: need a 4-byte frame length
//! - `WaitingForBody`: length parsed, need N more body bytes
//!
//! The first unit produced is the whole preamble + connection header. Every
//! later unit is one frame body with its length prefix stripped. A body that
//! arrives over several pushes is emitted as a multi-region [`FrameBuffer`]
//! made of the pieces as they arrived, so large payloads are never re-copied
//! into one contiguous allocation.

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    decode_length, validate_length, Preamble, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
    MAX_CONNECTION_HEADER_SIZE, PREAMBLE_SIZE,
};
use super::FrameBuffer;
use crate::error::Result;

/// State machine for unit parsing.
#[derive(Debug)]
enum State {
    /// Nothing read yet on this connection.
    WaitingForPreamble,
    /// Preamble validated; `total` is preamble + length + header size.
    WaitingForHeader { total: usize },
    /// Between frames.
    WaitingForLength,
    /// Frame length parsed, collecting body regions.
    WaitingForBody { remaining: usize, parts: Vec<Bytes> },
}

/// Buffer that accumulates socket reads and extracts complete units.
pub struct FrameDecoder {
    /// Accumulated bytes not yet assigned to a unit.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame body size.
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder expecting a preamble first, with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPreamble,
            max_frame_size,
        }
    }

    /// Push data into the decoder and extract all complete units.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on a bad preamble or an oversized length prefix. Both
    /// are fatal for the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<FrameBuffer>> {
        self.buffer.extend_from_slice(data);

        let mut units = Vec::new();
        while let Some(unit) = self.try_extract_one()? {
            units.push(unit);
        }
        Ok(units)
    }

    /// Try to extract a single unit.
    fn try_extract_one(&mut self) -> Result<Option<FrameBuffer>> {
        loop {
            match &mut self.state {
                State::WaitingForPreamble => {
                    if self.buffer.len() < PREAMBLE_SIZE + LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }
                    Preamble::decode(&self.buffer[..PREAMBLE_SIZE])?;
                    let header_len = decode_length(&self.buffer[PREAMBLE_SIZE..]).unwrap_or(0);
                    validate_length(header_len, MAX_CONNECTION_HEADER_SIZE)?;
                    self.state = State::WaitingForHeader {
                        total: PREAMBLE_SIZE + LENGTH_PREFIX_SIZE + header_len as usize,
                    };
                }

                State::WaitingForHeader { total } => {
                    let total = *total;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }
                    let unit = self.buffer.split_to(total).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(FrameBuffer::single(unit)));
                }

                State::WaitingForLength => {
                    let Some(len) = decode_length(&self.buffer) else {
                        return Ok(None);
                    };
                    validate_length(len, self.max_frame_size)?;
                    let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);

                    if len == 0 {
                        // Zero-length frames are keepalive pings.
                        tracing::trace!("skipping empty frame");
                        continue;
                    }
                    self.state = State::WaitingForBody {
                        remaining: len as usize,
                        parts: Vec::new(),
                    };
                }

                State::WaitingForBody { remaining, parts } => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining).min(self.buffer.len());
                    parts.push(self.buffer.split_to(take).freeze());
                    *remaining -= take;

                    if *remaining > 0 {
                        return Ok(None);
                    }
                    let parts = std::mem::take(parts);
                    self.state = State::WaitingForLength;
                    return Ok(Some(FrameBuffer::from_regions(parts)));
                }
            }
        }
    }

    /// Get the number of buffered bytes not yet assigned to a unit.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no unassigned bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether the preamble and connection header have been consumed.
    pub fn preamble_done(&self) -> bool {
        !matches!(
            self.state,
            State::WaitingForPreamble | State::WaitingForHeader { .. }
        )
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPreamble => "WaitingForPreamble",
            State::WaitingForHeader { .. } => "WaitingForHeader",
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
