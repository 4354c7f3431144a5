//! Protocol module - wire format, framing, and header messages.
//!
//! This module implements the binary protocol spoken on a connection:
//! - Preamble and length-prefix encoding/decoding
//! - Frame decoder that splits the byte stream into inbound units
//! - Zero-copy frame buffer over one or more regions
//! - Serde header messages

mod frame;
mod frame_buffer;
mod frame_decoder;
pub mod messages;
mod wire_format;

pub use frame::{build_frame, build_preamble, SaslReply};
pub use frame_buffer::FrameBuffer;
pub use frame_decoder::FrameDecoder;
pub use wire_format::{
    decode_length, sasl_status, validate_length, AuthMethod, Preamble, CURRENT_VERSION,
    DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, MAGIC, MAX_CONNECTION_HEADER_SIZE, PREAMBLE_SIZE,
};
