//! Outbound frame builders.
//!
//! Everything the server writes is a length-prefixed frame, except SASL
//! replies, which use the raw status layout the client's handshake reader
//! expects.
//!
//! # Example
//!
//! ```
//! use rpcwire_server::protocol::build_frame;
//!
//! let bytes = build_frame(b"hello");
//! assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
//! assert_eq!(&bytes[4..], b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{sasl_status, Preamble, LENGTH_PREFIX_SIZE, PREAMBLE_SIZE};

/// Build a length-prefixed frame as one contiguous buffer.
pub fn build_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Build the preamble unit: preamble, header length, header bytes.
pub fn build_preamble(preamble: &Preamble, header: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREAMBLE_SIZE + LENGTH_PREFIX_SIZE + header.len());
    buf.extend_from_slice(&preamble.encode());
    buf.put_u32(header.len() as u32);
    buf.extend_from_slice(header);
    buf.freeze()
}

/// A reply written during the SASL handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslReply {
    /// Step accepted; carries the server challenge (may be empty).
    Success(Bytes),
    /// Handshake failed.
    Error {
        exception_class: String,
        message: String,
    },
    /// Client asked for SASL but the server runs SIMPLE auth.
    SwitchToSimple,
}

impl SaslReply {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            SaslReply::Success(token) => {
                buf.put_i32(sasl_status::SUCCESS);
                buf.put_u32(token.len() as u32);
                buf.extend_from_slice(token);
            }
            SaslReply::Error {
                exception_class,
                message,
            } => {
                buf.put_i32(sasl_status::ERROR);
                put_string(&mut buf, exception_class);
                put_string(&mut buf, message);
            }
            SaslReply::SwitchToSimple => {
                buf.put_i32(sasl_status::SUCCESS);
                buf.put_i32(sasl_status::SWITCH_TO_SIMPLE_AUTH);
            }
        }
        buf.freeze()
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}
