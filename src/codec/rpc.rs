//! Decode/encode boundary between frames and typed calls.
//!
//! The engine never parses message schemas itself. It hands the connection
//! header unit and each (already unwrapped) call frame body to an [`RpcCodec`],
//! and gets back typed values. [`MsgPackRpcCodec`] is the default; it lays out
//! call and response bodies as described in [`crate::protocol`].
//!
//! # Call frame body
//!
//! ```text
//! u32 header_len | RequestHeader
//! [ u32 param_len | param ]      present iff header.request_param
//! [ cell block ]                 header.cell_block_meta.length bytes
//! ```
//!
//! # Response frame body
//!
//! ```text
//! u32 header_len | ResponseHeader
//! [ u32 result_len | result ]    present iff no exception
//! [ cell block ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::MsgPackCodec;
use crate::error::{Result, RpcwireError};
use crate::protocol::messages::{
    CellBlockMeta, ConnectionHeader, ExceptionResponse, RequestHeader, ResponseHeader,
    UserInformation,
};
use crate::protocol::{build_frame, build_preamble, AuthMethod, FrameBuffer, Preamble};
use crate::protocol::{LENGTH_PREFIX_SIZE, PREAMBLE_SIZE};

/// Decoded preamble plus connection header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPreamble {
    /// Protocol version byte from the preamble.
    pub version: u8,
    /// Authentication method the client asked for.
    pub auth_method: AuthMethod,
    /// Service targeted by every call on the connection.
    pub service_name: String,
    pub user_info: Option<UserInformation>,
    pub cell_block_codec: Option<String>,
    pub cell_block_compressor: Option<String>,
}

impl ConnectionPreamble {
    /// Effective user claimed in the header, if any.
    pub fn effective_user(&self) -> Option<&str> {
        self.user_info.as_ref().map(|u| u.effective_user.as_str())
    }
}

/// One call frame split into its parts.
#[derive(Debug)]
pub struct DecodedCall {
    pub header: RequestHeader,
    /// Request param bytes; empty when the header says there is none.
    pub param: Bytes,
    /// Cell block, still backed by the frame's regions.
    pub cell_block: Option<FrameBuffer>,
    /// Size of the whole frame body in bytes.
    pub size: usize,
}

/// Why a call frame could not become a call.
#[derive(Debug, Error)]
pub enum CallFrameError {
    /// The request header itself is unreadable; there is no call id to answer.
    #[error("undecodable call frame: {0}")]
    Unaddressable(#[source] RpcwireError),

    /// The header decoded but the call cannot run; answer it with `exception`.
    #[error("call {call_id} rejected: {}", .exception.message)]
    Call {
        call_id: u32,
        exception: ExceptionResponse,
    },
}

/// Outcome of a call, ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub call_id: u32,
    pub result: std::result::Result<Bytes, ExceptionResponse>,
    pub cell_block: Option<Bytes>,
}

impl CallResponse {
    /// Successful response carrying `result`.
    pub fn ok(call_id: u32, result: Bytes) -> Self {
        Self {
            call_id,
            result: Ok(result),
            cell_block: None,
        }
    }

    /// Failed response.
    pub fn error(call_id: u32, exception: ExceptionResponse) -> Self {
        Self {
            call_id,
            result: Err(exception),
            cell_block: None,
        }
    }

    /// Attach a cell block after the result.
    pub fn with_cell_block(mut self, cell_block: Bytes) -> Self {
        self.cell_block = Some(cell_block);
        self
    }
}

/// Message schema seam used by the connection engine.
pub trait RpcCodec: Send + Sync + 'static {
    /// Decode the first inbound unit (preamble, length, header).
    fn decode_connection_header(&self, unit: &[u8]) -> Result<ConnectionPreamble>;

    /// Decode one call frame body.
    fn decode_call_frame(
        &self,
        frame: FrameBuffer,
    ) -> std::result::Result<DecodedCall, CallFrameError>;

    /// Encode a response body (without the outer length prefix).
    fn encode_response(&self, response: &CallResponse) -> Result<Bytes>;
}

/// Default codec: MsgPack headers, raw param/result bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackRpcCodec;

impl MsgPackRpcCodec {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }

    /// Client side: encode the preamble unit for `header`.
    pub fn encode_connection_preamble(
        &self,
        auth: AuthMethod,
        header: &ConnectionHeader,
    ) -> Result<Bytes> {
        let encoded = MsgPackCodec::encode(header)?;
        Ok(build_preamble(&Preamble::new(auth), &encoded))
    }

    /// Client side: encode a complete call frame, length prefix included.
    ///
    /// `request_param` and `cell_block_meta` in `header` are overwritten to
    /// match the supplied parts.
    pub fn encode_call(
        &self,
        header: &RequestHeader,
        param: Option<&[u8]>,
        cell_block: Option<&[u8]>,
    ) -> Result<Bytes> {
        let mut header = header.clone();
        header.request_param = param.is_some();
        header.cell_block_meta = cell_block.map(|c| CellBlockMeta {
            length: c.len() as u32,
        });
        let header_bytes = MsgPackCodec::encode(&header)?;

        let mut body = BytesMut::new();
        put_delimited(&mut body, &header_bytes);
        if let Some(param) = param {
            put_delimited(&mut body, param);
        }
        if let Some(cell_block) = cell_block {
            body.extend_from_slice(cell_block);
        }
        Ok(build_frame(&body))
    }

    /// Client side: split a response frame body into header, result and cell block.
    pub fn decode_response(
        &self,
        body: Bytes,
    ) -> Result<(ResponseHeader, Option<Bytes>, Option<Bytes>)> {
        let mut buf = FrameBuffer::single(body);
        let header_len = buf.read_u32()? as usize;
        let header: ResponseHeader = MsgPackCodec::decode(&buf.read_bytes(header_len)?)?;
        let result = if header.exception.is_none() {
            let len = buf.read_u32()? as usize;
            Some(buf.read_bytes(len)?)
        } else {
            None
        };
        let cell_block = match header.cell_block_meta {
            Some(meta) => Some(buf.read_bytes(meta.length as usize)?),
            None => None,
        };
        Ok((header, result, cell_block))
    }
}

impl RpcCodec for MsgPackRpcCodec {
    fn decode_connection_header(&self, unit: &[u8]) -> Result<ConnectionPreamble> {
        let preamble = Preamble::decode(unit)?;
        let body = &unit[PREAMBLE_SIZE..];
        if body.len() < LENGTH_PREFIX_SIZE {
            return Err(RpcwireError::Protocol(
                "Connection header length missing".to_string(),
            ));
        }
        let declared = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let header_bytes = &body[LENGTH_PREFIX_SIZE..];
        if header_bytes.len() != declared {
            return Err(RpcwireError::Protocol(format!(
                "Connection header length {} does not match {} bytes received",
                declared,
                header_bytes.len()
            )));
        }
        let header: ConnectionHeader = MsgPackCodec::decode(header_bytes)?;
        Ok(ConnectionPreamble {
            version: preamble.version,
            auth_method: preamble.auth,
            service_name: header.service_name,
            user_info: header.user_info,
            cell_block_codec: header.cell_block_codec,
            cell_block_compressor: header.cell_block_compressor,
        })
    }

    fn decode_call_frame(
        &self,
        mut frame: FrameBuffer,
    ) -> std::result::Result<DecodedCall, CallFrameError> {
        let size = frame.remaining();
        let header_len = frame.read_u32().map_err(CallFrameError::Unaddressable)? as usize;
        let header_bytes = frame
            .read_bytes(header_len)
            .map_err(CallFrameError::Unaddressable)?;
        let header: RequestHeader =
            MsgPackCodec::decode(&header_bytes).map_err(CallFrameError::Unaddressable)?;

        let call_id = header.call_id;
        let reject = move |e: RpcwireError| CallFrameError::Call {
            call_id,
            exception: ExceptionResponse::bad_request(e.to_string()),
        };

        let param = if header.request_param {
            let len = frame.read_u32().map_err(reject)? as usize;
            frame.read_bytes(len).map_err(reject)?
        } else {
            Bytes::new()
        };

        let cell_block = match header.cell_block_meta {
            Some(meta) => Some(frame.split_to(meta.length as usize).map_err(reject)?),
            None => None,
        };

        if frame.has_remaining() {
            return Err(reject(RpcwireError::Protocol(format!(
                "{} unexpected trailing bytes in call frame",
                frame.remaining()
            ))));
        }

        Ok(DecodedCall {
            header,
            param,
            cell_block,
            size,
        })
    }

    fn encode_response(&self, response: &CallResponse) -> Result<Bytes> {
        let (exception, result) = match &response.result {
            Ok(result) => (None, Some(result)),
            Err(exception) => (Some(exception.clone()), None),
        };
        let header = ResponseHeader {
            call_id: response.call_id,
            exception,
            cell_block_meta: response.cell_block.as_ref().map(|c| CellBlockMeta {
                length: c.len() as u32,
            }),
        };
        let header_bytes = MsgPackCodec::encode(&header)?;

        let mut body = BytesMut::with_capacity(
            LENGTH_PREFIX_SIZE * 2
                + header_bytes.len()
                + result.map_or(0, Bytes::len)
                + response.cell_block.as_ref().map_or(0, Bytes::len),
        );
        put_delimited(&mut body, &header_bytes);
        if let Some(result) = result {
            put_delimited(&mut body, result);
        }
        if let Some(cell_block) = &response.cell_block {
            body.extend_from_slice(cell_block);
        }
        Ok(body.freeze())
    }
}

fn put_delimited(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
}
