//! Codec module - the message schema boundary.
//!
//! - [`MsgPackCodec`] - MessagePack helper using `rmp-serde` (`to_vec_named`)
//! - [`RpcCodec`] - trait the engine uses to decode headers and call frames
//!   and to encode responses
//! - [`MsgPackRpcCodec`] - default `RpcCodec`
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use rpcwire_server::codec::{CallResponse, MsgPackRpcCodec, RpcCodec};
//!
//! let codec = MsgPackRpcCodec::new();
//! let body = codec.encode_response(&CallResponse::ok(1, Bytes::from_static(b"pong"))).unwrap();
//! let (header, result, _) = codec.decode_response(body).unwrap();
//! assert_eq!(header.call_id, 1);
//! assert_eq!(result.as_deref(), Some(&b"pong"[..]));
//! ```

mod msgpack;
mod rpc;

pub use msgpack::MsgPackCodec;
pub use rpc::{
    CallFrameError, CallResponse, ConnectionPreamble, DecodedCall, MsgPackRpcCodec, RpcCodec,
};
