//! # rpcwire-server
//!
//! Per-connection protocol engine for a framed, SASL-capable RPC server.
//!
//! A client opens a connection with a preamble and a connection header naming
//! the service it will call. An optional SASL exchange follows; after it, every
//! frame is a call. Each call is decoded, bound to its connection, handed to an
//! executor, and answered through the same connection, wrapped by the SASL
//! session when it protects traffic.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): wire format, [`FrameBuffer`] zero-copy
//!   cursor, stream splitting
//! - **Engine** ([`connection`]): [`ConnectionEngine`] read-side state machine
//!   over a shared [`Connection`]
//! - **Security** ([`security`]): SASL state machine, PLAIN mechanism
//! - **Calls** ([`call`], [`executor`]): [`InFlightCall`] with its
//!   [`CallCleanup`], and the executors that run them
//! - **Transports** ([`transport`]): tokio writer task, blocking socket, memory
//!
//! ## Example
//!
//! ```ignore
//! use rpcwire_server::RpcServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RpcServer::builder()
//!         .handle("Kv", "echo", |data: String, _ctx| async move { Ok(data) })
//!         .build();
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:16020").await?;
//!     let (stream, _) = listener.accept().await?;
//!     server.serve_tcp(stream).await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod reservoir;
pub mod security;
pub mod service;
pub mod transport;

mod server;

pub use call::{CallCleanup, InFlightCall};
pub use config::EngineConfig;
pub use connection::{Connection, ConnectionEngine, Processed};
pub use error::{Result, RpcwireError};
pub use executor::{CallContext, CallExecutor, HandlerError};
pub use protocol::FrameBuffer;
pub use server::{RpcServer, ServerBuilder};
