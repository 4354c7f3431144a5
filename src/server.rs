//! Server builder and per-connection serving.
//!
//! The [`ServerBuilder`] provides a fluent API for registering handlers and
//! tuning limits. The [`RpcServer`] it builds serves one already-accepted
//! connection at a time per call to `serve*`; accepting is left to the caller.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire_server::RpcServer;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = std::sync::Arc::new(
//!         RpcServer::builder()
//!             .handle("Kv", "echo", |data: String, _ctx| async move { Ok(data) })
//!             .max_concurrent_calls(64)
//!             .build(),
//!     );
//!
//!     let listener = TcpListener::bind("127.0.0.1:16020").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let server = server.clone();
//!         tokio::spawn(async move { server.serve_tcp(stream).await });
//!     }
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;

use crate::codec::{MsgPackRpcCodec, RpcCodec};
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionEngine};
use crate::error::Result;
use crate::executor::{
    CallContext, CallExecutor, HandlerError, HandlerExecutor, HandlerRegistry, HandlerResult,
};
use crate::protocol::FrameDecoder;
use crate::reservoir::{Reservoir, ReservoirConfig};
use crate::security::{SaslServerFactory, SecurityConfig, SecurityLayer};
use crate::service::ServiceRegistry;
use crate::transport::{drive, drive_blocking, BlockingTransport, TokioTransport, Transport, WriterConfig};

/// Builder for configuring and creating an [`RpcServer`].
pub struct ServerBuilder {
    registry: HandlerRegistry,
    custom: Option<(Arc<dyn CallExecutor>, ServiceRegistry)>,
    config: EngineConfig,
    writer_config: WriterConfig,
    sasl: Option<Arc<dyn SaslServerFactory>>,
    codec: Arc<dyn RpcCodec>,
    runtime: Option<Handle>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            custom: None,
            config: EngineConfig::default(),
            writer_config: WriterConfig::default(),
            sasl: None,
            codec: Arc::new(MsgPackRpcCodec::new()),
            runtime: None,
        }
    }

    /// Register a typed handler for `service`.`method`.
    ///
    /// The param is decoded from MsgPack into `T`; the returned `R` is encoded
    /// back as the result.
    pub fn handle<F, T, R, Fut>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.registry.register(service, method, handler);
        self
    }

    /// Register a handler over raw param and result bytes.
    pub fn handle_raw<F, Fut>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register_raw(service, method, handler);
        self
    }

    /// Replace the handler executor with `executor` serving `services`.
    ///
    /// Handlers registered with [`handle`](Self::handle) are then ignored.
    pub fn executor(mut self, executor: impl CallExecutor, services: ServiceRegistry) -> Self {
        self.custom = Some((Arc::new(executor), services));
        self
    }

    /// Enable SASL with mechanisms from `factory`.
    pub fn sasl(mut self, factory: impl SaslServerFactory) -> Self {
        self.sasl = Some(Arc::new(factory));
        self
    }

    /// Set the authentication policy.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    /// Reject SIMPLE clients.
    pub fn require_sasl(mut self, require: bool) -> Self {
        self.config.security.require_sasl = require;
        self
    }

    /// Set the maximum accepted frame body size.
    pub fn max_frame_size(mut self, max: u32) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Set maximum concurrent handlers.
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit;
        self
    }

    /// Set maximum pending outbound frames per connection.
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set writer channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Configure the shared buffer budget.
    pub fn reservoir(mut self, reservoir: ReservoirConfig) -> Self {
        self.config.reservoir = reservoir;
        self
    }

    /// Take all engine settings from `config` (e.g. loaded from JSON).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different message codec.
    pub fn codec(mut self, codec: impl RpcCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Run handlers on `runtime`. Needed when serving from plain threads.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the server.
    pub fn build(self) -> RpcServer {
        let (executor, services) = match self.custom {
            Some((executor, services)) => (executor, services),
            None => {
                let services = self.registry.build_services();
                let mut executor =
                    HandlerExecutor::new(self.registry, self.config.max_concurrent_calls);
                if let Some(runtime) = self.runtime {
                    executor = executor.with_runtime(runtime);
                }
                (Arc::new(executor) as Arc<dyn CallExecutor>, services)
            }
        };

        RpcServer {
            services: Arc::new(services),
            executor,
            reservoir: Reservoir::new(self.config.reservoir),
            config: self.config,
            writer_config: self.writer_config,
            sasl: self.sasl,
            codec: self.codec,
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves connections with one shared set of services, executor and reservoir.
pub struct RpcServer {
    services: Arc<ServiceRegistry>,
    executor: Arc<dyn CallExecutor>,
    reservoir: Reservoir,
    config: EngineConfig,
    writer_config: WriterConfig,
    sasl: Option<Arc<dyn SaslServerFactory>>,
    codec: Arc<dyn RpcCodec>,
}

impl RpcServer {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the engine for a connection over `transport`.
    ///
    /// For callers that bring their own transport and read loop.
    pub fn engine(&self, transport: Arc<dyn Transport>) -> ConnectionEngine {
        let security = SecurityLayer::new(self.sasl.clone(), self.config.security);
        let connection = Arc::new(Connection::new(transport, security, self.codec.clone()));
        tracing::debug!(
            conn = %connection.id(),
            host = connection.host_address(),
            "connection accepted"
        );
        ConnectionEngine::new(
            connection,
            self.services.clone(),
            self.executor.clone(),
            self.reservoir.clone(),
        )
    }

    /// Frame decoder honoring the configured size limit.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::with_max_frame_size(self.config.max_frame_size)
    }

    /// Serve one connection over any async stream until it closes.
    pub async fn serve<S>(&self, stream: S, remote_addr: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.serve_split(reader, writer, remote_addr).await
    }

    /// Serve one accepted TCP connection until it closes.
    pub async fn serve_tcp(&self, stream: tokio::net::TcpStream) -> Result<()> {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        self.serve_split(reader, writer, remote_addr).await
    }

    async fn serve_split<R, W>(
        &self,
        reader: R,
        writer: W,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, writer_task) =
            TokioTransport::spawn(writer, remote_addr, self.writer_config.clone());
        let closed = transport.closed();
        let engine = self.engine(transport);

        let result = drive(reader, engine, self.decoder(), closed).await;

        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Writer stopped with error: {}", e),
            Err(e) => tracing::warn!("Writer task failed: {}", e),
        }
        result
    }

    /// Serve one accepted TCP connection on the current thread.
    ///
    /// Handlers still run on tokio; see [`ServerBuilder::runtime`].
    pub fn serve_blocking(&self, stream: std::net::TcpStream) -> Result<()> {
        let reader = stream.try_clone()?;
        let transport = Arc::new(BlockingTransport::new(stream)?);
        drive_blocking(reader, self.engine(transport), self.decoder())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ChannelExecutor;
    use crate::service::ServiceDescriptor;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_builder_default() {
        let server = ServerBuilder::default().build();
        assert!(server.services().is_empty());
        assert_eq!(server.config(), &EngineConfig::default());
    }

    #[test]
    fn test_builder_registers_services() {
        let server = RpcServer::builder()
            .handle("Kv", "get", |_: String, _ctx| async { Ok(()) })
            .handle_raw("Kv", "put", |data, _ctx| async move { Ok(data) })
            .handle("Admin", "ping", |_: (), _ctx| async { Ok("pong") })
            .build();

        let kv = server.services().get("Kv").unwrap();
        assert!(kv.method("get").is_some());
        assert!(kv.method("put").is_some());
        assert!(server.services().get("Admin").is_some());
    }

    #[test]
    fn test_builder_configuration() {
        let server = RpcServer::builder()
            .max_concurrent_calls(512)
            .max_frame_size(4096)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .require_sasl(true)
            .reservoir(ReservoirConfig {
                capacity_bytes: 1 << 20,
                min_pooled_size: 1024,
            })
            .build();

        assert_eq!(server.config().max_concurrent_calls, 512);
        assert_eq!(server.config().max_frame_size, 4096);
        assert!(server.config().security.require_sasl);
        assert_eq!(server.writer_config.max_pending_frames, 2048);
        assert_eq!(server.writer_config.channel_capacity, 512);
        assert_eq!(server.reservoir().available(), 1 << 20);
    }

    #[test]
    fn test_custom_executor() {
        let (executor, _rx) = ChannelExecutor::new(4);
        let mut services = ServiceRegistry::new();
        services.register(ServiceDescriptor::new("Queue").with_method("push"));

        let server = RpcServer::builder()
            .handle("Ignored", "m", |_: (), _ctx| async { Ok(()) })
            .executor(executor, services)
            .build();

        assert!(server.services().get("Queue").is_some());
        assert!(server.services().get("Ignored").is_none());
    }

    #[test]
    fn test_engine_over_custom_transport() {
        let server = RpcServer::builder().build();
        let engine = server.engine(Arc::new(MemoryTransport::new()));
        assert!(engine.is_open());
        assert!(!engine.is_connection_header_read());
    }
}
