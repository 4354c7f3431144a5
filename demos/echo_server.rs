//! Echo Server - accepts TCP connections and serves an echo service.
//!
//! This demo shows:
//! - Building an `RpcServer` with typed handlers
//! - Enabling PLAIN SASL with an in-memory user table
//! - Serving each accepted connection on its own task
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:16020
//! ```

use std::sync::Arc;

use rpcwire_server::security::{InMemoryAuthenticator, PlainServerFactory};
use rpcwire_server::{CallContext, RpcServer};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Input structure for the echo method.
#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo method.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
    user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:16020".to_string());

    let server = Arc::new(
        RpcServer::builder()
            .handle("Echo", "echo", |data: EchoInput, ctx: CallContext| async move {
                Ok(EchoOutput {
                    echo: data.message,
                    user: ctx.user().map(str::to_string),
                })
            })
            .handle_raw("Echo", "ping", |param, _ctx| async move { Ok(param) })
            .sasl(PlainServerFactory::new(
                InMemoryAuthenticator::new().user("demo", "demo"),
            ))
            .max_concurrent_calls(64)
            .build(),
    );

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_tcp(stream).await {
                tracing::warn!(%peer, "connection ended: {}", e);
            }
        });
    }
}
