//! Handler registry keyed by service and method name.
//!
//! # Example
//!
//! ```
//! use rpcwire_server::executor::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("Kv", "echo", |data: String, _ctx| async move { Ok(data) });
//!
//! let services = registry.build_services();
//! assert!(services.get("Kv").unwrap().method("echo").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::CallContext;
use crate::codec::MsgPackCodec;
use crate::error::RpcwireError;
use crate::protocol::messages::ExceptionResponse;
use crate::service::ServiceRegistry;

/// Why a handler did not produce a result.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Param could not be decoded.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Handler-chosen exception, sent as is.
    #[error("{}: {}", .0.exception_class_name, .0.message)]
    Exception(ExceptionResponse),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] RpcwireError),
}

impl HandlerError {
    /// Convert to what the client sees.
    pub fn into_exception(self) -> ExceptionResponse {
        match self {
            HandlerError::BadRequest(message) => ExceptionResponse::bad_request(message),
            HandlerError::Exception(exception) => exception,
            HandlerError::Internal(e) => {
                ExceptionResponse::new(ExceptionResponse::SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<ExceptionResponse> for HandlerError {
    fn from(exception: ExceptionResponse) -> Self {
        HandlerError::Exception(exception)
    }
}

/// Result type for handler functions: encoded result bytes.
pub type HandlerResult = std::result::Result<Bytes, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with raw param bytes.
    fn call(&self, param: &Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the param and encodes the result with MsgPack.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
{
    fn call(&self, param: &Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match MsgPackCodec::decode(param) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move { Err(HandlerError::BadRequest(e.to_string())) })
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await?;
            MsgPackCodec::encode_bytes(&value).map_err(HandlerError::from)
        })
    }
}

/// Handler over raw param and result bytes.
struct RawHandler<F> {
    handler: F,
}

impl<F, Fut> Handler for RawHandler<F>
where
    F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, param: &Bytes, ctx: CallContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(param.clone(), ctx))
    }
}

/// Registry mapping service and method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<String, HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed method handler.
    ///
    /// # Arguments
    ///
    /// * `service` - Service name from the connection header
    /// * `method` - Method name from the request header
    /// * `handler` - Takes (T, CallContext) and returns the result value
    pub fn register<F, T, R, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.insert(service, method, Arc::new(TypedHandler::new(handler)));
    }

    /// Register a handler that works on raw bytes.
    pub fn register_raw<F, Fut>(&mut self, service: &str, method: &str, handler: F)
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(service, method, Arc::new(RawHandler { handler }));
    }

    fn insert(&mut self, service: &str, method: &str, handler: Arc<dyn Handler>) {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), handler);
    }

    /// Get a handler.
    pub fn get(&self, service: &str, method: &str) -> Option<Arc<dyn Handler>> {
        self.services.get(service)?.get(method).cloned()
    }

    /// Build the service descriptors the engine resolves calls against.
    pub fn build_services(&self) -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        for (service, methods) in &self.services {
            for method in methods.keys() {
                registry.add_method(service, method);
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register("Kv", "echo", |data: String, _ctx| async move { Ok(data) });

        assert!(registry.get("Kv", "echo").is_some());
        assert!(registry.get("Kv", "missing").is_none());
        assert!(registry.get("Other", "echo").is_none());
    }

    #[test]
    fn test_build_services() {
        let mut registry = HandlerRegistry::new();
        registry.register("Kv", "get", |_: String, _ctx| async { Ok(()) });
        registry.register("Kv", "put", |_: (String, String), _ctx| async { Ok(()) });
        registry.register_raw("Admin", "ping", |data, _ctx| async move { Ok(data) });

        let services = registry.build_services();

        assert_eq!(services.len(), 2);
        assert!(services.get("Kv").unwrap().method("put").is_some());
        assert!(services.get("Admin").unwrap().method("ping").is_some());
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let handler = TypedHandler::new(|n: u32, _ctx| async move { Ok(n * 2) });
        let param = MsgPackCodec::encode_bytes(&21u32).unwrap();

        let out = handler.call(&param, CallContext::detached(1)).await.unwrap();

        let value: u32 = MsgPackCodec::decode(&out).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_typed_handler_bad_param() {
        let handler = TypedHandler::new(|n: u32, _ctx| async move { Ok(n) });
        let err = handler
            .call(&Bytes::from_static(b"\xc1"), CallContext::detached(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::BadRequest(_)));
        assert_eq!(
            err.into_exception().exception_class_name,
            ExceptionResponse::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_handler_exception_passes_through() {
        let handler = TypedHandler::new(|_: (), _ctx| async move {
            Err::<(), _>(ExceptionResponse::new("RegionMovedException", "moved").into())
        });
        let param = MsgPackCodec::encode_bytes(&()).unwrap();

        let err = handler.call(&param, CallContext::detached(1)).await.unwrap_err();

        let exception = err.into_exception();
        assert_eq!(exception.exception_class_name, "RegionMovedException");
        assert_eq!(exception.message, "moved");
    }
}
