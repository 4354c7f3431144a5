//! Read-side connection state machine.
//!
//! [`ConnectionEngine::process`] takes one inbound unit at a time, in the
//! order the transport produced them:
//!
//! 1. The first unit is the preamble plus connection header. It is copied,
//!    released right away, and never seen again.
//! 2. If the client asked for SASL but the server told it to use SIMPLE, the
//!    client still sends one handshake frame; that frame is skipped.
//! 3. While a SASL exchange is running, frames are handshake tokens.
//! 4. Everything else is a call frame: unwrapped if the session protects
//!    traffic, decoded, and handed to the executor. A protected packet holds
//!    one complete length-prefixed call frame, mirroring responses.
//!
//! The release attached to each post-header unit is parked in
//! `pending_cleanup` while the unit is processed. A call that is produced
//! takes it along; on every other path, including errors, it runs before
//! `process` returns.

use std::sync::Arc;

use bytes::Buf;

use crate::call::{CallCleanup, CallParts, InFlightCall};
use crate::codec::{CallFrameError, CallResponse, ConnectionPreamble};
use crate::error::{Result, RpcwireError};
use crate::executor::{CallExecutor, DispatchRejected};
use crate::protocol::messages::ExceptionResponse;
use crate::protocol::{FrameBuffer, SaslReply, CURRENT_VERSION};
use crate::reservoir::Reservoir;
use crate::security::{HandshakeStart, HandshakeStep, SecurityLayer, SecurityState};
use crate::service::{ServiceDescriptor, ServiceRegistry};

use super::Connection;

/// What one call to [`ConnectionEngine::process`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Connection header consumed.
    ConnectionHeader,
    /// Initial handshake frame of a fallback-to-SIMPLE client dropped.
    Skipped,
    /// SASL token consumed; more to come.
    Handshake,
    /// SASL exchange finished.
    HandshakeComplete,
    /// Call handed to the executor.
    Dispatched { call_id: u32 },
    /// Call answered with an exception without running.
    CallRejected { call_id: u32 },
}

/// Per-connection inbound state.
pub struct ConnectionEngine {
    connection: Arc<Connection>,
    services: Arc<ServiceRegistry>,
    executor: Arc<dyn CallExecutor>,
    reservoir: Reservoir,
    connection_header_read: bool,
    use_sasl: bool,
    skip_initial_handshake_frame: bool,
    pending_cleanup: Option<CallCleanup>,
    preamble: Option<ConnectionPreamble>,
    service: Option<Arc<ServiceDescriptor>>,
    user: Option<String>,
}

impl ConnectionEngine {
    /// Create an engine for a freshly accepted connection.
    pub fn new(
        connection: Arc<Connection>,
        services: Arc<ServiceRegistry>,
        executor: Arc<dyn CallExecutor>,
        reservoir: Reservoir,
    ) -> Self {
        Self {
            connection,
            services,
            executor,
            reservoir,
            connection_header_read: false,
            use_sasl: false,
            skip_initial_handshake_frame: false,
            pending_cleanup: None,
            preamble: None,
            service: None,
            user: None,
        }
    }

    /// Shared half of this connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Buffer budget large units are accounted against.
    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    /// Decoded connection header, once read.
    pub fn preamble(&self) -> Option<&ConnectionPreamble> {
        self.preamble.as_ref()
    }

    /// Service resolved from the connection header.
    pub fn service(&self) -> Option<&Arc<ServiceDescriptor>> {
        self.service.as_ref()
    }

    pub fn is_connection_header_read(&self) -> bool {
        self.connection_header_read
    }

    /// User calls run as: SASL identity, or the header's claim under SIMPLE.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Process one inbound unit.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` after close, and any error that ends the
    /// connection: bad header, unknown service, refused auth, SASL failure,
    /// undecodable call header, failed write. The connection is already
    /// closed when one of these is returned. Call-local problems are
    /// answered on the wire and reported as [`Processed::CallRejected`].
    pub fn process(&mut self, mut chunk: FrameBuffer) -> Result<Processed> {
        if !self.connection.is_open() {
            return Err(RpcwireError::ConnectionClosed);
        }

        let result = if !self.connection_header_read {
            let unit = chunk.to_bytes().to_vec();
            chunk.release();
            self.connection_header_read = true;
            self.process_connection_header(&unit)
        } else {
            self.pending_cleanup = Some(chunk.take_release());
            let result = self.process_frame(chunk);
            if let Some(cleanup) = self.pending_cleanup.take() {
                cleanup.run();
            }
            result
        };

        if let Err(e) = &result {
            if e.is_connection_fatal() {
                tracing::debug!(conn = %self.connection.id(), "closing after error: {}", e);
                self.connection.close();
            }
        }
        result
    }

    fn process_connection_header(&mut self, unit: &[u8]) -> Result<Processed> {
        let connection = Arc::clone(&self.connection);
        let preamble = connection.codec().decode_connection_header(unit)?;

        let service = self
            .services
            .get(&preamble.service_name)
            .ok_or_else(|| RpcwireError::UnknownService(preamble.service_name.clone()))?;

        if preamble.version != CURRENT_VERSION {
            return Err(RpcwireError::UnsupportedVersion(preamble.version));
        }

        let start = connection
            .security()
            .begin_if_requested(&preamble, connection.info())?;
        match start {
            HandshakeStart::NotRequested => {
                self.user = preamble.effective_user().map(str::to_string);
            }
            HandshakeStart::Negotiating => self.use_sasl = true,
            HandshakeStart::FallbackToSimple => {
                self.skip_initial_handshake_frame = true;
                self.user = preamble.effective_user().map(str::to_string);
                connection.write_raw(SaslReply::SwitchToSimple.encode())?;
            }
        }

        tracing::debug!(
            conn = %connection.id(),
            host = connection.host_address(),
            service = service.name(),
            auth = %preamble.auth_method,
            user = preamble.effective_user().unwrap_or(""),
            cell_block_codec = preamble.cell_block_codec.as_deref().unwrap_or(""),
            "connection header read"
        );

        self.service = Some(service);
        self.preamble = Some(preamble);
        Ok(Processed::ConnectionHeader)
    }

    fn process_frame(&mut self, frame: FrameBuffer) -> Result<Processed> {
        if self.skip_initial_handshake_frame {
            self.skip_initial_handshake_frame = false;
            tracing::trace!(conn = %self.connection.id(), "skipping initial SASL frame");
            return Ok(Processed::Skipped);
        }

        if !self.use_sasl {
            return self.process_call(frame);
        }

        let connection = Arc::clone(&self.connection);
        let mut security = connection.security();
        match security.state() {
            SecurityState::Negotiating => {
                let token = frame.to_bytes();
                drop(frame);
                self.handshake(&mut security, &token)
            }
            SecurityState::Established => {
                let wrapping = security.is_wrapping();
                let frame = security.unwrap(frame)?;
                drop(security);
                let frame = if wrapping { unwrapped_call(frame)? } else { frame };
                self.process_call(frame)
            }
            state => Err(RpcwireError::Protocol(format!(
                "Frame received while security layer is {:?}",
                state
            ))),
        }
    }

    fn handshake(&mut self, security: &mut SecurityLayer, token: &[u8]) -> Result<Processed> {
        match security.handshake_step(token) {
            Ok(HandshakeStep::Continue(challenge)) => {
                self.connection
                    .write_raw(SaslReply::Success(challenge).encode())?;
                Ok(Processed::Handshake)
            }
            Ok(HandshakeStep::Complete(final_token)) => {
                if let Some(token) = final_token {
                    self.connection.write_raw(SaslReply::Success(token).encode())?;
                }
                self.user = security.authorized_user().map(str::to_string);
                tracing::debug!(
                    conn = %self.connection.id(),
                    user = self.user.as_deref().unwrap_or(""),
                    "SASL authentication successful"
                );
                Ok(Processed::HandshakeComplete)
            }
            Err(e) => {
                tracing::warn!(
                    conn = %self.connection.id(),
                    host = self.connection.host_address(),
                    "SASL authentication failed: {}",
                    e
                );
                let reply = SaslReply::Error {
                    exception_class: ExceptionResponse::SASL_FAILURE.to_string(),
                    message: e.to_string(),
                };
                if let Err(write_err) = self.connection.write_raw(reply.encode()) {
                    tracing::debug!("Could not send SASL error reply: {}", write_err);
                }
                Err(match e {
                    RpcwireError::Sasl(_) | RpcwireError::AccessDenied(_) => e,
                    other => RpcwireError::Sasl(other.to_string()),
                })
            }
        }
    }

    fn process_call(&mut self, frame: FrameBuffer) -> Result<Processed> {
        let connection = Arc::clone(&self.connection);
        let decoded = match connection.codec().decode_call_frame(frame) {
            Ok(decoded) => decoded,
            Err(CallFrameError::Unaddressable(e)) => return Err(e),
            Err(CallFrameError::Call { call_id, exception }) => {
                return self.reject(call_id, exception)
            }
        };
        let call_id = decoded.header.call_id;

        let (Some(service), Some(preamble)) = (self.service.clone(), self.preamble.as_ref()) else {
            return Err(RpcwireError::Protocol(
                "Call frame before connection header".to_string(),
            ));
        };

        let Some(method) = service.method(&decoded.header.method_name) else {
            let exception = ExceptionResponse::unknown_method(service.name(), &decoded.header.method_name);
            return self.reject(call_id, exception);
        };

        if decoded.cell_block.is_some() && preamble.cell_block_codec.is_none() {
            return self.reject(
                call_id,
                ExceptionResponse::bad_request(
                    "Cell block sent but no cell block codec was declared",
                ),
            );
        }

        let call = InFlightCall::from_parts(CallParts {
            service,
            method,
            header: decoded.header,
            param: decoded.param,
            cell_block: decoded.cell_block,
            size: decoded.size,
            connection,
            user: self.user.clone(),
            reservoir: self.reservoir.clone(),
            cleanup: self.pending_cleanup.take().unwrap_or_default(),
        });

        match self.executor.dispatch(call) {
            Ok(()) => Ok(Processed::Dispatched { call_id }),
            Err(DispatchRejected { call, reason }) => {
                tracing::warn!(
                    conn = %self.connection.id(),
                    call_id,
                    "Call rejected by executor: {}",
                    reason
                );
                call.respond_error(ExceptionResponse::call_queue_too_big(&reason))?;
                Ok(Processed::CallRejected { call_id })
            }
        }
    }

    /// Answer a call that will not run.
    fn reject(&self, call_id: u32, exception: ExceptionResponse) -> Result<Processed> {
        tracing::warn!(
            conn = %self.connection.id(),
            call_id,
            class = exception.exception_class_name.as_str(),
            "Rejecting call: {}",
            exception.message
        );
        self.connection
            .respond(&CallResponse::error(call_id, exception))?;
        Ok(Processed::CallRejected { call_id })
    }
}

/// Strip the length prefix of the call frame inside an unwrapped packet.
///
/// A wrapped packet holds exactly one frame, prefix included, the same shape
/// [`Connection::respond`] wraps on the way out.
fn unwrapped_call(mut packet: FrameBuffer) -> Result<FrameBuffer> {
    let len = packet.read_u32()? as usize;
    if len != packet.remaining() {
        return Err(RpcwireError::Protocol(format!(
            "Wrapped packet holds {} bytes after its prefix, frame claims {}",
            packet.remaining(),
            len
        )));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackRpcCodec;
    use crate::protocol::messages::{ConnectionHeader, RequestHeader, UserInformation};
    use crate::protocol::{AuthMethod, LENGTH_PREFIX_SIZE};
    use crate::security::{InMemoryAuthenticator, PlainServerFactory, SecurityConfig};
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingExecutor {
        calls: Mutex<Vec<InFlightCall>>,
        reject: bool,
    }

    impl CallExecutor for CollectingExecutor {
        fn dispatch(&self, call: InFlightCall) -> std::result::Result<(), DispatchRejected> {
            if self.reject {
                return Err(DispatchRejected::new(call, "busy"));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    struct Fixture {
        engine: ConnectionEngine,
        transport: Arc<MemoryTransport>,
        executor: Arc<CollectingExecutor>,
        released: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(security: SecurityLayer, executor: CollectingExecutor) -> Self {
            let transport = Arc::new(MemoryTransport::new());
            let connection = Arc::new(Connection::new(
                transport.clone(),
                security,
                Arc::new(MsgPackRpcCodec::new()),
            ));
            let mut services = ServiceRegistry::new();
            services.register(ServiceDescriptor::new("Kv").with_method("get"));
            let executor = Arc::new(executor);
            let engine = ConnectionEngine::new(
                connection,
                Arc::new(services),
                executor.clone(),
                Reservoir::default(),
            );
            Self {
                engine,
                transport,
                executor,
                released: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn simple() -> Self {
            Self::new(SecurityLayer::disabled(), CollectingExecutor::default())
        }

        fn counted(&self, bytes: Bytes) -> FrameBuffer {
            let released = self.released.clone();
            FrameBuffer::single(bytes).with_release(CallCleanup::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn header(&self, auth: AuthMethod, service: &str) -> FrameBuffer {
            let header = ConnectionHeader {
                service_name: service.to_string(),
                user_info: Some(UserInformation {
                    effective_user: "alice".to_string(),
                    real_user: None,
                }),
                ..Default::default()
            };
            let unit = MsgPackRpcCodec::new()
                .encode_connection_preamble(auth, &header)
                .unwrap();
            self.counted(unit)
        }

        fn call(&self, call_id: u32, method: &str) -> FrameBuffer {
            let header = RequestHeader {
                call_id,
                method_name: method.to_string(),
                ..Default::default()
            };
            let frame = MsgPackRpcCodec::new()
                .encode_call(&header, Some(b"param"), None)
                .unwrap();
            self.counted(frame.slice(LENGTH_PREFIX_SIZE..))
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_header_then_call() {
        let mut f = Fixture::simple();

        assert_eq!(
            f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap(),
            Processed::ConnectionHeader
        );
        assert_eq!(f.released(), 1);
        assert_eq!(f.engine.user(), Some("alice"));

        assert_eq!(
            f.engine.process(f.call(1, "get")).unwrap(),
            Processed::Dispatched { call_id: 1 }
        );
        // The call holds the buffer.
        assert_eq!(f.released(), 1);

        let call = f.executor.calls.lock().unwrap().pop().unwrap();
        assert_eq!(&call.param()[..], b"param");
        assert_eq!(call.user(), Some("alice"));
        drop(call);
        assert_eq!(f.released(), 2);
    }

    #[test]
    fn test_header_is_consumed_once() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();
        assert!(f.engine.is_connection_header_read());

        // A second header-shaped unit is treated as a call frame.
        let result = f.engine.process(f.header(AuthMethod::Simple, "Kv"));
        assert!(result.is_err());
        assert_eq!(f.released(), 2);
    }

    #[test]
    fn test_unknown_service_is_fatal() {
        let mut f = Fixture::simple();
        let err = f
            .engine
            .process(f.header(AuthMethod::Simple, "Nope"))
            .unwrap_err();
        assert!(matches!(err, RpcwireError::UnknownService(_)));
        assert_eq!(f.released(), 1);
    }

    #[test]
    fn test_unknown_method_answered_and_released() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();

        let result = f.engine.process(f.call(8, "scan")).unwrap();

        assert_eq!(result, Processed::CallRejected { call_id: 8 });
        assert_eq!(f.released(), 2);
        let writes = f.transport.writes();
        assert_eq!(writes.len(), 1);
        let (header, _, _) = MsgPackRpcCodec::new()
            .decode_response(writes[0].slice(LENGTH_PREFIX_SIZE..))
            .unwrap();
        assert_eq!(header.call_id, 8);
        assert_eq!(
            header.exception.unwrap().exception_class_name,
            ExceptionResponse::UNSUPPORTED_OPERATION
        );
    }

    #[test]
    fn test_dispatch_rejection_answered_and_released() {
        let executor = CollectingExecutor {
            reject: true,
            ..Default::default()
        };
        let mut f = Fixture::new(SecurityLayer::disabled(), executor);
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();

        let result = f.engine.process(f.call(2, "get")).unwrap();

        assert_eq!(result, Processed::CallRejected { call_id: 2 });
        assert_eq!(f.released(), 2);
        let (header, _, _) = MsgPackRpcCodec::new()
            .decode_response(f.transport.writes()[0].slice(LENGTH_PREFIX_SIZE..))
            .unwrap();
        assert_eq!(
            header.exception.unwrap().exception_class_name,
            ExceptionResponse::CALL_QUEUE_TOO_BIG
        );
    }

    #[test]
    fn test_undecodable_call_is_fatal_and_released() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();

        let garbage = f.counted(Bytes::from_static(&[0, 0, 0, 1, 0xc1]));
        assert!(f.engine.process(garbage).is_err());
        assert_eq!(f.released(), 2);
    }

    #[test]
    fn test_fallback_skips_first_frame() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Token, "Kv")).unwrap();
        assert_eq!(f.transport.writes()[0], SaslReply::SwitchToSimple.encode());

        let token = f.counted(Bytes::from_static(b"ignored sasl token"));
        assert_eq!(f.engine.process(token).unwrap(), Processed::Skipped);
        assert_eq!(f.released(), 2);

        assert_eq!(
            f.engine.process(f.call(3, "get")).unwrap(),
            Processed::Dispatched { call_id: 3 }
        );
    }

    #[test]
    fn test_plain_handshake_gates_calls() {
        let factory = PlainServerFactory::new(InMemoryAuthenticator::new().user("bob", "pw"));
        let security = SecurityLayer::new(Some(Arc::new(factory)), SecurityConfig::default());
        let mut f = Fixture::new(security, CollectingExecutor::default());

        f.engine.process(f.header(AuthMethod::Token, "Kv")).unwrap();
        assert_eq!(f.engine.user(), None);

        let token = f.counted(Bytes::from_static(b"\0bob\0pw"));
        assert_eq!(f.engine.process(token).unwrap(), Processed::HandshakeComplete);
        assert_eq!(f.engine.user(), Some("bob"));
        assert_eq!(f.released(), 2);
        assert!(f.executor.calls.lock().unwrap().is_empty());

        assert_eq!(
            f.engine.process(f.call(4, "get")).unwrap(),
            Processed::Dispatched { call_id: 4 }
        );
        let calls = f.executor.calls.lock().unwrap();
        assert_eq!(calls[0].user(), Some("bob"));
    }

    #[test]
    fn test_failed_handshake_is_fatal() {
        let factory = PlainServerFactory::new(InMemoryAuthenticator::new().user("bob", "pw"));
        let security = SecurityLayer::new(Some(Arc::new(factory)), SecurityConfig::default());
        let mut f = Fixture::new(security, CollectingExecutor::default());
        f.engine.process(f.header(AuthMethod::Token, "Kv")).unwrap();

        let token = f.counted(Bytes::from_static(b"\0bob\0wrong"));
        assert!(f.engine.process(token).is_err());
        assert_eq!(f.released(), 2);

        let reply = &f.transport.writes()[0];
        assert_eq!(&reply[..4], &1i32.to_be_bytes());
    }

    #[test]
    fn test_process_after_close_is_rejected_and_released() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();
        f.engine.close();
        f.engine.close();

        assert!(!f.engine.is_open());
        let err = f.engine.process(f.call(5, "get")).unwrap_err();
        assert!(matches!(err, RpcwireError::ConnectionClosed));
        assert_eq!(f.released(), 2);
    }

    #[test]
    fn test_require_sasl_rejects_simple() {
        let config = SecurityConfig {
            require_sasl: true,
            ..Default::default()
        };
        let mut f = Fixture::new(SecurityLayer::new(None, config), CollectingExecutor::default());
        let err = f
            .engine
            .process(f.header(AuthMethod::Simple, "Kv"))
            .unwrap_err();
        assert!(matches!(err, RpcwireError::AccessDenied(_)));
    }

    #[test]
    fn test_backpressured_rejection_closes_connection() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();
        f.transport.set_full(true);

        let err = f.engine.process(f.call(5, "scan")).unwrap_err();

        assert!(matches!(err, RpcwireError::Backpressure { .. }));
        assert_eq!(f.released(), 2);
        assert!(!f.engine.is_open());
        assert_eq!(f.transport.close_count(), 1);
    }

    #[test]
    fn test_backpressured_switch_to_simple_closes_connection() {
        let mut f = Fixture::simple();
        f.transport.set_full(true);

        let err = f
            .engine
            .process(f.header(AuthMethod::Token, "Kv"))
            .unwrap_err();

        assert!(matches!(err, RpcwireError::Backpressure { .. }));
        assert!(!f.engine.is_open());
        assert!(f.transport.writes().is_empty());

        let late = f.engine.process(f.call(1, "get")).unwrap_err();
        assert!(matches!(late, RpcwireError::ConnectionClosed));
        assert_eq!(f.released(), 2);
        assert!(f.executor.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fatal_error_closes_connection() {
        let mut f = Fixture::simple();
        f.engine.process(f.header(AuthMethod::Simple, "Kv")).unwrap();

        let garbage = f.counted(Bytes::from_static(&[0, 0, 0, 1, 0xc1]));
        assert!(f.engine.process(garbage).is_err());

        assert!(!f.engine.is_open());
        assert_eq!(f.transport.close_count(), 1);
    }
}
