//! Per-connection SASL security layer.
//!
//! [`SecurityLayer`] drives one connection through
//! `Disabled -> Negotiating -> Established`, with `Disposed` reachable from any
//! state. The mechanism itself sits behind [`SaslServer`], created per
//! connection by a [`SaslServerFactory`]. Once established, frames are
//! wrapped and unwrapped only when the negotiated [`Qop`] asks for integrity or
//! privacy; plain `auth` sessions pass bytes through untouched.
//!
//! Protected traffic is framed the same way in both directions:
//!
//! ```text
//! u32 packet_len | wrap( u32 frame_len | frame body )
//! ```
//!
//! One packet carries exactly one frame. Several calls need several packets.

mod plain;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;

use crate::codec::ConnectionPreamble;
use crate::connection::ConnectionInfo;
use crate::error::{Result, RpcwireError};
use crate::protocol::{AuthMethod, FrameBuffer};

pub use plain::{Authenticator, InMemoryAuthenticator, PlainServer, PlainServerFactory};

/// Quality of protection negotiated by a SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qop {
    /// Authentication only.
    Auth,
    /// Authentication with integrity protection.
    AuthInt,
    /// Authentication with integrity and confidentiality.
    AuthConf,
}

impl Qop {
    /// Whether frames must go through `wrap`/`unwrap`.
    #[inline]
    pub fn wraps(self) -> bool {
        !matches!(self, Qop::Auth)
    }
}

impl fmt::Display for Qop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
            Qop::AuthConf => "auth-conf",
        })
    }
}

/// Server side of one SASL mechanism exchange.
pub trait SaslServer: Send {
    /// Mechanism name, e.g. `PLAIN`.
    fn mechanism(&self) -> &str;

    /// Process a client token and return the next challenge (may be empty).
    fn evaluate_response(&mut self, response: &[u8]) -> Result<Bytes>;

    /// Whether the exchange has finished successfully.
    fn is_complete(&self) -> bool;

    /// Authenticated identity, available once complete.
    fn authorization_id(&self) -> Option<String>;

    /// Protection level agreed during the exchange.
    fn negotiated_qop(&self) -> Qop {
        Qop::Auth
    }

    /// Protect an outgoing buffer.
    fn wrap(&mut self, _data: &[u8]) -> Result<Bytes> {
        Err(RpcwireError::Sasl(format!(
            "{} does not provide a security layer",
            self.mechanism()
        )))
    }

    /// Verify and strip protection from an incoming buffer.
    fn unwrap(&mut self, _data: &[u8]) -> Result<Bytes> {
        Err(RpcwireError::Sasl(format!(
            "{} does not provide a security layer",
            self.mechanism()
        )))
    }

    /// Release mechanism resources. Called at most once.
    fn dispose(&mut self) {}
}

/// Creates a [`SaslServer`] for each connection that asks for SASL.
pub trait SaslServerFactory: Send + Sync + 'static {
    /// Create a server for `auth` on the connection described by `info`.
    fn create(&self, auth: AuthMethod, info: &ConnectionInfo) -> Result<Box<dyn SaslServer>>;
}

/// Authentication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject clients that ask for SIMPLE auth.
    pub require_sasl: bool,
    /// Let SASL clients continue with SIMPLE auth when no mechanism is configured.
    pub allow_fallback_to_simple: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_sasl: false,
            allow_fallback_to_simple: true,
        }
    }
}

/// Observable state of a [`SecurityLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Disabled,
    Negotiating,
    Established,
    Disposed,
}

/// What the header told the layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStart {
    /// SIMPLE auth; no handshake frames follow.
    NotRequested,
    /// A SASL exchange has started.
    Negotiating,
    /// Client asked for SASL but will be told to use SIMPLE; its first
    /// handshake frame must be skipped.
    FallbackToSimple,
}

/// Result of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// More tokens needed; send this challenge.
    Continue(Bytes),
    /// Done. Carries a final token for the client, if the mechanism has one.
    Complete(Option<Bytes>),
}

enum Phase {
    Disabled,
    Negotiating(Box<dyn SaslServer>),
    Established { server: Box<dyn SaslServer>, qop: Qop },
    Disposed,
}

/// SASL state for one connection.
pub struct SecurityLayer {
    phase: Phase,
    factory: Option<Arc<dyn SaslServerFactory>>,
    config: SecurityConfig,
    authorized_user: Option<String>,
}

impl SecurityLayer {
    /// Create a layer in the `Disabled` state.
    pub fn new(factory: Option<Arc<dyn SaslServerFactory>>, config: SecurityConfig) -> Self {
        Self {
            phase: Phase::Disabled,
            factory,
            config,
            authorized_user: None,
        }
    }

    /// A layer that never negotiates.
    pub fn disabled() -> Self {
        Self::new(None, SecurityConfig::default())
    }

    /// Current state.
    pub fn state(&self) -> SecurityState {
        match self.phase {
            Phase::Disabled => SecurityState::Disabled,
            Phase::Negotiating(_) => SecurityState::Negotiating,
            Phase::Established { .. } => SecurityState::Established,
            Phase::Disposed => SecurityState::Disposed,
        }
    }

    /// Identity established by the handshake.
    pub fn authorized_user(&self) -> Option<&str> {
        self.authorized_user.as_deref()
    }

    /// Negotiated protection, once established.
    pub fn qop(&self) -> Option<Qop> {
        match &self.phase {
            Phase::Established { qop, .. } => Some(*qop),
            _ => None,
        }
    }

    /// Whether outgoing and incoming frames are transformed.
    pub fn is_wrapping(&self) -> bool {
        self.qop().is_some_and(Qop::wraps)
    }

    /// Decide, from the connection header, whether a handshake follows.
    ///
    /// # Errors
    ///
    /// `AccessDenied` when the policy refuses the requested method, or any
    /// error from the factory.
    pub fn begin_if_requested(
        &mut self,
        preamble: &ConnectionPreamble,
        info: &ConnectionInfo,
    ) -> Result<HandshakeStart> {
        if !matches!(self.phase, Phase::Disabled) {
            return Err(RpcwireError::Protocol(format!(
                "Security layer already {:?}",
                self.state()
            )));
        }

        let auth = preamble.auth_method;
        if !auth.uses_sasl() {
            if self.config.require_sasl {
                return Err(RpcwireError::AccessDenied(
                    "SIMPLE authentication is not enabled".to_string(),
                ));
            }
            return Ok(HandshakeStart::NotRequested);
        }

        match &self.factory {
            Some(factory) => {
                let server = factory.create(auth, info)?;
                tracing::debug!(
                    auth = %auth,
                    mechanism = server.mechanism(),
                    "SASL negotiation started"
                );
                self.phase = Phase::Negotiating(server);
                Ok(HandshakeStart::Negotiating)
            }
            None if self.config.allow_fallback_to_simple && !self.config.require_sasl => {
                tracing::debug!(auth = %auth, "no SASL mechanism configured, falling back to SIMPLE");
                Ok(HandshakeStart::FallbackToSimple)
            }
            None => Err(RpcwireError::AccessDenied(format!(
                "{} authentication is not enabled",
                auth
            ))),
        }
    }

    /// Feed one client token to the mechanism.
    ///
    /// # Errors
    ///
    /// Protocol error when not negotiating; otherwise whatever the mechanism
    /// reports. Any error is fatal for the connection.
    pub fn handshake_step(&mut self, token: &[u8]) -> Result<HandshakeStep> {
        let mut server = match std::mem::replace(&mut self.phase, Phase::Disposed) {
            Phase::Negotiating(server) => server,
            other => {
                self.phase = other;
                return Err(RpcwireError::Protocol(format!(
                    "SASL token received while {:?}",
                    self.state()
                )));
            }
        };

        let challenge = match server.evaluate_response(token) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.phase = Phase::Negotiating(server);
                return Err(e);
            }
        };

        if !server.is_complete() {
            self.phase = Phase::Negotiating(server);
            return Ok(HandshakeStep::Continue(challenge));
        }

        let qop = server.negotiated_qop();
        self.authorized_user = server.authorization_id();
        tracing::debug!(
            mechanism = server.mechanism(),
            user = self.authorized_user.as_deref().unwrap_or(""),
            qop = %qop,
            "SASL negotiation complete"
        );
        self.phase = Phase::Established { server, qop };
        let final_token = (!challenge.is_empty()).then_some(challenge);
        Ok(HandshakeStep::Complete(final_token))
    }

    /// Strip protection from an inbound frame body.
    ///
    /// Identity unless established with a wrapping QOP. The frame's release,
    /// if any, moves to the returned buffer.
    pub fn unwrap(&mut self, mut frame: FrameBuffer) -> Result<FrameBuffer> {
        match &mut self.phase {
            Phase::Established { server, qop } if qop.wraps() => {
                let release = frame.take_release();
                let plain = server.unwrap(&frame.to_bytes())?;
                Ok(FrameBuffer::single(plain).with_release(release))
            }
            _ => Ok(frame),
        }
    }

    /// Protect an outbound buffer. Identity unless wrapping.
    pub fn wrap(&mut self, data: Bytes) -> Result<Bytes> {
        match &mut self.phase {
            Phase::Established { server, qop } if qop.wraps() => server.wrap(&data),
            _ => Ok(data),
        }
    }

    /// Release the mechanism. Safe to call in any state, any number of times.
    pub fn dispose(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Disposed) {
            Phase::Negotiating(mut server) | Phase::Established { mut server, .. } => {
                server.dispose();
            }
            Phase::Disabled | Phase::Disposed => {}
        }
    }
}

impl fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("state", &self.state())
            .field("authorized_user", &self.authorized_user)
            .field("qop", &self.qop())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Two-step mechanism with XOR "confidentiality".
    struct XorServer {
        steps: usize,
        disposed: Arc<AtomicUsize>,
    }

    impl SaslServer for XorServer {
        fn mechanism(&self) -> &str {
            "XOR-TEST"
        }

        fn evaluate_response(&mut self, response: &[u8]) -> Result<Bytes> {
            if response == b"bad" {
                return Err(RpcwireError::AccessDenied("bad token".to_string()));
            }
            self.steps += 1;
            Ok(Bytes::from(format!("challenge-{}", self.steps)))
        }

        fn is_complete(&self) -> bool {
            self.steps >= 2
        }

        fn authorization_id(&self) -> Option<String> {
            Some("bob".to_string())
        }

        fn negotiated_qop(&self) -> Qop {
            Qop::AuthConf
        }

        fn wrap(&mut self, data: &[u8]) -> Result<Bytes> {
            Ok(data.iter().map(|b| b ^ 0x5a).collect::<Vec<u8>>().into())
        }

        fn unwrap(&mut self, data: &[u8]) -> Result<Bytes> {
            self.wrap(data)
        }

        fn dispose(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct XorFactory {
        disposed: Arc<AtomicUsize>,
    }

    impl SaslServerFactory for XorFactory {
        fn create(&self, _auth: AuthMethod, _info: &ConnectionInfo) -> Result<Box<dyn SaslServer>> {
            Ok(Box::new(XorServer {
                steps: 0,
                disposed: self.disposed.clone(),
            }))
        }
    }

    fn preamble(auth: AuthMethod) -> ConnectionPreamble {
        ConnectionPreamble {
            version: 0,
            auth_method: auth,
            service_name: "Kv".to_string(),
            user_info: None,
            cell_block_codec: None,
            cell_block_compressor: None,
        }
    }

    fn layer() -> (SecurityLayer, Arc<AtomicUsize>) {
        let disposed = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(XorFactory {
            disposed: disposed.clone(),
        });
        (
            SecurityLayer::new(Some(factory), SecurityConfig::default()),
            disposed,
        )
    }

    fn established() -> SecurityLayer {
        let (mut layer, _) = layer();
        layer
            .begin_if_requested(&preamble(AuthMethod::Token), &ConnectionInfo::unknown())
            .unwrap();
        layer.handshake_step(b"one").unwrap();
        layer.handshake_step(b"two").unwrap();
        layer
    }

    #[test]
    fn test_simple_auth_not_requested() {
        let (mut layer, _) = layer();
        let start = layer
            .begin_if_requested(&preamble(AuthMethod::Simple), &ConnectionInfo::unknown())
            .unwrap();
        assert_eq!(start, HandshakeStart::NotRequested);
        assert_eq!(layer.state(), SecurityState::Disabled);
    }

    #[test]
    fn test_simple_auth_rejected_when_sasl_required() {
        let config = SecurityConfig {
            require_sasl: true,
            ..Default::default()
        };
        let mut layer = SecurityLayer::new(None, config);
        let err = layer
            .begin_if_requested(&preamble(AuthMethod::Simple), &ConnectionInfo::unknown())
            .unwrap_err();
        assert!(matches!(err, RpcwireError::AccessDenied(_)));
    }

    #[test]
    fn test_fallback_to_simple_without_factory() {
        let mut layer = SecurityLayer::disabled();
        let start = layer
            .begin_if_requested(&preamble(AuthMethod::Kerberos), &ConnectionInfo::unknown())
            .unwrap();
        assert_eq!(start, HandshakeStart::FallbackToSimple);
        assert_eq!(layer.state(), SecurityState::Disabled);
    }

    #[test]
    fn test_sasl_refused_without_factory_or_fallback() {
        let config = SecurityConfig {
            require_sasl: false,
            allow_fallback_to_simple: false,
        };
        let mut layer = SecurityLayer::new(None, config);
        assert!(layer
            .begin_if_requested(&preamble(AuthMethod::Token), &ConnectionInfo::unknown())
            .is_err());
    }

    #[test]
    fn test_handshake_continues_then_completes() {
        let (mut layer, _) = layer();
        let start = layer
            .begin_if_requested(&preamble(AuthMethod::Token), &ConnectionInfo::unknown())
            .unwrap();
        assert_eq!(start, HandshakeStart::Negotiating);

        let first = layer.handshake_step(b"one").unwrap();
        assert_eq!(first, HandshakeStep::Continue(Bytes::from_static(b"challenge-1")));
        assert_eq!(layer.state(), SecurityState::Negotiating);

        let second = layer.handshake_step(b"two").unwrap();
        assert_eq!(
            second,
            HandshakeStep::Complete(Some(Bytes::from_static(b"challenge-2")))
        );
        assert_eq!(layer.state(), SecurityState::Established);
        assert_eq!(layer.authorized_user(), Some("bob"));
        assert!(layer.is_wrapping());
    }

    #[test]
    fn test_handshake_step_outside_negotiation_is_error() {
        let mut layer = SecurityLayer::disabled();
        assert!(layer.handshake_step(b"x").is_err());
        assert_eq!(layer.state(), SecurityState::Disabled);

        let mut layer = established();
        assert!(layer.handshake_step(b"x").is_err());
        assert_eq!(layer.state(), SecurityState::Established);
    }

    #[test]
    fn test_handshake_failure_keeps_negotiating() {
        let (mut layer, _) = layer();
        layer
            .begin_if_requested(&preamble(AuthMethod::Token), &ConnectionInfo::unknown())
            .unwrap();
        assert!(layer.handshake_step(b"bad").is_err());
        assert_eq!(layer.state(), SecurityState::Negotiating);
    }

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let mut layer = established();
        let wrapped = layer.wrap(Bytes::from_static(b"response")).unwrap();
        assert_ne!(&wrapped[..], b"response");

        let frame = FrameBuffer::from_regions([wrapped.slice(..3), wrapped.slice(3..)]);
        let mut plain = layer.unwrap(frame).unwrap();
        assert_eq!(plain.copy_to_bytes(plain.remaining()), Bytes::from_static(b"response"));
    }

    #[test]
    fn test_unwrap_keeps_release() {
        let mut layer = established();
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let frame = FrameBuffer::copy_from_slice(b"abc").with_release(crate::call::CallCleanup::new(
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let out = layer.unwrap(frame).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        out.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_when_not_wrapping() {
        let mut layer = SecurityLayer::disabled();
        let data = Bytes::from_static(b"abc");
        let out = layer.wrap(data.clone()).unwrap();
        assert_eq!(out.as_ptr(), data.as_ptr());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (mut layer, disposed) = layer();
        layer
            .begin_if_requested(&preamble(AuthMethod::Token), &ConnectionInfo::unknown())
            .unwrap();
        layer.dispose();
        layer.dispose();
        assert_eq!(layer.state(), SecurityState::Disposed);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(layer.handshake_step(b"one").is_err());
    }
}
