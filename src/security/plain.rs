//! SASL PLAIN (RFC 4616) checked against a pluggable [`Authenticator`].
//!
//! The client sends one message, `authzid NUL authcid NUL passwd`. There is no
//! challenge and no security layer, so sessions established with PLAIN always
//! run at QOP `auth`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use super::{SaslServer, SaslServerFactory};
use crate::connection::ConnectionInfo;
use crate::error::{Result, RpcwireError};
use crate::protocol::AuthMethod;

/// Credential backend.
pub trait Authenticator: Send + Sync + 'static {
    /// Check a user's password.
    fn authenticate(&self, user: &str, password: &[u8]) -> bool;

    /// Whether `real_user` may act as `effective_user`.
    fn can_impersonate(&self, _real_user: &str, _effective_user: &str) -> bool {
        false
    }
}

/// Fixed user table, for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuthenticator {
    users: HashMap<String, Vec<u8>>,
    proxies: HashMap<String, HashSet<String>>,
}

impl InMemoryAuthenticator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    pub fn user(mut self, name: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        self.users.insert(name.into(), password.as_ref().to_vec());
        self
    }

    /// Let `real_user` act as `effective_user`.
    pub fn allow_proxy(
        mut self,
        real_user: impl Into<String>,
        effective_user: impl Into<String>,
    ) -> Self {
        self.proxies
            .entry(real_user.into())
            .or_default()
            .insert(effective_user.into());
        self
    }
}

impl Authenticator for InMemoryAuthenticator {
    fn authenticate(&self, user: &str, password: &[u8]) -> bool {
        self.users
            .get(user)
            .is_some_and(|expected| constant_time_eq(expected, password))
    }

    fn can_impersonate(&self, real_user: &str, effective_user: &str) -> bool {
        self.proxies
            .get(real_user)
            .is_some_and(|allowed| allowed.contains(effective_user))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// One PLAIN exchange.
pub struct PlainServer {
    authenticator: Arc<dyn Authenticator>,
    authorized: Option<String>,
}

impl PlainServer {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            authorized: None,
        }
    }
}

impl SaslServer for PlainServer {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<Bytes> {
        if self.authorized.is_some() {
            return Err(RpcwireError::Sasl(
                "PLAIN exchange already complete".to_string(),
            ));
        }

        let mut parts = response.split(|b| *b == 0);
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RpcwireError::Sasl("Malformed PLAIN message".to_string()));
        };

        let authcid = std::str::from_utf8(authcid)
            .map_err(|_| RpcwireError::Sasl("PLAIN user is not UTF-8".to_string()))?;
        let authzid = std::str::from_utf8(authzid)
            .map_err(|_| RpcwireError::Sasl("PLAIN authzid is not UTF-8".to_string()))?;
        if authcid.is_empty() {
            return Err(RpcwireError::Sasl("PLAIN user is empty".to_string()));
        }

        if !self.authenticator.authenticate(authcid, password) {
            return Err(RpcwireError::AccessDenied(format!(
                "Authentication failed for user {}",
                authcid
            )));
        }

        let effective = if authzid.is_empty() { authcid } else { authzid };
        if effective != authcid && !self.authenticator.can_impersonate(authcid, effective) {
            return Err(RpcwireError::AccessDenied(format!(
                "User {} is not allowed to impersonate {}",
                authcid, effective
            )));
        }

        self.authorized = Some(effective.to_string());
        Ok(Bytes::new())
    }

    fn is_complete(&self) -> bool {
        self.authorized.is_some()
    }

    fn authorization_id(&self) -> Option<String> {
        self.authorized.clone()
    }
}

/// Hands out [`PlainServer`]s for TOKEN auth.
#[derive(Clone)]
pub struct PlainServerFactory {
    authenticator: Arc<dyn Authenticator>,
}

impl PlainServerFactory {
    pub fn new(authenticator: impl Authenticator) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
        }
    }
}

impl SaslServerFactory for PlainServerFactory {
    fn create(&self, auth: AuthMethod, info: &ConnectionInfo) -> Result<Box<dyn SaslServer>> {
        match auth {
            AuthMethod::Token => Ok(Box::new(PlainServer::new(self.authenticator.clone()))),
            other => Err(RpcwireError::AccessDenied(format!(
                "{} authentication is not supported for {}",
                other, info.host_address
            ))),
        }
    }
}
