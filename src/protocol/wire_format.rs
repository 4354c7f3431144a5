//! Wire format constants and the connection preamble.
//!
//! A connection starts with a fixed preamble followed by the connection header:
//! ```text
//! ┌────────┬─────────┬──────┬────────────┬──────────────────┐
//! │ Magic  │ Version │ Auth │ Header len │ ConnectionHeader │
//! │ "RPCW" │ 1 byte  │1 byte│ uint32 BE  │ msgpack          │
//! └────────┴─────────┴──────┴────────────┴──────────────────┘
//! ```
//!
//! Everything after that is a frame: a `uint32 BE` length followed by the body.

use crate::error::{Result, RpcwireError};

/// Preamble magic bytes.
pub const MAGIC: [u8; 4] = *b"RPCW";

/// The only protocol version this server speaks.
pub const CURRENT_VERSION: u8 = 0;

/// Preamble size in bytes (magic + version + auth).
pub const PREAMBLE_SIZE: usize = 6;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (256 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Maximum size of the connection header itself (64 KB).
pub const MAX_CONNECTION_HEADER_SIZE: u32 = 64 * 1024;

/// SASL reply status codes.
pub mod sasl_status {
    /// Handshake step accepted.
    pub const SUCCESS: i32 = 0;
    /// Handshake failed; reply carries exception class and message.
    pub const ERROR: i32 = 1;
    /// Sent in place of a token length to tell the client to use SIMPLE auth.
    pub const SWITCH_TO_SIMPLE_AUTH: i32 = -88;
}

/// Authentication method requested by the client in the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication; the header's user info is trusted.
    Simple,
    /// Kerberos via SASL GSSAPI.
    Kerberos,
    /// Delegation token / password via SASL.
    Token,
}

impl AuthMethod {
    /// Wire code for this method.
    pub fn code(self) -> u8 {
        match self {
            AuthMethod::Simple => 80,
            AuthMethod::Kerberos => 81,
            AuthMethod::Token => 82,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            80 => Some(AuthMethod::Simple),
            81 => Some(AuthMethod::Kerberos),
            82 => Some(AuthMethod::Token),
            _ => None,
        }
    }

    /// Whether this method runs a SASL handshake.
    #[inline]
    pub fn uses_sasl(self) -> bool {
        !matches!(self, AuthMethod::Simple)
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthMethod::Simple => "SIMPLE",
            AuthMethod::Kerberos => "KERBEROS",
            AuthMethod::Token => "TOKEN",
        };
        f.write_str(name)
    }
}

/// Decoded fixed-size preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version.
    pub version: u8,
    /// Requested authentication method.
    pub auth: AuthMethod,
}

impl Preamble {
    /// Create a preamble for the current version.
    pub fn new(auth: AuthMethod) -> Self {
        Self {
            version: CURRENT_VERSION,
            auth,
        }
    }

    /// Encode preamble to bytes.
    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let mut buf = [0u8; PREAMBLE_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version;
        buf[5] = self.auth.code();
        buf
    }

    /// Decode and validate a preamble.
    ///
    /// Version is not checked here; the engine decides what it supports.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PREAMBLE_SIZE {
            return Err(RpcwireError::Protocol(format!(
                "Preamble needs {} bytes, got {}",
                PREAMBLE_SIZE,
                buf.len()
            )));
        }
        if buf[0..4] != MAGIC {
            return Err(RpcwireError::Protocol(
                "Bad preamble magic, not an rpcwire client".to_string(),
            ));
        }
        let auth = AuthMethod::from_code(buf[5]).ok_or_else(|| {
            RpcwireError::Protocol(format!("Unknown auth method code {}", buf[5]))
        })?;
        Ok(Self {
            version: buf[4],
            auth,
        })
    }
}

/// Read a big-endian length prefix.
///
/// Returns `None` if fewer than 4 bytes are available.
#[inline]
pub fn decode_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Reject a frame length above `max`.
#[inline]
pub fn validate_length(len: u32, max: u32) -> Result<()> {
    if len > max {
        return Err(RpcwireError::FrameTooLarge { size: len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_layout() {
        let bytes = Preamble::new(AuthMethod::Token).encode();
        assert_eq!(&bytes[0..4], b"RPCW");
        assert_eq!(bytes[4], CURRENT_VERSION);
        assert_eq!(bytes[5], 82);
    }

    #[test]
    fn test_preamble_decode() {
        let decoded = Preamble::decode(&[b'R', b'P', b'C', b'W', 0, 80]).unwrap();
        assert_eq!(decoded.auth, AuthMethod::Simple);
        assert_eq!(decoded.version, 0);
    }

    #[test]
    fn test_preamble_bad_magic() {
        let result = Preamble::decode(b"HTTP/1");
        assert!(result.unwrap_err().to_string().contains("magic"));
    }

    #[test]
    fn test_preamble_unknown_auth() {
        let result = Preamble::decode(&[b'R', b'P', b'C', b'W', 0, 7]);
        assert!(result.unwrap_err().to_string().contains("auth method"));
    }

    #[test]
    fn test_preamble_too_short() {
        assert!(Preamble::decode(b"RPC").is_err());
    }

    #[test]
    fn test_auth_codes() {
        for auth in [AuthMethod::Simple, AuthMethod::Kerberos, AuthMethod::Token] {
            assert_eq!(AuthMethod::from_code(auth.code()), Some(auth));
        }
        assert!(!AuthMethod::Simple.uses_sasl());
        assert!(AuthMethod::Kerberos.uses_sasl());
        assert_eq!(AuthMethod::Token.to_string(), "TOKEN");
    }

    #[test]
    fn test_length_prefix_big_endian() {
        assert_eq!(decode_length(&[0, 0, 1, 2]), Some(258));
        assert_eq!(decode_length(&[0, 0, 1]), None);
    }

    #[test]
    fn test_validate_length() {
        assert!(validate_length(100, 100).is_ok());
        let err = validate_length(101, 100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
