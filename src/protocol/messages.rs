//! Header messages carried inside frames.
//!
//! These are encoded with MsgPack by [`MsgPackRpcCodec`](crate::codec::MsgPackRpcCodec);
//! the engine itself only sees the decoded structs.

use serde::{Deserialize, Serialize};

/// Sent once, right after the preamble.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHeader {
    /// Service every call on this connection targets.
    pub service_name: String,
    /// Claimed identity (trusted only under SIMPLE auth).
    #[serde(default)]
    pub user_info: Option<UserInformation>,
    /// Codec for cell blocks; cell blocks are refused when unset.
    #[serde(default)]
    pub cell_block_codec: Option<String>,
    /// Compressor for cell blocks.
    #[serde(default)]
    pub cell_block_compressor: Option<String>,
}

/// User identity claimed in the connection header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInformation {
    /// User the calls run as.
    pub effective_user: String,
    /// User that authenticated, when proxying.
    #[serde(default)]
    pub real_user: Option<String>,
}

/// Describes a cell block appended after the request or response message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBlockMeta {
    /// Cell block length in bytes.
    pub length: u32,
}

/// Distributed tracing context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: u64,
    pub parent_id: u64,
}

/// Per-call header at the start of every call frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Client-chosen call id, echoed in the response.
    pub call_id: u32,
    /// Method name within the connection's service.
    pub method_name: String,
    /// Whether a length-prefixed request param follows the header.
    #[serde(default)]
    pub request_param: bool,
    #[serde(default)]
    pub cell_block_meta: Option<CellBlockMeta>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Client deadline for this call, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u32>,
    #[serde(default)]
    pub trace_info: Option<TraceInfo>,
}

/// Failure details returned in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    /// Exception class name the client maps to an error type.
    pub exception_class_name: String,
    /// Human-readable message.
    pub message: String,
    /// Tells the client not to retry this call.
    #[serde(default)]
    pub do_not_retry: bool,
}

impl ExceptionResponse {
    /// Exception class for unknown methods and malformed params.
    pub const UNSUPPORTED_OPERATION: &'static str = "UnsupportedOperationException";
    /// Exception class for a rejected dispatch.
    pub const CALL_QUEUE_TOO_BIG: &'static str = "CallQueueTooBigException";
    /// Exception class for calls that overran their timeout.
    pub const CALL_TIMEOUT: &'static str = "CallTimeoutException";
    /// Exception class for handler failures.
    pub const SERVER_ERROR: &'static str = "ServerException";
    /// Exception class for malformed request payloads.
    pub const BAD_REQUEST: &'static str = "DoNotRetryIOException";
    /// Exception class sent in SASL error replies.
    pub const SASL_FAILURE: &'static str = "AccessDeniedException";

    /// Create a new exception response.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_class_name: class.into(),
            message: message.into(),
            do_not_retry: false,
        }
    }

    /// Mark as not retryable.
    pub fn do_not_retry(mut self) -> Self {
        self.do_not_retry = true;
        self
    }

    /// Unknown method on the connection's service.
    pub fn unknown_method(service: &str, method: &str) -> Self {
        Self::new(
            Self::UNSUPPORTED_OPERATION,
            format!("Unknown method {} on service {}", method, service),
        )
        .do_not_retry()
    }

    /// Executor refused the call.
    pub fn call_queue_too_big(reason: &str) -> Self {
        Self::new(Self::CALL_QUEUE_TOO_BIG, reason)
    }

    /// Handler exceeded the call's timeout.
    pub fn call_timeout(timeout_ms: u64) -> Self {
        Self::new(
            Self::CALL_TIMEOUT,
            format!("Call did not complete within {} ms", timeout_ms),
        )
    }

    /// Malformed request payload.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Self::BAD_REQUEST, message).do_not_retry()
    }
}

/// Header at the start of every response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub call_id: u32,
    #[serde(default)]
    pub exception: Option<ExceptionResponse>,
    #[serde(default)]
    pub cell_block_meta: Option<CellBlockMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_is_not_retryable() {
        let e = ExceptionResponse::unknown_method("Kv", "scan");
        assert_eq!(e.exception_class_name, ExceptionResponse::UNSUPPORTED_OPERATION);
        assert!(e.message.contains("scan"));
        assert!(e.do_not_retry);
    }

    #[test]
    fn test_call_queue_too_big_is_retryable() {
        let e = ExceptionResponse::call_queue_too_big("full");
        assert!(!e.do_not_retry);
    }

    #[test]
    fn test_request_header_defaults_for_missing_fields() {
        #[derive(Serialize)]
        struct Minimal {
            call_id: u32,
            method_name: String,
        }
        let bytes = rmp_serde::to_vec_named(&Minimal {
            call_id: 9,
            method_name: "get".to_string(),
        })
        .unwrap();
        let header: RequestHeader = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(header.call_id, 9);
        assert!(!header.request_param);
        assert!(header.timeout_ms.is_none());
    }
}
