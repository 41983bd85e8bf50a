//! # Error Taxonomy
//!
//! Purpose: Separate failures that poison a connection (framing) from those
//! that only spoil one frame (codec), and give callers a small, code-carrying
//! error type for everything that can end a call.
//!
//! ## Code Space
//!
//! ```text
//!        0  success
//!  1..2000  system errors (raised locally or by the remote runtime)
//!   >=2000  logic errors (raised by service code)
//! ```

use thiserror::Error;

/// Internal failure (misconfiguration, encode failure, closed connection).
pub const ERROR_INTERNAL: i32 = 1001;
/// No node list or no usable node for the requested service.
pub const ERROR_SERVICE_NOT_FOUND: i32 = 1002;
/// The call's deadline fired before a response arrived.
pub const ERROR_TIMEOUT: i32 = 1003;
/// The remote service has no handler for the requested method.
pub const ERROR_METHOD_NOT_FOUND: i32 = 1004;
/// The connection pool stayed exhausted for the whole wait bound.
pub const ERROR_POOL_EXHAUSTED: i32 = 1005;
/// Dialing the selected node failed.
pub const ERROR_CONNECT_FAILED: i32 = 1006;
/// The remote could not decode the request body.
pub const ERROR_BAD_REQUEST: i32 = 1007;
/// Codes below this value are system errors; at or above it, logic errors.
pub const MAX_SYSTEM_CODE: i32 = 2000;

/// Errors raised while framing or (de)serializing a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame start byte {0:#04x}")]
    BadStx(u8),

    #[error("invalid frame end byte {0:#04x}")]
    BadEtx(u8),

    #[error("unknown frame format {0}")]
    UnknownFormat(u8),

    #[error("header length {len} exceeds limit {max}")]
    HeaderTooLarge { len: usize, max: usize },

    #[error("body length {len} exceeds limit {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl ProtocolError {
    /// Framing errors leave the byte stream desynchronized; the connection
    /// that produced them must be torn down.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadStx(_)
                | ProtocolError::BadEtx(_)
                | ProtocolError::UnknownFormat(_)
                | ProtocolError::HeaderTooLarge { .. }
                | ProtocolError::BodyTooLarge { .. }
                | ProtocolError::Truncated { .. }
        )
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Caller-facing outcome of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Runtime failure, local or remote; `code < MAX_SYSTEM_CODE`.
    #[error("system error ret={code}, msg={msg}")]
    System { code: i32, msg: String },

    /// Service-level failure reported by the remote handler.
    #[error("logic error ret={code}, msg={msg}")]
    Logic { code: i32, msg: String },

    /// No response arrived before the call's deadline.
    #[error("request timed out")]
    Timeout,
}

impl RpcError {
    pub fn system(code: i32, msg: impl Into<String>) -> Self {
        RpcError::System {
            code,
            msg: msg.into(),
        }
    }

    pub fn logic(code: i32, msg: impl Into<String>) -> Self {
        RpcError::Logic {
            code,
            msg: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RpcError::system(ERROR_INTERNAL, msg)
    }

    /// Classifies a non-zero remote result code.
    pub fn from_ret(ret: i32, msg: impl Into<String>) -> Self {
        if ret > 0 && ret < MAX_SYSTEM_CODE {
            RpcError::system(ret, msg)
        } else {
            RpcError::logic(ret, msg)
        }
    }

    /// Numeric code as it would appear in a response header.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::System { code, .. } | RpcError::Logic { code, .. } => *code,
            RpcError::Timeout => ERROR_TIMEOUT,
        }
    }

    /// Message as it would appear in a response header.
    pub fn message(&self) -> String {
        match self {
            RpcError::System { msg, .. } | RpcError::Logic { msg, .. } => msg.clone(),
            RpcError::Timeout => "request time out".to_string(),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::internal(err.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
