//! Error types for the wire format.

use thiserror::Error;

/// Maelstrom error codes.
///
/// Codes below 1000 are reserved by the protocol; anything else is kept as
/// [`ErrorCode::Custom`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
    Custom(u32),
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
            ErrorCode::Custom(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxnConflict,
            other => ErrorCode::Custom(other),
        }
    }

    /// Definite errors guarantee the request had no effect. A timeout or a
    /// crash may or may not have been applied.
    pub fn is_definite(&self) -> bool {
        !matches!(self, ErrorCode::Timeout | ErrorCode::Crash)
    }

    fn name(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::NodeNotFound => "node-not-found",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::TemporarilyUnavailable => "temporarily-unavailable",
            ErrorCode::MalformedRequest => "malformed-request",
            ErrorCode::Crash => "crash",
            ErrorCode::Abort => "abort",
            ErrorCode::KeyDoesNotExist => "key-does-not-exist",
            ErrorCode::KeyAlreadyExists => "key-already-exists",
            ErrorCode::PreconditionFailed => "precondition-failed",
            ErrorCode::TxnConflict => "txn-conflict",
            ErrorCode::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A failure reported to, or by, the other side of a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {text}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub text: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn malformed(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedRequest, text)
    }

    pub fn not_supported(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, text)
    }

    pub fn unavailable(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::TemporarilyUnavailable, text)
    }

    pub fn crash(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::Crash, text)
    }
}

/// Errors raised while encoding or decoding messages.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("payload has no string `type` field")]
    MissingType,
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        RpcError::malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_both_ways() {
        for code in [0, 1, 10, 11, 12, 13, 14, 20, 21, 22, 30, 1002] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_definite_errors() {
        assert!(!ErrorCode::Timeout.is_definite());
        assert!(!ErrorCode::Crash.is_definite());
        assert!(ErrorCode::PreconditionFailed.is_definite());
        assert!(ErrorCode::KeyDoesNotExist.is_definite());
    }

    #[test]
    fn test_display() {
        let err = RpcError::new(ErrorCode::KeyDoesNotExist, "no key value");
        assert_eq!(err.to_string(), "key-does-not-exist (20): no key value");
    }

    #[test]
    fn test_wire_error_becomes_malformed_request() {
        let err: RpcError = WireError::MissingType.into();
        assert_eq!(err.code, ErrorCode::MalformedRequest);
    }
}
