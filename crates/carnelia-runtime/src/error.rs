//! Error types for the node runtime.

use carnelia_wire::{ErrorCode, NodeId, RpcError, WireError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered with an `error` body.
    #[error("{dest} replied with {error}")]
    Remote { dest: NodeId, error: RpcError },

    #[error("no reply from {dest} to msg {msg_id} in time")]
    Timeout { dest: NodeId, msg_id: u64 },

    #[error("node has not received init yet")]
    NotInitialized,

    #[error("outbound channel closed")]
    Closed,

    #[error("outbound receiver already taken")]
    AlreadyRunning,
}

impl RuntimeError {
    /// The Maelstrom code this failure should be reported with.
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::Remote { error, .. } => error.code,
            RuntimeError::Timeout { .. } => ErrorCode::Timeout,
            RuntimeError::Wire(_) => ErrorCode::MalformedRequest,
            RuntimeError::NotInitialized => ErrorCode::TemporarilyUnavailable,
            RuntimeError::Io(_) | RuntimeError::Closed | RuntimeError::AlreadyRunning => {
                ErrorCode::Crash
            }
        }
    }
}

impl From<RuntimeError> for RpcError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Remote { error, .. } => error,
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
