//! Error types for the services.

use carnelia_runtime::KvError;
use carnelia_wire::{ErrorCode, RpcError};
use thiserror::Error;

/// Errors from the counter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key does not exist")]
    KeyDoesNotExist,

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("store failure: {0}")]
    Failed(RpcError),

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::KeyDoesNotExist(_) => StoreError::KeyDoesNotExist,
            KvError::PreconditionFailed(_) => StoreError::PreconditionFailed,
            other => StoreError::Failed(other.into()),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::KeyDoesNotExist => {
                RpcError::new(ErrorCode::KeyDoesNotExist, "key does not exist")
            }
            StoreError::PreconditionFailed => {
                RpcError::new(ErrorCode::PreconditionFailed, "precondition failed")
            }
            StoreError::Failed(e) => e,
            StoreError::Cancelled => RpcError::unavailable("cancelled by shutdown"),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
