//! Key-value services reachable over the cluster network.
//!
//! [`KvClient`] talks to Maelstrom's `seq-kv`, `lin-kv` and `lww-kv`
//! services. [`MemoryKv`] answers the same protocol from memory so a
//! simulated cluster can include a KV service of its own.

use crate::error::RuntimeError;
use crate::node::{Handler, Node, Request};
use async_trait::async_trait;
use carnelia_wire::{Body, ErrorCode, NodeId, RpcError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Sequentially consistent store.
pub const SEQ_KV: &str = "seq-kv";
/// Linearizable store.
pub const LIN_KV: &str = "lin-kv";
/// Last-write-wins store.
pub const LWW_KV: &str = "lww-kv";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvRequest {
    Read {
        key: Value,
    },
    Write {
        key: Value,
        value: Value,
    },
    Cas {
        key: Value,
        from: Value,
        to: Value,
        #[serde(default)]
        create_if_not_exists: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvResponse {
    ReadOk { value: Value },
    WriteOk,
    CasOk,
}

/// Errors returned by a KV service.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key does not exist: {0}")]
    KeyDoesNotExist(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl KvError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KvError::KeyDoesNotExist(_) => ErrorCode::KeyDoesNotExist,
            KvError::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            KvError::UnexpectedReply(_) => ErrorCode::Crash,
            KvError::Runtime(e) => e.code(),
        }
    }
}

impl From<RuntimeError> for KvError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Remote { error, .. } if error.code == ErrorCode::KeyDoesNotExist => {
                KvError::KeyDoesNotExist(error.text)
            }
            RuntimeError::Remote { error, .. } if error.code == ErrorCode::PreconditionFailed => {
                KvError::PreconditionFailed(error.text)
            }
            other => KvError::Runtime(other),
        }
    }
}

impl From<KvError> for RpcError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Runtime(e) => e.into(),
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

/// Client for a KV service.
#[derive(Clone)]
pub struct KvClient {
    node: Node,
    service: NodeId,
}

impl KvClient {
    pub fn new(node: Node, service: impl Into<NodeId>) -> Self {
        Self {
            node,
            service: service.into(),
        }
    }

    /// Client for the sequentially consistent `seq-kv` service.
    pub fn seq(node: Node) -> Self {
        Self::new(node, SEQ_KV)
    }

    pub fn service(&self) -> &NodeId {
        &self.service
    }

    pub async fn read<V: DeserializeOwned>(&self, key: &str) -> Result<V, KvError> {
        let response = self
            .request(&KvRequest::Read { key: key.into() })
            .await?;
        match response {
            KvResponse::ReadOk { value } => serde_json::from_value(value)
                .map_err(|e| KvError::UnexpectedReply(e.to_string())),
            other => Err(KvError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn read_int(&self, key: &str) -> Result<i64, KvError> {
        self.read(key).await
    }

    pub async fn write<V: Serialize>(&self, key: &str, value: &V) -> Result<(), KvError> {
        let request = KvRequest::Write {
            key: key.into(),
            value: to_value(value)?,
        };
        match self.request(&request).await? {
            KvResponse::WriteOk => Ok(()),
            other => Err(KvError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Atomically replace `from` with `to`. With `create_if_not_exists`, a
    /// missing key is created holding `to`.
    pub async fn compare_and_swap<V: Serialize>(
        &self,
        key: &str,
        from: &V,
        to: &V,
        create_if_not_exists: bool,
    ) -> Result<(), KvError> {
        let request = KvRequest::Cas {
            key: key.into(),
            from: to_value(from)?,
            to: to_value(to)?,
            create_if_not_exists,
        };
        match self.request(&request).await? {
            KvResponse::CasOk => Ok(()),
            other => Err(KvError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    async fn request(&self, request: &KvRequest) -> Result<KvResponse, KvError> {
        let body = Body::from_payload(request).map_err(RuntimeError::from)?;
        let reply = self.node.call(&self.service, body).await?;
        reply
            .body
            .decode()
            .map_err(|e| KvError::UnexpectedReply(e.to_string()))
    }
}

fn to_value<V: Serialize>(value: &V) -> Result<Value, KvError> {
    serde_json::to_value(value).map_err(|e| KvError::Runtime(RuntimeError::Wire(e.into())))
}

/// An in-memory KV service with Maelstrom's error semantics.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Apply one request atomically.
    pub fn apply(&self, request: KvRequest) -> Result<KvResponse, RpcError> {
        let mut entries = self.entries.lock();
        match request {
            KvRequest::Read { key } => {
                let key = key_string(&key);
                match entries.get(&key) {
                    Some(value) => Ok(KvResponse::ReadOk {
                        value: value.clone(),
                    }),
                    None => Err(RpcError::new(
                        ErrorCode::KeyDoesNotExist,
                        format!("key {} does not exist", key),
                    )),
                }
            }
            KvRequest::Write { key, value } => {
                entries.insert(key_string(&key), value);
                Ok(KvResponse::WriteOk)
            }
            KvRequest::Cas {
                key,
                from,
                to,
                create_if_not_exists,
            } => {
                let key = key_string(&key);
                match entries.get_mut(&key) {
                    Some(current) if *current == from => {
                        *current = to;
                        Ok(KvResponse::CasOk)
                    }
                    Some(current) => Err(RpcError::new(
                        ErrorCode::PreconditionFailed,
                        format!("current value {} is not {}", current, from),
                    )),
                    None if create_if_not_exists => {
                        entries.insert(key, to);
                        Ok(KvResponse::CasOk)
                    }
                    None => Err(RpcError::new(
                        ErrorCode::KeyDoesNotExist,
                        format!("key {} does not exist", key),
                    )),
                }
            }
        }
    }

    /// Serve `read`, `write` and `cas` on `node`.
    pub fn serve(self: &Arc<Self>, node: &Node) {
        for kind in ["read", "write", "cas"] {
            node.handle(kind, Arc::clone(self) as Arc<dyn Handler>);
        }
    }
}

#[async_trait]
impl Handler for MemoryKv {
    async fn handle(&self, request: &Request) -> Result<(), RpcError> {
        let kv_request: KvRequest = request.decode()?;
        let response = self.apply(kv_request)?;
        request.reply(&response).await
    }
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
