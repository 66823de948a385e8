//! Carnelia node runtime.
//!
//! Runs a cluster node that speaks the Maelstrom protocol: newline-delimited
//! JSON messages on stdin/stdout, an `init` handshake, typed handlers per
//! message type, and request/response calls to other nodes and services.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use carnelia_runtime::{Handler, Node, Request, RuntimeConfig, StdioTransport};
//! use carnelia_wire::{Body, RpcError};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Handler for Ping {
//!     async fn handle(&self, request: &Request) -> Result<(), RpcError> {
//!         request.reply_body(Body::new("pong")).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> carnelia_runtime::Result<()> {
//!     let node = Node::new(RuntimeConfig::default());
//!     node.handle("ping", Arc::new(Ping));
//!     node.run(StdioTransport::stdio()).await
//! }
//! ```
//!
//! - [`node`] - identity, dispatch, replies and calls
//! - [`transport`] - stdio and in-memory transports
//! - [`kv`] - KV service client and an in-memory KV service
//! - [`network`] - simulated lossy network between in-process nodes
//! - [`config`] - runtime configuration
//! - [`error`] - error types

pub mod config;
pub mod error;
pub mod kv;
pub mod network;
pub mod node;
mod rpc;
pub mod transport;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{Result, RuntimeError};
pub use kv::{KvClient, KvError, MemoryKv};
pub use network::{NetworkConfig, NetworkStats, SimNetwork};
pub use node::{Handler, Identity, Node, Request};
pub use transport::{LineTransport, MemoryHandle, MemoryTransport, StdioTransport, Transport};
