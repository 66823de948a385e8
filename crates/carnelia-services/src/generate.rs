//! Cluster-unique ids.
//!
//! Ids are `<node_id>-<ULID>`. The node prefix keeps ids from different
//! nodes apart; within a node a monotonic ULID generator never repeats.

use async_trait::async_trait;
use carnelia_runtime::{Handler, Request};
use carnelia_wire::{Body, NodeId, RpcError};
use parking_lot::Mutex;
use ulid::{Generator, Ulid};

pub struct IdGenerator {
    ulids: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            ulids: Mutex::new(Generator::new()),
        }
    }

    pub fn next_id(&self, node: &NodeId) -> String {
        // A generator exhausts its random part only after 2^80 ids in one
        // millisecond; fall back to a fresh ULID rather than fail.
        let ulid = self.ulids.lock().generate().unwrap_or_else(|_| Ulid::new());
        format!("{}-{}", node, ulid)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for IdGenerator {
    async fn handle(&self, request: &Request) -> Result<(), RpcError> {
        let node = request.node().require_id()?;
        let id = self.next_id(&node);
        request
            .reply_body(Body::new("generate_ok").with_field("id", id))
            .await
    }
}
