//! Neighbor set assigned by `topology` messages.

use async_trait::async_trait;
use carnelia_runtime::{Handler, Request};
use carnelia_wire::{Body, NodeId, RpcError};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// The peers this node gossips to. Only ever grows.
#[derive(Default)]
pub struct Topology {
    neighbors: RwLock<BTreeSet<NodeId>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union the entry for `local` into the neighbor set. Entries for other
    /// nodes are ignored. Returns how many neighbors were new.
    pub fn apply(&self, local: &NodeId, assignment: &HashMap<NodeId, Vec<NodeId>>) -> usize {
        let Some(assigned) = assignment.get(local) else {
            return 0;
        };
        let mut neighbors = self.neighbors.write();
        assigned
            .iter()
            .filter(|peer| neighbors.insert((*peer).clone()))
            .count()
    }

    pub fn neighbors(&self) -> BTreeSet<NodeId> {
        self.neighbors.read().clone()
    }

    pub fn len(&self) -> usize {
        self.neighbors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.read().is_empty()
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TopologyRequest {
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
}

/// Serves `topology`.
pub struct TopologyHandler {
    topology: Arc<Topology>,
}

impl TopologyHandler {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl Handler for TopologyHandler {
    async fn handle(&self, request: &Request) -> Result<(), RpcError> {
        let local = request.node().require_id()?;
        let TopologyRequest::Topology { topology } = request.decode()?;

        let added = self.topology.apply(&local, &topology);
        info!(node = %local, added, neighbors = self.topology.len(), "topology updated");

        request
            .reply_body(Body::new("topology_ok").with_field("topology", serde_json::json!({})))
            .await
    }
}
