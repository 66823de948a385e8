//! In-process cluster network for tests and simulation.
//!
//! Every attached [`Node`] has its outbound queue drained by a routing task
//! that dispatches each message straight into the destination node. Links
//! between two *lossy* attachments drop messages with probability
//! `loss_rate`; anything touching a reliable attachment (clients, KV
//! services) is always delivered.

use crate::error::{Result, RuntimeError};
use crate::node::Node;
use carnelia_wire::{Message, NodeId};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Network configuration for simulation.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Probability of losing a message between two lossy nodes (0.0 - 1.0).
    pub loss_rate: f64,
    /// Seed for the loss decisions.
    pub seed: u64,
}

impl NetworkConfig {
    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            seed: 0,
        }
    }
}

/// Message counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub unroutable: u64,
}

struct Route {
    node: Node,
    lossy: bool,
}

struct Inner {
    config: NetworkConfig,
    routes: RwLock<HashMap<NodeId, Route>>,
    rng: Mutex<StdRng>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unroutable: AtomicU64,
}

/// A simulated network connecting in-process nodes.
///
/// Can be cloned to obtain another handle to the same network.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Inner>,
}

impl SimNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner: Arc::new(Inner {
                config,
                routes: RwLock::new(HashMap::new()),
                rng: Mutex::new(rng),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                unroutable: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Attach a node whose links are never lossy.
    pub fn attach(&self, node: &Node) -> Result<JoinHandle<()>> {
        self.attach_as(node, false)
    }

    /// Attach a node whose links to other lossy nodes drop messages.
    pub fn attach_lossy(&self, node: &Node) -> Result<JoinHandle<()>> {
        self.attach_as(node, true)
    }

    fn attach_as(&self, node: &Node, lossy: bool) -> Result<JoinHandle<()>> {
        let id = node.require_id()?;
        let mut outbound = node.take_outbound().ok_or(RuntimeError::AlreadyRunning)?;
        self.inner.routes.write().insert(
            id,
            Route {
                node: node.clone(),
                lossy,
            },
        );

        let network = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                network.route(message);
            }
        }))
    }

    /// The node attached under `id`.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.inner.routes.read().get(id).map(|route| route.node.clone())
    }

    /// Deliver, or lose, one message.
    pub fn route(&self, message: Message) {
        let (dest, lossy_link) = {
            let routes = self.inner.routes.read();
            let src_lossy = routes.get(&message.src).map_or(false, |r| r.lossy);
            match routes.get(&message.dest) {
                Some(route) => (Some(route.node.clone()), src_lossy && route.lossy),
                None => (None, false),
            }
        };

        let Some(dest) = dest else {
            self.inner.unroutable.fetch_add(1, Ordering::Relaxed);
            trace!(dest = %message.dest, "no route");
            return;
        };

        if lossy_link && self.should_drop() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(src = %message.src, dest = %message.dest, kind = message.kind(), "dropped");
            return;
        }

        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        dest.dispatch(message);
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            unroutable: self.inner.unroutable.load(Ordering::Relaxed),
        }
    }

    fn should_drop(&self) -> bool {
        let rate = self.inner.config.loss_rate;
        rate > 0.0 && self.inner.rng.lock().gen_bool(rate.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::node::Identity;
    use carnelia_wire::Body;

    fn node(id: &str) -> Node {
        Node::with_identity(RuntimeConfig::default(), Identity::new(id, vec![]))
    }

    #[tokio::test]
    async fn test_attach_requires_identity() {
        let network = SimNetwork::new(NetworkConfig::reliable());
        let anonymous = Node::new(RuntimeConfig::default());
        assert!(matches!(
            network.attach(&anonymous),
            Err(RuntimeError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_unroutable_messages_are_counted() {
        let network = SimNetwork::new(NetworkConfig::reliable());
        network.route(Message::new("n1", "nowhere", Body::new("broadcast")));
        assert_eq!(network.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn test_total_loss_only_between_lossy_nodes() {
        let network = SimNetwork::new(NetworkConfig::lossy(1.0));
        let a = node("n1");
        let b = node("n2");
        let client = node("c1");
        network.attach_lossy(&a).unwrap();
        network.attach_lossy(&b).unwrap();
        network.attach(&client).unwrap();

        network.route(Message::new("n1", "n2", Body::new("gossip")));
        network.route(Message::new("c1", "n2", Body::new("gossip")));

        let stats = network.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let network = SimNetwork::new(NetworkConfig::reliable());
        let a = node("n1");
        network.attach(&a).unwrap();
        assert!(matches!(
            network.attach(&a),
            Err(RuntimeError::AlreadyRunning)
        ));
        assert!(network.node(&NodeId::new("n1")).is_some());
    }
}
