//! Carnelia cluster workloads.
//!
//! - [`counter`] - replicated counter over a compare-and-swap store
//! - [`broadcast`] - gossip dissemination with per-value retry loops
//! - [`topology`] - neighbor set assigned by `topology`
//! - [`seen`] - grow-only set of accepted broadcast values
//! - [`echo`] and [`generate`] - utility workloads every node serves
//!
//! [`install`] registers everything a node needs for one [`Workload`].

pub mod broadcast;
pub mod config;
pub mod counter;
pub mod echo;
pub mod error;
pub mod generate;
pub mod seen;
pub mod timer;
pub mod topology;

pub use broadcast::{BroadcastHandler, BroadcastPayload, Disseminator, Obligation, PeerClient};
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use counter::{CounterPayload, CounterService, CounterStore};
pub use echo::EchoHandler;
pub use error::{Result, StoreError};
pub use generate::IdGenerator;
pub use seen::SeenValues;
pub use topology::{Topology, TopologyHandler};

use carnelia_runtime::{KvClient, Node};
use std::sync::Arc;

/// Which workload owns the `read` message type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Workload {
    Counter,
    #[default]
    Broadcast,
}

/// What [`install`] wired up, for inspection.
pub struct Services {
    pub topology: Arc<Topology>,
    pub broadcast: Option<Arc<Disseminator<Node>>>,
    pub counter: Option<Arc<CounterService<KvClient>>>,
}

/// Register the handlers for `workload` on `node`. `echo`, `generate` and
/// `topology` are always served.
pub fn install(node: &Node, workload: Workload, config: &ServiceConfig) -> Services {
    node.handle("echo", Arc::new(EchoHandler));
    node.handle("generate", Arc::new(IdGenerator::new()));

    let topology = Arc::new(Topology::new());
    node.handle("topology", Arc::new(TopologyHandler::new(Arc::clone(&topology))));

    let mut services = Services {
        topology: Arc::clone(&topology),
        broadcast: None,
        counter: None,
    };

    match workload {
        Workload::Broadcast => {
            let disseminator = Arc::new(Disseminator::new(
                Arc::new(node.clone()),
                topology,
                config,
                node.shutdown_token(),
            ));
            let handler = Arc::new(BroadcastHandler::new(Arc::clone(&disseminator)));
            node.handle("broadcast", handler.clone());
            node.handle("broadcast_ok", handler.clone());
            node.handle("read", handler);
            services.broadcast = Some(disseminator);
        }
        Workload::Counter => {
            let store = KvClient::new(node.clone(), config.kv_service.as_str());
            let counter = Arc::new(CounterService::new(store, config, node.shutdown_token()));
            node.handle("add", counter.clone());
            node.handle("read", counter.clone());
            services.counter = Some(counter);
        }
    }

    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use carnelia_runtime::{Identity, RuntimeConfig};
    use carnelia_wire::{Body, ErrorCode, Message, NodeId};

    #[tokio::test]
    async fn test_counter_workload_does_not_serve_broadcast() {
        let node = Node::with_identity(
            RuntimeConfig::default(),
            Identity::new("n1", vec![NodeId::new("n1")]),
        );
        let mut outbound = node.take_outbound().unwrap();
        let services = install(&node, Workload::Counter, &ServiceConfig::default());
        assert!(services.counter.is_some());
        assert!(services.broadcast.is_none());

        node.dispatch(Message::new(
            "c1",
            "n1",
            Body::new("broadcast").with_msg_id(1).with_field("message", 1),
        ));

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.body.failure().unwrap().code, ErrorCode::NotSupported);
    }
}
