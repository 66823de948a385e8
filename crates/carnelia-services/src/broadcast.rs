//! Gossip dissemination of broadcast values.
//!
//! Every value a node accepts for the first time becomes an
//! [`Obligation`]: the set of neighbors that still have to acknowledge it.
//! A retry loop re-sends the value to whoever is still pending once per
//! gossip interval until the set drains. Values already seen are
//! acknowledged and dropped, which is what stops gossip from circulating
//! forever on cyclic topologies.
//!
//! Acknowledgements arrive concurrently and each one removes a single peer
//! under the obligation's own lock, so the order they land in does not
//! matter. A request gives up after one interval, but its id is kept for a
//! while afterwards so an acknowledgement that arrives late still counts.

use crate::config::ServiceConfig;
use crate::seen::SeenValues;
use crate::timer::pause;
use crate::topology::Topology;
use async_trait::async_trait;
use carnelia_runtime::{Handler, Node, Request, RuntimeError};
use carnelia_wire::{Body, Message, NodeId, RpcError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Timed-out request ids remembered per peer and value.
const LATE_ACK_WINDOW: usize = 16;

/// Sends a request to a peer and waits for its answer.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn request(
        &self,
        dest: &NodeId,
        body: Body,
        timeout: Duration,
    ) -> Result<Message, RuntimeError>;
}

#[async_trait]
impl PeerClient for Node {
    async fn request(
        &self,
        dest: &NodeId,
        body: Body,
        timeout: Duration,
    ) -> Result<Message, RuntimeError> {
        self.call_with_timeout(dest, body, timeout).await
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastPayload {
    Broadcast { message: i64 },
    BroadcastOk,
    Read,
    ReadOk { messages: Vec<i64> },
}

/// Neighbors that still owe an acknowledgement for one value.
pub struct Obligation {
    value: i64,
    pending: Mutex<BTreeSet<NodeId>>,
    rounds: AtomicU64,
    expired: Mutex<HashMap<NodeId, VecDeque<u64>>>,
}

impl Obligation {
    fn new(value: i64, peers: BTreeSet<NodeId>) -> Self {
        Self {
            value,
            pending: Mutex::new(peers),
            rounds: AtomicU64::new(0),
            expired: Mutex::new(HashMap::new()),
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn pending(&self) -> BTreeSet<NodeId> {
        self.pending.lock().clone()
    }

    /// Send rounds issued so far.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Mark `peer` as having acknowledged. Returns `false` if it already had.
    pub fn acknowledge(&self, peer: &NodeId) -> bool {
        self.pending.lock().remove(peer)
    }

    pub fn is_settled(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remember a request to `peer` that timed out. Returns the id pushed
    /// out of the window, if any.
    fn expire(&self, peer: &NodeId, msg_id: u64) -> Option<u64> {
        let mut expired = self.expired.lock();
        let ids = expired.entry(peer.clone()).or_default();
        ids.push_back(msg_id);
        if ids.len() > LATE_ACK_WINDOW {
            ids.pop_front()
        } else {
            None
        }
    }

    fn take_expired(&self, peer: &NodeId, msg_id: u64) -> bool {
        let mut expired = self.expired.lock();
        let Some(ids) = expired.get_mut(peer) else {
            return false;
        };
        match ids.iter().position(|id| *id == msg_id) {
            Some(at) => {
                ids.remove(at);
                true
            }
            None => false,
        }
    }

    fn expired_ids(&self) -> Vec<u64> {
        self.expired.lock().values().flatten().copied().collect()
    }
}

/// Accepts broadcast values and gossips them to neighbors until acknowledged.
pub struct Disseminator<P> {
    peers: Arc<P>,
    topology: Arc<Topology>,
    seen: SeenValues,
    obligations: Mutex<HashMap<i64, Arc<Obligation>>>,
    /// Timed-out gossip request id to the value it carried. Lock after
    /// `obligations`.
    late: Mutex<HashMap<u64, i64>>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<P: PeerClient> Disseminator<P> {
    pub fn new(
        peers: Arc<P>,
        topology: Arc<Topology>,
        config: &ServiceConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            peers,
            topology,
            seen: SeenValues::new(),
            obligations: Mutex::new(HashMap::new()),
            late: Mutex::new(HashMap::new()),
            interval: config.gossip_interval(),
            shutdown,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Record `value` as seen. Returns `true` the first time only.
    pub fn record(&self, value: i64) -> bool {
        self.seen.insert(value)
    }

    /// Start gossiping `value` to every neighbor except `sender` and
    /// `local`. Returns `None` when there is nobody to tell.
    pub fn disseminate(
        self: &Arc<Self>,
        value: i64,
        sender: &NodeId,
        local: &NodeId,
    ) -> Option<Arc<Obligation>> {
        let mut peers = self.topology.neighbors();
        peers.remove(sender);
        peers.remove(local);
        if peers.is_empty() {
            debug!(value, "no neighbors to gossip to");
            return None;
        }

        let obligation = Arc::new(Obligation::new(value, peers));
        self.obligations
            .lock()
            .insert(value, Arc::clone(&obligation));

        let this = Arc::clone(self);
        let task = Arc::clone(&obligation);
        tokio::spawn(async move { this.gossip(task).await });
        Some(obligation)
    }

    /// Every accepted value, in no particular order.
    pub fn read_all(&self) -> Vec<i64> {
        self.seen.snapshot()
    }

    pub fn obligation(&self, value: i64) -> Option<Arc<Obligation>> {
        self.obligations.lock().get(&value).cloned()
    }

    pub fn active_obligations(&self) -> usize {
        self.obligations.lock().len()
    }

    /// Timed-out requests whose acknowledgement would still count.
    pub fn late_acks(&self) -> usize {
        self.late.lock().len()
    }

    /// Apply an acknowledgement from `peer` for a request that already
    /// timed out. Returns `false` if it matches no live obligation.
    pub fn acknowledge_late(&self, peer: &NodeId, in_reply_to: u64) -> bool {
        let obligations = self.obligations.lock();
        let mut late = self.late.lock();
        let Some(obligation) = late
            .get(&in_reply_to)
            .and_then(|value| obligations.get(value))
        else {
            return false;
        };
        if !obligation.take_expired(peer, in_reply_to) {
            return false;
        }
        late.remove(&in_reply_to);
        obligation.acknowledge(peer);
        true
    }

    async fn gossip(self: Arc<Self>, obligation: Arc<Obligation>) {
        loop {
            let round = obligation.rounds.fetch_add(1, Ordering::Relaxed) + 1;
            let pending = obligation.pending();
            debug!(value = obligation.value, round, pending = pending.len(), "gossip round");

            for peer in pending {
                let this = Arc::clone(&self);
                let obligation = Arc::clone(&obligation);
                tokio::spawn(async move { this.send_to(&obligation, peer).await });
            }

            if !pause(self.interval, &self.shutdown).await {
                info!(
                    value = obligation.value,
                    pending = obligation.pending().len(),
                    "gossip stopped by shutdown"
                );
                break;
            }
            if obligation.is_settled() {
                debug!(value = obligation.value, rounds = round, "gossip complete");
                break;
            }
        }
        let mut obligations = self.obligations.lock();
        obligations.remove(&obligation.value);
        let mut late = self.late.lock();
        for msg_id in obligation.expired_ids() {
            late.remove(&msg_id);
        }
    }

    async fn send_to(&self, obligation: &Arc<Obligation>, peer: NodeId) {
        let body = Body::new("broadcast").with_field("message", obligation.value);
        match self.peers.request(&peer, body, self.interval).await {
            Ok(reply) if reply.kind() == "broadcast_ok" => {
                obligation.acknowledge(&peer);
            }
            Ok(reply) => {
                error!(
                    dest = %peer,
                    value = obligation.value,
                    kind = reply.kind(),
                    "unexpected reply to broadcast"
                );
            }
            Err(RuntimeError::Timeout { msg_id, .. }) => {
                debug!(dest = %peer, value = obligation.value, msg_id, "broadcast unanswered");
                self.expect_late(obligation, &peer, msg_id);
            }
            Err(e) => {
                error!(dest = %peer, value = obligation.value, error = %e, "broadcast failed");
            }
        }
    }

    fn expect_late(&self, obligation: &Arc<Obligation>, peer: &NodeId, msg_id: u64) {
        if obligation.is_settled() {
            return;
        }
        let obligations = self.obligations.lock();
        let live = obligations
            .get(&obligation.value)
            .is_some_and(|current| Arc::ptr_eq(current, obligation));
        if !live {
            return;
        }
        let mut late = self.late.lock();
        late.insert(msg_id, obligation.value);
        if let Some(evicted) = obligation.expire(peer, msg_id) {
            late.remove(&evicted);
        }
    }
}

/// Serves `broadcast`, `read` and stray `broadcast_ok` messages.
pub struct BroadcastHandler<P> {
    disseminator: Arc<Disseminator<P>>,
}

impl<P: PeerClient> BroadcastHandler<P> {
    pub fn new(disseminator: Arc<Disseminator<P>>) -> Self {
        Self { disseminator }
    }
}

#[async_trait]
impl<P: PeerClient> Handler for BroadcastHandler<P> {
    async fn handle(&self, request: &Request) -> Result<(), RpcError> {
        match request.decode::<BroadcastPayload>()? {
            BroadcastPayload::Broadcast { message } => {
                let local = request.node().require_id()?;
                let fresh = self.disseminator.record(message);
                request.reply(&BroadcastPayload::BroadcastOk).await?;
                if fresh {
                    self.disseminator.disseminate(message, request.src(), &local);
                }
                Ok(())
            }
            BroadcastPayload::Read => {
                let messages = self.disseminator.read_all();
                request.reply(&BroadcastPayload::ReadOk { messages }).await
            }
            BroadcastPayload::BroadcastOk => {
                // The call already timed out; the ack may still settle a peer.
                if let Some(in_reply_to) = request.message().body.in_reply_to {
                    if self.disseminator.acknowledge_late(request.src(), in_reply_to) {
                        debug!(src = %request.src(), in_reply_to, "late broadcast ack applied");
                    }
                }
                Ok(())
            }
            BroadcastPayload::ReadOk { .. } => Ok(()),
        }
    }
}
