//! The node runtime: identity, handler dispatch, replies and calls.
//!
//! A [`Node`] is a cheap, clonable handle. Inbound messages go through
//! [`Node::dispatch`]:
//!
//! 1. a message answering one of our pending calls resolves that call;
//! 2. `init` sets the identity and is answered with `init_ok`;
//! 3. anything else runs the [`Handler`] registered for its `type` in its
//!    own task, so handlers execute concurrently with each other and with
//!    whatever background work they started.
//!
//! Outbound messages are queued on a bounded channel drained by a single
//! writer in [`Node::run`].

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::rpc::CallTable;
use crate::transport::Transport;
use async_trait::async_trait;
use carnelia_wire::{Body, Message, NodeId, RpcError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Handles every inbound message of one or more types.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a request. An `Err` is sent back to the sender as an `error`
    /// body.
    async fn handle(&self, request: &Request) -> std::result::Result<(), RpcError>;
}

/// The local node's place in the cluster, assigned by `init`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub node_id: NodeId,
    pub node_ids: Vec<NodeId>,
}

impl Identity {
    pub fn new(node_id: impl Into<NodeId>, node_ids: Vec<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            node_ids,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InitRequest {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InitResponse {
    InitOk,
}

/// An inbound message together with the node that received it.
pub struct Request {
    node: Node,
    message: Message,
}

impl Request {
    pub fn new(node: Node, message: Message) -> Self {
        Self { node, message }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Who sent the request.
    pub fn src(&self) -> &NodeId {
        &self.message.src
    }

    /// Decode the body into a typed payload.
    pub fn decode<P: DeserializeOwned>(&self) -> std::result::Result<P, RpcError> {
        Ok(self.message.body.decode()?)
    }

    /// Reply to the sender with a typed payload.
    pub async fn reply<P: Serialize>(&self, payload: &P) -> std::result::Result<(), RpcError> {
        let body = Body::from_payload(payload)?;
        self.reply_body(body).await
    }

    pub async fn reply_body(&self, body: Body) -> std::result::Result<(), RpcError> {
        self.node.reply(&self.message, body).await?;
        Ok(())
    }
}

/// A node in the cluster.
///
/// Can be cloned to obtain another handle to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    identity: RwLock<Option<Identity>>,
    calls: Arc<CallTable>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(mut config: RuntimeConfig) -> Self {
        // Configs built by hand skip the builder's clamp; tokio panics on 0.
        config.channel_capacity = config.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                identity: RwLock::new(None),
                calls: Arc::new(CallTable::new()),
                handlers: RwLock::new(HashMap::new()),
                outbound_tx: tx,
                outbound_rx: Mutex::new(Some(rx)),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// A node that already knows who it is, without waiting for `init`.
    pub fn with_identity(config: RuntimeConfig, identity: Identity) -> Self {
        let node = Self::new(config);
        node.set_identity(identity);
        node
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Register `handler` for messages of type `kind`, replacing any earlier
    /// registration.
    pub fn handle(&self, kind: impl Into<String>, handler: Arc<dyn Handler>) {
        self.inner.handlers.write().insert(kind.into(), handler);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.read().clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.inner.identity.write() = Some(identity);
    }

    /// The local node id, if `init` has been received.
    pub fn id(&self) -> Option<NodeId> {
        self.inner
            .identity
            .read()
            .as_ref()
            .map(|identity| identity.node_id.clone())
    }

    pub fn require_id(&self) -> Result<NodeId> {
        self.id().ok_or(RuntimeError::NotInitialized)
    }

    /// Every node in the cluster, including this one.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner
            .identity
            .read()
            .as_ref()
            .map(|identity| identity.node_ids.clone())
            .unwrap_or_default()
    }

    /// Cancelled when the node stops. Background loops should stop with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight_calls(&self) -> usize {
        self.inner.calls.in_flight()
    }

    /// Take the queue of outbound messages. Only the first caller gets it;
    /// [`Node::run`] takes it itself.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.outbound_rx.lock().take()
    }

    /// Send a message without waiting for any reply.
    pub async fn send(&self, dest: &NodeId, body: Body) -> Result<()> {
        let src = self.require_id()?;
        self.emit(Message::new(src, dest.clone(), body)).await
    }

    /// Answer `request`. The reply comes from whoever the request was sent to.
    pub async fn reply(&self, request: &Message, mut body: Body) -> Result<()> {
        body.msg_id = Some(self.inner.calls.next_msg_id());
        body.in_reply_to = request.body.msg_id;
        self.emit(Message::new(request.dest.clone(), request.src.clone(), body))
            .await
    }

    /// Send a request and wait for its reply with the configured timeout.
    pub async fn call(&self, dest: &NodeId, body: Body) -> Result<Message> {
        self.call_with_timeout(dest, body, self.inner.config.rpc_timeout())
            .await
    }

    /// Send a request and wait up to `timeout` for its reply. An `error`
    /// reply comes back as [`RuntimeError::Remote`].
    pub async fn call_with_timeout(
        &self,
        dest: &NodeId,
        mut body: Body,
        timeout: Duration,
    ) -> Result<Message> {
        let src = self.require_id()?;
        let pending = self.inner.calls.register();
        let msg_id = pending.msg_id();
        body.msg_id = Some(msg_id);
        body.in_reply_to = None;

        self.emit(Message::new(src, dest.clone(), body)).await?;

        let reply = pending
            .wait(timeout)
            .await
            .ok_or_else(|| RuntimeError::Timeout {
                dest: dest.clone(),
                msg_id,
            })?;

        match reply.body.failure() {
            Some(error) => Err(RuntimeError::Remote {
                dest: dest.clone(),
                error,
            }),
            None => Ok(reply),
        }
    }

    /// Route one inbound message.
    pub fn dispatch(&self, message: Message) {
        let message = match self.inner.calls.resolve(message) {
            Ok(()) => return,
            Err(message) => message,
        };

        if message.kind() == "init" {
            self.init(message);
            return;
        }

        let handler = self.inner.handlers.read().get(message.kind()).cloned();
        match handler {
            Some(handler) => {
                let request = Request::new(self.clone(), message);
                self.inner.tasks.spawn(async move {
                    if let Err(error) = handler.handle(&request).await {
                        request.node.fail(&request.message, &error).await;
                    }
                });
            }
            None if message.is_reply() => {
                debug!(
                    kind = message.kind(),
                    src = %message.src,
                    in_reply_to = ?message.body.in_reply_to,
                    "dropping reply nobody is waiting for"
                );
            }
            None if message.body.msg_id.is_some() => {
                let node = self.clone();
                self.inner.tasks.spawn(async move {
                    let error = RpcError::not_supported(format!(
                        "no handler for message type {}",
                        message.kind()
                    ));
                    node.fail(&message, &error).await;
                });
            }
            None => {
                debug!(kind = message.kind(), src = %message.src, "dropping unhandled message");
            }
        }
    }

    /// Serve the node over `transport` until input ends, the node is shut
    /// down, or the transport fails.
    pub async fn run<T: Transport>(&self, transport: T) -> Result<()> {
        let outbound = self.take_outbound().ok_or(RuntimeError::AlreadyRunning)?;
        let transport = Arc::new(transport);
        let stop_writer = CancellationToken::new();

        let mut writer = tokio::spawn(write_loop(
            Arc::clone(&transport),
            outbound,
            stop_writer.clone(),
        ));

        let shutdown = self.shutdown_token();
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                done = &mut writer => {
                    break match done {
                        Ok(Err(e)) => Err(e),
                        _ => Err(RuntimeError::Closed),
                    };
                }
                inbound = transport.recv() => match inbound {
                    Ok(Some(message)) => self.dispatch(message),
                    Ok(None) => {
                        info!("input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        // Stop retry loops first so handlers blocked on them can finish and
        // queue their replies before the writer drains.
        self.shutdown();
        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.config.rpc_timeout(), self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tasks.len(),
                "handlers still running at shutdown"
            );
        }
        stop_writer.cancel();
        if !writer.is_finished() {
            match writer.await {
                Ok(Err(e)) if result.is_ok() => return Err(e),
                _ => {}
            }
        }
        result
    }

    fn init(&self, message: Message) {
        let node = self.clone();
        match message.body.decode::<InitRequest>() {
            Ok(InitRequest::Init { node_id, node_ids }) => {
                info!(node = %node_id, cluster = node_ids.len(), "node initialized");
                self.set_identity(Identity { node_id, node_ids });
                self.inner.tasks.spawn(async move {
                    let reply = match Body::from_payload(&InitResponse::InitOk) {
                        Ok(body) => node.reply(&message, body).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = reply {
                        warn!(error = %e, "failed to answer init");
                    }
                });
            }
            Err(e) => {
                let error = RpcError::from(e);
                self.inner.tasks.spawn(async move {
                    node.fail(&message, &error).await;
                });
            }
        }
    }

    /// Report a failed request back to its sender.
    async fn fail(&self, request: &Message, error: &RpcError) {
        warn!(
            kind = request.kind(),
            src = %request.src,
            error = %error,
            "request failed"
        );
        if request.body.msg_id.is_none() {
            return;
        }
        if let Err(e) = self.reply(request, Body::from(error)).await {
            warn!(error = %e, "failed to send error reply");
        }
    }

    async fn emit(&self, message: Message) -> Result<()> {
        self.inner
            .outbound_tx
            .send(message)
            .await
            .map_err(|_| RuntimeError::Closed)
    }
}

/// Drain the outbound queue into the transport. Once `stop` fires, flush
/// whatever is already queued and return.
async fn write_loop<T: Transport>(
    transport: Arc<T>,
    mut outbound: mpsc::Receiver<Message>,
    stop: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => transport.send(&message).await?,
                None => return Ok(()),
            },
            _ = stop.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    transport.send(&message).await?;
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carnelia_wire::ErrorCode;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: &Request) -> std::result::Result<(), RpcError> {
            let echo = request
                .message()
                .body
                .fields
                .get("echo")
                .cloned()
                .ok_or_else(|| RpcError::malformed("missing echo"))?;
            request
                .reply_body(Body::new("echo_ok").with_field("echo", echo))
                .await
        }
    }

    fn request(kind: &str, msg_id: u64) -> Message {
        Message::new("c1", "n1", Body::new(kind).with_msg_id(msg_id))
    }

    #[tokio::test]
    async fn test_init_sets_identity_and_replies() {
        let node = Node::new(RuntimeConfig::default());
        let mut outbound = node.take_outbound().unwrap();

        let init = Message::new(
            "c0",
            "n1",
            Body::new("init")
                .with_msg_id(1)
                .with_field("node_id", "n1")
                .with_field("node_ids", json!(["n1", "n2"])),
        );
        node.dispatch(init);

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.kind(), "init_ok");
        assert_eq!(reply.src, NodeId::new("n1"));
        assert_eq!(reply.dest, NodeId::new("c0"));
        assert_eq!(reply.body.in_reply_to, Some(1));
        assert_eq!(node.id(), Some(NodeId::new("n1")));
        assert_eq!(node.node_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_init_is_rejected() {
        let node = Node::new(RuntimeConfig::default());
        let mut outbound = node.take_outbound().unwrap();

        node.dispatch(request("init", 1));

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.body.failure().unwrap().code, ErrorCode::MalformedRequest);
        assert!(node.id().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_is_not_supported() {
        let node = Node::new(RuntimeConfig::default());
        let mut outbound = node.take_outbound().unwrap();

        node.dispatch(request("frobnicate", 4));

        let reply = outbound.recv().await.unwrap();
        let failure = reply.body.failure().unwrap();
        assert_eq!(failure.code, ErrorCode::NotSupported);
        assert_eq!(reply.body.in_reply_to, Some(4));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let node = Node::new(RuntimeConfig::default());
        let mut outbound = node.take_outbound().unwrap();
        node.handle("echo", Arc::new(Echo));

        node.dispatch(request("echo", 2));

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.body.failure().unwrap().code, ErrorCode::MalformedRequest);
    }

    #[tokio::test]
    async fn test_call_is_resolved_by_dispatch() {
        let node = Node::with_identity(
            RuntimeConfig::default(),
            Identity::new("n1", vec![NodeId::new("n1"), NodeId::new("n2")]),
        );
        let mut outbound = node.take_outbound().unwrap();

        let caller = node.clone();
        let call = tokio::spawn(async move {
            caller
                .call(&NodeId::new("n2"), Body::new("broadcast").with_field("message", 3))
                .await
        });

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent.dest, NodeId::new("n2"));
        let msg_id = sent.body.msg_id.unwrap();
        assert_eq!(node.in_flight_calls(), 1);

        node.dispatch(Message::new(
            "n2",
            "n1",
            Body::new("broadcast_ok").in_reply_to(msg_id),
        ));

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.kind(), "broadcast_ok");
        assert_eq!(node.in_flight_calls(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_becomes_remote_error() {
        let node = Node::with_identity(
            RuntimeConfig::default(),
            Identity::new("n1", vec![NodeId::new("n1")]),
        );
        let mut outbound = node.take_outbound().unwrap();

        let caller = node.clone();
        let call = tokio::spawn(async move {
            caller
                .call(&NodeId::new("seq-kv"), Body::new("read").with_field("key", "value"))
                .await
        });

        let sent = outbound.recv().await.unwrap();
        let msg_id = sent.body.msg_id.unwrap();
        node.dispatch(Message::new(
            "seq-kv",
            "n1",
            Body::error(ErrorCode::KeyDoesNotExist, "key does not exist").in_reply_to(msg_id),
        ));

        match call.await.unwrap() {
            Err(RuntimeError::Remote { error, .. }) => {
                assert_eq!(error.code, ErrorCode::KeyDoesNotExist)
            }
            other => panic!("expected remote error, got {:?}", other.map(|m| m.body)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let config = RuntimeConfig {
            rpc_timeout_ms: 100,
            ..Default::default()
        };
        let node = Node::with_identity(config, Identity::new("n1", vec![NodeId::new("n1")]));
        let _outbound = node.take_outbound().unwrap();

        let result = node.call(&NodeId::new("n2"), Body::new("broadcast")).await;
        assert!(matches!(result, Err(RuntimeError::Timeout { .. })));
        assert_eq!(node.in_flight_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_requires_identity() {
        let node = Node::new(RuntimeConfig::default());
        let result = node.call(&NodeId::new("n2"), Body::new("broadcast")).await;
        assert!(matches!(result, Err(RuntimeError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_outbound_can_only_be_taken_once() {
        let node = Node::new(RuntimeConfig::default());
        assert!(node.take_outbound().is_some());
        assert!(node.take_outbound().is_none());

        let (transport, _handle) = crate::transport::MemoryTransport::new(4);
        assert!(matches!(
            node.run(transport).await,
            Err(RuntimeError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_zero_capacity_config_still_queues() {
        let config = RuntimeConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        let node = Node::with_identity(config, Identity::new("n1", vec![NodeId::new("n1")]));
        assert_eq!(node.config().channel_capacity, 1);

        let mut outbound = node.take_outbound().unwrap();
        node.send(&NodeId::new("n2"), Body::new("broadcast_ok")).await.unwrap();
        assert_eq!(outbound.recv().await.unwrap().dest, NodeId::new("n2"));
    }
}
