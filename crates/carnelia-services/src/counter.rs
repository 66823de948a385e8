//! Replicated counter backed by a compare-and-swap store.
//!
//! The counter lives under a single key of an external, sequentially
//! consistent store. An increment is an optimistic read-modify-write:
//!
//! 1. read the current value (a missing key counts as 0);
//! 2. compare-and-swap `current -> current + delta`, creating the key if it
//!    is missing;
//! 3. on a precondition failure another writer got there first: wait the
//!    backoff and start over. Any other failure aborts the increment.
//!
//! No local lock is held across the round trips; the store's CAS is what
//! rejects stale writes, including those from other nodes.

use crate::config::ServiceConfig;
use crate::error::{Result, StoreError};
use crate::timer::pause;
use async_trait::async_trait;
use carnelia_runtime::{Handler, KvClient, Request};
use carnelia_wire::{ErrorCode, RpcError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A store holding integers under string keys with atomic compare-and-swap.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Read `key`. [`StoreError::KeyDoesNotExist`] when it was never written.
    async fn read(&self, key: &str) -> Result<i64>;

    /// Replace `expected` with `new` at `key`, atomically.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        create_if_missing: bool,
    ) -> Result<()>;
}

#[async_trait]
impl CounterStore for KvClient {
    async fn read(&self, key: &str) -> Result<i64> {
        Ok(self.read_int(key).await?)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: i64,
        new: i64,
        create_if_missing: bool,
    ) -> Result<()> {
        Ok(KvClient::compare_and_swap(self, key, &expected, &new, create_if_missing).await?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterPayload {
    Add { delta: i64 },
    AddOk { delta: i64 },
    Read,
    ReadOk { value: i64 },
}

/// Serves `add` and `read` against a [`CounterStore`].
pub struct CounterService<S> {
    store: S,
    key: String,
    backoff: Duration,
    shutdown: CancellationToken,
    conflicts: AtomicU64,
}

impl<S: CounterStore> CounterService<S> {
    pub fn new(store: S, config: &ServiceConfig, shutdown: CancellationToken) -> Self {
        Self {
            store,
            key: config.counter_key.clone(),
            backoff: config.cas_backoff(),
            shutdown,
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Add `delta` to the counter. Returns how many CAS attempts it took.
    pub async fn increment(&self, delta: i64) -> Result<u32> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let current = self.current().await?;
            let candidate = current.checked_add(delta).ok_or_else(|| {
                StoreError::Failed(RpcError::new(
                    ErrorCode::Abort,
                    format!("{} + {} overflows", current, delta),
                ))
            })?;

            match self
                .store
                .compare_and_swap(&self.key, current, candidate, true)
                .await
            {
                Ok(()) => {
                    debug!(delta, from = current, to = candidate, attempts, "counter updated");
                    return Ok(attempts);
                }
                Err(StoreError::PreconditionFailed) => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(delta, expected = current, attempts, "lost CAS race, backing off");
                    if !pause(self.backoff, &self.shutdown).await {
                        return Err(StoreError::Cancelled);
                    }
                }
                Err(e) => {
                    warn!(delta, error = %e, "increment aborted");
                    return Err(e);
                }
            }
        }
    }

    /// The stored total.
    pub async fn read_total(&self) -> Result<i64> {
        self.current().await
    }

    /// CAS attempts that lost a race since startup.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    async fn current(&self) -> Result<i64> {
        match self.store.read(&self.key).await {
            Err(StoreError::KeyDoesNotExist) => Ok(0),
            other => other,
        }
    }
}

#[async_trait]
impl<S: CounterStore> Handler for CounterService<S> {
    async fn handle(&self, request: &Request) -> std::result::Result<(), RpcError> {
        match request.decode::<CounterPayload>()? {
            CounterPayload::Add { delta } => {
                self.increment(delta).await?;
                request.reply(&CounterPayload::AddOk { delta: 0 }).await
            }
            CounterPayload::Read => {
                let value = self.read_total().await?;
                request.reply(&CounterPayload::ReadOk { value }).await
            }
            CounterPayload::AddOk { .. } | CounterPayload::ReadOk { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carnelia_runtime::{Identity, Node, RuntimeConfig};
    use carnelia_wire::{Body, Message, NodeId};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    /// CAS store that yields between operations so concurrent increments
    /// interleave, and can be told to fail.
    #[derive(Default)]
    struct MemoryStore {
        value: Mutex<Option<i64>>,
        forced_conflicts: AtomicU32,
        read_error: Mutex<Option<StoreError>>,
        cas_error: Mutex<Option<StoreError>>,
        cas_calls: AtomicU32,
    }

    impl MemoryStore {
        fn with_conflicts(n: u32) -> Self {
            let store = Self::default();
            store.forced_conflicts.store(n, Ordering::SeqCst);
            store
        }

        fn value(&self) -> Option<i64> {
            *self.value.lock()
        }
    }

    #[async_trait]
    impl CounterStore for MemoryStore {
        async fn read(&self, _key: &str) -> Result<i64> {
            if let Some(e) = self.read_error.lock().clone() {
                return Err(e);
            }
            let value = *self.value.lock();
            tokio::task::yield_now().await;
            value.ok_or(StoreError::KeyDoesNotExist)
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            expected: i64,
            new: i64,
            create_if_missing: bool,
        ) -> Result<()> {
            self.cas_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.cas_error.lock().clone() {
                return Err(e);
            }
            let forced = self
                .forced_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced {
                return Err(StoreError::PreconditionFailed);
            }

            let mut value = self.value.lock();
            match *value {
                Some(current) if current == expected => {
                    *value = Some(new);
                    Ok(())
                }
                Some(_) => Err(StoreError::PreconditionFailed),
                None if create_if_missing => {
                    *value = Some(new);
                    Ok(())
                }
                None => Err(StoreError::KeyDoesNotExist),
            }
        }
    }

    fn service(store: MemoryStore) -> CounterService<MemoryStore> {
        CounterService::new(store, &ServiceConfig::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_increment_on_empty_store() {
        let counter = service(MemoryStore::default());

        assert_eq!(counter.read_total().await.unwrap(), 0);
        assert_eq!(counter.increment(5).await.unwrap(), 1);
        assert_eq!(counter.store().value(), Some(5));
        assert_eq!(counter.read_total().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_backs_off_and_retries() {
        let counter = service(MemoryStore::with_conflicts(2));
        let started = tokio::time::Instant::now();

        assert_eq!(counter.increment(3).await.unwrap(), 3);
        assert_eq!(counter.store().value(), Some(3));
        assert_eq!(counter.conflicts(), 2);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_increments_converge() {
        let counter = Arc::new(service(MemoryStore::with_conflicts(7)));

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move { counter.increment(1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(counter.read_total().await.unwrap(), 25);
        // Forced conflicts plus the races the yields provoke.
        assert!(counter.conflicts() >= 7);
    }

    #[tokio::test]
    async fn test_unexpected_read_error_aborts() {
        let store = MemoryStore::default();
        *store.read_error.lock() = Some(StoreError::Failed(RpcError::new(
            ErrorCode::Timeout,
            "seq-kv silent",
        )));
        let counter = service(store);

        let err = counter.increment(1).await.unwrap_err();
        assert!(matches!(err, StoreError::Failed(ref e) if e.code == ErrorCode::Timeout));
        assert_eq!(counter.store().cas_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unexpected_cas_error_aborts() {
        let store = MemoryStore::default();
        *store.cas_error.lock() = Some(StoreError::Failed(RpcError::crash("store crashed")));
        let counter = service(store);

        assert!(counter.increment(1).await.is_err());
        assert_eq!(counter.store().cas_calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.conflicts(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff() {
        let token = CancellationToken::new();
        token.cancel();
        let counter = CounterService::new(
            MemoryStore::with_conflicts(1),
            &ServiceConfig::default(),
            token,
        );

        assert_eq!(counter.increment(1).await, Err(StoreError::Cancelled));
        assert_eq!(counter.store().value(), None);
    }

    async fn roundtrip(
        node: &Node,
        outbound: &mut tokio::sync::mpsc::Receiver<Message>,
        body: Body,
    ) -> Message {
        node.dispatch(Message::new("c1", "n1", body));
        outbound.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_add_and_read_replies() {
        let node = Node::with_identity(
            RuntimeConfig::default(),
            Identity::new("n1", vec![NodeId::new("n1")]),
        );
        let mut outbound = node.take_outbound().unwrap();
        let counter = Arc::new(service(MemoryStore::default()));
        node.handle("add", counter.clone());
        node.handle("read", counter.clone());

        let reply = roundtrip(
            &node,
            &mut outbound,
            Body::new("add").with_msg_id(1).with_field("delta", 5),
        )
        .await;
        assert_eq!(
            reply.body.decode::<CounterPayload>().unwrap(),
            CounterPayload::AddOk { delta: 0 }
        );
        assert_eq!(reply.body.in_reply_to, Some(1));

        let reply = roundtrip(&node, &mut outbound, Body::new("read").with_msg_id(2)).await;
        assert_eq!(
            reply.body.decode::<CounterPayload>().unwrap(),
            CounterPayload::ReadOk { value: 5 }
        );
    }

    #[tokio::test]
    async fn test_store_failure_becomes_error_reply() {
        let node = Node::with_identity(
            RuntimeConfig::default(),
            Identity::new("n1", vec![NodeId::new("n1")]),
        );
        let mut outbound = node.take_outbound().unwrap();
        let store = MemoryStore::default();
        *store.read_error.lock() = Some(StoreError::Failed(RpcError::new(
            ErrorCode::TemporarilyUnavailable,
            "try later",
        )));
        node.handle("add", Arc::new(service(store)));

        let reply = roundtrip(
            &node,
            &mut outbound,
            Body::new("add").with_msg_id(1).with_field("delta", 1),
        )
        .await;
        assert_eq!(
            reply.body.failure().unwrap().code,
            ErrorCode::TemporarilyUnavailable
        );

        let reply = roundtrip(
            &node,
            &mut outbound,
            Body::new("add").with_msg_id(2).with_field("delta", "one"),
        )
        .await;
        assert_eq!(reply.body.failure().unwrap().code, ErrorCode::MalformedRequest);
    }
}
