//! Request/response correlation.
//!
//! Every outbound request gets a fresh `msg_id` and a one-shot slot in the
//! [`CallTable`]. The dispatch loop resolves the slot when a message with the
//! matching `in_reply_to` arrives. The [`PendingCall`] guard releases its
//! slot when dropped, so a request that never gets an answer (timeout, or the
//! caller giving up) does not leak an entry.

use carnelia_wire::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub(crate) struct CallTable {
    next_msg_id: AtomicU64,
    slots: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self {
            next_msg_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a message id. Shared by requests and replies.
    pub(crate) fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve a slot for the reply to a new request.
    pub(crate) fn register(self: &Arc<Self>) -> PendingCall {
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(msg_id, tx);
        PendingCall {
            msg_id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Hand a reply to whoever is waiting for it. Gives the message back when
    /// nobody is.
    pub(crate) fn resolve(&self, message: Message) -> Result<(), Message> {
        let Some(msg_id) = message.body.in_reply_to else {
            return Err(message);
        };
        let slot = self.slots.lock().remove(&msg_id);
        match slot {
            // The waiter may have given up between the lookup and the send.
            Some(tx) => {
                let _ = tx.send(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    fn forget(&self, msg_id: u64) {
        self.slots.lock().remove(&msg_id);
    }
}

/// A reserved reply slot.
pub(crate) struct PendingCall {
    msg_id: u64,
    rx: oneshot::Receiver<Message>,
    table: Arc<CallTable>,
}

impl PendingCall {
    pub(crate) fn msg_id(&self) -> u64 {
        self.msg_id
    }

    /// Wait for the reply. `None` on timeout.
    pub(crate) async fn wait(mut self, timeout: Duration) -> Option<Message> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(message)) => Some(message),
            // Elapsed, or the sender was dropped.
            _ => None,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.forget(self.msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carnelia_wire::Body;

    fn reply_to(msg_id: u64) -> Message {
        Message::new("n2", "n1", Body::new("broadcast_ok").in_reply_to(msg_id))
    }

    #[test]
    fn test_message_ids_are_unique_and_increasing() {
        let table = Arc::new(CallTable::new());
        let a = table.next_msg_id();
        let b = table.register();
        let c = table.next_msg_id();

        assert!(a < b.msg_id());
        assert!(b.msg_id() < c);
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let table = Arc::new(CallTable::new());
        let call = table.register();
        let id = call.msg_id();

        assert!(table.resolve(reply_to(id)).is_ok());
        let reply = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.body.in_reply_to, Some(id));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_returned() {
        let table = Arc::new(CallTable::new());
        assert!(table.resolve(reply_to(99)).is_err());

        let unsolicited = Message::new("n2", "n1", Body::new("broadcast_ok"));
        assert!(table.resolve(unsolicited).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let table = Arc::new(CallTable::new());
        let call = table.register();
        let id = call.msg_id();
        assert_eq!(table.in_flight(), 1);

        assert!(call.wait(Duration::from_millis(50)).await.is_none());
        assert_eq!(table.in_flight(), 0);
        // A late reply finds nobody waiting.
        assert!(table.resolve(reply_to(id)).is_err());
    }

    #[test]
    fn test_dropped_call_releases_slot() {
        let table = Arc::new(CallTable::new());
        {
            let _call = table.register();
            assert_eq!(table.in_flight(), 1);
        }
        assert_eq!(table.in_flight(), 0);
    }
}
