//! Transport abstraction, subscription dispatch and peer coordination

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{PeerId, SessionId};
use crate::wire::{InboundMessage, MessageType, WrappedMessage};
use crate::Result;

pub use ::async_trait::async_trait;

pub mod coordinator;
pub mod memory;

pub use coordinator::{join_epoch, leader_node, JoinFailure, JoinRequest, JoinedParty, Leader, PartyCoordinator};
pub use memory::{MemoryNetwork, MemoryTransport};

/// Peer identity to network address mapping learned by a transport
pub type AddressBook = BTreeMap<PeerId, String>;

/// Sender half of a session's inbound queue
pub type InboundSender = mpsc::UnboundedSender<InboundMessage>;

/// Message transport used by the engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local node
    fn local_peer_id(&self) -> PeerId;

    /// Send a message to one peer
    async fn send(&self, to: &PeerId, message: &WrappedMessage) -> Result<()>;

    /// Send a message to every listed peer; individual failures are skipped
    async fn broadcast(&self, to: &[PeerId], message: &WrappedMessage) -> Result<()> {
        for peer in to {
            if let Err(e) = self.send(peer, message).await {
                warn!(peer = %peer, error = %e, "Broadcast delivery failed");
            }
        }
        Ok(())
    }

    /// Addresses of the peers this transport knows about
    fn export_peer_addresses(&self) -> AddressBook {
        AddressBook::new()
    }
}

type SubscriptionKey = (MessageType, SessionId);

/// Upper bound of buffered messages per unsubscribed session
const PENDING_LIMIT: usize = 1024;

#[derive(Default)]
struct DispatchTable {
    subscribers: HashMap<SubscriptionKey, InboundSender>,
    pending: HashMap<SubscriptionKey, VecDeque<(Instant, InboundMessage)>>,
    /// Recently cancelled keys; stragglers for them are dropped, not buffered
    closed: HashMap<SubscriptionKey, Instant>,
}

/// Routes inbound transport messages to the session subscribed to them.
///
/// Messages for a session that has not subscribed yet are buffered for a
/// limited time and replayed, in arrival order, on subscribe. Messages that
/// arrive after a session cancelled are discarded for the same period, so a
/// retry under the same session id never sees the previous attempt's traffic.
pub struct Dispatcher {
    table: Mutex<DispatchTable>,
    pending_ttl: Duration,
}

impl Dispatcher {
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(DispatchTable::default()),
            pending_ttl,
        }
    }

    /// Register the queue receiving `message_type` messages of `session_id`
    pub fn subscribe(&self, message_type: MessageType, session_id: &str, tx: InboundSender) {
        let key = (message_type, session_id.to_string());
        let mut table = self.table.lock();
        table.closed.remove(&key);
        if let Some(queued) = table.pending.remove(&key) {
            let ttl = self.pending_ttl;
            for (_, message) in queued.into_iter().filter(|(at, _)| at.elapsed() < ttl) {
                let _ = tx.send(message);
            }
        }
        table.subscribers.insert(key, tx);
    }

    /// Remove a subscription and its buffered messages; no-op when absent
    pub fn cancel_subscribe(&self, message_type: MessageType, session_id: &str) {
        let key = (message_type, session_id.to_string());
        let mut table = self.table.lock();
        if table.subscribers.remove(&key).is_some() {
            table.closed.insert(key.clone(), Instant::now());
        }
        table.pending.remove(&key);
    }

    /// Subscribe several message types at once; cancelled when the guard drops
    pub fn subscribe_guard(
        self: &Arc<Self>,
        message_types: &[MessageType],
        session_id: &str,
        tx: InboundSender,
    ) -> Subscription {
        for message_type in message_types {
            self.subscribe(*message_type, session_id, tx.clone());
        }
        Subscription {
            dispatcher: Arc::clone(self),
            keys: message_types
                .iter()
                .map(|t| (*t, session_id.to_string()))
                .collect(),
        }
    }

    pub fn is_subscribed(&self, message_type: MessageType, session_id: &str) -> bool {
        self.table
            .lock()
            .subscribers
            .contains_key(&(message_type, session_id.to_string()))
    }

    /// True when no session is subscribed
    pub fn is_empty(&self) -> bool {
        self.table.lock().subscribers.is_empty()
    }

    /// Hand an inbound message to its session, or buffer it
    pub fn dispatch(&self, message: InboundMessage) {
        let key = (message.message.message_type, message.message.session_id.clone());
        let mut table = self.table.lock();
        if let Some(tx) = table.subscribers.get(&key) {
            if tx.send(message).is_err() {
                debug!(session_id = %key.1, "Subscriber queue closed, dropping message");
                table.subscribers.remove(&key);
            }
            return;
        }

        let ttl = self.pending_ttl;
        table.closed.retain(|_, at| at.elapsed() < ttl);
        if table.closed.contains_key(&key) {
            debug!(session_id = %key.1, "Session already closed, dropping late message");
            return;
        }
        table.pending.retain(|_, queue| {
            queue.retain(|(at, _)| at.elapsed() < ttl);
            !queue.is_empty()
        });
        let queue = table.pending.entry(key).or_default();
        if queue.len() >= PENDING_LIMIT {
            queue.pop_front();
        }
        queue.push_back((Instant::now(), message));
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Keeps a session subscribed while alive
#[must_use = "dropping the guard cancels the subscription"]
pub struct Subscription {
    dispatcher: Arc<Dispatcher>,
    keys: Vec<SubscriptionKey>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for (message_type, session_id) in &self.keys {
            self.dispatcher.cancel_subscribe(*message_type, session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(message_type: MessageType, session_id: &str, payload: u8) -> InboundMessage {
        InboundMessage {
            from: PeerId::new("peer"),
            message: WrappedMessage {
                message_type,
                session_id: session_id.into(),
                payload: vec![payload],
            },
        }
    }

    #[test]
    fn test_cancel_without_subscribe_is_noop() {
        let dispatcher = Dispatcher::default();
        dispatcher.cancel_subscribe(MessageType::Keysign, "never");
        dispatcher.cancel_subscribe(MessageType::Keysign, "never");
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_subscribe_and_cancel() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keygen, "s1", tx);
        assert!(dispatcher.is_subscribed(MessageType::Keygen, "s1"));

        dispatcher.dispatch(inbound(MessageType::Keygen, "s1", 1));
        assert_eq!(rx.try_recv().unwrap().message.payload, vec![1]);

        dispatcher.cancel_subscribe(MessageType::Keygen, "s1");
        dispatcher.cancel_subscribe(MessageType::Keygen, "s1");
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_pending_messages_replayed_in_order() {
        let dispatcher = Dispatcher::default();
        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 1));
        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 2));
        dispatcher.dispatch(inbound(MessageType::Keysign, "other", 9));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keysign, "s1", tx);
        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 3));

        let received: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.message.payload[0])
            .collect();
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[test]
    fn test_expired_pending_messages_dropped() {
        let dispatcher = Dispatcher::new(Duration::ZERO);
        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 1));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keysign, "s1", tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_late_messages_not_replayed_into_retry() {
        let dispatcher = Dispatcher::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keysign, "s1", tx);
        dispatcher.cancel_subscribe(MessageType::Keysign, "s1");

        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 0xaa));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keysign, "s1", tx);
        assert!(rx.try_recv().is_err());

        // the fresh subscription receives live traffic again
        dispatcher.dispatch(inbound(MessageType::Keysign, "s1", 1));
        assert_eq!(rx.try_recv().unwrap().message.payload, vec![1]);
    }

    #[test]
    fn test_closed_key_buffers_again_after_ttl() {
        let dispatcher = Dispatcher::new(Duration::from_millis(20));
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keygen, "s1", tx);
        dispatcher.cancel_subscribe(MessageType::Keygen, "s1");
        std::thread::sleep(Duration::from_millis(30));

        dispatcher.dispatch(inbound(MessageType::Keygen, "s1", 4));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keygen, "s1", tx);
        assert_eq!(rx.try_recv().unwrap().message.payload, vec![4]);
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let _guard = dispatcher.subscribe_guard(
                &[MessageType::Keysign, MessageType::TaskDone],
                "s1",
                tx,
            );
            assert!(dispatcher.is_subscribed(MessageType::TaskDone, "s1"));
        }
        assert!(dispatcher.is_empty());
    }
}
