//! In-memory transport for tests and single-process demos

use super::{async_trait, AddressBook, Dispatcher, Transport};
use crate::types::PeerId;
use crate::wire::{InboundMessage, WrappedMessage};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Decides whether a message from `from` to `to` is delivered
pub type DeliveryFilter = dyn Fn(&PeerId, &PeerId, &WrappedMessage) -> bool + Send + Sync;

/// A set of nodes connected in-process
pub struct MemoryNetwork {
    /// Inbound dispatcher of every registered node
    nodes: DashMap<PeerId, Arc<Dispatcher>>,
    /// Optional fault injection
    filter: RwLock<Option<Arc<DeliveryFilter>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            filter: RwLock::new(None),
        })
    }

    /// Attach a node; its inbound messages go to `dispatcher`
    pub fn register(self: &Arc<Self>, peer_id: PeerId, dispatcher: Arc<Dispatcher>) -> MemoryTransport {
        self.nodes.insert(peer_id.clone(), dispatcher);
        MemoryTransport {
            peer_id,
            network: Arc::clone(self),
        }
    }

    /// Detach a node; messages to it fail from now on
    pub fn disconnect(&self, peer_id: &PeerId) {
        self.nodes.remove(peer_id);
    }

    /// Drop every message for which `filter` returns false
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&PeerId, &PeerId, &WrappedMessage) -> bool + Send + Sync + 'static,
    {
        *self.filter.write() = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.write() = None;
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, message: &WrappedMessage) -> Result<()> {
        let filter = self.filter.read().clone();
        if let Some(filter) = filter {
            if !filter(from, to, message) {
                trace!(from = %from, to = %to, "Message dropped by filter");
                return Ok(());
            }
        }

        let dispatcher = self
            .nodes
            .get(to)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Transport(format!("unknown peer {to}")))?;
        dispatcher.dispatch(InboundMessage {
            from: from.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    peer_id: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn send(&self, to: &PeerId, message: &WrappedMessage) -> Result<()> {
        self.network.deliver(&self.peer_id, to, message)
    }

    fn export_peer_addresses(&self) -> AddressBook {
        self.network
            .nodes
            .iter()
            .filter(|entry| entry.key() != &self.peer_id)
            .map(|entry| (entry.key().clone(), format!("memory://{}", entry.key())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageType;
    use tokio::sync::mpsc;

    fn message(payload: u8) -> WrappedMessage {
        WrappedMessage {
            message_type: MessageType::Keygen,
            session_id: "s1".into(),
            payload: vec![payload],
        }
    }

    #[tokio::test]
    async fn test_broadcast() {
        let network = MemoryNetwork::new();
        let mut receivers = Vec::new();
        let mut transports = Vec::new();
        for i in 0..3 {
            let dispatcher = Arc::new(Dispatcher::default());
            let (tx, rx) = mpsc::unbounded_channel();
            dispatcher.subscribe(MessageType::Keygen, "s1", tx);
            receivers.push(rx);
            transports.push(network.register(PeerId::new(format!("p{i}")), dispatcher));
        }

        let peers = vec![PeerId::new("p1"), PeerId::new("p2")];
        transports[0].broadcast(&peers, &message(42)).await.unwrap();

        for rx in receivers.iter_mut().skip(1) {
            let inbound = rx.try_recv().unwrap();
            assert_eq!(inbound.from, PeerId::new("p0"));
            assert_eq!(inbound.message.payload, vec![42]);
        }
        assert!(receivers[0].try_recv().is_err());
        assert_eq!(transports[0].export_peer_addresses().len(), 2);
    }

    #[tokio::test]
    async fn test_direct_and_filter() {
        let network = MemoryNetwork::new();
        let dispatcher = Arc::new(Dispatcher::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(MessageType::Keygen, "s1", tx);
        let a = network.register(PeerId::new("a"), Arc::new(Dispatcher::default()));
        network.register(PeerId::new("b"), dispatcher);

        a.send(&PeerId::new("b"), &message(100)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().message.payload, vec![100]);

        network.set_filter(|from, _, _| from.as_str() != "a");
        a.send(&PeerId::new("b"), &message(101)).await.unwrap();
        assert!(rx.try_recv().is_err());

        network.clear_filter();
        assert!(a.send(&PeerId::new("nobody"), &message(1)).await.is_err());
    }
}
