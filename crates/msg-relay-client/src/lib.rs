//! Message Relay Client
//!
//! [`Transport`] implementation over the message relay service, plus the
//! inbox poller that feeds received messages into a node's dispatcher.

use msg_relay::api::{InboxResponse, PostMessageRequest};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use tss_core::mpc::async_trait;
use tss_core::signal::Signal;
use tss_core::{AddressBook, Dispatcher, Error, InboundMessage, PeerId, Result, Transport, WrappedMessage};

/// HTTP-based relay transport
#[derive(Clone)]
pub struct RelayTransport {
    /// HTTP client
    client: Client,
    /// Relay service URL
    url: String,
    /// This node's transport identity
    peer_id: PeerId,
    /// Request timeout
    timeout: Duration,
}

impl RelayTransport {
    pub fn new(url: &str, peer_id: PeerId) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            peer_id,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch and remove every message waiting for this node
    #[instrument(skip(self), fields(peer = %self.peer_id))]
    pub async fn fetch_inbox(&self) -> Result<Vec<InboundMessage>> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let response = self
            .client
            .get(format!("{}/v1/inbox/{}", self.url, self.peer_id))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "GET inbox failed with status: {}",
                response.status()
            )));
        }

        let inbox: InboxResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut messages = Vec::with_capacity(inbox.messages.len());
        for item in inbox.messages {
            let decoded = STANDARD
                .decode(&item.payload)
                .map_err(|e| Error::Deserialization(e.to_string()))
                .and_then(|bytes| Ok(serde_json::from_slice::<WrappedMessage>(&bytes)?));
            match decoded {
                Ok(message) => messages.push(InboundMessage {
                    from: PeerId::new(item.from),
                    message,
                }),
                Err(e) => warn!(id = %item.id, error = %e, "Dropping undecodable relay message"),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn send(&self, to: &PeerId, message: &WrappedMessage) -> Result<()> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let req = PostMessageRequest {
            from: self.peer_id.to_string(),
            to: to.to_string(),
            payload: STANDARD.encode(serde_json::to_vec(message)?),
        };

        let response = self
            .client
            .post(format!("{}/v1/msg", self.url))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "POST failed with status: {}",
                response.status()
            )));
        }

        debug!(to = %to, session_id = %message.session_id, "Message posted");
        Ok(())
    }

    fn export_peer_addresses(&self) -> AddressBook {
        let mut book = AddressBook::new();
        book.insert(self.peer_id.clone(), self.url.clone());
        book
    }
}

/// Poll the relay inbox every `interval` and dispatch what arrives, until
/// `stop` fires
pub fn spawn_inbox_poller(
    transport: RelayTransport,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    stop: Signal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.fired() => break,
                _ = ticker.tick() => {
                    match transport.fetch_inbox().await {
                        Ok(messages) => {
                            for message in messages {
                                dispatcher.dispatch(message);
                            }
                        }
                        Err(e) => debug!(error = %e, "Inbox poll failed"),
                    }
                }
            }
        }
        debug!(peer = %transport.peer_id, "Inbox poller stopped");
    })
}
