//! Message Relay Library
//!
//! Store-and-forward mailbox used to move TSS messages between nodes that
//! cannot reach each other directly. Every peer owns an inbox; senders post
//! into it and the owner drains it. Messages expire after a TTL, and an
//! identical message still waiting in an inbox is not queued twice.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Inbox full: {0}")]
    InboxFull(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Queued message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Uuid,
    /// Sender peer ID
    pub from: String,
    /// Recipient peer ID
    pub to: String,
    pub payload: Vec<u8>,
    /// blake3 of sender, recipient and payload
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RelayMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Compute the duplicate-suppression digest of a message
pub fn message_digest(from: &str, to: &str, payload: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_bytes());
    hasher.update(&[0]);
    hasher.update(to.as_bytes());
    hasher.update(&[0]);
    hasher.update(payload);
    hex::encode(hasher.finalize().as_bytes())
}

/// Per-peer message queues
#[derive(Clone)]
pub struct Mailbox {
    inboxes: Arc<DashMap<String, VecDeque<RelayMessage>>>,
    ttl: chrono::Duration,
    max_pending: usize,
}

impl Mailbox {
    /// Create a mailbox whose messages live `ttl_seconds` and whose inboxes
    /// hold at most `max_pending` messages
    pub fn new(ttl_seconds: i64, max_pending: usize) -> Self {
        Self {
            inboxes: Arc::new(DashMap::new()),
            ttl: chrono::Duration::seconds(ttl_seconds),
            max_pending,
        }
    }

    /// Queue a message for `to`.
    ///
    /// Returns `None` when an identical message is already waiting.
    pub fn put(&self, from: &str, to: &str, payload: Vec<u8>) -> Result<Option<Uuid>> {
        if from.is_empty() || to.is_empty() {
            return Err(RelayError::InvalidFormat("sender and recipient are required".into()));
        }
        if payload.is_empty() {
            return Err(RelayError::InvalidFormat("empty payload".into()));
        }

        let now = Utc::now();
        let digest = message_digest(from, to, &payload);
        let mut inbox = self.inboxes.entry(to.to_string()).or_default();
        inbox.retain(|m| !m.is_expired(now));

        if inbox.iter().any(|m| m.digest == digest) {
            debug!(from, to, "Duplicate message suppressed");
            return Ok(None);
        }
        if inbox.len() >= self.max_pending {
            return Err(RelayError::InboxFull(to.to_string()));
        }

        let id = Uuid::new_v4();
        inbox.push_back(RelayMessage {
            id,
            from: from.to_string(),
            to: to.to_string(),
            payload,
            digest,
            created_at: now,
            expires_at: now + self.ttl,
        });
        Ok(Some(id))
    }

    /// Remove and return every live message for `peer`, oldest first
    pub fn drain(&self, peer: &str) -> Vec<RelayMessage> {
        let now = Utc::now();
        self.inboxes
            .remove(peer)
            .map(|(_, queue)| queue.into_iter().filter(|m| !m.is_expired(now)).collect())
            .unwrap_or_default()
    }

    /// Number of live messages waiting for `peer`
    pub fn pending(&self, peer: &str) -> usize {
        let now = Utc::now();
        self.inboxes
            .get(peer)
            .map(|queue| queue.iter().filter(|m| !m.is_expired(now)).count())
            .unwrap_or(0)
    }

    /// Drop expired messages and empty inboxes; returns the number removed
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.inboxes.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|m| !m.is_expired(now));
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new(300, 4096)
    }
}

/// JSON bodies exchanged with the relay service
pub mod api {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// `POST /v1/msg`
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PostMessageRequest {
        pub from: String,
        pub to: String,
        /// base64 encoded
        pub payload: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PostMessageResponse {
        /// `None` when the message was a pending duplicate
        pub id: Option<Uuid>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InboxMessage {
        pub id: Uuid,
        pub from: String,
        /// base64 encoded
        pub payload: String,
    }

    /// `GET /v1/inbox/:peer`
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct InboxResponse {
        pub messages: Vec<InboxMessage>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_drain() {
        let mailbox = Mailbox::default();
        mailbox.put("a", "b", vec![1]).unwrap().unwrap();
        mailbox.put("c", "b", vec![2]).unwrap().unwrap();
        assert_eq!(mailbox.pending("b"), 2);
        assert_eq!(mailbox.pending("a"), 0);

        let drained = mailbox.drain("b");
        assert_eq!(drained.iter().map(|m| m.payload[0]).collect::<Vec<_>>(), vec![1, 2]);
        assert!(mailbox.drain("b").is_empty());
    }

    #[test]
    fn test_duplicate_suppressed_while_pending() {
        let mailbox = Mailbox::default();
        assert!(mailbox.put("a", "b", vec![7]).unwrap().is_some());
        assert!(mailbox.put("a", "b", vec![7]).unwrap().is_none());
        assert_eq!(mailbox.drain("b").len(), 1);

        // delivered messages may be sent again
        assert!(mailbox.put("a", "b", vec![7]).unwrap().is_some());
    }

    #[test]
    fn test_expiry_and_limits() {
        let expired = Mailbox::new(0, 10);
        expired.put("a", "b", vec![1]).unwrap();
        assert_eq!(expired.pending("b"), 0);
        assert_eq!(expired.cleanup(), 1);

        let small = Mailbox::new(60, 1);
        small.put("a", "b", vec![1]).unwrap();
        assert!(matches!(small.put("a", "b", vec![2]), Err(RelayError::InboxFull(_))));
        assert!(small.put("", "b", vec![1]).is_err());
        assert!(small.put("a", "b", Vec::new()).is_err());
    }
}
