//! Peer-to-peer message shapes

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{hex_bytes, PeerId, SessionId};
use crate::{Error, Result};

/// Protocol a transport message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    JoinParty,
    Keygen,
    Keysign,
    TaskDone,
}

/// Unit moved by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    pub session_id: SessionId,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

/// A transport message together with its transport-level sender
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: WrappedMessage,
}

/// Message emitted by a cryptographic round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub session_id: SessionId,
    /// Join attempt the message belongs to
    pub epoch: String,
    pub round_type: String,
    pub sender: PeerId,
    /// Sub-session the message belongs to
    pub moniker: String,
    pub is_broadcast: bool,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl RoundMessage {
    /// Hash peers compare when confirming a broadcast
    pub fn digest(&self) -> String {
        blake3::hash(&self.payload).to_hex().to_string()
    }

    pub fn confirm_key(&self) -> ConfirmKey {
        ConfirmKey {
            round_type: self.round_type.clone(),
            owner: self.sender.clone(),
            moniker: self.moniker.clone(),
        }
    }
}

/// Identifies one broadcast message across all parties
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmKey {
    pub round_type: String,
    pub owner: PeerId,
    pub moniker: String,
}

/// Echo of the hash a party received for someone's broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfirm {
    pub session_id: SessionId,
    pub epoch: String,
    pub confirmer: PeerId,
    pub key: ConfirmKey,
    pub hash: String,
}

/// Body of a session envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionPayload {
    Round(RoundMessage),
    Confirm(BroadcastConfirm),
    TaskDone {
        session_id: SessionId,
        epoch: String,
        sender: PeerId,
    },
}

impl SessionPayload {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Round(message) => &message.session_id,
            Self::Confirm(confirm) => &confirm.session_id,
            Self::TaskDone { session_id, .. } => session_id,
        }
    }

    pub fn epoch(&self) -> &str {
        match self {
            Self::Round(message) => &message.epoch,
            Self::Confirm(confirm) => &confirm.epoch,
            Self::TaskDone { epoch, .. } => epoch,
        }
    }
}

/// Join-session handshake messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinPartyMessage {
    /// Sender is online for the session
    Ready {
        session_id: SessionId,
        sender: PeerId,
        version: String,
        /// Random per join attempt, so a retry is told apart from
        /// leftovers of the previous attempt
        attempt: u64,
    },
    /// Leader's agreed party list
    PartyList {
        session_id: SessionId,
        leader: PeerId,
        /// Every ready peer the leader saw, with the attempt it saw
        ready: BTreeMap<PeerId, u64>,
        /// Selected peers, leader included
        members: BTreeMap<PeerId, u64>,
    },
}

/// Payload bytes signed by the sender's node key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    pub fn seal<T: Serialize>(payload: &T, key: &SigningKey) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        let signature = key.sign(&body).to_bytes().to_vec();
        Ok(Self { body, signature })
    }

    /// Verify the signature and decode the body
    pub fn open<T: DeserializeOwned>(&self, key: &VerifyingKey) -> Result<T> {
        let signature = ed25519_dalek::Signature::from_slice(&self.signature)
            .map_err(|e| Error::VerificationFailed(e.to_string()))?;
        key.verify(&self.body, &signature)
            .map_err(|e| Error::VerificationFailed(format!("envelope signature: {e}")))?;
        serde_json::from_slice(&self.body).map_err(|e| Error::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_envelope_seal_open() {
        let signer = key();
        let payload = SessionPayload::TaskDone {
            session_id: "s1".into(),
            epoch: "e1".into(),
            sender: PeerId::new("p1"),
        };
        let envelope = SignedEnvelope::seal(&payload, &signer).unwrap();
        let decoded = SignedEnvelope::decode(&envelope.encode().unwrap()).unwrap();

        let opened: SessionPayload = decoded.open(&signer.verifying_key()).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_envelope_rejects_other_key_and_tampering() {
        let signer = key();
        let payload = JoinPartyMessage::Ready {
            session_id: "s1".into(),
            sender: PeerId::new("p1"),
            version: "1".into(),
            attempt: 7,
        };
        let mut envelope = SignedEnvelope::seal(&payload, &signer).unwrap();
        assert!(envelope.open::<JoinPartyMessage>(&key().verifying_key()).is_err());

        envelope.body[0] ^= 1;
        assert!(envelope.open::<JoinPartyMessage>(&signer.verifying_key()).is_err());
    }
}
