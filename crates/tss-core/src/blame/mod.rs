//! Failure attribution for aborted sessions

use serde::{Deserialize, Serialize};

use crate::types::hex_bytes;

mod manager;

pub use manager::BlameManager;

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    /// A round stalled
    Timeout,
    /// A peer never supplied a required share
    MissingShare,
    /// A peer's contribution failed verification
    InvalidProof,
    /// Peers failed to join the session
    SyncFailure,
    /// A peer sent different broadcast payloads to different parties
    HashCheckFail,
    /// The final output did not validate
    VerificationFailed,
    /// Local failure with no one to blame
    Internal,
}

/// One accused participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNode {
    /// Participant key string of the accused node
    pub pub_key: String,
    /// Offending message body, when available
    #[serde(with = "hex_bytes", default)]
    pub blame_data: Vec<u8>,
    /// The accused node's signature over `blame_data`
    #[serde(with = "hex_bytes", default)]
    pub blame_signature: Vec<u8>,
}

impl BlameNode {
    pub fn new(pub_key: impl Into<String>) -> Self {
        Self {
            pub_key: pub_key.into(),
            ..Self::default()
        }
    }

    pub fn with_evidence(pub_key: impl Into<String>, data: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            pub_key: pub_key.into(),
            blame_data: data,
            blame_signature: signature,
        }
    }
}

/// Attribution attached to every keygen/keysign response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: Option<FailReason>,
    pub is_unicast: bool,
    /// Round that was in flight, when known
    #[serde(default)]
    pub round: String,
    pub blame_nodes: Vec<BlameNode>,
}

impl Blame {
    pub fn new(fail_reason: FailReason, blame_nodes: Vec<BlameNode>) -> Self {
        Self {
            fail_reason: Some(fail_reason),
            blame_nodes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_none() && self.blame_nodes.is_empty()
    }

    pub fn set_blame(
        &mut self,
        fail_reason: FailReason,
        blame_nodes: Vec<BlameNode>,
        is_unicast: bool,
        round: impl Into<String>,
    ) {
        self.fail_reason = Some(fail_reason);
        self.blame_nodes = blame_nodes;
        self.is_unicast = is_unicast;
        self.round = round.into();
    }

    /// Add accused nodes, skipping ones already present
    pub fn add_blame_nodes(&mut self, nodes: impl IntoIterator<Item = BlameNode>) {
        for node in nodes {
            if !self.already_blamed(&node.pub_key) {
                self.blame_nodes.push(node);
            }
        }
    }

    pub fn already_blamed(&self, pub_key: &str) -> bool {
        self.blame_nodes.iter().any(|n| n.pub_key == pub_key)
    }

    /// Participant keys of the accused nodes
    pub fn accused(&self) -> Vec<&str> {
        self.blame_nodes.iter().map(|n| n.pub_key.as_str()).collect()
    }
}
