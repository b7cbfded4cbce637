//! Keysign round payloads

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oblivious::MtaResponse;
use crate::protocol::RoundInfo;
use crate::types::{hex_bytes, hex_vec};

pub const ECDSA_ROUND1_COMMIT: &str = "ECDSASignRound1Commit";
pub const ECDSA_ROUND1_OT_REQUEST: &str = "ECDSASignRound1OtRequest";
pub const ECDSA_ROUND2_OT_RESPONSE: &str = "ECDSASignRound2OtResponse";
pub const ECDSA_ROUND3_DELTA: &str = "ECDSASignRound3Delta";
pub const ECDSA_ROUND4_DECOMMIT: &str = "ECDSASignRound4Decommit";
pub const ECDSA_ROUND5_PARTIAL: &str = "ECDSASignRound5PartialSignature";

pub const ECDSA_ROUNDS: &[RoundInfo] = &[
    RoundInfo::broadcast(ECDSA_ROUND1_COMMIT),
    RoundInfo::unicast(ECDSA_ROUND1_OT_REQUEST),
    RoundInfo::unicast(ECDSA_ROUND2_OT_RESPONSE),
    RoundInfo::broadcast(ECDSA_ROUND3_DELTA),
    RoundInfo::broadcast(ECDSA_ROUND4_DECOMMIT),
    RoundInfo::broadcast(ECDSA_ROUND5_PARTIAL),
];

pub const EDDSA_ROUND1_COMMIT: &str = "EDDSASignRound1Commit";
pub const EDDSA_ROUND2_DECOMMIT: &str = "EDDSASignRound2Decommit";
pub const EDDSA_ROUND3_PARTIAL: &str = "EDDSASignRound3PartialSignature";

pub const EDDSA_ROUNDS: &[RoundInfo] = &[
    RoundInfo::broadcast(EDDSA_ROUND1_COMMIT),
    RoundInfo::broadcast(EDDSA_ROUND2_DECOMMIT),
    RoundInfo::broadcast(EDDSA_ROUND3_PARTIAL),
];

/// Hash commitment to a nonce point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMessage {
    #[serde(with = "hex_bytes")]
    pub commitment: Vec<u8>,
}

/// Opening of a [`CommitMessage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommitMessage {
    #[serde(with = "hex_bytes")]
    pub point: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub blind: Vec<u8>,
}

/// OT choices for both multiplications against the recipient's `k`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtRequestMessage {
    #[serde(with = "hex_vec")]
    pub requests: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtResponseMessage {
    pub response: MtaResponse,
}

/// A single scalar: delta share or partial signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarMessage {
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// Commitment binding a party's nonce point to the sub-session
pub fn commitment_digest(session_id: &str, index: usize, point: &[u8], blind: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update((index as u64).to_be_bytes());
    hasher.update(point);
    hasher.update(blind);
    hasher.finalize().to_vec()
}
