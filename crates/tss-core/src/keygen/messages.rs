//! Keygen round payloads

use serde::{Deserialize, Serialize};

use crate::protocol::RoundInfo;
use crate::types::{hex_bytes, hex_vec};

pub const KG_ROUND1_COMMITMENTS: &str = "KGRound1Commitments";
pub const KG_ROUND2_SHARE: &str = "KGRound2Share";
pub const KG_ROUND3_PUBLIC_SHARE: &str = "KGRound3PublicShare";

/// Keygen round schedule
pub const KEYGEN_ROUNDS: &[RoundInfo] = &[
    RoundInfo::broadcast(KG_ROUND1_COMMITMENTS),
    RoundInfo::unicast(KG_ROUND2_SHARE),
    RoundInfo::broadcast(KG_ROUND3_PUBLIC_SHARE),
];

/// Round 1: Feldman commitments, proof of knowledge of the constant term and
/// the ECDSA pre-parameter public key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgRound1Message {
    #[serde(with = "hex_vec")]
    pub commitments: Vec<Vec<u8>>,
    #[serde(with = "hex_bytes")]
    pub proof_nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub proof_response: Vec<u8>,
    /// Empty for EdDSA keys
    #[serde(default, with = "hex_bytes")]
    pub ot_public: Vec<u8>,
}

/// Round 2: the recipient's evaluation of the sender's polynomial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgRound2Message {
    #[serde(with = "hex_bytes")]
    pub share: Vec<u8>,
}

/// Round 3: the sender's view of the group key and its own public share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgRound3Message {
    #[serde(with = "hex_bytes")]
    pub pub_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub public_share: Vec<u8>,
}
