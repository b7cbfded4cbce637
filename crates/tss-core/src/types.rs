//! Core types shared by the coordination engine

use k256::ecdsa;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Identifier scoping one keygen or keysign attempt
pub type SessionId = String;

/// Signing algorithm of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgo {
    /// ECDSA over secp256k1
    Secp256k1,
    /// EdDSA over ed25519
    Ed25519,
}

impl SigningAlgo {
    /// Every supported algorithm, in multi-algorithm keygen order
    pub const ALL: [SigningAlgo; 2] = [SigningAlgo::Secp256k1, SigningAlgo::Ed25519];

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgo::Secp256k1 => "secp256k1",
            SigningAlgo::Ed25519 => "ed25519",
        }
    }
}

impl fmt::Display for SigningAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "secp256k1" | "ecdsa" => Ok(SigningAlgo::Secp256k1),
            "ed25519" | "eddsa" => Ok(SigningAlgo::Ed25519),
            other => Err(Error::InvalidRequest(format!("unknown algorithm {other}"))),
        }
    }
}

/// Outcome reported on every keygen/keysign response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

/// Transport-level identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signature produced for one message of a keysign batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signature {
    /// ECDSA signature (r, s) with recovery id
    Ecdsa {
        #[serde(with = "hex_bytes")]
        r: Vec<u8>,
        #[serde(with = "hex_bytes")]
        s: Vec<u8>,
        recovery_id: u8,
    },
    /// Raw 64-byte ed25519 signature (R || S)
    Eddsa {
        #[serde(with = "hex_bytes")]
        raw: Vec<u8>,
    },
}

impl Signature {
    /// Convert to bytes (r || s, or the raw EdDSA encoding)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Signature::Ecdsa { r, s, .. } => {
                let mut bytes = Vec::with_capacity(r.len() + s.len());
                bytes.extend_from_slice(r);
                bytes.extend_from_slice(s);
                bytes
            }
            Signature::Eddsa { raw } => raw.clone(),
        }
    }

    /// Convert an ECDSA signature to DER format
    pub fn to_der(&self) -> Result<Vec<u8>> {
        match self {
            Signature::Ecdsa { r, s, .. } => {
                let field_bytes = |bytes: &[u8]| -> Result<k256::FieldBytes> {
                    let array: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| Error::InvalidRequest("ECDSA scalars must be 32 bytes".into()))?;
                    Ok(k256::FieldBytes::from(array))
                };
                let sig = ecdsa::Signature::from_scalars(field_bytes(r.as_slice())?, field_bytes(s.as_slice())?)
                    .map_err(|e| Error::Crypto(e.to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            Signature::Eddsa { .. } => {
                Err(Error::InvalidRequest("DER encoding only applies to ECDSA".into()))
            }
        }
    }

    /// Algorithm this signature belongs to
    pub fn algo(&self) -> SigningAlgo {
        match self {
            Signature::Ecdsa { .. } => SigningAlgo::Secp256k1,
            Signature::Eddsa { .. } => SigningAlgo::Ed25519,
        }
    }
}

/// A signature together with the message it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,
    pub signature: Signature,
}

/// Serialize byte vectors as hex strings
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize a list of byte vectors as a list of hex strings
pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
