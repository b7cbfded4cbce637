//! Key strings, identities, thresholds and session identifiers

use digest::Digest;
use ed25519_dalek::VerifyingKey;
use ripemd::Ripemd160;
use sha2::Sha256;
use std::cmp::Ordering;

use crate::types::{PeerId, SigningAlgo};
use crate::{Error, Result};

/// Version byte of secp256k1 pool addresses
const SECP256K1_ADDRESS_VERSION: u8 = 0x00;
/// Version byte of ed25519 pool addresses
const ED25519_ADDRESS_VERSION: u8 = 0x0d;

/// Maximum number of faulty parties tolerated for `n` parties.
///
/// Signing needs `threshold + 1` cooperating parties.
pub fn threshold(n: usize) -> Result<usize> {
    if n == 0 {
        return Err(Error::InvalidConfig("party count must be positive".into()));
    }
    Ok((2 * n + 2) / 3 - 1)
}

/// Render a public key as `<algo>:<base58>`
pub fn encode_pub_key(algo: SigningAlgo, key: &[u8]) -> String {
    format!("{}:{}", algo.as_str(), bs58::encode(key).into_string())
}

/// Parse a `<algo>:<base58>` public key string
pub fn decode_pub_key(pub_key: &str) -> Result<(SigningAlgo, Vec<u8>)> {
    let (tag, body) = pub_key
        .split_once(':')
        .ok_or_else(|| Error::InvalidRequest(format!("public key without type tag: {pub_key}")))?;
    let algo = match tag {
        "secp256k1" => SigningAlgo::Secp256k1,
        "ed25519" => SigningAlgo::Ed25519,
        other => return Err(Error::InvalidRequest(format!("unknown key type {other}"))),
    };
    let bytes = bs58::decode(body)
        .into_vec()
        .map_err(|e| Error::InvalidRequest(format!("invalid base58 key: {e}")))?;
    let expected = match algo {
        SigningAlgo::Secp256k1 => 33,
        SigningAlgo::Ed25519 => 32,
    };
    if bytes.len() != expected {
        return Err(Error::InvalidRequest(format!(
            "{algo} key must be {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok((algo, bytes))
}

/// Public key string of a node identity key
pub fn node_pub_key(key: &VerifyingKey) -> String {
    encode_pub_key(SigningAlgo::Ed25519, key.as_bytes())
}

/// Node identity key behind a participant key string
pub fn node_verifying_key(pub_key: &str) -> Result<VerifyingKey> {
    let (algo, bytes) = decode_pub_key(pub_key)?;
    if algo != SigningAlgo::Ed25519 {
        return Err(Error::InvalidRequest(format!(
            "participant keys must be ed25519 node keys: {pub_key}"
        )));
    }
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidRequest("invalid node key length".into()))?;
    VerifyingKey::from_bytes(&raw).map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Transport identity derived from a participant key string
pub fn peer_id_from_pub_key(pub_key: &str) -> Result<PeerId> {
    let (_, bytes) = decode_pub_key(pub_key)?;
    Ok(PeerId::new(bs58::encode(Sha256::digest(&bytes)).into_string()))
}

/// Base58check address of a group public key
pub fn pool_address(algo: SigningAlgo, key: &[u8]) -> String {
    let (version, payload): (u8, Vec<u8>) = match algo {
        SigningAlgo::Secp256k1 => (
            SECP256K1_ADDRESS_VERSION,
            Ripemd160::digest(Sha256::digest(key)).to_vec(),
        ),
        SigningAlgo::Ed25519 => (ED25519_ADDRESS_VERSION, Sha256::digest(key)[..20].to_vec()),
    };
    let mut data = Vec::with_capacity(25);
    data.push(version);
    data.extend_from_slice(&payload);
    let checksum = Sha256::digest(Sha256::digest(&data));
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

/// Compare two byte strings as unsigned big-endian integers
pub fn compare_big_endian(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Total order on messages: big-endian value, then length, then raw bytes.
///
/// Distinct messages with the same value (`[5]` and `[0, 5]`) never compare
/// equal, so two independently sorted lists line up entry by entry.
pub fn compare_messages(a: &[u8], b: &[u8]) -> Ordering {
    compare_big_endian(a, b)
        .then_with(|| a.len().cmp(&b.len()))
        .then_with(|| a.cmp(b))
}

/// Sort messages in descending [`compare_messages`] order
pub fn sort_messages_desc(messages: &mut [Vec<u8>]) {
    messages.sort_by(|a, b| compare_messages(b, a));
}

/// Moniker of the signing sub-session for one message of a batch
pub fn message_moniker(message: &[u8], position: usize) -> String {
    format!("{}:{position}", hex::encode(Sha256::digest(message)))
}

/// Session identifier of a keygen request
pub fn keygen_session_id(participant_keys: &[String], block_height: i64) -> String {
    let mut keys = participant_keys.to_vec();
    keys.sort();
    let mut hasher = Sha256::new();
    hasher.update(keys.join(",").as_bytes());
    hasher.update(block_height.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Session identifier of a keysign request, independent of message order
pub fn keysign_session_id(messages: &[Vec<u8>], pool_pub_key: &str, participant_keys: &[String]) -> String {
    let mut sorted = messages.to_vec();
    sort_messages_desc(&mut sorted);
    let mut keys = participant_keys.to_vec();
    keys.sort();

    let mut hasher = Sha256::new();
    for message in &sorted {
        hasher.update((message.len() as u64).to_be_bytes());
        hasher.update(message);
    }
    hasher.update(pool_pub_key.as_bytes());
    hasher.update(keys.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-algorithm sub-session of a multi-algorithm keygen
pub fn algo_session_id(session_id: &str, algo: SigningAlgo) -> String {
    format!("{session_id}{algo}")
}
