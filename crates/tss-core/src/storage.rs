//! Keygen output and the pluggable store it is persisted through

use dashmap::DashMap;
use elliptic_curve::Group;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ciphersuite::{lagrange_coefficient, Ciphersuite, Ed25519, Secp256k1};
use crate::conversion;
use crate::keygen::DkgOutput;
use crate::mpc::AddressBook;
use crate::types::{hex_bytes, SigningAlgo};
use crate::{Error, Result};

/// Per-party output of a successful keygen
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LocalState {
    #[zeroize(skip)]
    pub algo: SigningAlgo,
    /// Group public key, `<algo>:<base58>`
    pub pub_key: String,
    /// Node key of the owner
    pub local_party_key: String,
    /// Sorted keygen participants
    pub participant_keys: Vec<String>,
    pub index: usize,
    pub threshold: usize,
    #[serde(with = "hex_bytes")]
    pub secret_share: Vec<u8>,
    #[zeroize(skip)]
    #[serde(with = "hex_map")]
    pub public_shares: BTreeMap<usize, Vec<u8>>,
    /// ECDSA pre-parameter secret, empty for EdDSA
    #[serde(default, with = "hex_bytes")]
    pub ot_secret: Vec<u8>,
    #[zeroize(skip)]
    #[serde(default, with = "hex_map")]
    pub ot_public_keys: BTreeMap<usize, Vec<u8>>,
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState")
            .field("algo", &self.algo)
            .field("pub_key", &self.pub_key)
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl LocalState {
    pub fn from_dkg(
        algo: SigningAlgo,
        output: &DkgOutput,
        local_party_key: &str,
        participant_keys: &[String],
        ot_secret: Vec<u8>,
    ) -> Self {
        let mut keys = participant_keys.to_vec();
        keys.sort();
        keys.dedup();
        Self {
            algo,
            pub_key: conversion::encode_pub_key(algo, &output.pub_key),
            local_party_key: local_party_key.to_string(),
            participant_keys: keys,
            index: output.index,
            threshold: output.threshold,
            secret_share: output.secret_share.clone(),
            public_shares: output.public_shares.clone(),
            ot_secret,
            ot_public_keys: output.ot_public_keys.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(format!("local state: {e}")))
    }

    /// Raw group public key
    pub fn group_key_bytes(&self) -> Result<Vec<u8>> {
        let (algo, key) = conversion::decode_pub_key(&self.pub_key)?;
        if algo != self.algo {
            return Err(Error::Internal(format!(
                "local state algo {} does not match key {}",
                self.algo, self.pub_key
            )));
        }
        Ok(key)
    }

    /// Check the stored share against the public material
    pub fn validate(&self) -> Result<()> {
        let n = self.participant_keys.len();
        if self.threshold != conversion::threshold(n)? {
            return Err(Error::Internal(format!("threshold {} invalid for {n} parties", self.threshold)));
        }
        if self.participant_keys.get(self.index) != Some(&self.local_party_key) {
            return Err(Error::Internal("local party key does not match share index".into()));
        }
        if (0..n).any(|i| !self.public_shares.contains_key(&i)) {
            return Err(Error::Internal("public shares incomplete".into()));
        }
        let group_key = self.group_key_bytes()?;
        match self.algo {
            SigningAlgo::Secp256k1 => {
                self.validate_shares::<Secp256k1>(&group_key)?;
                let secret = Secp256k1::scalar_from_bytes(&self.ot_secret)
                    .ok_or_else(|| Error::Internal("missing OT secret".into()))?;
                let own = Secp256k1::point_to_bytes(&(Secp256k1::generator() * secret));
                if self.ot_public_keys.get(&self.index) != Some(&own) {
                    return Err(Error::Internal("OT key pair mismatch".into()));
                }
                if (0..n).any(|i| !self.ot_public_keys.contains_key(&i)) {
                    return Err(Error::Internal("OT public keys incomplete".into()));
                }
                Ok(())
            }
            SigningAlgo::Ed25519 => self.validate_shares::<Ed25519>(&group_key),
        }
    }

    fn validate_shares<C: Ciphersuite>(&self, group_key: &[u8]) -> Result<()> {
        let secret = C::scalar_from_bytes(&self.secret_share)
            .ok_or_else(|| Error::Internal("invalid secret share".into()))?;
        let own = C::point_to_bytes(&(C::generator() * secret));
        if self.public_shares.get(&self.index) != Some(&own) {
            return Err(Error::Internal("secret share does not match public share".into()));
        }

        let subset: Vec<usize> = (0..=self.threshold).collect();
        let mut combined = C::Point::identity();
        for i in &subset {
            let share = self
                .public_shares
                .get(i)
                .and_then(|bytes| C::point_from_bytes(bytes))
                .ok_or_else(|| Error::Internal(format!("invalid public share {i}")))?;
            let lambda = lagrange_coefficient::<C::Scalar>(*i, &subset)
                .ok_or_else(|| Error::Internal("degenerate share indices".into()))?;
            combined += share * lambda;
        }
        if C::point_to_bytes(&combined) != group_key {
            return Err(Error::Internal("public shares do not interpolate to the group key".into()));
        }
        Ok(())
    }
}

mod hex_map {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<usize, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(k, v)| (k.to_string(), hex::encode(v))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<usize, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                let index = k.parse::<usize>().map_err(serde::de::Error::custom)?;
                let bytes = hex::decode(v).map_err(serde::de::Error::custom)?;
                Ok((index, bytes))
            })
            .collect()
    }
}

/// Persistence of keygen output and learned peer addresses
pub trait LocalStateStore: Send + Sync {
    fn save_local_state(&self, state: &LocalState) -> Result<()>;

    /// State of the key whose group public key string is `pub_key`
    fn get_local_state(&self, pub_key: &str) -> Result<LocalState>;

    fn save_address_book(&self, book: &AddressBook) -> Result<()>;

    fn retrieve_address_book(&self) -> Result<AddressBook>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStateStore {
    states: DashMap<String, LocalState>,
    address_book: RwLock<AddressBook>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStateStore for MemoryStateStore {
    fn save_local_state(&self, state: &LocalState) -> Result<()> {
        self.states.insert(state.pub_key.clone(), state.clone());
        Ok(())
    }

    fn get_local_state(&self, pub_key: &str) -> Result<LocalState> {
        self.states
            .get(pub_key)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::Storage(format!("no local state for {pub_key}")))
    }

    fn save_address_book(&self, book: &AddressBook) -> Result<()> {
        self.address_book.write().extend(book.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn retrieve_address_book(&self) -> Result<AddressBook> {
        Ok(self.address_book.read().clone())
    }
}

const ADDRESS_BOOK_FILE: &str = "address_book.json";

/// JSON files in a directory, one per key
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn state_path(&self, pub_key: &str) -> PathBuf {
        self.dir.join(format!("localstate-{}.json", pub_key.replace(':', "-")))
    }
}

impl LocalStateStore for FileStateStore {
    fn save_local_state(&self, state: &LocalState) -> Result<()> {
        let path = self.state_path(&state.pub_key);
        fs::write(&path, serde_json::to_vec_pretty(state)?)?;
        debug!(path = %path.display(), "Local state saved");
        Ok(())
    }

    fn get_local_state(&self, pub_key: &str) -> Result<LocalState> {
        let path = self.state_path(pub_key);
        let bytes = fs::read(&path)
            .map_err(|e| Error::Storage(format!("cannot read {}: {e}", path.display())))?;
        LocalState::from_bytes(&bytes)
    }

    fn save_address_book(&self, book: &AddressBook) -> Result<()> {
        let mut merged = self.retrieve_address_book()?;
        merged.extend(book.iter().map(|(k, v)| (k.clone(), v.clone())));
        fs::write(self.dir.join(ADDRESS_BOOK_FILE), serde_json::to_vec_pretty(&merged)?)?;
        Ok(())
    }

    fn retrieve_address_book(&self) -> Result<AddressBook> {
        let path = self.dir.join(ADDRESS_BOOK_FILE);
        if !path.exists() {
            return Ok(AddressBook::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}
