//! Party identities and the ordered party set of a session

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::conversion;
use crate::types::PeerId;
use crate::{Error, Result};

/// One participant of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    /// Participant key string (`ed25519:<base58>`)
    pub pub_key: String,
    /// Transport identity
    pub peer_id: PeerId,
    /// Position among the keygen participants, used as the Shamir index
    pub index: usize,
}

/// Ordered, deduplicated parties of one session
#[derive(Debug, Clone)]
pub struct PartySet {
    parties: Vec<PartyId>,
    by_peer: HashMap<PeerId, usize>,
    by_index: HashMap<usize, usize>,
    verifying_keys: HashMap<PeerId, VerifyingKey>,
    threshold: usize,
    /// Join attempt this set was agreed in; session traffic carries it
    epoch: String,
}

impl PartySet {
    /// Party set whose indices are positions in `keys` after sorting
    pub fn new(keys: &[String]) -> Result<Self> {
        Self::with_reference(keys, keys)
    }

    /// Party set of `members`, indexed by their position in the sorted
    /// `reference` list (the keygen participants).
    ///
    /// The threshold always comes from the reference list.
    pub fn with_reference(members: &[String], reference: &[String]) -> Result<Self> {
        let mut reference: Vec<String> = reference.to_vec();
        reference.sort();
        reference.dedup();

        let mut members: Vec<String> = members.to_vec();
        members.sort();
        members.dedup();
        if members.is_empty() {
            return Err(Error::InvalidRequest("empty party set".into()));
        }

        let mut parties = Vec::with_capacity(members.len());
        let mut by_peer = HashMap::new();
        let mut by_index = HashMap::new();
        let mut verifying_keys = HashMap::new();
        for key in members {
            let index = reference.binary_search(&key).map_err(|_| {
                Error::InvalidRequest(format!("{key} is not a keygen participant"))
            })?;
            let peer_id = conversion::peer_id_from_pub_key(&key)?;
            verifying_keys.insert(peer_id.clone(), conversion::node_verifying_key(&key)?);
            by_peer.insert(peer_id.clone(), parties.len());
            by_index.insert(index, parties.len());
            parties.push(PartyId {
                pub_key: key,
                peer_id,
                index,
            });
        }

        Ok(Self {
            parties,
            by_peer,
            by_index,
            verifying_keys,
            threshold: conversion::threshold(reference.len())?,
            epoch: String::new(),
        })
    }

    /// Bind the set to the join attempt that agreed on it
    pub fn with_epoch(mut self, epoch: impl Into<String>) -> Self {
        self.epoch = epoch.into();
        self
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    /// Tolerated faulty parties (T)
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter()
    }

    pub fn by_peer(&self, peer: &PeerId) -> Option<&PartyId> {
        self.by_peer.get(peer).map(|pos| &self.parties[*pos])
    }

    pub fn by_index(&self, index: usize) -> Option<&PartyId> {
        self.by_index.get(&index).map(|pos| &self.parties[*pos])
    }

    pub fn by_pub_key(&self, pub_key: &str) -> Option<&PartyId> {
        self.parties.iter().find(|p| p.pub_key == pub_key)
    }

    pub fn verifying_key(&self, peer: &PeerId) -> Option<&VerifyingKey> {
        self.verifying_keys.get(peer)
    }

    /// Shamir indices of all members, ascending
    pub fn indices(&self) -> Vec<usize> {
        self.parties.iter().map(|p| p.index).collect()
    }

    /// Transport identities of every member except `local`
    pub fn peers_except(&self, local: &PeerId) -> Vec<PeerId> {
        self.parties
            .iter()
            .filter(|p| &p.peer_id != local)
            .map(|p| p.peer_id.clone())
            .collect()
    }
}
