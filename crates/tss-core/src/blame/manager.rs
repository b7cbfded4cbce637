//! Per-session blame bookkeeping

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Blame, BlameNode, FailReason};
use crate::config::BlameBound;
use crate::conversion;
use crate::party::PartySet;
use crate::protocol::{find_round, previous_unicast, RoundInfo};
use crate::types::PeerId;
use crate::{Error, Result};

/// Last round message the local party sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub round_type: String,
    pub is_broadcast: bool,
}

/// Tracks expected and received contributions of one session and renders
/// the final [`Blame`] when it aborts.
#[derive(Debug)]
pub struct BlameManager {
    blame: Blame,
    local_pub_key: String,
    bound: BlameBound,
    party_set: Option<Arc<PartySet>>,
    rounds: &'static [RoundInfo],
    /// Messages every sub-session must receive from each peer per round
    batch_size: usize,
    last_msg: Option<LastMessage>,
    /// round type -> peer -> messages received
    received: HashMap<String, HashMap<PeerId, usize>>,
    /// round type -> peer -> messages applied to the local parties
    accepted: HashMap<String, HashMap<PeerId, usize>>,
    /// round type -> peers the local parties sent unicasts to
    unicast_peers: HashMap<String, HashSet<PeerId>>,
}

impl BlameManager {
    pub fn new(local_pub_key: impl Into<String>, bound: BlameBound) -> Self {
        Self {
            blame: Blame::default(),
            local_pub_key: local_pub_key.into(),
            bound,
            party_set: None,
            rounds: &[],
            batch_size: 1,
            last_msg: None,
            received: HashMap::new(),
            accepted: HashMap::new(),
            unicast_peers: HashMap::new(),
        }
    }

    /// Install the agreed party set and round schedule once joined
    pub fn set_party_info(
        &mut self,
        party_set: Arc<PartySet>,
        rounds: &'static [RoundInfo],
        batch_size: usize,
    ) {
        self.party_set = Some(party_set);
        self.rounds = rounds;
        self.batch_size = batch_size.max(1);
    }

    pub fn set_last_msg(&mut self, round_type: &str, is_broadcast: bool) {
        self.last_msg = Some(LastMessage {
            round_type: round_type.to_string(),
            is_broadcast,
        });
    }

    pub fn last_msg(&self) -> Option<&LastMessage> {
        self.last_msg.as_ref()
    }

    pub fn record_received(&mut self, round_type: &str, from: &PeerId) {
        *self
            .received
            .entry(round_type.to_string())
            .or_default()
            .entry(from.clone())
            .or_default() += 1;
    }

    /// Unicast rounds are pairwise: a peer we addressed owes us its message
    pub fn record_unicast_sent(&mut self, round_type: &str, to: &PeerId) {
        self.unicast_peers
            .entry(round_type.to_string())
            .or_default()
            .insert(to.clone());
    }

    pub fn record_accepted(&mut self, round_type: &str, from: &PeerId) {
        *self
            .accepted
            .entry(round_type.to_string())
            .or_default()
            .entry(from.clone())
            .or_default() += 1;
    }

    pub fn blame(&self) -> &Blame {
        &self.blame
    }

    pub fn blame_mut(&mut self) -> &mut Blame {
        &mut self.blame
    }

    /// Tolerated faulty parties (T) of the session
    pub fn threshold(&self) -> Result<usize> {
        self.party_set
            .as_ref()
            .map(|set| set.threshold())
            .ok_or_else(|| Error::Internal("blame manager has no party set".into()))
    }

    /// Whether accusing `count` peers stays within the over-blame guard
    pub fn within_bound(&self, count: usize) -> bool {
        match self.threshold() {
            Ok(threshold) => count > 0 && self.bound.allows(count, threshold),
            Err(_) => false,
        }
    }

    fn missing_from(
        &self,
        record: &HashMap<String, HashMap<PeerId, usize>>,
        round_type: &str,
        expected: impl Fn(&PeerId) -> bool,
    ) -> Result<Vec<BlameNode>> {
        let party_set = self
            .party_set
            .as_ref()
            .ok_or_else(|| Error::Internal("blame manager has no party set".into()))?;
        let got = record.get(round_type);
        Ok(party_set
            .iter()
            .filter(|p| p.pub_key != self.local_pub_key && expected(&p.peer_id))
            .filter(|p| {
                got.and_then(|peers| peers.get(&p.peer_id)).copied().unwrap_or(0) < self.batch_size
            })
            .map(|p| BlameNode::new(p.pub_key.clone()))
            .collect())
    }

    /// Peers we exchanged `round_type` unicasts with that never sent theirs.
    ///
    /// Only the peers the local parties addressed in that round are expected;
    /// a round we sent nothing in pins nobody.
    pub fn unicast_blame(&self, round_type: &str) -> Result<Vec<BlameNode>> {
        let Some(addressed) = self.unicast_peers.get(round_type) else {
            return Ok(Vec::new());
        };
        self.missing_from(&self.received, round_type, |peer| addressed.contains(peer))
    }

    /// Parties whose broadcast of `round_type` never reached us
    pub fn broadcast_blame(&self, round_type: &str) -> Result<Vec<BlameNode>> {
        self.missing_from(&self.received, round_type, |_| true)
    }

    /// Walk the schedule and report the first round some peer never
    /// completed, together with that round.
    pub fn missing_share_blame(&self) -> Result<Option<(Vec<BlameNode>, &'static RoundInfo)>> {
        for round in self.rounds {
            let missing = self.missing_from(&self.accepted, round.round_type, |_| true)?;
            if !missing.is_empty() {
                return Ok(Some((missing, round)));
            }
        }
        Ok(None)
    }

    /// Candidates that never showed up during join
    pub fn node_sync_blame(&self, candidates: &[String], online: &[PeerId]) -> Result<Vec<BlameNode>> {
        let mut nodes = Vec::new();
        for key in candidates {
            if *key == self.local_pub_key {
                continue;
            }
            let peer = conversion::peer_id_from_pub_key(key)?;
            if !online.contains(&peer) {
                nodes.push(BlameNode::new(key.clone()));
            }
        }
        Ok(nodes)
    }

    /// Render the blame of a stalled session.
    ///
    /// Pins the in-flight round from the last sent message, falls back to the
    /// missing-share walk, and never accuses more peers than the bound allows.
    pub fn timeout_blame(&mut self, reason: FailReason) -> &Blame {
        let mut nodes: Vec<BlameNode> = Vec::new();
        let mut is_unicast = false;
        let mut round = String::new();

        if let Some(last) = self.last_msg.clone() {
            round = last.round_type.clone();
            let unicast_round = if last.is_broadcast {
                previous_unicast(self.rounds, &last.round_type).map(str::to_string)
            } else {
                Some(last.round_type.clone())
            };

            if let Some(unicast_round) = unicast_round {
                match self.unicast_blame(&unicast_round) {
                    Ok(found) if self.within_bound(found.len()) => {
                        nodes = found;
                        is_unicast = true;
                        round = unicast_round;
                    }
                    Ok(found) => {
                        debug!(round = %unicast_round, count = found.len(), "Unicast blame outside bound");
                    }
                    Err(e) => warn!(error = %e, "Unicast blame unavailable"),
                }
            }

            if last.is_broadcast {
                match self.broadcast_blame(&last.round_type) {
                    Ok(found) if !found.is_empty() => {
                        let mut merged = Blame::default();
                        merged.add_blame_nodes(nodes.iter().cloned());
                        merged.add_blame_nodes(found);
                        if self.within_bound(merged.blame_nodes.len()) {
                            if nodes.is_empty() {
                                is_unicast = false;
                                round = last.round_type.clone();
                            }
                            nodes = merged.blame_nodes;
                        } else {
                            debug!(round = %last.round_type, "Broadcast blame outside bound");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Broadcast blame unavailable"),
                }
            }
        }

        if nodes.is_empty() {
            match self.missing_share_blame() {
                Ok(Some((found, info))) if self.within_bound(found.len()) => {
                    nodes = found;
                    is_unicast = !info.is_broadcast;
                    round = info.round_type.to_string();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Missing share blame unavailable"),
            }
        }

        self.blame.set_blame(reason, nodes, is_unicast, round);
        &self.blame
    }

    /// Accuse specific peers, subject to the over-blame guard.
    ///
    /// Returns false when the guard rejected the accusation; the failure
    /// reason is recorded either way.
    pub fn accuse(&mut self, reason: FailReason, nodes: Vec<BlameNode>, round: &str) -> bool {
        let is_unicast = find_round(self.rounds, round)
            .map(|r| !r.is_broadcast)
            .unwrap_or(false);
        if self.within_bound(nodes.len()) {
            self.blame.set_blame(reason, nodes, is_unicast, round);
            true
        } else {
            warn!(count = nodes.len(), round, "Accusation outside bound, not applied");
            self.blame.set_blame(reason, Vec::new(), is_unicast, round);
            false
        }
    }

    /// Accuse every other member of the party set
    pub fn accuse_all(&mut self, reason: FailReason, round: &str) {
        let nodes = self
            .party_set
            .as_ref()
            .map(|set| {
                set.iter()
                    .filter(|p| p.pub_key != self.local_pub_key)
                    .map(|p| BlameNode::new(p.pub_key.clone()))
                    .collect()
            })
            .unwrap_or_default();
        self.blame.set_blame(reason, nodes, false, round);
    }

    /// Blame nodes for Shamir indices of the party set
    pub fn nodes_for_indices(&self, indices: &[usize]) -> Vec<BlameNode> {
        let Some(set) = self.party_set.as_ref() else {
            return Vec::new();
        };
        indices
            .iter()
            .filter_map(|i| set.by_index(*i))
            .filter(|p| p.pub_key != self.local_pub_key)
            .map(|p| BlameNode::new(p.pub_key.clone()))
            .collect()
    }
}
