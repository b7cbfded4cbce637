//! Join-session protocol: agree on the online party set before any round runs

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::{Dispatcher, Transport};
use crate::config::TssConfig;
use crate::conversion;
use crate::signal::Signal;
use crate::types::PeerId;
use crate::wire::{JoinPartyMessage, MessageType, SignedEnvelope, WrappedMessage};
use crate::{Error, Result};

/// Deterministic leader of a session.
///
/// Every peer hashes `session_id ‖ block_height ‖ peer` and the peer with the
/// smallest digest leads, so all honest nodes agree without a message round.
pub fn leader_node(session_id: &str, block_height: i64, peers: &[PeerId]) -> Result<PeerId> {
    if peers.is_empty() {
        return Err(Error::InvalidRequest("empty peer list".into()));
    }
    if session_id.is_empty() {
        return Err(Error::InvalidRequest("empty session id".into()));
    }
    if block_height == 0 {
        return Err(Error::InvalidRequest("block height must not be zero".into()));
    }

    peers
        .iter()
        .map(|peer| {
            let digest = Sha256::digest(format!("{session_id}{block_height}{peer}").as_bytes());
            (hex::encode(digest), peer)
        })
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, peer)| peer.clone())
        .ok_or_else(|| Error::Internal("no leader candidate".into()))
}

/// Identifier of one agreed join attempt.
///
/// Hashes the session ID with every selected peer and the attempt nonce it
/// joined with, so traffic left over from an earlier attempt of the same
/// session never matches.
pub fn join_epoch(session_id: &str, members: &BTreeMap<PeerId, u64>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    for (peer, attempt) in members {
        hasher.update([0]);
        hasher.update(peer.as_str().as_bytes());
        hasher.update(attempt.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Leader reported with a join result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leader {
    /// Quorum was never reached
    None,
    Peer(PeerId),
}

/// Parameters of one join attempt
#[derive(Debug, Clone)]
pub struct JoinRequest<'a> {
    pub session_id: &'a str,
    pub block_height: i64,
    pub version: &'a str,
    /// Participant key strings of every candidate, local node included
    pub candidates: &'a [String],
    /// Number of other peers that must join
    pub required: usize,
}

/// Agreed outcome of a successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedParty {
    /// Selected peers, local node included, sorted
    pub peers: Vec<PeerId>,
    pub leader: PeerId,
    /// See [`join_epoch`]
    pub epoch: String,
}

/// Why a join did not produce a party set
#[derive(Debug)]
pub struct JoinFailure {
    /// Peers seen online; `None` when the failure happened before any peer
    /// information existed
    pub online: Option<Vec<PeerId>>,
    pub leader: Leader,
    pub error: Error,
}

impl JoinFailure {
    fn internal(error: Error) -> Self {
        Self {
            online: None,
            leader: Leader::None,
            error,
        }
    }
}

/// Runs the join handshake for the local node
pub struct PartyCoordinator {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    node_key: Arc<SigningKey>,
    timeout: Duration,
    resend_interval: Duration,
    stop: Signal,
}

impl PartyCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        node_key: Arc<SigningKey>,
        config: &TssConfig,
        stop: Signal,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            node_key,
            timeout: config.party_timeout,
            resend_interval: config.join_resend_interval,
            stop,
        }
    }

    /// Wait until `required` other candidates are online and the leader has
    /// announced the party list, or the join timeout elapses.
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn join_session(
        &self,
        request: &JoinRequest<'_>,
    ) -> std::result::Result<JoinedParty, JoinFailure> {
        let local = self.transport.local_peer_id();

        let mut keys: BTreeMap<PeerId, VerifyingKey> = BTreeMap::new();
        for candidate in request.candidates {
            let peer = conversion::peer_id_from_pub_key(candidate).map_err(JoinFailure::internal)?;
            let key = conversion::node_verifying_key(candidate).map_err(JoinFailure::internal)?;
            keys.insert(peer, key);
        }
        if !keys.contains_key(&local) {
            return Err(JoinFailure::internal(Error::InvalidRequest(
                "local node is not a join candidate".into(),
            )));
        }
        let peers: Vec<PeerId> = keys.keys().cloned().collect();
        let others: Vec<PeerId> = peers.iter().filter(|p| **p != local).cloned().collect();
        if request.required > others.len() {
            return Err(JoinFailure::internal(Error::ThresholdNotMet {
                required: request.required,
                actual: others.len(),
            }));
        }

        let leader = leader_node(request.session_id, request.block_height, &peers)
            .map_err(JoinFailure::internal)?;
        let is_leader = leader == local;
        let attempt: u64 = rand::random();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription =
            self.dispatcher
                .subscribe_guard(&[MessageType::JoinParty], request.session_id, tx);

        let ready = self
            .wrap(&JoinPartyMessage::Ready {
                session_id: request.session_id.to_string(),
                sender: local.clone(),
                version: request.version.to_string(),
                attempt,
            }, request.session_id)
            .map_err(JoinFailure::internal)?;

        info!(leader = %leader, is_leader, required = request.required, "Joining session");

        // latest attempt seen per ready peer
        let mut online: BTreeMap<PeerId, u64> = BTreeMap::new();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut resend = tokio::time::interval(self.resend_interval);
        resend.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if is_leader && online.len() >= request.required {
                let mut members: BTreeMap<PeerId, u64> = online
                    .iter()
                    .take(request.required)
                    .map(|(peer, seen)| (peer.clone(), *seen))
                    .collect();
                members.insert(local.clone(), attempt);
                let epoch = join_epoch(request.session_id, &members);

                let announcement = self
                    .wrap(&JoinPartyMessage::PartyList {
                        session_id: request.session_id.to_string(),
                        leader: local.clone(),
                        ready: online.clone(),
                        members: members.clone(),
                    }, request.session_id)
                    .map_err(JoinFailure::internal)?;
                if let Err(e) = self.transport.broadcast(&others, &announcement).await {
                    warn!(error = %e, "Failed to announce party list");
                }
                info!(peers = members.len(), "Party list announced");
                return Ok(JoinedParty {
                    peers: members.into_keys().collect(),
                    leader,
                    epoch,
                });
            }

            tokio::select! {
                _ = self.stop.fired() => {
                    return Err(JoinFailure::internal(Error::Stopped));
                }
                _ = &mut deadline => break,
                _ = resend.tick() => {
                    if let Err(e) = self.transport.broadcast(&others, &ready).await {
                        debug!(error = %e, "Ready broadcast failed");
                    }
                }
                Some(inbound) = rx.recv() => {
                    let Some(key) = keys.get(&inbound.from) else {
                        debug!(peer = %inbound.from, "Join message from unknown peer");
                        continue;
                    };
                    let message = match SignedEnvelope::decode(&inbound.message.payload)
                        .and_then(|envelope| envelope.open::<JoinPartyMessage>(key))
                    {
                        Ok(message) => message,
                        Err(e) => {
                            debug!(peer = %inbound.from, error = %e, "Dropping invalid join message");
                            continue;
                        }
                    };

                    match message {
                        JoinPartyMessage::Ready { session_id, sender, version, attempt: seen } => {
                            if sender != inbound.from || session_id != request.session_id {
                                continue;
                            }
                            if version != request.version {
                                warn!(peer = %sender, version = %version, "Ignoring peer with incompatible version");
                                continue;
                            }
                            if sender != local && online.insert(sender.clone(), seen) != Some(seen) {
                                debug!(peer = %sender, online = online.len(), "Peer ready");
                            }
                        }
                        JoinPartyMessage::PartyList { session_id, leader: announced, ready, members } => {
                            if is_leader
                                || inbound.from != leader
                                || announced != leader
                                || session_id != request.session_id
                                || members.keys().chain(ready.keys()).any(|p| !keys.contains_key(p))
                            {
                                debug!(peer = %inbound.from, "Ignoring unexpected party list");
                                continue;
                            }
                            let current = Some(&attempt);
                            if ready.get(&local) != current && members.get(&local) != current {
                                debug!(peer = %inbound.from, "Ignoring party list of an earlier attempt");
                                continue;
                            }
                            if members.get(&local) != current {
                                info!("Local node not selected by the leader");
                                return Err(JoinFailure {
                                    online: Some(online.into_keys().collect()),
                                    leader: Leader::Peer(leader),
                                    error: Error::NotParticipant,
                                });
                            }
                            let epoch = join_epoch(request.session_id, &members);
                            info!(peers = members.len(), "Received party list from leader");
                            return Ok(JoinedParty {
                                peers: members.into_keys().collect(),
                                leader,
                                epoch,
                            });
                        }
                    }
                }
            }
        }

        let online: Vec<PeerId> = online.into_keys().collect();
        if online.len() < request.required {
            warn!(online = online.len(), required = request.required, "Join quorum not reached");
            Err(JoinFailure {
                online: Some(online),
                leader: Leader::None,
                error: Error::JoinPartyTimeout("quorum not reached".into()),
            })
        } else {
            warn!(leader = %leader, "Leader did not announce the party list");
            Err(JoinFailure {
                online: Some(online),
                leader: Leader::Peer(leader),
                error: Error::JoinPartyTimeout("no party list from leader".into()),
            })
        }
    }

    fn wrap(&self, message: &JoinPartyMessage, session_id: &str) -> Result<WrappedMessage> {
        let envelope = SignedEnvelope::seal(message, &self.node_key)?;
        Ok(WrappedMessage {
            message_type: MessageType::JoinParty,
            session_id: session_id.to_string(),
            payload: envelope.encode()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryNetwork;

    #[test]
    fn test_leader_node_edge_cases() {
        let peers = vec![PeerId::new("a"), PeerId::new("b"), PeerId::new("c")];
        assert!(leader_node("msg", 10, &[]).is_err());
        assert!(leader_node("", 10, &peers).is_err());
        assert!(leader_node("msg", 0, &peers).is_err());

        let leader = leader_node("msg", 10, &peers).unwrap();
        let mut reversed = peers.clone();
        reversed.reverse();
        assert_eq!(leader_node("msg", 10, &reversed).unwrap(), leader);
        assert!(peers.contains(&leader));
    }

    struct Node {
        coordinator: PartyCoordinator,
        dispatcher: Arc<Dispatcher>,
        key: SigningKey,
        pub_key: String,
        peer: PeerId,
    }

    fn nodes(network: &Arc<MemoryNetwork>, n: usize, timeout: Duration) -> Vec<Node> {
        let config = TssConfig {
            party_timeout: timeout,
            join_resend_interval: Duration::from_millis(50),
            ..TssConfig::default()
        };
        (0..n)
            .map(|_| {
                let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
                let pub_key = conversion::node_pub_key(&key.verifying_key());
                let peer = conversion::peer_id_from_pub_key(&pub_key).unwrap();
                let dispatcher = Arc::new(Dispatcher::default());
                let transport = network.register(peer.clone(), Arc::clone(&dispatcher));
                Node {
                    coordinator: PartyCoordinator::new(
                        Arc::new(transport),
                        Arc::clone(&dispatcher),
                        Arc::new(key.clone()),
                        &config,
                        Signal::new(),
                    ),
                    dispatcher,
                    key,
                    pub_key,
                    peer,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_nodes_agree_on_party() {
        let network = MemoryNetwork::new();
        let nodes = nodes(&network, 3, Duration::from_secs(5));
        let keys: Vec<String> = nodes.iter().map(|n| n.pub_key.clone()).collect();

        let results = futures_util::future::join_all(nodes.iter().map(|node| {
            let keys = keys.clone();
            async move {
                let request = JoinRequest {
                    session_id: "join-all",
                    block_height: 7,
                    version: "1.0.0",
                    candidates: &keys,
                    required: 2,
                };
                node.coordinator.join_session(&request).await
            }
        }))
        .await;

        let first = results[0].as_ref().unwrap();
        assert_eq!(first.peers.len(), 3);
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_party_list_of_earlier_attempt_is_ignored() {
        let network = MemoryNetwork::new();
        let nodes = nodes(&network, 2, Duration::from_secs(5));
        let keys: Vec<String> = nodes.iter().map(|n| n.pub_key.clone()).collect();
        let peers: Vec<PeerId> = nodes.iter().map(|n| n.peer.clone()).collect();
        let leader = leader_node("retry", 7, &peers).unwrap();
        let (leader_node_ref, follower) = if nodes[0].peer == leader {
            (&nodes[0], &nodes[1])
        } else {
            (&nodes[1], &nodes[0])
        };

        // leftover from an attempt that selected the follower under another nonce
        let stale_members = BTreeMap::from([(leader.clone(), 1), (follower.peer.clone(), 2)]);
        let stale = JoinPartyMessage::PartyList {
            session_id: "retry".into(),
            leader: leader.clone(),
            ready: BTreeMap::from([(follower.peer.clone(), 2)]),
            members: stale_members.clone(),
        };
        let envelope = SignedEnvelope::seal(&stale, &leader_node_ref.key).unwrap();
        follower.dispatcher.dispatch(crate::wire::InboundMessage {
            from: leader.clone(),
            message: WrappedMessage {
                message_type: MessageType::JoinParty,
                session_id: "retry".into(),
                payload: envelope.encode().unwrap(),
            },
        });

        let results = futures_util::future::join_all(nodes.iter().map(|node| {
            let keys = keys.clone();
            async move {
                let request = JoinRequest {
                    session_id: "retry",
                    block_height: 7,
                    version: "1.0.0",
                    candidates: &keys,
                    required: 1,
                };
                node.coordinator.join_session(&request).await
            }
        }))
        .await;

        let first = results[0].as_ref().unwrap();
        assert_eq!(results[1].as_ref().unwrap(), first);
        assert_ne!(first.epoch, join_epoch("retry", &stale_members));
    }

    #[tokio::test]
    async fn test_quorum_not_reached_reports_no_leader() {
        let network = MemoryNetwork::new();
        let nodes = nodes(&network, 3, Duration::from_millis(600));
        let keys: Vec<String> = nodes.iter().map(|n| n.pub_key.clone()).collect();

        let online = &nodes[..2];
        let results = futures_util::future::join_all(online.iter().map(|node| {
            let keys = keys.clone();
            async move {
                let request = JoinRequest {
                    session_id: "join-partial",
                    block_height: 7,
                    version: "1.0.0",
                    candidates: &keys,
                    required: 2,
                };
                node.coordinator.join_session(&request).await
            }
        }))
        .await;

        for (i, result) in results.into_iter().enumerate() {
            let failure = result.unwrap_err();
            assert_eq!(failure.leader, Leader::None);
            assert!(matches!(failure.error, Error::JoinPartyTimeout(_)));
            assert_eq!(failure.online.unwrap(), vec![online[1 - i].peer.clone()]);
        }
    }

    #[tokio::test]
    async fn test_local_node_outside_candidates_fails_without_peers() {
        let network = MemoryNetwork::new();
        let nodes = nodes(&network, 3, Duration::from_millis(200));
        let keys: Vec<String> = nodes[1..].iter().map(|n| n.pub_key.clone()).collect();

        let request = JoinRequest {
            session_id: "outsider",
            block_height: 1,
            version: "1.0.0",
            candidates: &keys,
            required: 1,
        };
        let failure = nodes[0].coordinator.join_session(&request).await.unwrap_err();
        assert!(failure.online.is_none());
        assert_eq!(failure.leader, Leader::None);
    }
}
