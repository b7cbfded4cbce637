//! Per-session message router.
//!
//! Outbound protocol messages are wrapped in signed envelopes and handed to
//! the transport; inbound envelopes are verified, broadcast payloads are
//! echo-checked with the other parties, and accepted payloads are delivered to
//! the round party owning their moniker.

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::blame::{BlameManager, BlameNode, FailReason};
use crate::mpc::Transport;
use crate::party::PartySet;
use crate::protocol::{find_round, ProtocolMessage, Recipient, RoundInfo};
use crate::signal::Signal;
use crate::types::{PeerId, SessionId};
use crate::wire::{
    BroadcastConfirm, ConfirmKey, InboundMessage, MessageType, RoundMessage, SessionPayload,
    SignedEnvelope, WrappedMessage,
};
use crate::{Error, Result};

/// Payload delivered to a round party
#[derive(Debug, Clone)]
pub struct PartyMessage {
    /// Shamir index of the sender
    pub from: usize,
    pub round_type: String,
    pub payload: Vec<u8>,
}

/// Input queues of the round parties, keyed by moniker
pub type PartyRegistry = HashMap<String, mpsc::UnboundedSender<PartyMessage>>;

/// Session-scoped routing state shared by the round loop and the inbound task
pub struct TssCommon {
    session_id: SessionId,
    message_type: MessageType,
    local_peer: PeerId,
    node_key: Arc<SigningKey>,
    transport: Arc<dyn Transport>,
    party_set: Arc<PartySet>,
    rounds: &'static [RoundInfo],
    blame: Arc<Mutex<BlameManager>>,
    task_done: Signal,
}

impl TssCommon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<SessionId>,
        message_type: MessageType,
        local_peer: PeerId,
        node_key: Arc<SigningKey>,
        transport: Arc<dyn Transport>,
        party_set: Arc<PartySet>,
        rounds: &'static [RoundInfo],
        blame: Arc<Mutex<BlameManager>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_type,
            local_peer,
            node_key,
            transport,
            party_set,
            rounds,
            blame,
            task_done: Signal::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn party_set(&self) -> &Arc<PartySet> {
        &self.party_set
    }

    fn wrap(&self, message_type: MessageType, payload: &SessionPayload) -> Result<(WrappedMessage, SignedEnvelope)> {
        let envelope = SignedEnvelope::seal(payload, &self.node_key)?;
        Ok((
            WrappedMessage {
                message_type,
                session_id: self.session_id.clone(),
                payload: envelope.encode()?,
            },
            envelope,
        ))
    }

    /// Send one message produced by the round party `moniker`.
    ///
    /// Delivery failures to single peers are logged; the round continues for
    /// the peers that did receive it.
    pub async fn process_out(&self, moniker: &str, message: ProtocolMessage) -> Result<()> {
        let is_broadcast = message.is_broadcast();
        self.blame.lock().set_last_msg(message.round_type, is_broadcast);

        let round = RoundMessage {
            session_id: self.session_id.clone(),
            epoch: self.party_set.epoch().to_string(),
            round_type: message.round_type.to_string(),
            sender: self.local_peer.clone(),
            moniker: moniker.to_string(),
            is_broadcast,
            payload: message.payload,
        };
        let (wrapped, _) = self.wrap(self.message_type, &SessionPayload::Round(round))?;

        match message.recipient {
            Recipient::Broadcast => {
                let peers = self.party_set.peers_except(&self.local_peer);
                self.transport.broadcast(&peers, &wrapped).await?;
            }
            Recipient::Party(index) => {
                let party = self.party_set.by_index(index).ok_or_else(|| {
                    Error::Internal(format!("no party with index {index} in session"))
                })?;
                self.blame.lock().record_unicast_sent(message.round_type, &party.peer_id);
                if let Err(e) = self.transport.send(&party.peer_id, &wrapped).await {
                    warn!(
                        session_id = %self.session_id,
                        peer = %party.peer_id,
                        round = message.round_type,
                        error = %e,
                        "Unicast delivery failed"
                    );
                }
            }
        }
        trace!(session_id = %self.session_id, round = message.round_type, moniker, "Round message sent");
        Ok(())
    }

    /// Tell the other parties this node has finished the session
    pub async fn notify_task_done(&self) -> Result<()> {
        let (wrapped, _) = self.wrap(
            MessageType::TaskDone,
            &SessionPayload::TaskDone {
                session_id: self.session_id.clone(),
                epoch: self.party_set.epoch().to_string(),
                sender: self.local_peer.clone(),
            },
        )?;
        self.transport
            .broadcast(&self.party_set.peers_except(&self.local_peer), &wrapped)
            .await
    }

    /// Fires once every other party reported task done
    pub fn task_done(&self) -> Signal {
        self.task_done.clone()
    }

    /// Run [`Self::process_inbound_messages`] on its own task
    pub fn spawn_inbound(
        self: &Arc<Self>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        parties: PartyRegistry,
        errors: mpsc::UnboundedSender<Error>,
        done: Signal,
    ) -> JoinHandle<()> {
        let common = Arc::clone(self);
        tokio::spawn(async move { common.process_inbound_messages(inbound, parties, errors, done).await })
    }

    /// Verify and route inbound messages until `done` fires or the queue closes.
    ///
    /// Invalid envelopes are dropped. A broadcast whose confirmed hash
    /// disagrees with ours aborts the session through `errors`.
    pub async fn process_inbound_messages(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        parties: PartyRegistry,
        errors: mpsc::UnboundedSender<Error>,
        done: Signal,
    ) {
        let mut state = InboundState {
            parties,
            broadcasts: HashMap::new(),
            finished: HashSet::new(),
        };
        loop {
            tokio::select! {
                _ = done.fired() => break,
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = self.handle_inbound(&mut state, message).await {
                        error!(session_id = %self.session_id, error = %e, "Session aborted by router");
                        let _ = errors.send(e);
                        break;
                    }
                }
            }
        }
        debug!(session_id = %self.session_id, "Inbound routing stopped");
    }

    async fn handle_inbound(&self, state: &mut InboundState, inbound: InboundMessage) -> Result<()> {
        let from = inbound.from;
        let Some(key) = self.party_set.verifying_key(&from) else {
            debug!(session_id = %self.session_id, peer = %from, "Message from peer outside the party set");
            return Ok(());
        };
        let opened = SignedEnvelope::decode(&inbound.message.payload)
            .and_then(|envelope| Ok((envelope.open::<SessionPayload>(key)?, envelope)));
        let (payload, envelope) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session_id = %self.session_id, peer = %from, error = %e, "Dropping invalid envelope");
                return Ok(());
            }
        };
        if payload.epoch() != self.party_set.epoch() {
            debug!(session_id = %self.session_id, peer = %from, "Message from another join attempt");
            return Ok(());
        }

        match payload {
            SessionPayload::Round(message) => {
                if message.session_id != self.session_id || message.sender != from {
                    debug!(session_id = %self.session_id, peer = %from, "Round message with mismatched header");
                    return Ok(());
                }
                if find_round(self.rounds, &message.round_type).is_none() {
                    debug!(peer = %from, round = %message.round_type, "Unknown round type");
                    return Ok(());
                }
                self.blame.lock().record_received(&message.round_type, &from);
                if message.is_broadcast {
                    self.on_broadcast(state, message, envelope).await
                } else {
                    self.apply(state, &message);
                    Ok(())
                }
            }
            SessionPayload::Confirm(confirm) => {
                if confirm.session_id != self.session_id || confirm.confirmer != from {
                    return Ok(());
                }
                if confirm.key.owner == from || confirm.key.owner == self.local_peer {
                    trace!(peer = %from, "Ignoring confirmation of own broadcast");
                    return Ok(());
                }
                state
                    .broadcasts
                    .entry(confirm.key.clone())
                    .or_default()
                    .confirmations
                    .insert(from, confirm.hash);
                self.try_apply(state, &confirm.key)
            }
            SessionPayload::TaskDone { session_id, sender, .. } => {
                if session_id == self.session_id && sender == from && state.finished.insert(sender) {
                    let others = self.party_set.len().saturating_sub(1);
                    debug!(session_id = %self.session_id, done = state.finished.len(), others, "Peer finished");
                    if state.finished.len() >= others {
                        self.task_done.fire();
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_broadcast(&self, state: &mut InboundState, message: RoundMessage, envelope: SignedEnvelope) -> Result<()> {
        let key = message.confirm_key();
        let hash = message.digest();
        let entry = state.broadcasts.entry(key.clone()).or_default();
        if entry.message.is_some() {
            debug!(peer = %key.owner, round = %key.round_type, "Duplicate broadcast dropped");
            return Ok(());
        }
        entry.message = Some(message);
        entry.local_hash = hash.clone();
        entry.evidence = Some(envelope);
        entry.confirmations.insert(self.local_peer.clone(), hash.clone());

        let confirm = SessionPayload::Confirm(BroadcastConfirm {
            session_id: self.session_id.clone(),
            epoch: self.party_set.epoch().to_string(),
            confirmer: self.local_peer.clone(),
            key: key.clone(),
            hash,
        });
        let (wrapped, _) = self.wrap(self.message_type, &confirm)?;
        let peers: Vec<PeerId> = self
            .party_set
            .peers_except(&self.local_peer)
            .into_iter()
            .filter(|p| *p != key.owner)
            .collect();
        self.transport.broadcast(&peers, &wrapped).await?;

        self.try_apply(state, &key)
    }

    /// Apply a broadcast once enough parties confirmed the same hash
    fn try_apply(&self, state: &mut InboundState, key: &ConfirmKey) -> Result<()> {
        let Some(entry) = state.broadcasts.get(key) else {
            return Ok(());
        };
        if entry.applied || entry.message.is_none() {
            return Ok(());
        }

        let required = self.party_set.threshold().max(1);
        let confirmers = self.party_set.len().saturating_sub(1);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for hash in entry.confirmations.values() {
            *counts.entry(hash.as_str()).or_default() += 1;
        }
        let (majority, freq) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| (*a.0 == entry.local_hash).cmp(&(*b.0 == entry.local_hash))))
            .map(|(hash, freq)| (hash.to_string(), *freq))
            .unwrap_or_default();

        if freq >= required && majority == entry.local_hash {
            let message = entry.message.clone();
            if let Some(entry) = state.broadcasts.get_mut(key) {
                entry.applied = true;
            }
            if let Some(message) = message {
                self.apply(state, &message);
            }
            return Ok(());
        }

        let conflicting = freq >= required;
        let exhausted = entry.confirmations.len() >= confirmers;
        if conflicting || exhausted {
            let owner = self
                .party_set
                .by_peer(&key.owner)
                .map(|p| p.pub_key.clone())
                .ok_or_else(|| Error::Internal(format!("broadcast from unknown owner {}", key.owner)))?;
            let node = match &entry.evidence {
                Some(envelope) => BlameNode::with_evidence(owner, envelope.body.clone(), envelope.signature.clone()),
                None => BlameNode::new(owner),
            };
            self.blame
                .lock()
                .accuse(FailReason::HashCheckFail, vec![node], &key.round_type);
            return Err(Error::InvalidShare(format!(
                "broadcast hash check failed for {} from {}",
                key.round_type, key.owner
            )));
        }
        Ok(())
    }

    fn apply(&self, state: &InboundState, message: &RoundMessage) {
        let Some(party) = self.party_set.by_peer(&message.sender) else {
            return;
        };
        let Some(tx) = state.parties.get(&message.moniker) else {
            debug!(session_id = %self.session_id, moniker = %message.moniker, "No round party for moniker");
            return;
        };
        let delivered = tx.send(PartyMessage {
            from: party.index,
            round_type: message.round_type.clone(),
            payload: message.payload.clone(),
        });
        if delivered.is_ok() {
            self.blame.lock().record_accepted(&message.round_type, &message.sender);
        } else {
            trace!(moniker = %message.moniker, "Round party already finished");
        }
    }
}

struct InboundState {
    parties: PartyRegistry,
    broadcasts: HashMap<ConfirmKey, PendingBroadcast>,
    finished: HashSet<PeerId>,
}

#[derive(Default)]
struct PendingBroadcast {
    message: Option<RoundMessage>,
    local_hash: String,
    evidence: Option<SignedEnvelope>,
    /// confirmer -> hash it received
    confirmations: HashMap<PeerId, String>,
    applied: bool,
}
