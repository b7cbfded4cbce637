//! Round loop shared by keygen and keysign.
//!
//! Each round party runs on its own task and steps its protocol on the
//! blocking pool. The loop forwards their messages through the router and
//! waits for the next of: party output, protocol error, router abort,
//! inactivity timeout or the engine stop signal.

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blame::{BlameManager, FailReason};
use crate::config::TssConfig;
use crate::mpc::{async_trait, InboundSender, Transport};
use crate::party::PartySet;
use crate::protocol::{ProtocolError, ProtocolMessage, RoundProtocol, Step};
use crate::router::{PartyMessage, TssCommon};
use crate::signal::Signal;
use crate::types::{PeerId, SessionId};
use crate::wire::{InboundMessage, MessageType};
use crate::{Error, Result};

/// Node-wide handles every session needs
#[derive(Clone)]
pub struct NodeContext {
    pub local_peer: PeerId,
    /// Participant key string of this node
    pub local_pub_key: String,
    pub node_key: Arc<SigningKey>,
    pub transport: Arc<dyn Transport>,
    pub config: TssConfig,
    /// Engine-wide stop signal
    pub stop: Signal,
}

/// Common contract of the keygen and keysign engines
#[async_trait]
pub trait TssSession: Send {
    type Output: Send;

    /// Run the cryptographic rounds with the agreed party set
    async fn drive_rounds(&mut self, party_set: Arc<PartySet>) -> Result<Self::Output>;

    /// Sender to subscribe with the dispatcher for this session's messages
    fn channel(&self) -> InboundSender;

    /// Blame state of the session
    fn common_state(&self) -> Arc<Mutex<BlameManager>>;
}

/// State owned by one keygen or keysign attempt
pub struct SessionContext {
    pub session_id: SessionId,
    pub message_type: MessageType,
    pub node: NodeContext,
    pub blame: Arc<Mutex<BlameManager>>,
    timeout: Duration,
    inbound_tx: InboundSender,
    inbound_rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

enum PartyEvent<O> {
    Out(String, Vec<ProtocolMessage>),
    Finished(String, O),
    Failed(String, ProtocolError),
}

/// Fires the session completion token on every exit path
struct CompleteOnDrop(Signal);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.0.fire();
    }
}

impl SessionContext {
    pub fn new(session_id: impl Into<SessionId>, message_type: MessageType, node: NodeContext, timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let blame = BlameManager::new(node.local_pub_key.clone(), node.config.blame_bound);
        Self {
            session_id: session_id.into(),
            message_type,
            node,
            blame: Arc::new(Mutex::new(blame)),
            timeout,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
        }
    }

    pub fn channel(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    /// Drive one protocol instance per moniker to completion.
    ///
    /// Outputs are returned keyed by moniker. On failure the session blame is
    /// filled in before the error is returned.
    pub async fn run_rounds<P: RoundProtocol>(
        &mut self,
        party_set: Arc<PartySet>,
        protocols: Vec<(String, P)>,
    ) -> Result<BTreeMap<String, P::Output>> {
        let inbound = self
            .inbound_rx
            .take()
            .ok_or_else(|| Error::Internal("session rounds already driven".into()))?;
        let rounds = protocols
            .first()
            .map(|(_, p)| p.rounds())
            .ok_or_else(|| Error::Internal("no round party to run".into()))?;
        let expected = protocols.len();
        self.blame
            .lock()
            .set_party_info(Arc::clone(&party_set), rounds, expected);

        let common = Arc::new(TssCommon::new(
            self.session_id.clone(),
            self.message_type,
            self.node.local_peer.clone(),
            Arc::clone(&self.node.node_key),
            Arc::clone(&self.node.transport),
            party_set,
            rounds,
            Arc::clone(&self.blame),
        ));

        let done = Signal::new();
        let _complete = CompleteOnDrop(done.clone());
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (errors_tx, mut errors) = mpsc::unbounded_channel();

        let mut registry = std::collections::HashMap::new();
        for (moniker, protocol) in protocols {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.insert(moniker.clone(), tx);
            tokio::spawn(run_party(moniker, protocol, rx, events_tx.clone(), done.clone()));
        }
        drop(events_tx);
        let router = common.spawn_inbound(inbound, registry, errors_tx, done.clone());

        info!(session_id = %self.session_id, parties = expected, "Round loop started");
        let mut outputs = BTreeMap::new();
        let idle = tokio::time::sleep(self.timeout);
        tokio::pin!(idle);

        while outputs.len() < expected {
            tokio::select! {
                _ = self.node.stop.fired() => {
                    warn!(session_id = %self.session_id, "Session stopped");
                    return Err(Error::Stopped);
                }
                _ = &mut idle => {
                    let blame = self.blame.lock().timeout_blame(FailReason::Timeout).clone();
                    warn!(
                        session_id = %self.session_id,
                        round = %blame.round,
                        accused = blame.blame_nodes.len(),
                        "Round loop timed out"
                    );
                    return Err(Error::RoundTimeout(format!("no progress within {:?}", self.timeout)));
                }
                Some(e) = errors.recv() => return Err(e),
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Error::Internal("round parties exited early".into()));
                    };
                    idle.as_mut().reset(Instant::now() + self.timeout);
                    match event {
                        PartyEvent::Out(moniker, messages) => {
                            for message in messages {
                                common.process_out(&moniker, message).await?;
                            }
                        }
                        PartyEvent::Finished(moniker, output) => {
                            debug!(session_id = %self.session_id, moniker = %moniker, "Round party finished");
                            outputs.insert(moniker, output);
                        }
                        PartyEvent::Failed(moniker, error) => {
                            return Err(self.protocol_failure(&moniker, error));
                        }
                    }
                }
            }
        }

        if let Err(e) = common.notify_task_done().await {
            debug!(session_id = %self.session_id, error = %e, "Task-done notification failed");
        }
        let peers_done = common.task_done();
        tokio::select! {
            _ = peers_done.fired() => debug!(session_id = %self.session_id, "All peers finished"),
            _ = tokio::time::sleep(self.node.config.task_done_grace) => {
                debug!(session_id = %self.session_id, "Task-done grace elapsed");
            }
            _ = self.node.stop.fired() => {}
        }
        done.fire();
        let _ = router.await;
        info!(session_id = %self.session_id, "Round loop completed");
        Ok(outputs)
    }

    fn protocol_failure(&self, moniker: &str, error: ProtocolError) -> Error {
        let mut blame = self.blame.lock();
        warn!(session_id = %self.session_id, moniker, error = %error, "Round party failed");
        match error {
            ProtocolError::InvalidShare { round, culprits, reason } => {
                let nodes = blame.nodes_for_indices(&culprits);
                blame.accuse(FailReason::InvalidProof, nodes, round);
                Error::InvalidShare(reason)
            }
            ProtocolError::VerificationFailed(reason) => {
                let round = blame.last_msg().map(|m| m.round_type.clone()).unwrap_or_default();
                blame.accuse_all(FailReason::VerificationFailed, &round);
                Error::VerificationFailed(reason)
            }
            ProtocolError::Internal(reason) => {
                blame.timeout_blame(FailReason::Internal);
                Error::Internal(reason)
            }
        }
    }
}

/// Step one protocol on the blocking pool
async fn step<P, F>(mut protocol: P, f: F) -> std::result::Result<(P, std::result::Result<Step<P::Output>, ProtocolError>), ProtocolError>
where
    P: RoundProtocol,
    F: FnOnce(&mut P) -> std::result::Result<Step<P::Output>, ProtocolError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&mut protocol);
        (protocol, result)
    })
    .await
    .map_err(|e| ProtocolError::Internal(format!("round task failed: {e}")))
}

async fn run_party<P: RoundProtocol>(
    moniker: String,
    protocol: P,
    mut input: mpsc::UnboundedReceiver<PartyMessage>,
    events: mpsc::UnboundedSender<PartyEvent<P::Output>>,
    done: Signal,
) {
    let started = step(protocol, |p| p.start().map(Step::Continue)).await;
    let (mut protocol, result) = match started {
        Ok(stepped) => stepped,
        Err(e) => {
            let _ = events.send(PartyEvent::Failed(moniker, e));
            return;
        }
    };
    let mut result = Some(result);

    loop {
        match result.take() {
            Some(Ok(Step::Continue(out))) => {
                if !out.is_empty() && events.send(PartyEvent::Out(moniker.clone(), out)).is_err() {
                    return;
                }
            }
            Some(Ok(Step::Finished(out, output))) => {
                if !out.is_empty() {
                    let _ = events.send(PartyEvent::Out(moniker.clone(), out));
                }
                let _ = events.send(PartyEvent::Finished(moniker, output));
                return;
            }
            Some(Err(e)) => {
                let _ = events.send(PartyEvent::Failed(moniker, e));
                return;
            }
            None => {}
        }

        let message = tokio::select! {
            _ = done.fired() => return,
            message = input.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        match step(protocol, move |p| p.handle_message(message.from, &message.round_type, &message.payload)).await {
            Ok((next, stepped)) => {
                protocol = next;
                result = Some(stepped);
            }
            Err(e) => {
                let _ = events.send(PartyEvent::Failed(moniker, e));
                return;
            }
        }
    }
}
