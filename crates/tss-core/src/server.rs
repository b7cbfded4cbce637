//! Engine entry points: keygen, multi-algorithm keygen and keysign

use ed25519_dalek::SigningKey;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::blame::{Blame, BlameManager, BlameNode, FailReason};
use crate::config::TssConfig;
use crate::conversion;
use crate::keygen::{KeygenInstance, KeygenRequest, KeygenResponse};
use crate::mpc::{Dispatcher, JoinFailure, JoinRequest, JoinedParty, Leader, PartyCoordinator, Subscription, Transport};
use crate::oblivious::PreParams;
use crate::party::PartySet;
use crate::session::{NodeContext, TssSession};
use crate::sign::{KeysignInstance, KeysignRequest, KeysignResponse, Notifier};
use crate::signal::Signal;
use crate::storage::{LocalState, LocalStateStore};
use crate::types::{PeerId, SigningAlgo};
use crate::wire::MessageType;
use crate::{Error, Result};

/// One TSS engine instance bound to a node identity
pub struct TssServer {
    node: NodeContext,
    dispatcher: Arc<Dispatcher>,
    coordinator: PartyCoordinator,
    store: Arc<dyn LocalStateStore>,
    pre_params: Arc<PreParams>,
    /// Held for the whole duration of a keygen
    keygen_lock: AsyncMutex<()>,
}

impl TssServer {
    /// Build an engine; ECDSA pre-parameters are generated when not supplied
    pub async fn new(
        config: TssConfig,
        node_key: SigningKey,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn LocalStateStore>,
        pre_params: Option<PreParams>,
    ) -> Result<Self> {
        config.validate()?;
        let local_pub_key = conversion::node_pub_key(&node_key.verifying_key());
        let local_peer = conversion::peer_id_from_pub_key(&local_pub_key)?;
        if transport.local_peer_id() != local_peer {
            return Err(Error::InvalidConfig(format!(
                "transport identity {} does not match node key {local_pub_key}",
                transport.local_peer_id()
            )));
        }

        let pre_params = match pre_params {
            Some(params) => {
                params.validate()?;
                params
            }
            None => PreParams::generate_with_timeout(config.pre_param_timeout).await?,
        };

        let node_key = Arc::new(node_key);
        let stop = Signal::new();
        let coordinator = PartyCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&dispatcher),
            Arc::clone(&node_key),
            &config,
            stop.clone(),
        );
        info!(peer = %local_peer, pub_key = %local_pub_key, "TSS engine ready");

        Ok(Self {
            node: NodeContext {
                local_peer,
                local_pub_key,
                node_key,
                transport,
                config,
                stop,
            },
            dispatcher,
            coordinator,
            store,
            pre_params: Arc::new(pre_params),
            keygen_lock: AsyncMutex::new(()),
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.node.local_peer
    }

    /// Participant key string of this node
    pub fn local_pub_key(&self) -> &str {
        &self.node.local_pub_key
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &TssConfig {
        &self.node.config
    }

    /// Abort every in-flight session of this engine
    pub fn stop(&self) {
        info!(peer = %self.node.local_peer, "Stopping TSS engine");
        self.node.stop.fire();
    }

    pub fn keygen_in_progress(&self) -> bool {
        self.keygen_lock.try_lock().is_err()
    }

    /// Generate a key of `request.algo` with every participant.
    ///
    /// Failures after the join phase are reported as a `fail` response with
    /// blame; errors before any peer interaction are returned as `Err`.
    #[instrument(skip(self, request), fields(algo = %request.algo))]
    pub async fn keygen(&self, request: &KeygenRequest) -> Result<KeygenResponse> {
        let _lock = self.keygen_lock.lock().await;
        let keys = self.keygen_participants(request)?;
        let session_id = conversion::keygen_session_id(&keys, request.block_height);

        let mut instance = KeygenInstance::new(
            request.algo,
            session_id.clone(),
            self.node.clone(),
            &keys,
            Some(Arc::clone(&self.pre_params)),
        );
        let _subscription = self.subscribe(MessageType::Keygen, &session_id, &instance);

        let joined = match self
            .join(&session_id, request.block_height, &request.version, &keys, keys.len() - 1)
            .await
        {
            Ok(joined) => joined,
            Err(failure) => {
                let blame = self.join_failure_blame(failure, &keys, &instance.common_state())?;
                return Ok(KeygenResponse::failure(request.algo, blame));
            }
        };
        let party_set = Arc::new(self.party_set(&joined, &keys, &keys)?);

        match instance.drive_rounds(party_set).await {
            Ok(state) => {
                self.store.save_local_state(&state)?;
                self.save_address_book();
                KeygenResponse::success(&state)
            }
            Err(Error::Stopped) => Err(Error::Stopped),
            Err(e) => {
                let blame = instance.common_state().lock().blame().clone();
                warn!(session_id = %session_id, error = %e, accused = blame.blame_nodes.len(), "Keygen failed");
                Ok(KeygenResponse::failure(request.algo, blame))
            }
        }
    }

    /// Generate one key per supported algorithm under a single join.
    ///
    /// The result is atomic: either every key is returned or every response
    /// is a failure carrying the first failing algorithm's blame.
    #[instrument(skip(self, request))]
    pub async fn keygen_all_algo(&self, request: &KeygenRequest) -> Result<Vec<KeygenResponse>> {
        let _lock = self.keygen_lock.lock().await;
        let keys = self.keygen_participants(request)?;
        let session_id = conversion::keygen_session_id(&keys, request.block_height);

        let mut instances: Vec<KeygenInstance> = SigningAlgo::ALL
            .iter()
            .map(|algo| {
                KeygenInstance::new(
                    *algo,
                    conversion::algo_session_id(&session_id, *algo),
                    self.node.clone(),
                    &keys,
                    Some(Arc::clone(&self.pre_params)),
                )
            })
            .collect();
        let _subscriptions: Vec<Subscription> = instances
            .iter()
            .map(|instance| self.subscribe(MessageType::Keygen, instance.session_id(), instance))
            .collect();

        let fail_all = |blame: Blame| -> Vec<KeygenResponse> {
            SigningAlgo::ALL
                .iter()
                .map(|algo| KeygenResponse::failure(*algo, blame.clone()))
                .collect()
        };

        let joined = match self
            .join(&session_id, request.block_height, &request.version, &keys, keys.len() - 1)
            .await
        {
            Ok(joined) => joined,
            Err(failure) => {
                let blame = self.join_failure_blame(failure, &keys, &instances[0].common_state())?;
                return Ok(fail_all(blame));
            }
        };
        let party_set = Arc::new(self.party_set(&joined, &keys, &keys)?);

        let results = join_all(instances.iter_mut().map(|instance| {
            let party_set = Arc::clone(&party_set);
            async move { instance.drive_rounds(party_set).await }
        }))
        .await;

        let mut states: Vec<LocalState> = Vec::with_capacity(results.len());
        for (instance, result) in instances.iter().zip(results) {
            match result {
                Ok(state) => states.push(state),
                Err(Error::Stopped) => return Err(Error::Stopped),
                Err(e) => {
                    let blame = instance.common_state().lock().blame().clone();
                    warn!(algo = %instance.algo(), error = %e, "Multi-algorithm keygen failed");
                    return Ok(fail_all(blame));
                }
            }
        }

        for state in &states {
            self.store.save_local_state(state)?;
        }
        self.save_address_book();
        states.iter().map(KeygenResponse::success).collect()
    }

    /// Sign a batch of messages with a stored key.
    ///
    /// A node that is not among the signers gets a successful response with
    /// no signatures.
    #[instrument(skip(self, request), fields(pool_pub_key = %request.pool_pub_key, messages = request.messages.len()))]
    pub async fn keysign(&self, request: &KeysignRequest) -> Result<KeysignResponse> {
        if request.messages.is_empty() {
            return Err(Error::InvalidRequest("no messages to sign".into()));
        }
        let state = if request.local_state.is_empty() {
            self.store.get_local_state(&request.pool_pub_key)?
        } else {
            LocalState::from_bytes(&request.local_state)?
        };
        state.validate()?;
        if state.pub_key != request.pool_pub_key {
            return Err(Error::InvalidRequest(format!(
                "local state holds {}, request asks for {}",
                state.pub_key, request.pool_pub_key
            )));
        }

        let mut signers = request.participant_keys.clone();
        signers.sort();
        signers.dedup();
        if !signers.contains(&self.node.local_pub_key) {
            info!("Local node is not a signer");
            return Ok(KeysignResponse::success(Vec::new()));
        }
        if let Some(outsider) = signers.iter().find(|k| !state.participant_keys.contains(k)) {
            return Err(Error::InvalidRequest(format!("{outsider} did not take part in keygen")));
        }
        let threshold = state.threshold;
        if signers.len() < threshold + 1 {
            return Err(Error::ThresholdNotMet {
                required: threshold + 1,
                actual: signers.len(),
            });
        }

        let session_id = conversion::keysign_session_id(&request.messages, &request.pool_pub_key, &signers);
        let reference = state.participant_keys.clone();
        let mut instance = KeysignInstance::new(session_id.clone(), self.node.clone(), state, &request.messages);
        let _subscription = self.subscribe(MessageType::Keysign, &session_id, &instance);

        let joined = match self
            .join(&session_id, request.block_height, &request.version, &signers, threshold)
            .await
        {
            Ok(joined) => joined,
            Err(failure) if matches!(failure.error, Error::NotParticipant) => {
                info!(session_id = %session_id, "Local node not selected for signing");
                return Ok(KeysignResponse::success(Vec::new()));
            }
            Err(failure) => {
                let blame = self.join_failure_blame(failure, &signers, &instance.common_state())?;
                return Ok(KeysignResponse::failure(blame));
            }
        };
        let party_set = Arc::new(self.party_set(&joined, &signers, &reference)?);

        let signatures = match instance.drive_rounds(party_set).await {
            Ok(signatures) => signatures,
            Err(Error::Stopped) => return Err(Error::Stopped),
            Err(e) => {
                let blame = instance.common_state().lock().blame().clone();
                warn!(session_id = %session_id, error = %e, accused = blame.blame_nodes.len(), "Keysign failed");
                return Ok(KeysignResponse::failure(blame));
            }
        };

        let (mut notifier, released) =
            Notifier::new(session_id.clone(), request.messages.clone(), request.pool_pub_key.clone(), Vec::new())?;
        if let Err(e) = notifier.process_signature(signatures) {
            warn!(session_id = %session_id, error = %e, "Signature batch rejected");
            let blame = {
                let blame_mgr = instance.common_state();
                let mut blame_mgr = blame_mgr.lock();
                blame_mgr.accuse_all(FailReason::VerificationFailed, "");
                blame_mgr.blame().clone()
            };
            return Ok(KeysignResponse::failure(blame));
        }
        drop(notifier);
        let signatures = released
            .await
            .map_err(|_| Error::Internal("notifier released no signatures".into()))?;

        self.save_address_book();
        Ok(KeysignResponse::success(signatures))
    }

    fn keygen_participants(&self, request: &KeygenRequest) -> Result<Vec<String>> {
        let mut keys = request.participant_keys.clone();
        keys.sort();
        keys.dedup();
        if keys.len() < 2 {
            return Err(Error::InvalidRequest("keygen needs at least two participants".into()));
        }
        if !keys.contains(&self.node.local_pub_key) {
            return Err(Error::InvalidRequest("local node is not a keygen participant".into()));
        }
        Ok(keys)
    }

    fn subscribe<S: TssSession>(&self, message_type: MessageType, session_id: &str, session: &S) -> Subscription {
        self.dispatcher
            .subscribe_guard(&[message_type, MessageType::TaskDone], session_id, session.channel())
    }

    async fn join(
        &self,
        session_id: &str,
        block_height: i64,
        version: &str,
        candidates: &[String],
        required: usize,
    ) -> std::result::Result<JoinedParty, JoinFailure> {
        let request = JoinRequest {
            session_id,
            block_height,
            version,
            candidates,
            required,
        };
        self.coordinator.join_session(&request).await
    }

    /// Party set of the peers the leader selected
    fn party_set(&self, joined: &JoinedParty, candidates: &[String], reference: &[String]) -> Result<PartySet> {
        let mut members = Vec::with_capacity(joined.peers.len());
        for key in candidates {
            if joined.peers.contains(&conversion::peer_id_from_pub_key(key)?) {
                members.push(key.clone());
            }
        }
        if members.len() != joined.peers.len() {
            return Err(Error::Internal("party list names unknown peers".into()));
        }
        Ok(PartySet::with_reference(&members, reference)?.with_epoch(joined.epoch.clone()))
    }

    /// Blame for a failed join: the candidates that never showed up, plus
    /// the leader when quorum was reached but no party list arrived.
    fn join_failure_blame(
        &self,
        failure: JoinFailure,
        candidates: &[String],
        blame_mgr: &Arc<Mutex<BlameManager>>,
    ) -> Result<Blame> {
        let Some(online) = failure.online else {
            warn!(error = %failure.error, "Join failed before any peer interaction");
            return Err(failure.error);
        };

        let mut blame_mgr = blame_mgr.lock();
        let mut nodes = blame_mgr.node_sync_blame(candidates, &online)?;
        if let Leader::Peer(leader) = &failure.leader {
            if *leader != self.node.local_peer {
                for key in candidates {
                    if conversion::peer_id_from_pub_key(key)? == *leader
                        && !nodes.iter().any(|n| n.pub_key == *key)
                    {
                        nodes.push(BlameNode::new(key.clone()));
                    }
                }
            }
        }
        warn!(
            error = %failure.error,
            online = online.len(),
            accused = nodes.len(),
            "Join session failed"
        );
        blame_mgr.blame_mut().set_blame(FailReason::SyncFailure, nodes, false, "");
        Ok(blame_mgr.blame().clone())
    }

    fn save_address_book(&self) {
        let book = self.node.transport.export_peer_addresses();
        if let Err(e) = self.store.save_address_book(&book) {
            warn!(error = %e, "Failed to save address book");
        }
    }
}
