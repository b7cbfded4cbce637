//! Batched threshold signing

pub mod ecdsa;
pub mod eddsa;
pub mod messages;
pub mod notifier;

pub use ecdsa::EcdsaSignProtocol;
pub use eddsa::EddsaSignProtocol;
pub use notifier::{verify, Notifier};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use crate::blame::{Blame, BlameManager};
use crate::conversion::{self, compare_messages};
use crate::mpc::{async_trait, InboundSender};
use crate::party::PartySet;
use crate::protocol::{ProtocolError, RoundProtocol};
use crate::session::{NodeContext, SessionContext, TssSession};
use crate::storage::LocalState;
use crate::types::{hex_bytes, hex_vec, Signature, SignatureData, SigningAlgo, Status};
use crate::wire::MessageType;
use crate::{Error, Result};

/// Keysign request from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    pub pool_pub_key: String,
    #[serde(rename = "messages_to_sign", with = "hex_vec")]
    pub messages: Vec<Vec<u8>>,
    /// Serialized [`LocalState`]; loaded from the state store when empty
    #[serde(rename = "keygen_local_state", default, with = "hex_bytes")]
    pub local_state: Vec<u8>,
    pub participant_keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

impl KeysignRequest {
    pub fn new(
        pool_pub_key: impl Into<String>,
        messages: Vec<Vec<u8>>,
        participant_keys: Vec<String>,
        block_height: i64,
        version: impl Into<String>,
    ) -> Self {
        Self {
            pool_pub_key: pool_pub_key.into(),
            messages,
            local_state: Vec::new(),
            participant_keys,
            block_height,
            version: version.into(),
        }
    }

    pub fn with_local_state(mut self, state: &LocalState) -> Result<Self> {
        self.local_state = state.to_bytes()?;
        Ok(self)
    }
}

/// Keysign outcome returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<SignatureData>,
    pub status: Status,
    pub blame: Blame,
}

impl KeysignResponse {
    pub fn success(signatures: Vec<SignatureData>) -> Self {
        Self {
            signatures,
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    pub fn failure(blame: Blame) -> Self {
        Self {
            signatures: Vec::new(),
            status: Status::Fail,
            blame,
        }
    }
}

/// Inputs of one signer for one message
pub struct SignInput {
    /// Sub-session ID, `<session>:<moniker>`
    pub session_id: String,
    pub index: usize,
    /// Shamir indices of every signer
    pub signers: Vec<usize>,
    pub secret_share: Zeroizing<Vec<u8>>,
    pub public_shares: BTreeMap<usize, Vec<u8>>,
    /// Raw group public key
    pub pub_key: Vec<u8>,
    pub message: Vec<u8>,
    pub ot_secret: Zeroizing<Vec<u8>>,
    pub ot_public_keys: BTreeMap<usize, Vec<u8>>,
}

type ProtocolBuilder<P> = fn(SignInput) -> std::result::Result<P, ProtocolError>;

/// Keysign engine running one round party per message
pub struct TssKeySign<P> {
    ctx: SessionContext,
    state: LocalState,
    /// Sorted in descending order
    messages: Vec<Vec<u8>>,
    build: ProtocolBuilder<P>,
}

impl<P: RoundProtocol<Output = Signature>> TssKeySign<P> {
    pub fn new(
        session_id: impl Into<String>,
        node: NodeContext,
        state: LocalState,
        messages: &[Vec<u8>],
        build: ProtocolBuilder<P>,
    ) -> Self {
        let timeout = node.config.keysign_timeout;
        let mut messages = messages.to_vec();
        conversion::sort_messages_desc(&mut messages);
        Self {
            ctx: SessionContext::new(session_id, MessageType::Keysign, node, timeout),
            state,
            messages,
            build,
        }
    }
}

#[async_trait]
impl<P: RoundProtocol<Output = Signature>> TssSession for TssKeySign<P> {
    type Output = Vec<SignatureData>;

    async fn drive_rounds(&mut self, party_set: Arc<PartySet>) -> Result<Vec<SignatureData>> {
        let local = party_set
            .by_peer(&self.ctx.node.local_peer)
            .cloned()
            .ok_or(Error::NotParticipant)?;
        let signers = party_set.indices();
        let group_key = self.state.group_key_bytes()?;

        let mut protocols = Vec::with_capacity(self.messages.len());
        let mut monikers = Vec::with_capacity(self.messages.len());
        for (position, message) in self.messages.iter().enumerate() {
            let moniker = conversion::message_moniker(message, position);
            let input = SignInput {
                session_id: format!("{}:{moniker}", self.ctx.session_id),
                index: local.index,
                signers: signers.clone(),
                secret_share: Zeroizing::new(self.state.secret_share.clone()),
                public_shares: self.state.public_shares.clone(),
                pub_key: group_key.clone(),
                message: message.clone(),
                ot_secret: Zeroizing::new(self.state.ot_secret.clone()),
                ot_public_keys: self.state.ot_public_keys.clone(),
            };
            let protocol = (self.build)(input).map_err(|e| Error::Internal(e.to_string()))?;
            protocols.push((moniker.clone(), protocol));
            monikers.push((moniker, message.clone()));
        }

        let mut outputs = self.ctx.run_rounds(party_set, protocols).await?;
        let mut signatures = Vec::with_capacity(monikers.len());
        for (moniker, message) in monikers {
            let signature = outputs
                .remove(&moniker)
                .ok_or_else(|| Error::Internal(format!("no signature for {moniker}")))?;
            signatures.push(SignatureData { message, signature });
        }
        signatures.sort_by(|a, b| compare_messages(&b.message, &a.message));
        info!(session_id = %self.ctx.session_id, count = signatures.len(), "Messages signed");
        Ok(signatures)
    }

    fn channel(&self) -> InboundSender {
        self.ctx.channel()
    }

    fn common_state(&self) -> Arc<Mutex<BlameManager>> {
        Arc::clone(&self.ctx.blame)
    }
}

/// Keysign engine selected by the key's algorithm
pub enum KeysignInstance {
    Ecdsa(TssKeySign<EcdsaSignProtocol>),
    Eddsa(TssKeySign<EddsaSignProtocol>),
}

impl KeysignInstance {
    pub fn new(session_id: impl Into<String>, node: NodeContext, state: LocalState, messages: &[Vec<u8>]) -> Self {
        match state.algo {
            SigningAlgo::Secp256k1 => Self::Ecdsa(TssKeySign::new(session_id, node, state, messages, EcdsaSignProtocol::new)),
            SigningAlgo::Ed25519 => Self::Eddsa(TssKeySign::new(session_id, node, state, messages, EddsaSignProtocol::new)),
        }
    }
}

#[async_trait]
impl TssSession for KeysignInstance {
    type Output = Vec<SignatureData>;

    async fn drive_rounds(&mut self, party_set: Arc<PartySet>) -> Result<Vec<SignatureData>> {
        match self {
            Self::Ecdsa(k) => k.drive_rounds(party_set).await,
            Self::Eddsa(k) => k.drive_rounds(party_set).await,
        }
    }

    fn channel(&self) -> InboundSender {
        match self {
            Self::Ecdsa(k) => k.channel(),
            Self::Eddsa(k) => k.channel(),
        }
    }

    fn common_state(&self) -> Arc<Mutex<BlameManager>> {
        match self {
            Self::Ecdsa(k) => k.common_state(),
            Self::Eddsa(k) => k.common_state(),
        }
    }
}
