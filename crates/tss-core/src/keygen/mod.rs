//! Distributed key generation for both signing algorithms

pub mod dkg;
pub mod messages;

pub use dkg::{DkgOutput, KeygenProtocol};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{error, info};

use crate::blame::{Blame, BlameManager, FailReason};
use crate::ciphersuite::{Ciphersuite, Ed25519, Secp256k1};
use crate::mpc::{async_trait, InboundSender};
use crate::oblivious::PreParams;
use crate::party::PartySet;
use crate::session::{NodeContext, SessionContext, TssSession};
use crate::storage::LocalState;
use crate::types::{SigningAlgo, Status};
use crate::wire::MessageType;
use crate::{Error, Result};

/// Keygen request from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    /// Ignored by multi-algorithm keygen
    #[serde(rename = "algorithm", default = "default_algo")]
    pub algo: SigningAlgo,
    pub participant_keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

fn default_algo() -> SigningAlgo {
    SigningAlgo::Secp256k1
}

impl KeygenRequest {
    pub fn new(algo: SigningAlgo, participant_keys: Vec<String>, block_height: i64, version: impl Into<String>) -> Self {
        Self {
            algo,
            participant_keys,
            block_height,
            version: version.into(),
        }
    }
}

/// Keygen outcome returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub algo: SigningAlgo,
    pub pub_key: String,
    pub pool_address: String,
    pub status: Status,
    pub blame: Blame,
}

impl KeygenResponse {
    pub fn success(state: &LocalState) -> Result<Self> {
        let key = state.group_key_bytes()?;
        Ok(Self {
            algo: state.algo,
            pub_key: state.pub_key.clone(),
            pool_address: crate::conversion::pool_address(state.algo, &key),
            status: Status::Success,
            blame: Blame::default(),
        })
    }

    pub fn failure(algo: SigningAlgo, blame: Blame) -> Self {
        Self {
            algo,
            pub_key: String::new(),
            pool_address: String::new(),
            status: Status::Fail,
            blame,
        }
    }
}

/// Keygen engine for one curve
pub struct TssKeyGen<C: Ciphersuite> {
    ctx: SessionContext,
    participant_keys: Vec<String>,
    pre_params: Option<Arc<PreParams>>,
    _curve: PhantomData<C>,
}

impl<C: Ciphersuite> TssKeyGen<C> {
    pub fn new(
        session_id: impl Into<String>,
        node: NodeContext,
        participant_keys: &[String],
        pre_params: Option<Arc<PreParams>>,
    ) -> Self {
        let timeout = node.config.keygen_timeout;
        Self {
            ctx: SessionContext::new(session_id, MessageType::Keygen, node, timeout),
            participant_keys: participant_keys.to_vec(),
            pre_params,
            _curve: PhantomData,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }
}

#[async_trait]
impl<C: Ciphersuite> TssSession for TssKeyGen<C> {
    type Output = LocalState;

    async fn drive_rounds(&mut self, party_set: Arc<PartySet>) -> Result<LocalState> {
        let local = party_set
            .by_peer(&self.ctx.node.local_peer)
            .cloned()
            .ok_or(Error::NotParticipant)?;

        let require_ot = C::ALGO == SigningAlgo::Secp256k1;
        let (ot_public, ot_secret) = match (&self.pre_params, require_ot) {
            (Some(params), true) => (params.public_key().to_vec(), params.secret_key().to_vec()),
            (None, true) => return Err(Error::Internal("ECDSA keygen requires pre-parameters".into())),
            (_, false) => (Vec::new(), Vec::new()),
        };

        let protocol = KeygenProtocol::<C>::new(
            self.ctx.session_id.clone(),
            local.index,
            party_set.indices(),
            party_set.threshold(),
            ot_public,
            require_ot,
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let mut outputs = self
            .ctx
            .run_rounds(party_set, vec![(String::new(), protocol)])
            .await?;
        let output = outputs
            .remove("")
            .ok_or_else(|| Error::Internal("keygen produced no output".into()))?;

        let state = LocalState::from_dkg(
            C::ALGO,
            &output,
            &local.pub_key,
            &self.participant_keys,
            ot_secret,
        );
        if let Err(e) = state.validate() {
            error!(session_id = %self.ctx.session_id, error = %e, "Keygen output failed validation");
            let mut blame = self.ctx.blame.lock();
            let round = blame.last_msg().map(|m| m.round_type.clone()).unwrap_or_default();
            blame.accuse_all(FailReason::VerificationFailed, &round);
            return Err(Error::VerificationFailed(e.to_string()));
        }
        info!(session_id = %self.ctx.session_id, algo = %C::ALGO, pub_key = %state.pub_key, "Key generated");
        Ok(state)
    }

    fn channel(&self) -> InboundSender {
        self.ctx.channel()
    }

    fn common_state(&self) -> Arc<Mutex<BlameManager>> {
        Arc::clone(&self.ctx.blame)
    }
}

/// Keygen engine selected by algorithm
pub enum KeygenInstance {
    Secp256k1(TssKeyGen<Secp256k1>),
    Ed25519(TssKeyGen<Ed25519>),
}

impl KeygenInstance {
    pub fn new(
        algo: SigningAlgo,
        session_id: impl Into<String>,
        node: NodeContext,
        participant_keys: &[String],
        pre_params: Option<Arc<PreParams>>,
    ) -> Self {
        match algo {
            SigningAlgo::Secp256k1 => {
                Self::Secp256k1(TssKeyGen::new(session_id, node, participant_keys, pre_params))
            }
            SigningAlgo::Ed25519 => Self::Ed25519(TssKeyGen::new(session_id, node, participant_keys, None)),
        }
    }

    pub fn algo(&self) -> SigningAlgo {
        match self {
            Self::Secp256k1(_) => SigningAlgo::Secp256k1,
            Self::Ed25519(_) => SigningAlgo::Ed25519,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Secp256k1(k) => k.session_id(),
            Self::Ed25519(k) => k.session_id(),
        }
    }
}

#[async_trait]
impl TssSession for KeygenInstance {
    type Output = LocalState;

    async fn drive_rounds(&mut self, party_set: Arc<PartySet>) -> Result<LocalState> {
        match self {
            Self::Secp256k1(k) => k.drive_rounds(party_set).await,
            Self::Ed25519(k) => k.drive_rounds(party_set).await,
        }
    }

    fn channel(&self) -> InboundSender {
        match self {
            Self::Secp256k1(k) => k.channel(),
            Self::Ed25519(k) => k.channel(),
        }
    }

    fn common_state(&self) -> Arc<Mutex<BlameManager>> {
        match self {
            Self::Secp256k1(k) => k.common_state(),
            Self::Ed25519(k) => k.common_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde() {
        let json = r#"{"algorithm":"ed25519","participant_keys":["a","b"],"block_height":10,"version":"0.14.0"}"#;
        let req: KeygenRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.algo, SigningAlgo::Ed25519);
        assert_eq!(req.participant_keys.len(), 2);

        let json = r#"{"participant_keys":[],"block_height":1,"version":"v"}"#;
        let req: KeygenRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.algo, SigningAlgo::Secp256k1);
    }

    #[test]
    fn test_failure_response_carries_blame() {
        let response = KeygenResponse::failure(SigningAlgo::Ed25519, Blame::default());
        assert_eq!(response.status, Status::Fail);
        assert!(response.pub_key.is_empty());
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("blame").is_some());
    }
}
