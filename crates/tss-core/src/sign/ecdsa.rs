//! Threshold ECDSA signing over secp256k1
//!
//! Multiplicative nonce sharing in the style of GG18, with the two
//! multiplications per pair of signers done by OT-based MtA instead of
//! Paillier:
//!
//! 1. commit to `Γ_i = γ_i·G`; send OT choices for `γ_i` and `w_i`
//! 2. answer the OT choices with input `k_i`
//! 3. broadcast `δ_i`, a share of `k·γ`
//! 4. open `Γ_i`; `R = δ⁻¹·Γ`
//! 5. broadcast `s_i = m·k_i + r·σ_i` where `σ_i` is a share of `k·x`

use elliptic_curve::{point::AffineCoordinates, scalar::IsHigh};
use k256::ecdsa::{signature::hazmat::PrehashVerifier, VerifyingKey};
use k256::{ProjectivePoint, Scalar};
use std::collections::BTreeMap;
use tracing::debug;
use zeroize::Zeroizing;

use super::messages::*;
use super::SignInput;
use crate::ciphersuite::{lagrange_coefficient, Ciphersuite, Secp256k1};
use crate::oblivious::{mta, MtaReceiver};
use crate::protocol::{
    decode, ProtocolError, ProtocolMessage, RoundInbox, RoundInfo, RoundProtocol, Step,
};
use crate::types::Signature;

/// Message as a 32-byte prehash: truncated when longer, left-padded when shorter
pub fn prehash(message: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    if message.len() >= 32 {
        digest.copy_from_slice(&message[..32]);
    } else {
        digest[32 - message.len()..].copy_from_slice(message);
    }
    digest
}

fn message_scalar(message: &[u8]) -> Scalar {
    use elliptic_curve::{bigint::U256, ops::Reduce};
    <Scalar as Reduce<U256>>::reduce_bytes(&prehash(message).into())
}

/// Verify an ECDSA signature over the prehash of `message`
pub fn verify(pub_key: &[u8], message: &[u8], signature: &Signature) -> bool {
    let Signature::Ecdsa { r, s, .. } = signature else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(pub_key) else {
        return false;
    };
    let (Ok(r), Ok(s)) = (<[u8; 32]>::try_from(r.as_slice()), <[u8; 32]>::try_from(s.as_slice())) else {
        return false;
    };
    match k256::ecdsa::Signature::from_scalars(r, s) {
        Ok(sig) => key.verify_prehash(&prehash(message), &sig).is_ok(),
        Err(_) => false,
    }
}

fn scalar(round: &'static str, from: usize, bytes: &[u8]) -> Result<Scalar, ProtocolError> {
    Secp256k1::scalar_from_bytes(bytes).ok_or_else(|| ProtocolError::invalid(round, from, "invalid scalar"))
}

enum Stage {
    Choices,
    Responses,
    Deltas,
    Decommits,
    Partials,
    Done,
}

/// ECDSA signing state machine of one signer for one message
pub struct EcdsaSignProtocol {
    input: SignInput,
    stage: Stage,
    inbox: RoundInbox,
    k: Scalar,
    gamma: Scalar,
    w: Scalar,
    blind: [u8; 32],
    ot_secret: Scalar,
    ot_public: ProjectivePoint,
    commitments: BTreeMap<usize, Vec<u8>>,
    receivers: BTreeMap<usize, MtaReceiver>,
    /// `delta_i` and `sigma_i` accumulators
    delta: Scalar,
    sigma: Scalar,
    total_delta: Scalar,
    r: Scalar,
    y_odd: bool,
}

impl EcdsaSignProtocol {
    pub fn new(input: SignInput) -> Result<Self, ProtocolError> {
        let x = Secp256k1::scalar_from_bytes(&input.secret_share)
            .ok_or_else(|| ProtocolError::Internal("invalid secret share".into()))?;
        let lambda = lagrange_coefficient::<Scalar>(input.index, &input.signers)
            .ok_or_else(|| ProtocolError::Internal("duplicate signer index".into()))?;
        let ot_secret = Secp256k1::scalar_from_bytes(&input.ot_secret)
            .ok_or_else(|| ProtocolError::Internal("missing OT secret".into()))?;
        let ot_public = ProjectivePoint::GENERATOR * ot_secret;
        for index in &input.signers {
            if !input.ot_public_keys.contains_key(index) {
                return Err(ProtocolError::Internal(format!("no OT key for party {index}")));
            }
        }

        let others = input.signers.iter().copied().filter(|i| *i != input.index).collect();
        Ok(Self {
            input,
            stage: Stage::Choices,
            inbox: RoundInbox::new(ECDSA_ROUNDS, others),
            k: Scalar::ZERO,
            gamma: Scalar::ZERO,
            w: lambda * x,
            blind: [0u8; 32],
            ot_secret,
            ot_public,
            commitments: BTreeMap::new(),
            receivers: BTreeMap::new(),
            delta: Scalar::ZERO,
            sigma: Scalar::ZERO,
            total_delta: Scalar::ZERO,
            r: Scalar::ZERO,
            y_odd: false,
        })
    }

    fn others(&self) -> Vec<usize> {
        self.input
            .signers
            .iter()
            .copied()
            .filter(|i| *i != self.input.index)
            .collect()
    }

    fn tag(&self, sender: usize, receiver: usize) -> Vec<u8> {
        format!("{}:{sender}->{receiver}", self.input.session_id).into_bytes()
    }

    fn gamma_point(&self) -> Vec<u8> {
        Secp256k1::point_to_bytes(&(ProjectivePoint::GENERATOR * self.gamma))
    }

    /// Peers' commitments are in; answer their OT choices with `k_i`
    fn respond(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        for (from, payload) in self.inbox.take(ECDSA_ROUND1_COMMIT) {
            let body: CommitMessage = decode(ECDSA_ROUND1_COMMIT, from, &payload)?;
            self.commitments.insert(from, body.commitment);
        }

        let mut out = Vec::new();
        for (from, payload) in self.inbox.take(ECDSA_ROUND1_OT_REQUEST) {
            let body: OtRequestMessage = decode(ECDSA_ROUND1_OT_REQUEST, from, &payload)?;
            let requests = body
                .requests
                .iter()
                .map(|bytes| Secp256k1::point_from_bytes(bytes))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| ProtocolError::invalid(ECDSA_ROUND1_OT_REQUEST, from, "invalid OT request"))?;
            let tag = self.tag(self.input.index, from);
            let (alphas, response) = mta::respond(&self.k, &self.ot_secret, &self.ot_public, &requests, &tag)
                .filter(|(alphas, _)| alphas.len() == 2)
                .ok_or_else(|| ProtocolError::invalid(ECDSA_ROUND1_OT_REQUEST, from, "wrong OT request size"))?;
            self.delta += alphas[0];
            self.sigma += alphas[1];
            out.push(ProtocolMessage::unicast(
                ECDSA_ROUND2_OT_RESPONSE,
                from,
                &OtResponseMessage { response },
            )?);
        }
        self.stage = Stage::Responses;
        Ok(out)
    }

    fn share_delta(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        for (from, payload) in self.inbox.take(ECDSA_ROUND2_OT_RESPONSE) {
            let body: OtResponseMessage = decode(ECDSA_ROUND2_OT_RESPONSE, from, &payload)?;
            let betas = self
                .receivers
                .get(&from)
                .and_then(|receiver| receiver.finish(&body.response))
                .ok_or_else(|| ProtocolError::invalid(ECDSA_ROUND2_OT_RESPONSE, from, "malformed OT response"))?;
            self.delta += betas[0];
            self.sigma += betas[1];
        }
        self.receivers.clear();
        self.delta += self.k * self.gamma;
        self.sigma += self.k * self.w;

        self.stage = Stage::Deltas;
        Ok(vec![ProtocolMessage::broadcast(
            ECDSA_ROUND3_DELTA,
            &ScalarMessage {
                value: Secp256k1::scalar_to_bytes(&self.delta),
            },
        )?])
    }

    fn open_gamma(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        let mut total = self.delta;
        for (from, payload) in self.inbox.take(ECDSA_ROUND3_DELTA) {
            let body: ScalarMessage = decode(ECDSA_ROUND3_DELTA, from, &payload)?;
            total += scalar(ECDSA_ROUND3_DELTA, from, &body.value)?;
        }
        if bool::from(total.is_zero()) {
            return Err(ProtocolError::VerificationFailed("delta sums to zero".into()));
        }
        self.total_delta = total;

        self.stage = Stage::Decommits;
        Ok(vec![ProtocolMessage::broadcast(
            ECDSA_ROUND4_DECOMMIT,
            &DecommitMessage {
                point: self.gamma_point(),
                blind: self.blind.to_vec(),
            },
        )?])
    }

    fn partial_signature(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        let mut gamma_sum = ProjectivePoint::GENERATOR * self.gamma;
        let mut culprits = Vec::new();
        for (from, payload) in self.inbox.take(ECDSA_ROUND4_DECOMMIT) {
            let body: DecommitMessage = decode(ECDSA_ROUND4_DECOMMIT, from, &payload)?;
            let expected = commitment_digest(&self.input.session_id, from, &body.point, &body.blind);
            match Secp256k1::point_from_bytes(&body.point) {
                Some(point) if self.commitments.get(&from) == Some(&expected) => gamma_sum += point,
                _ => culprits.push(from),
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: ECDSA_ROUND4_DECOMMIT,
                culprits,
                reason: "nonce point does not open its commitment".into(),
            });
        }

        let delta_inv = Option::<Scalar>::from(self.total_delta.invert())
            .ok_or_else(|| ProtocolError::VerificationFailed("delta not invertible".into()))?;
        let big_r = (gamma_sum * delta_inv).to_affine();
        self.r = {
            use elliptic_curve::{bigint::U256, ops::Reduce};
            <Scalar as Reduce<U256>>::reduce_bytes(&big_r.x())
        };
        self.y_odd = bool::from(big_r.y_is_odd());
        if bool::from(self.r.is_zero()) {
            return Err(ProtocolError::VerificationFailed("nonce x-coordinate is zero".into()));
        }

        let partial = message_scalar(&self.input.message) * self.k + self.r * self.sigma;
        self.stage = Stage::Partials;
        Ok(vec![ProtocolMessage::broadcast(
            ECDSA_ROUND5_PARTIAL,
            &ScalarMessage {
                value: Secp256k1::scalar_to_bytes(&partial),
            },
        )?])
    }

    fn combine(&mut self) -> Result<Signature, ProtocolError> {
        let mut s = message_scalar(&self.input.message) * self.k + self.r * self.sigma;
        for (from, payload) in self.inbox.take(ECDSA_ROUND5_PARTIAL) {
            let body: ScalarMessage = decode(ECDSA_ROUND5_PARTIAL, from, &payload)?;
            s += scalar(ECDSA_ROUND5_PARTIAL, from, &body.value)?;
        }

        let mut recovery_id = u8::from(self.y_odd);
        if bool::from(s.is_high()) {
            s = -s;
            recovery_id ^= 1;
        }
        let signature = Signature::Ecdsa {
            r: Secp256k1::scalar_to_bytes(&self.r),
            s: Secp256k1::scalar_to_bytes(&s),
            recovery_id,
        };
        self.k = Scalar::ZERO;
        self.sigma = Scalar::ZERO;
        self.stage = Stage::Done;

        if !verify(&self.input.pub_key, &self.input.message, &signature) {
            return Err(ProtocolError::VerificationFailed("combined ECDSA signature is invalid".into()));
        }
        Ok(signature)
    }
}

impl RoundProtocol for EcdsaSignProtocol {
    type Output = Signature;

    fn rounds(&self) -> &'static [RoundInfo] {
        ECDSA_ROUNDS
    }

    fn start(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        self.k = Secp256k1::random_scalar();
        self.gamma = Secp256k1::random_scalar();
        self.blind = rand::random();
        let commitment = commitment_digest(
            &self.input.session_id,
            self.input.index,
            &self.gamma_point(),
            &self.blind,
        );

        let mut out = vec![ProtocolMessage::broadcast(ECDSA_ROUND1_COMMIT, &CommitMessage { commitment })?];
        let inputs = [self.gamma, self.w];
        for to in self.others() {
            let sender_public = self
                .input
                .ot_public_keys
                .get(&to)
                .and_then(|bytes| Secp256k1::point_from_bytes(bytes))
                .ok_or_else(|| ProtocolError::Internal(format!("invalid OT key of party {to}")))?;
            let tag = self.tag(to, self.input.index);
            let (receiver, requests) = MtaReceiver::new(inputs.as_slice(), &sender_public, &tag);
            self.receivers.insert(to, receiver);
            out.push(ProtocolMessage::unicast(
                ECDSA_ROUND1_OT_REQUEST,
                to,
                &OtRequestMessage {
                    requests: requests.iter().map(Secp256k1::point_to_bytes).collect(),
                },
            )?);
        }
        debug!(index = self.input.index, signers = ?self.input.signers, "ECDSA signing started");
        Ok(out)
    }

    fn handle_message(&mut self, from: usize, round_type: &str, payload: &[u8]) -> Result<Step<Signature>, ProtocolError> {
        self.inbox.insert(from, round_type, payload)?;

        let mut out = Vec::new();
        loop {
            match self.stage {
                Stage::Choices
                    if self.inbox.is_complete(ECDSA_ROUND1_COMMIT)
                        && self.inbox.is_complete(ECDSA_ROUND1_OT_REQUEST) =>
                {
                    out.extend(self.respond()?);
                }
                Stage::Responses if self.inbox.is_complete(ECDSA_ROUND2_OT_RESPONSE) => {
                    out.extend(self.share_delta()?);
                }
                Stage::Deltas if self.inbox.is_complete(ECDSA_ROUND3_DELTA) => {
                    out.extend(self.open_gamma()?);
                }
                Stage::Decommits if self.inbox.is_complete(ECDSA_ROUND4_DECOMMIT) => {
                    out.extend(self.partial_signature()?);
                }
                Stage::Partials if self.inbox.is_complete(ECDSA_ROUND5_PARTIAL) => {
                    let signature = self.combine()?;
                    return Ok(Step::Finished(out, signature));
                }
                _ => return Ok(Step::Continue(out)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::dkg::tests::{run_keygen, run_local};
    use crate::oblivious::PreParams;

    fn sign(signers: &[usize], message: &[u8]) -> (Vec<u8>, BTreeMap<usize, Signature>) {
        let all = [0usize, 1, 2, 3];
        let params: BTreeMap<usize, PreParams> = all.iter().map(|i| (*i, PreParams::generate())).collect();
        let keys = {
            use crate::keygen::dkg::KeygenProtocol;
            let parties = all
                .iter()
                .map(|i| {
                    let p = KeygenProtocol::<Secp256k1>::new(
                        "kg",
                        *i,
                        all.to_vec(),
                        2,
                        params[i].public_key().to_vec(),
                        true,
                    )
                    .unwrap();
                    (*i, p)
                })
                .collect();
            run_local(parties).unwrap()
        };

        let parties = signers
            .iter()
            .map(|i| {
                let key = &keys[i];
                let input = SignInput {
                    session_id: "ks".into(),
                    index: *i,
                    signers: signers.to_vec(),
                    secret_share: Zeroizing::new(key.secret_share.clone()),
                    public_shares: key.public_shares.clone(),
                    pub_key: key.pub_key.clone(),
                    message: message.to_vec(),
                    ot_secret: Zeroizing::new(params[i].secret_key().to_vec()),
                    ot_public_keys: key.ot_public_keys.clone(),
                };
                (*i, EcdsaSignProtocol::new(input).unwrap())
            })
            .collect();
        (keys[&0].pub_key.clone(), run_local(parties).unwrap())
    }

    #[test]
    fn test_threshold_ecdsa_signature_verifies() {
        let message = [7u8; 32];
        let (pub_key, signatures) = sign(&[0, 1, 3], &message);
        assert_eq!(signatures.len(), 3);

        let first = &signatures[&0];
        assert!(signatures.values().all(|s| s == first));
        assert!(verify(&pub_key, &message, first));
        assert!(!verify(&pub_key, &[8u8; 32], first));

        let Signature::Ecdsa { r, s, recovery_id } = first else {
            panic!("expected an ECDSA signature");
        };
        let sig = k256::ecdsa::Signature::from_scalars(
            <[u8; 32]>::try_from(r.as_slice()).unwrap(),
            <[u8; 32]>::try_from(s.as_slice()).unwrap(),
        )
        .unwrap();
        let recid = k256::ecdsa::RecoveryId::from_byte(*recovery_id).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(&message, &sig, recid).unwrap();
        assert_eq!(recovered.to_sec1_bytes().to_vec(), pub_key);
    }

    #[test]
    fn test_short_message_is_padded() {
        assert_eq!(prehash(b"\x01")[31], 1);
        assert_eq!(prehash(&[9u8; 40]), [9u8; 32]);
        let (pub_key, signatures) = sign(&[1, 2, 3], b"hello");
        assert!(verify(&pub_key, b"hello", &signatures[&1]));
    }

    #[test]
    fn test_missing_ot_key_rejected() {
        let keys = run_keygen::<Secp256k1>(&[0, 1, 2], 1, true);
        let input = SignInput {
            session_id: "ks".into(),
            index: 0,
            signers: vec![0, 1],
            secret_share: Zeroizing::new(keys[&0].secret_share.clone()),
            public_shares: keys[&0].public_shares.clone(),
            pub_key: keys[&0].pub_key.clone(),
            message: vec![1],
            ot_secret: Zeroizing::new(PreParams::generate().secret_key().to_vec()),
            ot_public_keys: BTreeMap::new(),
        };
        assert!(EcdsaSignProtocol::new(input).is_err());
    }
}
