//! Threshold EdDSA signing over ed25519
//!
//! Each signer commits to a nonce point, opens it, and sends
//! `s_i = r_i + c·λ_i·x_i` with `c = SHA-512(R ‖ A ‖ M)`. Partial signatures
//! are checked against the signer's public share so a bad contribution is
//! attributable.

use curve25519_dalek::{EdwardsPoint, Scalar};
use ed25519_dalek::Verifier;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use tracing::debug;

use super::messages::*;
use super::SignInput;
use crate::ciphersuite::{lagrange_coefficient, Ciphersuite, Ed25519};
use crate::protocol::{
    decode, ProtocolError, ProtocolMessage, RoundInbox, RoundInfo, RoundProtocol, Step,
};
use crate::types::Signature;

/// Verify an ed25519 signature over `message`
pub fn verify(pub_key: &[u8], message: &[u8], signature: &Signature) -> bool {
    let Signature::Eddsa { raw } = signature else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(pub_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(raw.as_slice()) else {
        return false;
    };
    match ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key
            .verify(message, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
            .is_ok(),
        Err(_) => false,
    }
}

fn challenge(nonce: &EdwardsPoint, pub_key: &[u8], message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(nonce.compress().as_bytes());
    hasher.update(pub_key);
    hasher.update(message);
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Ed25519::scalar_from_wide(&wide)
}

enum Stage {
    Commitments,
    Decommits,
    Partials,
    Done,
}

/// EdDSA signing state machine of one signer for one message
pub struct EddsaSignProtocol {
    input: SignInput,
    stage: Stage,
    inbox: RoundInbox,
    /// `λ_i·x_i`
    w: Scalar,
    nonce: Scalar,
    blind: [u8; 32],
    commitments: BTreeMap<usize, Vec<u8>>,
    nonce_points: BTreeMap<usize, EdwardsPoint>,
    big_r: EdwardsPoint,
    c: Scalar,
}

impl EddsaSignProtocol {
    pub fn new(input: SignInput) -> Result<Self, ProtocolError> {
        let x = Ed25519::scalar_from_bytes(&input.secret_share)
            .ok_or_else(|| ProtocolError::Internal("invalid secret share".into()))?;
        let lambda = lagrange_coefficient::<Scalar>(input.index, &input.signers)
            .ok_or_else(|| ProtocolError::Internal("duplicate signer index".into()))?;
        for index in &input.signers {
            if !input.public_shares.contains_key(index) {
                return Err(ProtocolError::Internal(format!("no public share for party {index}")));
            }
        }
        let others = input.signers.iter().copied().filter(|i| *i != input.index).collect();
        Ok(Self {
            input,
            stage: Stage::Commitments,
            inbox: RoundInbox::new(EDDSA_ROUNDS, others),
            w: lambda * x,
            nonce: Scalar::ZERO,
            blind: [0u8; 32],
            commitments: BTreeMap::new(),
            nonce_points: BTreeMap::new(),
            big_r: EdwardsPoint::default(),
            c: Scalar::ZERO,
        })
    }

    fn nonce_point(&self) -> EdwardsPoint {
        Ed25519::generator() * self.nonce
    }

    fn decommit(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        for (from, payload) in self.inbox.take(EDDSA_ROUND1_COMMIT) {
            let body: CommitMessage = decode(EDDSA_ROUND1_COMMIT, from, &payload)?;
            self.commitments.insert(from, body.commitment);
        }
        self.stage = Stage::Decommits;
        Ok(vec![ProtocolMessage::broadcast(
            EDDSA_ROUND2_DECOMMIT,
            &DecommitMessage {
                point: Ed25519::point_to_bytes(&self.nonce_point()),
                blind: self.blind.to_vec(),
            },
        )?])
    }

    fn partial_signature(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        let mut culprits = Vec::new();
        for (from, payload) in self.inbox.take(EDDSA_ROUND2_DECOMMIT) {
            let body: DecommitMessage = decode(EDDSA_ROUND2_DECOMMIT, from, &payload)?;
            let expected = commitment_digest(&self.input.session_id, from, &body.point, &body.blind);
            match Ed25519::point_from_bytes(&body.point) {
                Some(point) if self.commitments.get(&from) == Some(&expected) => {
                    self.nonce_points.insert(from, point);
                }
                _ => culprits.push(from),
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: EDDSA_ROUND2_DECOMMIT,
                culprits,
                reason: "nonce point does not open its commitment".into(),
            });
        }

        self.big_r = self.nonce_points.values().fold(self.nonce_point(), |acc, p| acc + p);
        self.c = challenge(&self.big_r, &self.input.pub_key, &self.input.message);
        let partial = self.nonce + self.c * self.w;

        self.stage = Stage::Partials;
        Ok(vec![ProtocolMessage::broadcast(
            EDDSA_ROUND3_PARTIAL,
            &ScalarMessage {
                value: Ed25519::scalar_to_bytes(&partial),
            },
        )?])
    }

    fn combine(&mut self) -> Result<Signature, ProtocolError> {
        let mut s = self.nonce + self.c * self.w;
        let mut culprits = Vec::new();
        for (from, payload) in self.inbox.take(EDDSA_ROUND3_PARTIAL) {
            let body: ScalarMessage = decode(EDDSA_ROUND3_PARTIAL, from, &payload)?;
            let partial = Ed25519::scalar_from_bytes(&body.value);
            let public_share = self
                .input
                .public_shares
                .get(&from)
                .and_then(|bytes| Ed25519::point_from_bytes(bytes));
            let lambda = lagrange_coefficient::<Scalar>(from, &self.input.signers);
            match (partial, public_share, lambda, self.nonce_points.get(&from)) {
                (Some(partial), Some(share), Some(lambda), Some(nonce))
                    if Ed25519::generator() * partial == nonce + share * (self.c * lambda) =>
                {
                    s += partial;
                }
                _ => culprits.push(from),
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: EDDSA_ROUND3_PARTIAL,
                culprits,
                reason: "partial signature does not match public share".into(),
            });
        }

        let mut raw = self.big_r.compress().to_bytes().to_vec();
        raw.extend_from_slice(s.as_bytes());
        let signature = Signature::Eddsa { raw };
        self.nonce = Scalar::ZERO;
        self.stage = Stage::Done;

        if !verify(&self.input.pub_key, &self.input.message, &signature) {
            return Err(ProtocolError::VerificationFailed("combined EdDSA signature is invalid".into()));
        }
        Ok(signature)
    }
}

impl RoundProtocol for EddsaSignProtocol {
    type Output = Signature;

    fn rounds(&self) -> &'static [RoundInfo] {
        EDDSA_ROUNDS
    }

    fn start(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        self.nonce = Ed25519::random_scalar();
        self.blind = rand::random();
        let commitment = commitment_digest(
            &self.input.session_id,
            self.input.index,
            &Ed25519::point_to_bytes(&self.nonce_point()),
            &self.blind,
        );
        debug!(index = self.input.index, signers = ?self.input.signers, "EdDSA signing started");
        Ok(vec![ProtocolMessage::broadcast(EDDSA_ROUND1_COMMIT, &CommitMessage { commitment })?])
    }

    fn handle_message(&mut self, from: usize, round_type: &str, payload: &[u8]) -> Result<Step<Signature>, ProtocolError> {
        self.inbox.insert(from, round_type, payload)?;

        let mut out = Vec::new();
        loop {
            match self.stage {
                Stage::Commitments if self.inbox.is_complete(EDDSA_ROUND1_COMMIT) => {
                    out.extend(self.decommit()?);
                }
                Stage::Decommits if self.inbox.is_complete(EDDSA_ROUND2_DECOMMIT) => {
                    out.extend(self.partial_signature()?);
                }
                Stage::Partials if self.inbox.is_complete(EDDSA_ROUND3_PARTIAL) => {
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
    use crate::keygen::dkg::DkgOutput;
    use zeroize::Zeroizing;

    fn input(key: &DkgOutput, signers: &[usize], message: &[u8]) -> SignInput {
        SignInput {
            session_id: "ks".into(),
            index: key.index,
            signers: signers.to_vec(),
            secret_share: Zeroizing::new(key.secret_share.clone()),
            public_shares: key.public_shares.clone(),
            pub_key: key.pub_key.clone(),
            message: message.to_vec(),
            ot_secret: Zeroizing::new(Vec::new()),
            ot_public_keys: BTreeMap::new(),
        }
    }

    #[test]
    fn test_threshold_eddsa_signature_verifies() {
        let keys = run_keygen::<Ed25519>(&[0, 1, 2, 3], 2, false);
        let signers = [0usize, 2, 3];
        let parties = signers
            .iter()
            .map(|i| (*i, EddsaSignProtocol::new(input(&keys[i], &signers, b"m1")).unwrap()))
            .collect();
        let signatures = run_local(parties).unwrap();

        let first = &signatures[&0];
        assert!(signatures.values().all(|s| s == first));
        assert!(verify(&keys[&0].pub_key, b"m1", first));
        assert!(!verify(&keys[&0].pub_key, b"m2", first));
    }

    #[test]
    fn test_bad_partial_is_attributed() {
        let keys = run_keygen::<Ed25519>(&[0, 1, 2], 1, false);
        let signers = [0usize, 1];
        let mut a = EddsaSignProtocol::new(input(&keys[&0], &signers, b"m")).unwrap();
        let mut b = EddsaSignProtocol::new(input(&keys[&1], &signers, b"m")).unwrap();

        let a1 = a.start().unwrap().remove(0);
        let b1 = b.start().unwrap().remove(0);
        let Step::Continue(mut a2) = a.handle_message(1, b1.round_type, &b1.payload).unwrap() else {
            panic!("signing ended early");
        };
        let Step::Continue(mut b2) = b.handle_message(0, a1.round_type, &a1.payload).unwrap() else {
            panic!("signing ended early");
        };
        let a2 = a2.remove(0);
        let b2 = b2.remove(0);
        let Step::Continue(_) = a.handle_message(1, b2.round_type, &b2.payload).unwrap() else {
            panic!("signing ended early");
        };
        b.handle_message(0, a2.round_type, &a2.payload).unwrap();

        let forged = ScalarMessage {
            value: Ed25519::scalar_to_bytes(&Ed25519::random_scalar()),
        };
        let payload = serde_json::to_vec(&forged).unwrap();
        match a.handle_message(1, EDDSA_ROUND3_PARTIAL, &payload) {
            Err(ProtocolError::InvalidShare { culprits, .. }) => assert_eq!(culprits, vec![1]),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
