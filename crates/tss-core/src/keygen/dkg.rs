//! Feldman verifiable secret sharing DKG, generic over the curve
//!
//! Every party deals a random degree-T polynomial. The group secret is the sum
//! of the constant terms and is never assembled; each party keeps the sum of
//! the evaluations it received at its own Shamir index.

use elliptic_curve::{Field, Group};
use merlin::Transcript;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::{debug, info};
use zeroize::Zeroize;

use super::messages::*;
use crate::ciphersuite::{evaluate_commitments, evaluate_polynomial, Ciphersuite};
use crate::protocol::{
    decode, ProtocolError, ProtocolMessage, RoundInbox, RoundInfo, RoundProtocol, Step,
};

/// Result of a successful DKG for one party
#[derive(Clone)]
pub struct DkgOutput {
    pub index: usize,
    pub threshold: usize,
    pub secret_share: Vec<u8>,
    pub pub_key: Vec<u8>,
    /// Shamir index -> public share
    pub public_shares: BTreeMap<usize, Vec<u8>>,
    /// Shamir index -> OT public key, ECDSA only
    pub ot_public_keys: BTreeMap<usize, Vec<u8>>,
}

impl Drop for DkgOutput {
    fn drop(&mut self) {
        self.secret_share.zeroize();
    }
}

impl std::fmt::Debug for DkgOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgOutput")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("pub_key", &hex::encode(&self.pub_key))
            .finish_non_exhaustive()
    }
}

/// Schnorr proof of knowledge of `secret` for `public = secret·G`
fn prove<C: Ciphersuite>(session_id: &str, index: usize, secret: &C::Scalar, public: &C::Point) -> (Vec<u8>, Vec<u8>) {
    let nonce = C::random_scalar();
    let nonce_point = C::generator() * nonce;
    let challenge = pok_challenge::<C>(session_id, index, public, &nonce_point);
    let response = nonce + challenge * secret;
    (C::point_to_bytes(&nonce_point), C::scalar_to_bytes(&response))
}

fn pok_challenge<C: Ciphersuite>(session_id: &str, index: usize, public: &C::Point, nonce: &C::Point) -> C::Scalar {
    let mut transcript = Transcript::new(b"tss-keygen-pok");
    transcript.append_message(b"algo", C::ALGO.as_str().as_bytes());
    transcript.append_message(b"session", session_id.as_bytes());
    transcript.append_u64(b"index", index as u64);
    transcript.append_message(b"public", &C::point_to_bytes(public));
    transcript.append_message(b"nonce", &C::point_to_bytes(nonce));
    let mut wide = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut wide);
    C::scalar_from_wide(&wide)
}

enum Stage {
    Commitments,
    Shares,
    PublicShares,
    Done,
}

/// Keygen state machine of one party
pub struct KeygenProtocol<C: Ciphersuite> {
    session_id: String,
    index: usize,
    indices: Vec<usize>,
    threshold: usize,
    ot_public: Vec<u8>,
    require_ot: bool,
    stage: Stage,
    inbox: RoundInbox,
    coefficients: Vec<C::Scalar>,
    /// dealer index -> Feldman commitments
    commitments: BTreeMap<usize, Vec<C::Point>>,
    ot_public_keys: BTreeMap<usize, Vec<u8>>,
    secret_share: C::Scalar,
    pub_key: C::Point,
    public_shares: BTreeMap<usize, C::Point>,
    _curve: PhantomData<C>,
}

impl<C: Ciphersuite> KeygenProtocol<C> {
    /// `indices` are the Shamir indices of every participant, `index` the
    /// local one. `ot_public` is the pre-parameter key published alongside the
    /// commitments; when `require_ot` is set every peer must publish one.
    pub fn new(
        session_id: impl Into<String>,
        index: usize,
        indices: Vec<usize>,
        threshold: usize,
        ot_public: Vec<u8>,
        require_ot: bool,
    ) -> Result<Self, ProtocolError> {
        if !indices.contains(&index) {
            return Err(ProtocolError::Internal(format!("index {index} not in party set")));
        }
        if threshold + 1 > indices.len() {
            return Err(ProtocolError::Internal(format!(
                "threshold {threshold} too large for {} parties",
                indices.len()
            )));
        }
        let others = indices.iter().copied().filter(|i| *i != index).collect();
        Ok(Self {
            session_id: session_id.into(),
            index,
            indices,
            threshold,
            ot_public,
            require_ot,
            stage: Stage::Commitments,
            inbox: RoundInbox::new(KEYGEN_ROUNDS, others),
            coefficients: Vec::new(),
            commitments: BTreeMap::new(),
            ot_public_keys: BTreeMap::new(),
            secret_share: C::Scalar::ZERO,
            pub_key: C::Point::identity(),
            public_shares: BTreeMap::new(),
            _curve: PhantomData,
        })
    }

    fn others(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied().filter(move |i| *i != self.index)
    }

    fn check_commitments(&mut self, from: usize, body: KgRound1Message) -> Result<(), ProtocolError> {
        if body.commitments.len() != self.threshold + 1 {
            return Err(ProtocolError::invalid(
                KG_ROUND1_COMMITMENTS,
                from,
                format!("expected {} commitments, got {}", self.threshold + 1, body.commitments.len()),
            ));
        }
        let points = body
            .commitments
            .iter()
            .map(|bytes| C::point_from_bytes(bytes))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ProtocolError::invalid(KG_ROUND1_COMMITMENTS, from, "invalid commitment point"))?;

        let nonce = C::point_from_bytes(&body.proof_nonce)
            .ok_or_else(|| ProtocolError::invalid(KG_ROUND1_COMMITMENTS, from, "invalid proof nonce"))?;
        let response = C::scalar_from_bytes(&body.proof_response)
            .ok_or_else(|| ProtocolError::invalid(KG_ROUND1_COMMITMENTS, from, "invalid proof response"))?;
        let challenge = pok_challenge::<C>(&self.session_id, from, &points[0], &nonce);
        if C::generator() * response != nonce + points[0] * challenge {
            return Err(ProtocolError::invalid(KG_ROUND1_COMMITMENTS, from, "proof of knowledge rejected"));
        }

        if self.require_ot {
            if crate::ciphersuite::Secp256k1::point_from_bytes(&body.ot_public).is_none() {
                return Err(ProtocolError::invalid(KG_ROUND1_COMMITMENTS, from, "missing OT public key"));
            }
            self.ot_public_keys.insert(from, body.ot_public);
        }
        self.commitments.insert(from, points);
        Ok(())
    }

    /// Verify all dealers, then send each peer its share
    fn finish_commitments(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        let mut culprits = Vec::new();
        let mut reason = String::new();
        for (from, payload) in self.inbox.take(KG_ROUND1_COMMITMENTS) {
            let checked = decode::<KgRound1Message>(KG_ROUND1_COMMITMENTS, from, &payload)
                .and_then(|body| self.check_commitments(from, body));
            match checked {
                Ok(()) => {}
                Err(ProtocolError::InvalidShare { reason: r, .. }) => {
                    culprits.push(from);
                    reason = r;
                }
                Err(e) => return Err(e),
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: KG_ROUND1_COMMITMENTS,
                culprits,
                reason,
            });
        }

        debug!(index = self.index, "Commitments verified, dealing shares");
        let mut out = Vec::new();
        for to in self.others().collect::<Vec<_>>() {
            let share = evaluate_polynomial(&self.coefficients, to as u64 + 1);
            let body = KgRound2Message {
                share: C::scalar_to_bytes(&share),
            };
            out.push(ProtocolMessage::unicast(KG_ROUND2_SHARE, to, &body)?);
        }
        self.secret_share = evaluate_polynomial(&self.coefficients, self.index as u64 + 1);
        self.stage = Stage::Shares;
        Ok(out)
    }

    fn finish_shares(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        let x = self.index as u64 + 1;
        let mut culprits = Vec::new();
        for (from, payload) in self.inbox.take(KG_ROUND2_SHARE) {
            let body: KgRound2Message = match decode(KG_ROUND2_SHARE, from, &payload) {
                Ok(body) => body,
                Err(_) => {
                    culprits.push(from);
                    continue;
                }
            };
            let share = C::scalar_from_bytes(&body.share);
            let expected = self.commitments.get(&from).map(|c| evaluate_commitments::<C>(c, x));
            match (share, expected) {
                (Some(share), Some(expected)) if C::generator() * share == expected => {
                    self.secret_share += share;
                }
                _ => culprits.push(from),
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: KG_ROUND2_SHARE,
                culprits,
                reason: "share does not match commitments".into(),
            });
        }

        self.pub_key = self.commitments.values().map(|c| c[0]).sum::<C::Point>()
            + C::generator() * self.coefficients[0];
        for index in self.indices.clone() {
            let x = index as u64 + 1;
            let dealt: C::Point = self
                .commitments
                .values()
                .map(|c| evaluate_commitments::<C>(c, x))
                .sum();
            let own = C::generator() * evaluate_polynomial(&self.coefficients, x);
            self.public_shares.insert(index, dealt + own);
        }
        self.coefficients.iter_mut().for_each(|c| *c = C::Scalar::ZERO);

        let body = KgRound3Message {
            pub_key: C::point_to_bytes(&self.pub_key),
            public_share: C::point_to_bytes(&(C::generator() * self.secret_share)),
        };
        self.stage = Stage::PublicShares;
        Ok(vec![ProtocolMessage::broadcast(KG_ROUND3_PUBLIC_SHARE, &body)?])
    }

    fn finish_public_shares(&mut self) -> Result<DkgOutput, ProtocolError> {
        let pub_key = C::point_to_bytes(&self.pub_key);
        let mut culprits = Vec::new();
        for (from, payload) in self.inbox.take(KG_ROUND3_PUBLIC_SHARE) {
            let consistent = decode::<KgRound3Message>(KG_ROUND3_PUBLIC_SHARE, from, &payload)
                .map(|body| {
                    body.pub_key == pub_key
                        && self
                            .public_shares
                            .get(&from)
                            .map(|p| C::point_to_bytes(p) == body.public_share)
                            .unwrap_or(false)
                })
                .unwrap_or(false);
            if !consistent {
                culprits.push(from);
            }
        }
        if !culprits.is_empty() {
            return Err(ProtocolError::InvalidShare {
                round: KG_ROUND3_PUBLIC_SHARE,
                culprits,
                reason: "inconsistent group key or public share".into(),
            });
        }

        let mut ot_public_keys = std::mem::take(&mut self.ot_public_keys);
        if self.require_ot {
            ot_public_keys.insert(self.index, self.ot_public.clone());
        }
        let output = DkgOutput {
            index: self.index,
            threshold: self.threshold,
            secret_share: C::scalar_to_bytes(&self.secret_share),
            pub_key,
            public_shares: self
                .public_shares
                .iter()
                .map(|(i, p)| (*i, C::point_to_bytes(p)))
                .collect(),
            ot_public_keys,
        };
        self.secret_share = C::Scalar::ZERO;
        self.stage = Stage::Done;
        info!(index = self.index, pub_key = %hex::encode(&output.pub_key), "Keygen completed");
        Ok(output)
    }
}

impl<C: Ciphersuite> RoundProtocol for KeygenProtocol<C> {
    type Output = DkgOutput;

    fn rounds(&self) -> &'static [RoundInfo] {
        KEYGEN_ROUNDS
    }

    fn start(&mut self) -> Result<Vec<ProtocolMessage>, ProtocolError> {
        self.coefficients = (0..=self.threshold).map(|_| C::random_scalar()).collect();
        let commitments: Vec<C::Point> = self.coefficients.iter().map(|c| C::generator() * c).collect();
        let (proof_nonce, proof_response) =
            prove::<C>(&self.session_id, self.index, &self.coefficients[0], &commitments[0]);
        let body = KgRound1Message {
            commitments: commitments.iter().map(C::point_to_bytes).collect(),
            proof_nonce,
            proof_response,
            ot_public: self.ot_public.clone(),
        };
        Ok(vec![ProtocolMessage::broadcast(KG_ROUND1_COMMITMENTS, &body)?])
    }

    fn handle_message(&mut self, from: usize, round_type: &str, payload: &[u8]) -> Result<Step<DkgOutput>, ProtocolError> {
        self.inbox.insert(from, round_type, payload)?;

        let mut out = Vec::new();
        loop {
            match self.stage {
                Stage::Commitments if self.inbox.is_complete(KG_ROUND1_COMMITMENTS) => {
                    out.extend(self.finish_commitments()?);
                }
                Stage::Shares if self.inbox.is_complete(KG_ROUND2_SHARE) => {
                    out.extend(self.finish_shares()?);
                }
                Stage::PublicShares if self.inbox.is_complete(KG_ROUND3_PUBLIC_SHARE) => {
                    let output = self.finish_public_shares()?;
                    return Ok(Step::Finished(out, output));
                }
                _ => return Ok(Step::Continue(out)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ciphersuite::{lagrange_coefficient, Ed25519, Secp256k1};
    use crate::protocol::Recipient;
    use std::collections::VecDeque;

    /// Run protocols to completion over a lossless in-memory queue
    pub(crate) fn run_local<P: RoundProtocol>(mut parties: BTreeMap<usize, P>) -> Result<BTreeMap<usize, P::Output>, ProtocolError> {
        let indices: Vec<usize> = parties.keys().copied().collect();
        let mut queue = VecDeque::new();
        for (index, party) in parties.iter_mut() {
            for msg in party.start()? {
                queue.push_back((*index, msg));
            }
        }
        let mut outputs = BTreeMap::new();
        while let Some((from, msg)) = queue.pop_front() {
            let targets: Vec<usize> = match msg.recipient {
                Recipient::Broadcast => indices.iter().copied().filter(|i| *i != from).collect(),
                Recipient::Party(to) => vec![to],
            };
            for to in targets {
                let party = parties.get_mut(&to).ok_or_else(|| ProtocolError::Internal("no such party".into()))?;
                match party.handle_message(from, msg.round_type, &msg.payload)? {
                    Step::Continue(next) => next.into_iter().for_each(|m| queue.push_back((to, m))),
                    Step::Finished(next, output) => {
                        next.into_iter().for_each(|m| queue.push_back((to, m)));
                        outputs.insert(to, output);
                    }
                }
            }
        }
        Ok(outputs)
    }

    pub(crate) fn run_keygen<C: Ciphersuite>(indices: &[usize], threshold: usize, with_ot: bool) -> BTreeMap<usize, DkgOutput> {
        let parties = indices
            .iter()
            .map(|i| {
                let ot = if with_ot {
                    crate::oblivious::PreParams::generate().public_key().to_vec()
                } else {
                    Vec::new()
                };
                let p = KeygenProtocol::<C>::new("sid", *i, indices.to_vec(), threshold, ot, with_ot).unwrap();
                (*i, p)
            })
            .collect();
        run_local(parties).unwrap()
    }

    fn check_keygen<C: Ciphersuite>(with_ot: bool) {
        let outputs = run_keygen::<C>(&[0, 1, 2, 3], 2, with_ot);
        assert_eq!(outputs.len(), 4);

        let pub_key = outputs[&0].pub_key.clone();
        assert!(outputs.values().all(|o| o.pub_key == pub_key));
        if with_ot {
            assert!(outputs.values().all(|o| o.ot_public_keys.len() == 4));
        }

        let signers = [0usize, 2, 3];
        let secret: C::Scalar = signers
            .iter()
            .map(|i| {
                C::scalar_from_bytes(&outputs[i].secret_share).unwrap()
                    * lagrange_coefficient::<C::Scalar>(*i, &signers).unwrap()
            })
            .sum();
        assert_eq!(C::point_to_bytes(&(C::generator() * secret)), pub_key);

        for output in outputs.values() {
            let share = C::scalar_from_bytes(&output.secret_share).unwrap();
            assert_eq!(output.public_shares[&output.index], C::point_to_bytes(&(C::generator() * share)));
        }
    }

    #[test]
    fn test_keygen_secp256k1() {
        check_keygen::<Secp256k1>(true);
    }

    #[test]
    fn test_keygen_ed25519() {
        check_keygen::<Ed25519>(false);
    }

    #[test]
    fn test_bad_share_blames_dealer() {
        let indices = vec![0usize, 1, 2];
        let mut parties: BTreeMap<usize, KeygenProtocol<Ed25519>> = indices
            .iter()
            .map(|i| (*i, KeygenProtocol::new("sid", *i, indices.clone(), 1, Vec::new(), false).unwrap()))
            .collect();

        let mut round1 = Vec::new();
        for (i, p) in parties.iter_mut() {
            round1.push((*i, p.start().unwrap().remove(0)));
        }
        let mut shares = Vec::new();
        for (from, msg) in &round1 {
            for (to, p) in parties.iter_mut() {
                if to == from {
                    continue;
                }
                if let Step::Continue(out) = p.handle_message(*from, msg.round_type, &msg.payload).unwrap() {
                    shares.extend(out.into_iter().map(|m| (*to, m)));
                }
            }
        }

        let forged = KgRound2Message {
            share: Ed25519::scalar_to_bytes(&Ed25519::random_scalar()),
        };
        let payload = serde_json::to_vec(&forged).unwrap();
        let target = parties.get_mut(&0).unwrap();
        let mut result = Ok(Step::Continue(Vec::new()));
        for (from, msg) in shares.iter().filter(|(_, m)| m.recipient == Recipient::Party(0)) {
            let payload = if *from == 2 { &payload } else { &msg.payload };
            result = target.handle_message(*from, msg.round_type, payload);
        }
        match result {
            Err(ProtocolError::InvalidShare { round, culprits, .. }) => {
                assert_eq!(round, KG_ROUND2_SHARE);
                assert_eq!(culprits, vec![2]);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(KeygenProtocol::<Secp256k1>::new("sid", 5, vec![0, 1], 1, Vec::new(), false).is_err());
        assert!(KeygenProtocol::<Secp256k1>::new("sid", 0, vec![0, 1], 2, Vec::new(), false).is_err());
    }
}
