//! Gilboa multiplication over oblivious transfer
//!
//! The receiver holds scalars `b_1..b_k`, the sender one scalar `a`. After a
//! single request/response exchange the sender holds `alpha_j` and the
//! receiver `beta_j` with `alpha_j + beta_j = a * b_j`.

use elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::ot::{self, OtKey};
use super::{map_indexed, SCALAR_BITS};
use crate::ciphersuite::{Ciphersuite, Secp256k1};

/// Masked messages of every transfer, indexed by choice bit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaResponse {
    #[serde(with = "crate::types::hex_vec")]
    pub masked: Vec<Vec<u8>>,
}

fn bits(scalar: &Scalar) -> impl Iterator<Item = bool> {
    let bytes = scalar.to_bytes();
    (0..SCALAR_BITS).map(move |t| (bytes[31 - t / 8] >> (t % 8)) & 1 == 1)
}

fn powers_of_two() -> Vec<Scalar> {
    let mut power = Scalar::ONE;
    (0..SCALAR_BITS)
        .map(|_| {
            let current = power;
            power = power.double();
            current
        })
        .collect()
}

fn mask(value: &Scalar, key: &OtKey) -> Vec<u8> {
    value
        .to_bytes()
        .iter()
        .zip(key.iter())
        .map(|(v, k)| v ^ k)
        .collect()
}

fn unmask(masked: &[u8], key: &OtKey) -> Option<Scalar> {
    if masked.len() != 32 {
        return None;
    }
    let bytes: Vec<u8> = masked.iter().zip(key.iter()).map(|(m, k)| m ^ k).collect();
    Secp256k1::scalar_from_bytes(&bytes)
}

/// Receiver half of a batch of multiplications
pub struct MtaReceiver {
    keys: Vec<OtKey>,
    choices: Vec<bool>,
    count: usize,
}

impl MtaReceiver {
    /// Choose one OT per bit of every input; returns the request for the sender
    pub fn new(inputs: &[Scalar], sender_public: &ProjectivePoint, tag: &[u8]) -> (Self, Vec<ProjectivePoint>) {
        let choices: Vec<bool> = inputs.iter().flat_map(bits).collect();
        let (requests, keys) = ot::receiver_choose(sender_public, &choices, tag);
        (
            Self {
                keys,
                choices,
                count: inputs.len(),
            },
            requests,
        )
    }

    /// Additive shares `beta_j`, or `None` when the response is malformed
    pub fn finish(&self, response: &MtaResponse) -> Option<Vec<Scalar>> {
        if response.masked.len() != self.choices.len() * 2 {
            return None;
        }
        let powers = powers_of_two();
        let mut shares = Vec::with_capacity(self.count);
        for chunk in 0..self.count {
            let mut beta = Scalar::ZERO;
            for (t, power) in powers.iter().enumerate() {
                let index = chunk * SCALAR_BITS + t;
                let slot = index * 2 + usize::from(self.choices[index]);
                beta += unmask(&response.masked[slot], &self.keys[index])? * power;
            }
            shares.push(beta);
        }
        Some(shares)
    }
}

/// Sender half: answer `requests` with input `a`, returning `alpha_j` per receiver input
pub fn respond(
    input: &Scalar,
    ot_secret: &Scalar,
    ot_public: &ProjectivePoint,
    requests: &[ProjectivePoint],
    tag: &[u8],
) -> Option<(Vec<Scalar>, MtaResponse)> {
    if requests.is_empty() || requests.len() % SCALAR_BITS != 0 {
        return None;
    }
    let keys = ot::sender_keys(ot_secret, ot_public, requests, tag);
    let pads: Vec<Scalar> = map_indexed(requests, |_, _| {
        <Scalar as elliptic_curve::Field>::random(&mut OsRng)
    });
    let powers = powers_of_two();

    let mut masked = Vec::with_capacity(requests.len() * 2);
    let mut alphas = vec![Scalar::ZERO; requests.len() / SCALAR_BITS];
    for (index, ((k0, k1), pad)) in keys.iter().zip(pads.iter()).enumerate() {
        masked.push(mask(pad, k0));
        masked.push(mask(&(*pad + input), k1));
        alphas[index / SCALAR_BITS] -= *pad * powers[index % SCALAR_BITS];
    }
    Some((alphas, MtaResponse { masked }))
}
