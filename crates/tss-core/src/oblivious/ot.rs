//! Simplest OT (Chou-Orlandi) over secp256k1
//!
//! The sender publishes `A = a·G` once. For every transfer the receiver sends
//! `B = b·G` (choice 0) or `B = A + b·G` (choice 1) and derives the key from
//! `b·A`; the sender derives both keys from `a·B` and `a·(B - A)`.

use k256::{ProjectivePoint, Scalar};
use sha2::{Digest, Sha256};

use super::map_indexed;
use crate::ciphersuite::{Ciphersuite, Secp256k1};

/// Symmetric key of one transfer
pub type OtKey = [u8; 32];

fn derive_key(tag: &[u8], index: usize, point: &ProjectivePoint) -> OtKey {
    let mut hasher = Sha256::new();
    hasher.update((tag.len() as u64).to_be_bytes());
    hasher.update(tag);
    hasher.update((index as u64).to_be_bytes());
    hasher.update(Secp256k1::point_to_bytes(point));
    hasher.finalize().into()
}

/// Receiver: request points and the key of each chosen message
pub fn receiver_choose(sender_public: &ProjectivePoint, choices: &[bool], tag: &[u8]) -> (Vec<ProjectivePoint>, Vec<OtKey>) {
    map_indexed(choices, |index, choice| {
        let b = Secp256k1::random_scalar();
        let mut request = ProjectivePoint::GENERATOR * b;
        if *choice {
            request += sender_public;
        }
        (request, derive_key(tag, index, &(*sender_public * b)))
    })
    .into_iter()
    .unzip()
}

/// Sender: both keys of every transfer
pub fn sender_keys(
    secret: &Scalar,
    public: &ProjectivePoint,
    requests: &[ProjectivePoint],
    tag: &[u8],
) -> Vec<(OtKey, OtKey)> {
    map_indexed(requests, |index, request| {
        let k0 = derive_key(tag, index, &(*request * secret));
        let k1 = derive_key(tag, index, &((*request - public) * secret));
        (k0, k1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_learns_only_chosen_key() {
        let a = Secp256k1::random_scalar();
        let public = ProjectivePoint::GENERATOR * a;
        let choices = [true, false, true, true, false];

        let (requests, keys) = receiver_choose(&public, &choices, b"tag");
        let pairs = sender_keys(&a, &public, &requests, b"tag");

        for (i, choice) in choices.iter().enumerate() {
            let (k0, k1) = pairs[i];
            if *choice {
                assert_eq!(keys[i], k1);
                assert_ne!(keys[i], k0);
            } else {
                assert_eq!(keys[i], k0);
                assert_ne!(keys[i], k1);
            }
        }

        let other_tag = sender_keys(&a, &public, &requests, b"other");
        assert_ne!(other_tag[0], pairs[0]);
    }
}
