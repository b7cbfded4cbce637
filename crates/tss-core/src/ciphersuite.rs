//! Curve abstraction shared by the keygen and signing protocols

use elliptic_curve::{
    group::{Group, GroupEncoding},
    Field, PrimeField,
};
use rand::rngs::OsRng;

use crate::types::SigningAlgo;

/// Prime-order group a threshold key lives in
pub trait Ciphersuite: Send + Sync + 'static {
    const ALGO: SigningAlgo;

    type Scalar: PrimeField;
    type Point: Group<Scalar = Self::Scalar> + GroupEncoding + Send + Sync;

    /// Reduce 64 uniformly random bytes to a scalar
    fn scalar_from_wide(bytes: &[u8; 64]) -> Self::Scalar;

    fn random_scalar() -> Self::Scalar {
        <Self::Scalar as Field>::random(&mut OsRng)
    }

    fn scalar_to_bytes(scalar: &Self::Scalar) -> Vec<u8> {
        scalar.to_repr().as_ref().to_vec()
    }

    fn scalar_from_bytes(bytes: &[u8]) -> Option<Self::Scalar> {
        let mut repr = <Self::Scalar as PrimeField>::Repr::default();
        if repr.as_ref().len() != bytes.len() {
            return None;
        }
        repr.as_mut().copy_from_slice(bytes);
        Option::from(Self::Scalar::from_repr(repr))
    }

    fn point_to_bytes(point: &Self::Point) -> Vec<u8> {
        point.to_bytes().as_ref().to_vec()
    }

    fn point_from_bytes(bytes: &[u8]) -> Option<Self::Point> {
        let mut repr = <Self::Point as GroupEncoding>::Repr::default();
        if repr.as_ref().len() != bytes.len() {
            return None;
        }
        repr.as_mut().copy_from_slice(bytes);
        Option::from(Self::Point::from_bytes(&repr))
    }

    fn generator() -> Self::Point {
        Self::Point::generator()
    }
}

/// secp256k1, used for ECDSA keys
#[derive(Debug, Clone, Copy)]
pub struct Secp256k1;

impl Ciphersuite for Secp256k1 {
    const ALGO: SigningAlgo = SigningAlgo::Secp256k1;

    type Scalar = k256::Scalar;
    type Point = k256::ProjectivePoint;

    fn scalar_from_wide(bytes: &[u8; 64]) -> Self::Scalar {
        use elliptic_curve::{bigint::U512, ops::Reduce};
        <k256::Scalar as Reduce<U512>>::reduce(U512::from_be_slice(bytes))
    }
}

/// ed25519, used for EdDSA keys
#[derive(Debug, Clone, Copy)]
pub struct Ed25519;

impl Ciphersuite for Ed25519 {
    const ALGO: SigningAlgo = SigningAlgo::Ed25519;

    type Scalar = curve25519_dalek::Scalar;
    type Point = curve25519_dalek::EdwardsPoint;

    fn scalar_from_wide(bytes: &[u8; 64]) -> Self::Scalar {
        curve25519_dalek::Scalar::from_bytes_mod_order_wide(bytes)
    }
}

/// Evaluate a polynomial (constant term first) at `x`
pub fn evaluate_polynomial<S: PrimeField>(coefficients: &[S], x: u64) -> S {
    let x = S::from(x);
    coefficients
        .iter()
        .rev()
        .fold(S::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Evaluate a committed polynomial (Feldman commitments) at `x`
pub fn evaluate_commitments<C: Ciphersuite>(commitments: &[C::Point], x: u64) -> C::Point {
    let x = C::Scalar::from(x);
    commitments
        .iter()
        .rev()
        .fold(C::Point::identity(), |acc, commitment| acc * x + commitment)
}

/// Lagrange coefficient at zero of Shamir index `index` within `indices`
pub fn lagrange_coefficient<S: PrimeField>(index: usize, indices: &[usize]) -> Option<S> {
    let i = S::from(index as u64 + 1);
    let mut numerator = S::ONE;
    let mut denominator = S::ONE;

    for &other in indices {
        if other == index {
            continue;
        }
        let j = S::from(other as u64 + 1);
        numerator *= j;
        denominator *= j - i;
    }

    Option::from(denominator.invert()).map(|inv: S| numerator * inv)
}
