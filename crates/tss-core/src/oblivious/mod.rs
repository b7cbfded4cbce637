//! Oblivious transfer primitives used by threshold ECDSA signing
//!
//! - simplest OT (Chou-Orlandi) base transfers keyed by each party's
//!   long-term OT key pair, the ECDSA pre-parameters
//! - Gilboa multiplicative-to-additive conversion on top of them

pub mod mta;
pub mod ot;

pub use mta::{MtaReceiver, MtaResponse};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ciphersuite::{Ciphersuite, Secp256k1};
use crate::types::hex_bytes;
use crate::{Error, Result};

/// Bits per multiplied scalar, one OT each
pub const SCALAR_BITS: usize = 256;

/// ECDSA pre-parameters: the party's long-term OT sender key pair
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreParams {
    #[serde(with = "hex_bytes")]
    secret: Vec<u8>,
    #[serde(with = "hex_bytes")]
    public: Vec<u8>,
}

impl PreParams {
    pub fn generate() -> Self {
        let secret = Secp256k1::random_scalar();
        let public = Secp256k1::generator() * secret;
        Self {
            secret: Secp256k1::scalar_to_bytes(&secret),
            public: Secp256k1::point_to_bytes(&public),
        }
    }

    /// Generate on a blocking thread, failing after `timeout`
    pub async fn generate_with_timeout(timeout: Duration) -> Result<Self> {
        let started = std::time::Instant::now();
        let params = tokio::time::timeout(timeout, tokio::task::spawn_blocking(Self::generate))
            .await
            .map_err(|_| Error::Internal("pre-parameter generation timed out".into()))?
            .map_err(|e| Error::Internal(format!("pre-parameter task failed: {e}")))?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Pre-parameters generated");
        Ok(params)
    }

    pub fn from_parts(secret: Vec<u8>, public: Vec<u8>) -> Result<Self> {
        let params = Self { secret, public };
        params.validate()?;
        Ok(params)
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret
    }

    pub(crate) fn secret_scalar(&self) -> Result<k256::Scalar> {
        Secp256k1::scalar_from_bytes(&self.secret)
            .ok_or_else(|| Error::Crypto("invalid OT secret".into()))
    }

    /// Check that the public key matches the secret
    pub fn validate(&self) -> Result<()> {
        let secret = self.secret_scalar()?;
        let public = Secp256k1::point_from_bytes(&self.public)
            .ok_or_else(|| Error::Crypto("invalid OT public key".into()))?;
        if Secp256k1::generator() * secret != public {
            return Err(Error::Crypto("OT key pair mismatch".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreParams")
            .field("public", &hex::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// Map over a slice, in parallel when the `multi-thread` feature is on
pub(crate) fn map_indexed<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync + Send,
{
    #[cfg(feature = "multi-thread")]
    {
        use rayon::prelude::*;
        items.par_iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }
    #[cfg(not(feature = "multi-thread"))]
    {
        items.iter().enumerate().map(|(i, item)| f(i, item)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pre_params() {
        let params = PreParams::generate_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        params.validate().unwrap();

        let json = serde_json::to_string(&params).unwrap();
        let back: PreParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key(), params.public_key());

        let other = PreParams::generate();
        assert!(PreParams::from_parts(other.secret_key().to_vec(), params.public_key().to_vec()).is_err());
    }
}
