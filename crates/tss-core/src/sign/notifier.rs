//! Verification of finished keysign batches before they are released

use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::conversion::{self, compare_messages};
use crate::types::{SignatureData, SigningAlgo};
use crate::{Error, Result};

/// How long a notifier waits for its batch before it may be discarded
pub const DEFAULT_NOTIFIER_TTL: Duration = Duration::from_secs(30);

/// Verify a signature batch against the pool key.
///
/// The verification algorithm comes from the key's type tag. Both sides are
/// put in descending message order and every pair must verify.
pub fn verify(signatures: &[SignatureData], messages: &[Vec<u8>], pool_pub_key: &str) -> bool {
    match try_verify(signatures, messages, pool_pub_key) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Signature batch rejected");
            false
        }
    }
}

fn try_verify(signatures: &[SignatureData], messages: &[Vec<u8>], pool_pub_key: &str) -> Result<()> {
    if signatures.is_empty() || signatures.len() != messages.len() {
        return Err(Error::VerificationFailed(format!(
            "{} signatures for {} messages",
            signatures.len(),
            messages.len()
        )));
    }
    let (algo, key) = conversion::decode_pub_key(pool_pub_key)?;

    let mut messages = messages.to_vec();
    conversion::sort_messages_desc(&mut messages);
    let mut signatures: Vec<&SignatureData> = signatures.iter().collect();
    signatures.sort_by(|a, b| compare_messages(&b.message, &a.message));

    for (i, (sig, message)) in signatures.iter().zip(messages.iter()).enumerate() {
        if sig.signature.algo() != algo {
            return Err(Error::VerificationFailed(format!(
                "signature {} is not a {algo} signature",
                i + 1
            )));
        }
        let valid = match algo {
            SigningAlgo::Secp256k1 => super::ecdsa::verify(&key, message, &sig.signature),
            SigningAlgo::Ed25519 => super::eddsa::verify(&key, message, &sig.signature),
        };
        if !valid {
            return Err(Error::VerificationFailed(format!(
                "signature {} of {} did not verify",
                i + 1,
                signatures.len()
            )));
        }
    }
    Ok(())
}

/// Collects a keysign batch and releases it once it verifies
pub struct Notifier {
    message_id: String,
    messages: Vec<Vec<u8>>,
    pool_pub_key: String,
    signatures: Vec<SignatureData>,
    resp: Option<oneshot::Sender<Vec<SignatureData>>>,
    processed: bool,
    last_updated: Instant,
    ttl: Duration,
}

impl Notifier {
    pub fn new(
        message_id: impl Into<String>,
        messages: Vec<Vec<u8>>,
        pool_pub_key: impl Into<String>,
        signatures: Vec<SignatureData>,
    ) -> Result<(Self, oneshot::Receiver<Vec<SignatureData>>)> {
        let message_id = message_id.into();
        if message_id.is_empty() {
            return Err(Error::InvalidRequest("message id is empty".into()));
        }
        let (tx, rx) = oneshot::channel();
        Ok((
            Self {
                message_id,
                messages,
                pool_pub_key: pool_pub_key.into(),
                signatures,
                resp: Some(tx),
                processed: false,
                last_updated: Instant::now(),
                ttl: DEFAULT_NOTIFIER_TTL,
            },
            rx,
        ))
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Everything needed to verify is present and nothing was released yet
    pub fn ready_to_process(&self) -> bool {
        !self.message_id.is_empty()
            && !self.messages.is_empty()
            && !self.pool_pub_key.is_empty()
            && !self.signatures.is_empty()
            && !self.processed
    }

    /// Fill in whatever is still missing
    pub fn update_unset(&mut self, messages: Vec<Vec<u8>>, pool_pub_key: &str, signatures: Vec<SignatureData>) {
        self.last_updated = Instant::now();
        if self.messages.is_empty() {
            self.messages = messages;
        }
        if self.pool_pub_key.is_empty() {
            self.pool_pub_key = pool_pub_key.to_string();
        }
        if self.signatures.is_empty() {
            self.signatures = signatures;
        }
    }

    pub fn is_expired(&self) -> bool {
        self.last_updated.elapsed() > self.ttl
    }

    /// Verify `signatures` and release them on the response channel.
    ///
    /// An empty batch is a failed keysign and releases nothing.
    pub fn process_signature(&mut self, signatures: Vec<SignatureData>) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        if self.processed {
            return Err(Error::Internal(format!("batch {} already released", self.message_id)));
        }
        try_verify(&signatures, &self.messages, &self.pool_pub_key).map_err(|e| {
            warn!(message_id = %self.message_id, error = %e, "Keysign batch failed verification");
            e
        })?;

        self.processed = true;
        self.signatures = signatures.clone();
        if let Some(resp) = self.resp.take() {
            let _ = resp.send(signatures);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signature;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_batch(key: &SigningKey, messages: &[&[u8]]) -> Vec<SignatureData> {
        messages
            .iter()
            .map(|m| SignatureData {
                message: m.to_vec(),
                signature: Signature::Eddsa {
                    raw: key.sign(m).to_bytes().to_vec(),
                },
            })
            .collect()
    }

    #[test]
    fn test_verify_batch_is_order_insensitive_and_atomic() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let pool = conversion::encode_pub_key(SigningAlgo::Ed25519, key.verifying_key().as_bytes());
        let messages = vec![b"m1".to_vec(), b"m2".to_vec()];

        let mut batch = signed_batch(&key, &[b"m2", b"m1"]);
        assert!(verify(&batch, &messages, &pool));
        batch.reverse();
        assert!(verify(&batch, &messages, &pool));

        if let Signature::Eddsa { raw } = &mut batch[1].signature {
            raw[0] ^= 1;
        }
        assert!(!verify(&batch, &messages, &pool));
        assert!(!verify(&batch[..1], &messages, &pool));
    }

    #[test]
    fn test_verify_pairs_messages_with_equal_value() {
        let key = SigningKey::from_bytes(&[6u8; 32]);
        let pool = conversion::encode_pub_key(SigningAlgo::Ed25519, key.verifying_key().as_bytes());
        let batch = signed_batch(&key, &[&[5u8], &[0u8, 5]]);

        assert!(verify(&batch, &[vec![5], vec![0, 5]], &pool));
        assert!(verify(&batch, &[vec![0, 5], vec![5]], &pool));
    }

    #[test]
    fn test_algorithm_comes_from_key_tag() {
        let key = SigningKey::from_bytes(&[4u8; 32]);
        let wrong_tag = format!(
            "secp256k1:{}",
            bs58::encode(key.verifying_key().as_bytes()).into_string()
        );
        let batch = signed_batch(&key, &[b"m"]);
        assert!(!verify(&batch, &[b"m".to_vec()], &wrong_tag));
    }

    #[tokio::test]
    async fn test_notifier_releases_verified_batch() {
        assert!(Notifier::new("", Vec::new(), "", Vec::new()).is_err());

        let key = SigningKey::from_bytes(&[5u8; 32]);
        let pool = conversion::encode_pub_key(SigningAlgo::Ed25519, key.verifying_key().as_bytes());
        let (mut notifier, rx) = Notifier::new("msg-1", Vec::new(), "", Vec::new()).unwrap();
        assert!(!notifier.ready_to_process());

        let batch = signed_batch(&key, &[b"m"]);
        notifier.update_unset(vec![b"m".to_vec()], &pool, batch.clone());
        assert!(notifier.ready_to_process());
        assert!(!notifier.is_expired());

        notifier.process_signature(batch.clone()).unwrap();
        assert!(!notifier.ready_to_process());
        assert_eq!(rx.await.unwrap(), batch);
        assert!(notifier.process_signature(batch).is_err());
    }
}
