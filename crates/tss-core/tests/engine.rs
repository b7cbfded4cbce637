mod common;

use common::{cluster, test_config, Cluster, VERSION};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tss_core::{
    conversion, Error, FailReason, KeygenRequest, KeysignRequest, MessageType, Signature, SignatureData, SigningAlgo,
    Status, TssConfig,
};

fn collect_signatures(responses: &[tss_core::KeysignResponse]) -> Vec<SignatureData> {
    let mut signatures = Vec::new();
    for response in responses {
        assert_eq!(response.status, Status::Success, "blame: {:?}", response.blame);
        if !response.signatures.is_empty() {
            if signatures.is_empty() {
                signatures = response.signatures.clone();
            } else {
                assert_eq!(signatures.len(), response.signatures.len());
            }
        }
    }
    signatures
}

fn flip_byte(signatures: &mut [SignatureData]) {
    match &mut signatures[0].signature {
        Signature::Ecdsa { s, .. } => s[31] ^= 0x01,
        Signature::Eddsa { raw } => raw[40] ^= 0x01,
    }
}

async fn keygen_and_sign(algo: SigningAlgo) {
    let c = cluster(3, test_config()).await;
    let responses = c.keygen(algo).await;
    for response in &responses {
        assert_eq!(response.status, Status::Success, "blame: {:?}", response.blame);
        assert_eq!(response.algo, algo);
        assert_eq!(response.pub_key, responses[0].pub_key);
        assert_eq!(response.pool_address, responses[0].pool_address);
    }
    let pub_key = responses[0].pub_key.clone();
    assert!(pub_key.starts_with(algo.as_str()));

    let signed = c.keysign(&pub_key, &[b"m1", b"m2"], &c.keys).await;
    // T = 1 for three parties, so two nodes sign and one is left out
    let signers = signed.iter().filter(|r| !r.signatures.is_empty()).count();
    assert_eq!(signers, 2);

    let mut signatures = collect_signatures(&signed);
    assert_eq!(signatures.len(), 2);
    let messages = vec![b"m1".to_vec(), b"m2".to_vec()];
    assert!(tss_core::verify(&signatures, &messages, &pub_key));

    flip_byte(&mut signatures);
    assert!(!tss_core::verify(&signatures, &messages, &pub_key));
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ecdsa_keygen_then_keysign() {
    keygen_and_sign(SigningAlgo::Secp256k1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eddsa_keygen_then_keysign() {
    keygen_and_sign(SigningAlgo::Ed25519).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keysign_is_insensitive_to_submission_order() {
    let c = cluster(3, test_config()).await;
    let pub_key = c.keygen(SigningAlgo::Ed25519).await[0].pub_key.clone();

    let batch: [&[u8]; 3] = [b"\x01aaaa", b"\x03aaaa", b"\x02aaaa"];
    let responses = futures_util::future::join_all(c.servers.iter().enumerate().map(|(i, server)| {
        let server = Arc::clone(server);
        let mut messages: Vec<Vec<u8>> = batch.iter().map(|m| m.to_vec()).collect();
        messages.rotate_left(i);
        let request = KeysignRequest::new(pub_key.clone(), messages, c.keys.clone(), 30, VERSION);
        async move { server.keysign(&request).await.unwrap() }
    }))
    .await;

    let signatures = collect_signatures(&responses);
    let order: Vec<&[u8]> = signatures.iter().map(|s| s.message.as_slice()).collect();
    let expected: Vec<&[u8]> = vec![b"\x03aaaa", b"\x02aaaa", b"\x01aaaa"];
    assert_eq!(order, expected);

    let reversed: Vec<Vec<u8>> = batch.iter().rev().map(|m| m.to_vec()).collect();
    assert!(tss_core::verify(&signatures, &reversed, &pub_key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_participant_gets_no_signatures() {
    let c = cluster(3, test_config()).await;
    let pub_key = c.keygen(SigningAlgo::Ed25519).await[0].pub_key.clone();

    let request = KeysignRequest::new(pub_key, vec![b"m1".to_vec()], c.keys[..2].to_vec(), 40, VERSION);
    let response = c.servers[2].keysign(&request).await.unwrap();
    assert_eq!(response.status, Status::Success);
    assert!(response.signatures.is_empty());
    assert!(response.blame.blame_nodes.is_empty());
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keysign_below_stored_threshold_is_rejected() {
    let c = cluster(4, test_config()).await;
    let pub_key = c.keygen(SigningAlgo::Ed25519).await[0].pub_key.clone();

    // four parties tolerate T = 2, so two signers are not enough
    let request = KeysignRequest::new(pub_key, vec![b"m1".to_vec()], c.keys[..2].to_vec(), 50, VERSION);
    let result = c.servers[0].keysign(&request).await;
    assert!(matches!(result, Err(Error::ThresholdNotMet { required: 3, actual: 2 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_failure_blames_missing_node() {
    let config = TssConfig {
        party_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster(3, config).await;

    let responses = c.keygen_on(&[0, 1], SigningAlgo::Ed25519, 10).await;
    for response in responses {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, Some(FailReason::SyncFailure));
        assert_eq!(response.blame.accused(), vec![c.keys[2].as_str()]);
    }
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_timeout_blame_stays_within_threshold() {
    let config = TssConfig {
        keygen_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster(4, config).await;
    let silent = conversion::peer_id_from_pub_key(&c.keys[3]).unwrap();
    c.network
        .set_filter(move |from, _, message| !(from == &silent && message.message_type == MessageType::Keygen));

    let responses = c.keygen_on(&[0, 1, 2, 3], SigningAlgo::Ed25519, 10).await;
    let threshold = conversion::threshold(4).unwrap();
    for response in &responses[..3] {
        assert_eq!(response.status, Status::Fail);
        let accused = response.blame.accused();
        assert!(!accused.is_empty());
        assert!(accused.len() <= threshold);
        assert!(accused.contains(&c.keys[3].as_str()));
    }
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keysign_timeout_blames_silent_signer() {
    let config = TssConfig {
        keysign_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster(4, config).await;
    let pub_key = c.keygen(SigningAlgo::Ed25519).await[0].pub_key.clone();

    // joins normally, then drops out of the signing rounds
    let silent = conversion::peer_id_from_pub_key(&c.keys[2]).unwrap();
    c.network
        .set_filter(move |from, _, message| !(from == &silent && message.message_type == MessageType::Keysign));

    let signers = c.keys[..3].to_vec();
    let responses = c.keysign(&pub_key, &[b"m1"], &signers).await;
    for response in &responses[..2] {
        assert_eq!(response.status, Status::Fail);
        assert!(response.signatures.is_empty());
        assert_eq!(response.blame.fail_reason, Some(FailReason::Timeout));
        assert_eq!(response.blame.accused(), vec![c.keys[2].as_str()]);
    }
    assert_eq!(responses[2].status, Status::Fail);
    // not a signer
    assert_eq!(responses[3].status, Status::Success);
    assert!(responses[3].signatures.is_empty());
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_keygen_waits_for_lock() {
    let config = TssConfig {
        party_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster(3, config).await;
    let server = Arc::clone(&c.servers[0]);
    let started = Instant::now();

    // nobody else joins, so each call holds the lock for the join timeout
    let first = {
        let server = Arc::clone(&server);
        let request = KeygenRequest::new(SigningAlgo::Ed25519, c.keys.clone(), 1, VERSION);
        tokio::spawn(async move {
            server.keygen(&request).await.unwrap();
            started.elapsed()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.keygen_in_progress());

    let second = {
        let server = Arc::clone(&server);
        let request = KeygenRequest::new(SigningAlgo::Ed25519, c.keys.clone(), 2, VERSION);
        tokio::spawn(async move {
            server.keygen(&request).await.unwrap();
            started.elapsed()
        })
    };

    let first_done = first.await.unwrap();
    let second_done = second.await.unwrap();
    assert!(second_done >= first_done + Duration::from_millis(900));
    assert!(!server.keygen_in_progress());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keygen_all_algo() {
    let c = cluster(3, test_config()).await;
    let responses = futures_util::future::join_all(c.servers.iter().map(|server| {
        let server = Arc::clone(server);
        let request = KeygenRequest::new(SigningAlgo::Secp256k1, c.keys.clone(), 10, VERSION);
        async move { server.keygen_all_algo(&request).await.unwrap() }
    }))
    .await;

    for node in &responses {
        assert_eq!(node.len(), 2);
        assert_eq!(node[0].algo, SigningAlgo::Secp256k1);
        assert_eq!(node[1].algo, SigningAlgo::Ed25519);
        assert!(node.iter().all(|r| r.status == Status::Success));
        assert_eq!(node, &responses[0]);
    }

    let ed_key = responses[0][1].pub_key.clone();
    let signatures = collect_signatures(&c.keysign(&ed_key, &[b"all"], &c.keys).await);
    assert!(tss_core::verify(&signatures, &[b"all".to_vec()], &ed_key));
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keygen_all_algo_failure_is_atomic() {
    let config = TssConfig {
        party_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let c = cluster(3, config).await;
    let request = KeygenRequest::new(SigningAlgo::Secp256k1, c.keys.clone(), 10, VERSION);
    let responses = c.servers[0].keygen_all_algo(&request).await.unwrap();
    assert_eq!(responses.len(), 2);
    for response in responses {
        assert_eq!(response.status, Status::Fail);
        assert!(response.pub_key.is_empty());
        assert_eq!(response.blame.fail_reason, Some(FailReason::SyncFailure));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_aborts_pending_keygen() {
    let c: Cluster = cluster(3, test_config()).await;
    let server = Arc::clone(&c.servers[0]);
    let request = KeygenRequest::new(SigningAlgo::Ed25519, c.keys.clone(), 3, VERSION);
    let handle = tokio::spawn(async move { server.keygen(&request).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    c.servers[0].stop();
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Stopped)));
    c.assert_unsubscribed();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_requests_fail_before_join() {
    let c = cluster(2, test_config()).await;
    let lonely = KeygenRequest::new(SigningAlgo::Ed25519, c.keys[..1].to_vec(), 1, VERSION);
    assert!(matches!(c.servers[0].keygen(&lonely).await, Err(Error::InvalidRequest(_))));

    let outsider = KeygenRequest::new(SigningAlgo::Ed25519, c.keys.clone(), 1, VERSION);
    let foreign = cluster(1, test_config()).await;
    assert!(matches!(foreign.servers[0].keygen(&outsider).await, Err(Error::InvalidRequest(_))));

    let empty = KeysignRequest::new("ed25519:missing", Vec::new(), c.keys.clone(), 1, VERSION);
    assert!(matches!(c.servers[0].keysign(&empty).await, Err(Error::InvalidRequest(_))));
    c.assert_unsubscribed();
}
