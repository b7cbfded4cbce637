//! Multi-node harness over the in-memory transport

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tss_core::{
    conversion, Dispatcher, KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, MemoryNetwork,
    MemoryStateStore, SigningAlgo, TssConfig, TssServer,
};

pub const VERSION: &str = "1.0.0";

pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub servers: Vec<Arc<TssServer>>,
    /// Participant key of each server, same order
    pub keys: Vec<String>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> TssConfig {
    TssConfig {
        keygen_timeout: Duration::from_secs(30),
        keysign_timeout: Duration::from_secs(30),
        party_timeout: Duration::from_secs(5),
        join_resend_interval: Duration::from_millis(100),
        task_done_grace: Duration::from_millis(500),
        ..TssConfig::default()
    }
}

pub async fn cluster(n: usize, config: TssConfig) -> Cluster {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut servers = Vec::with_capacity(n);
    for _ in 0..n {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let pub_key = conversion::node_pub_key(&key.verifying_key());
        let peer = conversion::peer_id_from_pub_key(&pub_key).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(config.pending_message_ttl));
        let transport = network.register(peer, Arc::clone(&dispatcher));
        let server = TssServer::new(
            config.clone(),
            key,
            Arc::new(transport),
            dispatcher,
            Arc::new(MemoryStateStore::new()),
            None,
        )
        .await
        .unwrap();
        servers.push(Arc::new(server));
    }
    let keys = servers.iter().map(|s| s.local_pub_key().to_string()).collect();
    Cluster {
        network,
        servers,
        keys,
    }
}

impl Cluster {
    /// Keygen on the listed servers concurrently
    pub async fn keygen_on(&self, nodes: &[usize], algo: SigningAlgo, block_height: i64) -> Vec<KeygenResponse> {
        join_all(nodes.iter().map(|i| {
            let server = Arc::clone(&self.servers[*i]);
            let request = KeygenRequest::new(algo, self.keys.clone(), block_height, VERSION);
            async move { server.keygen(&request).await.unwrap() }
        }))
        .await
    }

    pub async fn keygen(&self, algo: SigningAlgo) -> Vec<KeygenResponse> {
        let all: Vec<usize> = (0..self.servers.len()).collect();
        self.keygen_on(&all, algo, 10).await
    }

    /// Keysign on every server with the same signer set
    pub async fn keysign(&self, pool_pub_key: &str, messages: &[&[u8]], signers: &[String]) -> Vec<KeysignResponse> {
        join_all(self.servers.iter().map(|server| {
            let server = Arc::clone(server);
            let request = KeysignRequest::new(
                pool_pub_key,
                messages.iter().map(|m| m.to_vec()).collect(),
                signers.to_vec(),
                20,
                VERSION,
            );
            async move { server.keysign(&request).await.unwrap() }
        }))
        .await
    }

    pub fn assert_unsubscribed(&self) {
        for server in &self.servers {
            assert!(server.dispatcher().is_empty(), "subscriptions left behind");
        }
    }
}
