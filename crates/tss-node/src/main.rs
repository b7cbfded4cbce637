//! TSS Node CLI
//!
//! Command-line interface for running one TSS engine against a relay:
//! - Node identity setup
//! - Keygen (single algorithm or all at once)
//! - Keysign and signature verification
//! - An in-process multi-party demo

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ed25519_dalek::SigningKey;
use msg_relay_client::{spawn_inbox_poller, RelayTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tss_core::{
    conversion, Dispatcher, FileStateStore, KeygenRequest, KeygenResponse, KeysignRequest, LocalStateStore,
    MemoryNetwork, MemoryStateStore, PreParams, Signal, SignatureData, SigningAlgo, Status, TssConfig, TssServer,
};
use zeroize::Zeroizing;

const NODE_KEY_FILE: &str = "node_key";
const PRE_PARAMS_FILE: &str = "pre_params.json";

/// TSS Node - threshold signing party
#[derive(Parser)]
#[command(name = "tss-node")]
#[command(about = "Threshold signature party node")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay: String,

    /// Data directory for the node key, local states and address book
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(short, long, env = "TSS_CONFIG")]
    config: Option<PathBuf>,

    /// Relay inbox poll interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AlgoArg {
    Secp256k1,
    Ed25519,
    /// Every supported algorithm under one join
    All,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the node identity key
    InitKey {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Run distributed key generation
    Keygen {
        /// Participant keys (comma-separated), this node included
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,

        #[arg(short, long, value_enum, default_value = "secp256k1")]
        algo: AlgoArg,

        /// Block height the session is scoped to
        #[arg(short, long)]
        block_height: i64,

        /// Protocol version announced during join
        #[arg(long, default_value = tss_core::VERSION)]
        protocol_version: String,
    },

    /// Sign messages with a stored key
    Keysign {
        /// Group public key of the stored key
        #[arg(short, long)]
        pool_pub_key: String,

        /// Hex encoded messages
        #[arg(short, long, required = true)]
        message: Vec<String>,

        /// Signer keys (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,

        #[arg(short, long)]
        block_height: i64,

        #[arg(long, default_value = tss_core::VERSION)]
        protocol_version: String,

        /// Write the signatures to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Verify a signature batch file against a group public key
    Verify {
        #[arg(short, long)]
        pool_pub_key: String,

        /// Hex encoded messages
        #[arg(short, long, required = true)]
        message: Vec<String>,

        /// Signature file written by `keysign --out`
        #[arg(short, long)]
        signatures: PathBuf,
    },

    /// Show node identity and known peers
    Info,

    /// Run keygen, keysign and verify between in-process parties
    Demo {
        #[arg(short, long, default_value = "3")]
        parties: usize,

        #[arg(short, long, value_enum, default_value = "ed25519")]
        algo: AlgoArg,

        /// Messages to sign
        #[arg(short, long, default_values_t = vec!["m1".to_string(), "m2".to_string()])]
        message: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &cli.config {
        Some(path) => TssConfig::from_file(path)?,
        None => TssConfig::default(),
    };

    match &cli.command {
        Commands::InitKey { force } => init_key(&cli.dest, *force)?,
        Commands::Keygen {
            keys,
            algo,
            block_height,
            protocol_version,
        } => {
            let node = Node::start(&cli, config).await?;
            let result = run_keygen(&node.server, keys.clone(), *algo, *block_height, protocol_version).await;
            node.shutdown().await;
            result?;
        }
        Commands::Keysign {
            pool_pub_key,
            message,
            keys,
            block_height,
            protocol_version,
            out,
        } => {
            let node = Node::start(&cli, config).await?;
            let request = KeysignRequest::new(
                pool_pub_key.clone(),
                decode_messages(message)?,
                keys.clone(),
                *block_height,
                protocol_version.clone(),
            );
            let result = node.server.keysign(&request).await;
            node.shutdown().await;

            let response = result?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.status != Status::Success {
                return Err(anyhow!("keysign failed"));
            }
            if let Some(out) = out {
                std::fs::write(out, serde_json::to_vec_pretty(&response.signatures)?)?;
                info!(path = ?out, "Signatures saved");
            }
        }
        Commands::Verify {
            pool_pub_key,
            message,
            signatures,
        } => {
            let signatures: Vec<SignatureData> = serde_json::from_slice(&std::fs::read(signatures)?)?;
            let valid = tss_core::verify(&signatures, &decode_messages(message)?, pool_pub_key);
            println!("Valid: {valid}");
            if !valid {
                return Err(anyhow!("signature batch does not verify"));
            }
        }
        Commands::Info => show_info(&cli.dest)?,
        Commands::Demo {
            parties,
            algo,
            message,
        } => run_demo(config, *parties, *algo, message).await?,
    }

    Ok(())
}

/// An engine bound to the relay, with its inbox poller
struct Node {
    server: TssServer,
    poller: tokio::task::JoinHandle<()>,
    poller_stop: Signal,
}

impl Node {
    async fn start(cli: &Cli, config: TssConfig) -> Result<Self> {
        let node_key = load_node_key(&cli.dest)?;
        let pub_key = conversion::node_pub_key(&node_key.verifying_key());
        let peer_id = conversion::peer_id_from_pub_key(&pub_key)?;

        let transport = RelayTransport::new(&cli.relay, peer_id);
        let dispatcher = Arc::new(Dispatcher::new(config.pending_message_ttl));
        let poller_stop = Signal::new();
        let poller = spawn_inbox_poller(
            transport.clone(),
            Arc::clone(&dispatcher),
            Duration::from_millis(cli.poll_interval_ms.max(1)),
            poller_stop.clone(),
        );

        let store = Arc::new(FileStateStore::new(&cli.dest)?);
        let pre_params = load_or_create_pre_params(&cli.dest, &config).await?;
        let server = TssServer::new(config, node_key, Arc::new(transport), dispatcher, store, Some(pre_params)).await?;
        info!(pub_key = %pub_key, relay = %cli.relay, "Node started");

        Ok(Self {
            server,
            poller,
            poller_stop,
        })
    }

    async fn shutdown(self) {
        self.server.stop();
        self.poller_stop.fire();
        let _ = self.poller.await;
    }
}

fn init_key(dest: &Path, force: bool) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let path = dest.join(NODE_KEY_FILE);
    if path.exists() && !force {
        return Err(anyhow!("node key already exists at {}", path.display()));
    }

    let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
    let encoded = Zeroizing::new(hex::encode(key.to_bytes()));
    std::fs::write(&path, encoded.as_bytes())?;

    let pub_key = conversion::node_pub_key(&key.verifying_key());
    info!(path = ?path, "Node key created");
    println!("Participant Key: {pub_key}");
    println!("Peer ID: {}", conversion::peer_id_from_pub_key(&pub_key)?);
    Ok(())
}

fn load_node_key(dest: &Path) -> Result<SigningKey> {
    let path = dest.join(NODE_KEY_FILE);
    let encoded = Zeroizing::new(
        std::fs::read_to_string(&path).with_context(|| format!("reading {}, run init-key first", path.display()))?,
    );
    let bytes = Zeroizing::new(hex::decode(encoded.trim())?);
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("node key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&raw))
}

async fn load_or_create_pre_params(dest: &Path, config: &TssConfig) -> Result<PreParams> {
    let path = dest.join(PRE_PARAMS_FILE);
    if path.exists() {
        let params: PreParams = serde_json::from_slice(&std::fs::read(&path)?)?;
        params.validate()?;
        return Ok(params);
    }
    let params = PreParams::generate_with_timeout(config.pre_param_timeout).await?;
    std::fs::write(&path, serde_json::to_vec(&params)?)?;
    info!(path = ?path, "Pre-parameters saved");
    Ok(params)
}

async fn run_keygen(
    server: &TssServer,
    keys: Vec<String>,
    algo: AlgoArg,
    block_height: i64,
    protocol_version: &str,
) -> Result<()> {
    let responses = match algo {
        AlgoArg::All => {
            let request = KeygenRequest::new(SigningAlgo::Secp256k1, keys, block_height, protocol_version);
            server.keygen_all_algo(&request).await?
        }
        AlgoArg::Secp256k1 | AlgoArg::Ed25519 => {
            let request = KeygenRequest::new(algo_of(algo), keys, block_height, protocol_version);
            vec![server.keygen(&request).await?]
        }
    };

    println!("{}", serde_json::to_string_pretty(&responses)?);
    if responses.iter().any(|r| r.status != Status::Success) {
        return Err(anyhow!("keygen failed"));
    }
    Ok(())
}

fn show_info(dest: &Path) -> Result<()> {
    let key = load_node_key(dest)?;
    let pub_key = conversion::node_pub_key(&key.verifying_key());
    let book = FileStateStore::new(dest)?.retrieve_address_book()?;

    println!("Node Info:");
    println!("  Participant Key: {pub_key}");
    println!("  Peer ID: {}", conversion::peer_id_from_pub_key(&pub_key)?);
    println!("  Known Peers: {}", book.len());
    for (peer, address) in &book {
        println!("    {peer} -> {address}");
    }
    Ok(())
}

async fn run_demo(config: TssConfig, parties: usize, algo: AlgoArg, messages: &[String]) -> Result<()> {
    if parties < 2 {
        return Err(anyhow!("the demo needs at least two parties"));
    }
    let network = MemoryNetwork::new();
    let mut servers = Vec::with_capacity(parties);
    for _ in 0..parties {
        let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let peer = conversion::peer_id_from_pub_key(&conversion::node_pub_key(&key.verifying_key()))?;
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
        .await?;
        servers.push(server);
    }
    let keys: Vec<String> = servers.iter().map(|s| s.local_pub_key().to_string()).collect();
    info!(parties, threshold = conversion::threshold(parties)?, "Demo parties ready");

    let keygens = servers.iter().map(|server| {
        let keys = keys.clone();
        async move {
            match algo {
                AlgoArg::All => {
                    let request = KeygenRequest::new(SigningAlgo::Secp256k1, keys, 1, tss_core::VERSION);
                    server.keygen_all_algo(&request).await
                }
                AlgoArg::Secp256k1 | AlgoArg::Ed25519 => {
                    let request = KeygenRequest::new(algo_of(algo), keys, 1, tss_core::VERSION);
                    server.keygen(&request).await.map(|r| vec![r])
                }
            }
        }
    });
    let keygen_results = futures_util::future::join_all(keygens).await;
    let mut generated: Vec<KeygenResponse> = Vec::new();
    for result in keygen_results {
        let responses = result?;
        if responses.iter().any(|r| r.status != Status::Success) {
            return Err(anyhow!("demo keygen failed: {:?}", responses));
        }
        generated = responses;
    }

    let messages: Vec<Vec<u8>> = messages.iter().map(|m| m.as_bytes().to_vec()).collect();
    for key in &generated {
        println!("{} key: {} ({})", key.algo, key.pub_key, key.pool_address);
        let signs = servers.iter().map(|server| {
            let request = KeysignRequest::new(key.pub_key.clone(), messages.clone(), keys.clone(), 2, tss_core::VERSION);
            async move { server.keysign(&request).await }
        });
        let mut signatures = Vec::new();
        for result in futures_util::future::join_all(signs).await {
            let response = result?;
            if response.status != Status::Success {
                return Err(anyhow!("demo keysign failed: {:?}", response.blame));
            }
            if !response.signatures.is_empty() {
                signatures = response.signatures;
            }
        }
        let valid = tss_core::verify(&signatures, &messages, &key.pub_key);
        println!("  signatures: {}, valid: {valid}", signatures.len());
        if !valid {
            return Err(anyhow!("demo signatures do not verify"));
        }
    }

    for server in &servers {
        server.stop();
    }
    Ok(())
}

fn algo_of(algo: AlgoArg) -> SigningAlgo {
    match algo {
        AlgoArg::Secp256k1 | AlgoArg::All => SigningAlgo::Secp256k1,
        AlgoArg::Ed25519 => SigningAlgo::Ed25519,
    }
}

fn decode_messages(messages: &[String]) -> Result<Vec<Vec<u8>>> {
    messages
        .iter()
        .map(|m| hex::decode(m.trim_start_matches("0x")).with_context(|| format!("invalid hex message {m}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_keysign() {
        let cli = Cli::try_parse_from([
            "tss-node",
            "keysign",
            "--pool-pub-key",
            "ed25519:abc",
            "-m",
            "6d31",
            "-m",
            "6d32",
            "--keys",
            "a,b,c",
            "--block-height",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Keysign { message, keys, .. } => {
                assert_eq!(decode_messages(&message).unwrap(), vec![b"m1".to_vec(), b"m2".to_vec()]);
                assert_eq!(keys.len(), 3);
            }
            _ => panic!("expected keysign"),
        }
    }

    #[test]
    fn test_node_key_roundtrip() {
        let dir = std::env::temp_dir().join(format!("tss-node-{}", hex::encode(rand::random::<[u8; 8]>())));
        init_key(&dir, false).unwrap();
        assert!(init_key(&dir, false).is_err());
        let key = load_node_key(&dir).unwrap();
        init_key(&dir, true).unwrap();
        assert_ne!(load_node_key(&dir).unwrap().to_bytes(), key.to_bytes());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
