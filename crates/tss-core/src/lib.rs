//! # TSS Core
//!
//! Coordination engine for threshold signature schemes.
//!
//! This crate wraps round-based threshold protocols with everything needed to
//! run them between independent nodes:
//! - Join-session with a deterministic leader
//! - Message routing with signed envelopes and broadcast echo checks
//! - Blame attribution for stalled or misbehaving peers
//! - Keygen (ECDSA over secp256k1, EdDSA over ed25519, or both at once)
//! - Batched keysign and signature verification
//!
//! ## Example
//!
//! ```rust,ignore
//! use tss_core::{KeygenRequest, KeysignRequest, SigningAlgo, TssServer};
//!
//! let server = TssServer::new(config, node_key, transport, dispatcher, store, None).await?;
//! let key = server.keygen(&KeygenRequest::new(SigningAlgo::Ed25519, keys.clone(), 10, "1.0.0")).await?;
//! let signed = server
//!     .keysign(&KeysignRequest::new(key.pub_key, vec![b"m1".to_vec()], keys, 11, "1.0.0"))
//!     .await?;
//! ```

pub mod blame;
pub mod ciphersuite;
pub mod config;
pub mod conversion;
pub mod error;
pub mod keygen;
pub mod mpc;
pub mod oblivious;
pub mod party;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod sign;
pub mod signal;
pub mod storage;
pub mod types;
pub mod wire;

pub use blame::{Blame, BlameNode, FailReason};
pub use config::{BlameBound, TssConfig};
pub use error::{Error, Result};
pub use keygen::{KeygenRequest, KeygenResponse};
pub use mpc::{AddressBook, Dispatcher, MemoryNetwork, MemoryTransport, Transport};
pub use oblivious::PreParams;
pub use server::TssServer;
pub use sign::{verify, KeysignRequest, KeysignResponse};
pub use signal::Signal;
pub use storage::{FileStateStore, LocalState, LocalStateStore, MemoryStateStore};
pub use types::{PeerId, SessionId, Signature, SignatureData, SigningAlgo, Status};
pub use wire::{InboundMessage, MessageType, WrappedMessage};

/// Engine version, used in the join handshake by default
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
