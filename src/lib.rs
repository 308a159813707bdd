//! Bitnode: a Bitcoin-protocol peer node in Rust
//!
//! This crate implements the networking core of a Bitcoin-style node:
//! - A skip-linked block header tree with an active best chain,
//!   O(log n) ancestor queries and compact locator construction
//! - The P2P wire protocol: 24-byte message framing, the full handshake
//!   state machine, and misbehavior scoring with subnet bans
//! - A new/tried peer address book with deterministic group bucketing and
//!   terrible-peer eviction
//!
//! Out of scope by design: transaction/script validation, the UTXO set,
//! mining, wallets and RPC.
//!
//! # Example
//!
//! ```no_run
//! use bitnode::core::params::Network;
//! use bitnode::network::{Node, NodeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NodeConfig {
//!         network: Network::Main,
//!         ..Default::default()
//!     };
//!     let node = Arc::new(Node::with_defaults(config));
//!     node.start().await.unwrap();
//! }
//! ```

pub mod chain;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crate::chain::{BlockLocator, BlockTree, Chain, ChainState, Handle};
pub use crate::core::{BlockHeader, Hash256, Network, Params};
pub use crate::network::{
    AddrManager, BanList, Message, NetAddr, Node, NodeConfig, PeerManager, ServiceFlags, SubNet,
};
pub use crate::storage::{Storage, StorageConfig};
