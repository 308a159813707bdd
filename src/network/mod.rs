//! P2P networking
//!
//! Everything that talks to other nodes:
//! - Wire message catalog and 24-byte frame codec
//! - Version/verack handshake state machine and message dispatch
//! - New/tried address book with Sybil-resistant bucketing
//! - Ban list and misbehavior scoring
//! - Headers-first chain sync

pub mod addrman;
pub mod banlist;
pub mod codec;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod sync;

pub use addrman::{AddrManager, PeerRecord};
pub use banlist::{BanEntry, BanList, BanReason, SubNet, DEFAULT_BAN_DURATION};
pub use codec::MessageCodec;
pub use message::{
    GetBlocksMessage, InvItem, InvType, Message, MessageHeader, NetAddr, RejectCode,
    RejectMessage, ServiceFlags, VersionMessage, BIP31_VERSION, MAX_ADDR_PER_MESSAGE,
    MAX_HEADERS_RESULTS, MAX_INV_PER_MESSAGE, MAX_LOCATOR_HASHES, MAX_MESSAGE_SIZE,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, USER_AGENT,
};
pub use node::{Node, NodeConfig, NodeStatus};
pub use peer::{
    PeerError, PeerHandle, PeerId, PeerInfo, PeerManager, PeerState, BAN_SCORE, MAX_INBOUND,
    MAX_OUTBOUND,
};
pub use server::{connect_to_peer, handle_connection, PeerEvent, Server};
pub use sync::HeaderSync;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
