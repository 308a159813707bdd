//! Peer management
//!
//! Per-connection state (handshake progress, negotiated features, ping and
//! misbehavior bookkeeping, header-sync pointers) and the concurrent
//! registry all message handlers go through. Disconnect is the single
//! cleanup point: it unregisters the peer from every index and settles the
//! global sync counter exactly once.

use crate::chain::Handle;
use crate::network::banlist::SubNet;
use crate::network::message::{Message, NetAddr, ServiceFlags};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Maximum outbound connections we dial
pub const MAX_OUTBOUND: usize = 8;

/// Maximum inbound connections we accept
pub const MAX_INBOUND: usize = 117;

/// Misbehavior score at which a peer is banned
pub const BAN_SCORE: i32 = 100;

/// Monotonic peer identifier
pub type PeerId = u64;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Handshake progress of one connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Nothing exchanged yet
    Init,
    /// Our version is out, theirs has not arrived
    VersionSent,
    /// Their version accepted, waiting on verack
    VersionReceived,
    /// Verack received, connection fully up
    Established,
    Disconnected,
}

/// Everything we track about one connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: NetAddr,
    pub outbound: bool,
    pub state: PeerState,
    pub version: i32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    /// Peer asked for headers announcements (sendheaders)
    pub prefers_headers: bool,
    /// Compact-block version the peer negotiated, if any
    pub compact_blocks: Option<u64>,
    /// Peer acked our version; established once their version is also in
    pub verack_received: bool,
    /// Nonce of the single outstanding ping
    pub ping_nonce: Option<u64>,
    pub ping_sent_at: i64,
    pub last_pong: i64,
    pub misbehavior: i32,
    pub should_ban: bool,
    pub connected_at: i64,
    pub last_send: i64,
    pub last_recv: i64,
    /// Header-sync state: this peer is our active headers source
    pub sync_started: bool,
    /// Best header the peer has announced to us
    pub best_known_header: Option<Handle>,
    /// Deepest block known to be shared with this peer
    pub last_common_block: Option<Handle>,
    /// Best header we announced to the peer
    pub best_header_sent: Option<Handle>,
    /// Blocks requested from this peer and not yet received
    pub blocks_in_flight: Vec<crate::core::Hash256>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addr: NetAddr, outbound: bool, now: i64) -> Self {
        Self {
            id,
            addr,
            outbound,
            state: PeerState::Init,
            version: 0,
            services: ServiceFlags::empty(),
            user_agent: String::new(),
            start_height: 0,
            relay: false,
            prefers_headers: false,
            compact_blocks: None,
            verack_received: false,
            ping_nonce: None,
            ping_sent_at: 0,
            last_pong: 0,
            misbehavior: 0,
            should_ban: false,
            connected_at: now,
            last_send: now,
            last_recv: now,
            sync_started: false,
            best_known_header: None,
            last_common_block: None,
            best_header_sent: None,
            blocks_in_flight: Vec::new(),
        }
    }

    /// True once both sides completed the version/verack exchange
    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }
}

/// Write-side handle for one peer's connection pump
#[derive(Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.send(msg).await.map_err(|_| PeerError::Disconnected)
    }
}

/// Concurrent registry of all live connections
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    handles: RwLock<HashMap<PeerId, PeerHandle>>,
    by_addr: RwLock<HashMap<SocketAddr, PeerId>>,
    next_id: AtomicU64,
    /// Peers currently acting as a headers source
    sync_started_count: AtomicUsize,
    max_inbound: usize,
    max_outbound: usize,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::with_limits(MAX_INBOUND, MAX_OUTBOUND)
    }

    pub fn with_limits(max_inbound: usize, max_outbound: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            by_addr: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            sync_started_count: AtomicUsize::new(0),
            max_inbound,
            max_outbound,
        }
    }

    /// Register a new connection. Fails when the direction's cap is full.
    pub async fn add_peer(
        &self,
        addr: NetAddr,
        tx: mpsc::Sender<Message>,
        outbound: bool,
        now: i64,
    ) -> Result<PeerId, PeerError> {
        let mut peers = self.peers.write().await;
        let direction_count = peers.values().filter(|p| p.outbound == outbound).count();
        let cap = if outbound { self.max_outbound } else { self.max_inbound };
        if direction_count >= cap {
            return Err(PeerError::MaxPeersReached);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let socket = addr.socket_addr();
        peers.insert(id, PeerInfo::new(id, addr, outbound, now));
        drop(peers);

        self.handles.write().await.insert(id, PeerHandle { id, tx });
        self.by_addr.write().await.insert(socket, id);

        log::info!("peer {id} registered ({socket}, outbound={outbound})");
        Ok(id)
    }

    /// Unregister a connection. Idempotent; settles every index and the
    /// global sync counter exactly once and returns the final state.
    pub async fn remove_peer(&self, id: PeerId) -> Option<PeerInfo> {
        let mut info = self.peers.write().await.remove(&id)?;
        self.handles.write().await.remove(&id);
        self.by_addr.write().await.remove(&info.addr.socket_addr());
        if info.sync_started {
            self.sync_started_count.fetch_sub(1, Ordering::Relaxed);
        }
        info.state = PeerState::Disconnected;
        log::info!("peer {id} removed ({})", info.addr.socket_addr());
        Some(info)
    }

    pub async fn get(&self, id: PeerId) -> Option<PeerInfo> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn get_by_addr(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        let id = *self.by_addr.read().await.get(addr)?;
        self.get(id).await
    }

    /// Run a mutation against one peer's state
    pub async fn update<F: FnOnce(&mut PeerInfo)>(&self, id: PeerId, f: F) -> bool {
        match self.peers.write().await.get_mut(&id) {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        }
    }

    /// Accumulate misbehavior; returns true when the score crosses the
    /// ban threshold (the peer's should_ban flag is then set).
    pub async fn misbehaving(&self, id: PeerId, amount: i32, reason: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(info) = peers.get_mut(&id) else {
            return false;
        };
        let before = info.misbehavior;
        info.misbehavior += amount;
        log::debug!(
            "peer {id} misbehaving ({} -> {}): {reason}",
            before,
            info.misbehavior
        );
        if before < BAN_SCORE && info.misbehavior >= BAN_SCORE {
            info.should_ban = true;
            log::warn!("peer {id} crossed ban threshold: {reason}");
            true
        } else {
            false
        }
    }

    /// Flag this peer as our headers source; the global counter tracks how
    /// many peers hold that role
    pub async fn mark_sync_started(&self, id: PeerId) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&id) {
            Some(info) if !info.sync_started => {
                info.sync_started = true;
                self.sync_started_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn sync_started_count(&self) -> usize {
        self.sync_started_count.load(Ordering::Relaxed)
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn outbound_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.outbound).count()
    }

    pub async fn ids(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn infos(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Ids of peers whose address falls inside `subnet`
    pub async fn ids_in_subnet(&self, subnet: &SubNet) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|info| subnet.contains(info.addr.ip))
            .map(|info| info.id)
            .collect()
    }

    pub async fn send_to(&self, id: PeerId, msg: Message) -> Result<(), PeerError> {
        let handle = self
            .handles
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PeerError::UnknownPeer(id))?;
        handle.send(msg).await
    }

    /// Send to every established peer
    pub async fn broadcast(&self, msg: Message) {
        let targets: Vec<PeerId> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|info| info.is_established())
                .map(|info| info.id)
                .collect()
        };
        for id in targets {
            if let Err(err) = self.send_to(id, msg.clone()).await {
                log::warn!("broadcast to peer {id} failed: {err}");
            }
        }
    }

    /// Drop the write handle, which collapses the connection pump
    pub async fn close_connection(&self, id: PeerId) {
        self.handles.write().await.remove(&id);
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}
