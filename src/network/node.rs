//! P2P node
//!
//! Orchestrates all networking components: the accept and dial loops, the
//! per-peer handshake state machine, message dispatch into chain and
//! address-book state, misbehavior scoring with subnet bans, and the
//! inactivity timers. All shared state is injected, so multiple
//! independent nodes can live in one process.

use crate::chain::ChainState;
use crate::core::params::{Network, Params};
use crate::network::addrman::AddrManager;
use crate::network::banlist::{BanList, BanReason, SubNet, DEFAULT_BAN_DURATION};
use crate::network::message::{
    InvItem, InvType, Message, NetAddr, RejectCode, RejectMessage, ServiceFlags, VersionMessage,
    BIP31_VERSION, MAX_ADDR_PER_MESSAGE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    SENDCMPCT_VERSION, SENDHEADERS_VERSION, USER_AGENT,
};
use crate::network::peer::{PeerError, PeerId, PeerManager, PeerState};
use crate::network::server::{connect_to_peer, handle_connection, PeerEvent, Server};
use crate::network::sync::HeaderSync;
use crate::network::unix_time;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};

/// Depth of the central dispatch channel
const EVENT_CHANNEL_SIZE: usize = 1000;

/// How often the maintenance timer fires
const TIMER_INTERVAL: Duration = Duration::from_secs(30);

/// How often the dial loop looks for a new outbound peer
const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Send a ping when the last one is this old
const PING_INTERVAL: i64 = 2 * 60;

/// Disconnect when a ping goes unanswered this long
const PING_TIMEOUT: i64 = 20 * 60;

/// Disconnect when nothing was received for this long
const INACTIVITY_TIMEOUT: i64 = 90 * 60;

/// Disconnect when the handshake does not complete in time
const HANDSHAKE_TIMEOUT: i64 = 60;

/// Maximum block hashes in a getblocks inv reply
const MAX_BLOCKS_REPLY: usize = 500;

/// Node configuration
#[derive(Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// Listen port; zero asks the OS for an ephemeral port
    pub port: Option<u16>,
    /// Accept inbound connections
    pub listen: bool,
    /// Dial outbound peers from the address book automatically
    pub dial: bool,
    /// Peers to connect to at startup
    pub connect: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Main,
            port: None,
            listen: true,
            dial: true,
            connect: Vec::new(),
        }
    }
}

/// Snapshot of node state for status displays
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub height: usize,
    pub peers: usize,
    pub known_addresses: usize,
    pub banned_ranges: usize,
}

/// The main P2P node
pub struct Node {
    config: NodeConfig,
    params: Params,
    pub chain: Arc<RwLock<ChainState>>,
    pub peers: Arc<PeerManager>,
    pub addrman: Arc<RwLock<AddrManager>>,
    pub bans: Arc<RwLock<BanList>>,
    sync: HeaderSync,
    /// Nonces of versions we sent, for self-connection detection
    version_nonces: RwLock<HashSet<u64>>,
    event_tx: RwLock<Option<mpsc::Sender<PeerEvent>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
}

impl Node {
    /// Build a node over injected shared state
    pub fn new(
        config: NodeConfig,
        chain: Arc<RwLock<ChainState>>,
        addrman: Arc<RwLock<AddrManager>>,
        bans: Arc<RwLock<BanList>>,
    ) -> Self {
        let params = Params::new(config.network);
        let peers = Arc::new(PeerManager::new());
        let sync = HeaderSync::new(chain.clone(), peers.clone());
        Self {
            config,
            params,
            chain,
            peers,
            addrman,
            bans,
            sync,
            version_nonces: RwLock::new(HashSet::new()),
            event_tx: RwLock::new(None),
            local_addr: RwLock::new(None),
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
        }
    }

    /// Build a node with fresh chain/address-book/ban state
    pub fn with_defaults(config: NodeConfig) -> Self {
        let params = Params::new(config.network);
        Self::new(
            config,
            Arc::new(RwLock::new(ChainState::new(&params))),
            Arc::new(RwLock::new(AddrManager::new())),
            Arc::new(RwLock::new(BanList::new())),
        )
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Bound listen address, once `start` has bound the server
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            height: self.chain.read().await.height(),
            peers: self.peers.count().await,
            known_addresses: self.addrman.read().await.len(),
            banned_ranges: self.bans.read().await.len(),
        }
    }

    /// Ask the node to wind down; `start` returns shortly after
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_notify.notify_waiters();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Interrupt and drop every live connection
    pub async fn stop(&self) {
        self.interrupt();
        for id in self.peers.ids().await {
            self.peers.close_connection(id).await;
        }
    }

    /// Run the node: bind, spawn the accept/dial/timer loops, and dispatch
    /// peer events until interrupted.
    pub async fn start(self: Arc<Self>) -> Result<(), PeerError> {
        let (event_tx, mut event_rx) = mpsc::channel::<PeerEvent>(EVENT_CHANNEL_SIZE);
        *self.event_tx.write().await = Some(event_tx.clone());

        if self.config.listen {
            let port = self.config.port.unwrap_or(self.params.default_port);
            let server = Server::bind(port).await?;
            *self.local_addr.write().await = Some(server.local_addr());
            self.clone().spawn_accept_loop(server, event_tx.clone());
        }

        if self.config.dial {
            self.bootstrap_from_seeds().await;
            self.clone().spawn_dial_loop();
        }
        self.clone().spawn_timer_loop();

        for addr in self.config.connect.clone() {
            if let Err(err) = self.connect_to(addr).await {
                log::warn!("bootstrap connect to {addr} failed: {err}");
            }
        }

        log::info!("node started ({:?})", self.config.network);
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(PeerEvent::Connected(id)) => self.handle_connected(id).await,
                        Some(PeerEvent::Message(id, msg)) => self.handle_message(id, msg).await,
                        Some(PeerEvent::Disconnected(id)) => {
                            log::debug!("peer {id} gone");
                        }
                        None => break,
                    }
                }
                _ = self.interrupt_notify.notified() => {}
            }
            if self.is_interrupted() {
                break;
            }
        }
        log::info!("node dispatch loop finished");
        Ok(())
    }

    /// Dial one peer and hand the connection to the pump
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<(), PeerError> {
        let event_tx = self
            .event_tx
            .read()
            .await
            .clone()
            .ok_or_else(|| PeerError::ConnectionFailed("node not started".to_string()))?;
        let stream = connect_to_peer(addr).await?;
        let peers = self.peers.clone();
        let magic = self.params.magic;
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, addr, magic, peers, event_tx, true).await {
                log::warn!("connection to {addr} ended: {err}");
            }
        });
        Ok(())
    }

    /// Seed an empty address book from the network's DNS seeds
    async fn bootstrap_from_seeds(&self) {
        if !self.addrman.read().await.is_empty() || self.params.dns_seeds.is_empty() {
            return;
        }
        let now = unix_time();
        let mut added = 0;
        for seed in &self.params.dns_seeds {
            match tokio::net::lookup_host(*seed).await {
                Ok(addrs) => {
                    let mut addrman = self.addrman.write().await;
                    for socket in addrs {
                        let mut addr =
                            NetAddr::from_socket_addr(socket, ServiceFlags::NODE_NETWORK);
                        addr.timestamp = now as u32;
                        let source = addr.clone();
                        if addrman.add(&addr, &source, 0, now) {
                            added += 1;
                        }
                    }
                }
                Err(err) => log::warn!("failed to resolve DNS seed {seed}: {err}"),
            }
        }
        log::info!("resolved {added} addresses from DNS seeds");
    }

    fn spawn_accept_loop(self: Arc<Self>, server: Server, event_tx: mpsc::Sender<PeerEvent>) {
        tokio::spawn(async move {
            loop {
                if self.is_interrupted() {
                    break;
                }
                match server.accept().await {
                    Ok((stream, addr)) => {
                        if self.bans.read().await.is_banned(addr.ip(), unix_time()) {
                            log::debug!("dropping inbound from banned {addr}");
                            continue;
                        }
                        log::info!("inbound connection from {addr}");
                        let peers = self.peers.clone();
                        let magic = self.params.magic;
                        let tx = event_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                handle_connection(stream, addr, magic, peers, tx, false).await
                            {
                                log::warn!("inbound {addr} ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("accept failed: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    /// Keep the outbound slots filled from the address book
    fn spawn_dial_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(DIAL_INTERVAL).await;
                if self.is_interrupted() {
                    break;
                }
                if self.peers.outbound_count().await >= crate::network::peer::MAX_OUTBOUND {
                    continue;
                }
                let candidate = self.addrman.read().await.select(false);
                let Some(addr) = candidate else { continue };
                let socket = addr.socket_addr();
                let now = unix_time();
                if self.bans.read().await.is_banned(socket.ip(), now) {
                    continue;
                }
                if self.peers.get_by_addr(&socket).await.is_some() {
                    continue;
                }
                self.addrman.write().await.attempt(&addr, now);
                if let Err(err) = self.connect_to(socket).await {
                    log::debug!("dial {socket} failed: {err}");
                }
            }
        });
    }

    /// Periodic maintenance: pings, inactivity disconnects, ban sweeping
    fn spawn_timer_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TIMER_INTERVAL).await;
                if self.is_interrupted() {
                    break;
                }
                let now = unix_time();
                self.bans.write().await.sweep(now);
                for info in self.peers.infos().await {
                    // Handshake that never completed
                    if !info.is_established() && now - info.connected_at > HANDSHAKE_TIMEOUT {
                        log::info!("peer {} handshake timeout", info.id);
                        self.peers.close_connection(info.id).await;
                        continue;
                    }
                    if !info.is_established() {
                        continue;
                    }
                    // Dead link
                    if now - info.last_recv > INACTIVITY_TIMEOUT {
                        log::info!("peer {} inactive, disconnecting", info.id);
                        self.peers.close_connection(info.id).await;
                        continue;
                    }
                    // Unanswered ping
                    if info.ping_nonce.is_some() && now - info.ping_sent_at > PING_TIMEOUT {
                        log::info!("peer {} ping timeout", info.id);
                        self.peers.close_connection(info.id).await;
                        continue;
                    }
                    // Keep the link warm
                    if info.ping_nonce.is_none() && now - info.ping_sent_at > PING_INTERVAL {
                        self.send_ping(info.id, info.version).await;
                    }
                }
            }
        });
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn handle_connected(&self, id: PeerId) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        if info.outbound {
            // Outbound opens the handshake
            self.send_version(id).await;
        }
    }

    async fn send_version(&self, id: PeerId) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        let nonce: u64 = rand::thread_rng().gen();
        self.version_nonces.write().await.insert(nonce);

        let start_height = self.chain.read().await.height() as i32;
        let msg = Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: unix_time(),
            addr_recv: info.addr.clone(),
            addr_from: NetAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                self.config.port.unwrap_or(self.params.default_port),
                ServiceFlags::NODE_NETWORK,
            ),
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: true,
        });
        if self.peers.send_to(id, msg).await.is_ok() {
            self.peers
                .update(id, |p| {
                    if p.state == PeerState::Init {
                        p.state = PeerState::VersionSent;
                    }
                })
                .await;
        }
    }

    async fn handle_version(&self, id: PeerId, version: VersionMessage) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };

        // Duplicate version is a protocol violation but not fatal
        if info.version != 0 {
            let reject = RejectMessage::new("version", RejectCode::Duplicate, "duplicate version");
            let _ = self.peers.send_to(id, Message::Reject(reject)).await;
            self.peers.misbehaving(id, 1, "duplicate version").await;
            self.enforce_ban(id).await;
            return;
        }

        // Talking to ourselves through a loop
        if self.version_nonces.read().await.contains(&version.nonce) {
            log::info!("peer {id} is a self-connection, disconnecting");
            self.peers.close_connection(id).await;
            return;
        }

        if version.version < MIN_PROTOCOL_VERSION {
            let reject = RejectMessage::new(
                "version",
                RejectCode::Obsolete,
                &format!("version {} below minimum", version.version),
            );
            let _ = self.peers.send_to(id, Message::Reject(reject)).await;
            self.peers.close_connection(id).await;
            return;
        }

        // Outbound peers must offer the services we dialed them for
        if info.outbound && !version.services.contains(self.params.required_services) {
            log::info!("peer {id} lacks required services, disconnecting");
            self.peers.close_connection(id).await;
            return;
        }

        self.peers
            .update(id, |p| {
                p.version = version.version;
                p.services = version.services;
                p.user_agent = version.user_agent.clone();
                p.start_height = version.start_height;
                p.relay = version.relay;
                p.state = if p.verack_received {
                    PeerState::Established
                } else {
                    PeerState::VersionReceived
                };
            })
            .await;

        log::info!(
            "peer {id} version {} agent {} height {}",
            version.version,
            version.user_agent,
            version.start_height
        );

        if !info.outbound {
            // Inbound: answer with our own version before acking theirs
            self.send_version(id).await;
        }
        let _ = self.peers.send_to(id, Message::Verack).await;

        // Their verack raced ahead of their version
        if let Some(info) = self.peers.get(id).await {
            if info.is_established() {
                self.on_established(id).await;
            }
        }
    }

    async fn handle_verack(&self, id: PeerId) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        if info.state == PeerState::Established {
            self.peers.misbehaving(id, 1, "duplicate verack").await;
            return;
        }
        self.peers
            .update(id, |p| {
                p.verack_received = true;
                if p.version != 0 {
                    p.state = PeerState::Established;
                }
            })
            .await;
        if let Some(info) = self.peers.get(id).await {
            if info.is_established() {
                self.on_established(id).await;
            }
        }
    }

    /// One-time setup after version/verack completes in both directions
    async fn on_established(&self, id: PeerId) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        log::info!("peer {id} handshake complete");

        let now = unix_time();
        if info.outbound {
            let mut addrman = self.addrman.write().await;
            // Ensure the book knows this address before promotion
            let mut addr = info.addr.clone();
            addr.timestamp = now as u32;
            addr.services = info.services;
            addrman.add(&addr, &addr, 0, now);
            addrman.make_tried(&addr, now);
        }

        // Feature negotiation gated by the peer's version
        if info.version >= SENDHEADERS_VERSION {
            let _ = self.peers.send_to(id, Message::SendHeaders).await;
        }
        if info.version >= SENDCMPCT_VERSION {
            let _ = self
                .peers
                .send_to(
                    id,
                    Message::SendCmpct {
                        announce: false,
                        version: 1,
                    },
                )
                .await;
        }
        if info.outbound {
            let _ = self.peers.send_to(id, Message::GetAddr).await;
        }
        self.send_ping(id, info.version).await;
        self.sync.check_sync(id).await;
    }

    async fn send_ping(&self, id: PeerId, version: i32) {
        let now = unix_time();
        if version > BIP31_VERSION {
            let nonce: u64 = rand::thread_rng().gen();
            if self.peers.send_to(id, Message::Ping(Some(nonce))).await.is_ok() {
                self.peers
                    .update(id, |p| {
                        p.ping_nonce = Some(nonce);
                        p.ping_sent_at = now;
                    })
                    .await;
            }
        } else {
            // Pre-BIP31 pings carry no nonce and expect no pong
            let _ = self.peers.send_to(id, Message::Ping(None)).await;
            self.peers.update(id, |p| p.ping_sent_at = now).await;
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn handle_message(&self, id: PeerId, msg: Message) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        log::debug!("<- {} from peer {id}", msg.command());

        if !msg.is_valid() {
            let reject =
                RejectMessage::new(msg.command(), RejectCode::Malformed, "structurally invalid");
            let _ = self.peers.send_to(id, Message::Reject(reject)).await;
            self.peers
                .misbehaving(id, 10, "structurally invalid message")
                .await;
            self.enforce_ban(id).await;
            return;
        }

        // Anti-DoS ordering guard: nothing but version before the peer's
        // version, nothing but verack before the handshake completes
        let version_received = info.version != 0;
        match &msg {
            Message::Version(_) => {}
            Message::Verack => {
                if !version_received && info.state == PeerState::Init {
                    self.peers.misbehaving(id, 1, "verack before version").await;
                    self.enforce_ban(id).await;
                    return;
                }
            }
            _ => {
                if !version_received {
                    self.peers
                        .misbehaving(id, 1, "message before version")
                        .await;
                    self.enforce_ban(id).await;
                    return;
                }
                if !info.is_established() {
                    self.peers
                        .misbehaving(id, 1, "message before handshake completion")
                        .await;
                    self.enforce_ban(id).await;
                    return;
                }
            }
        }

        match msg {
            Message::Version(version) => self.handle_version(id, version).await,
            Message::Verack => self.handle_verack(id).await,

            Message::Ping(nonce) => {
                // BIP31: nonce pings get a matching pong; older peers none
                if info.version > BIP31_VERSION {
                    if let Some(nonce) = nonce {
                        let _ = self.peers.send_to(id, Message::Pong(nonce)).await;
                    }
                }
            }

            Message::Pong(nonce) => {
                let now = unix_time();
                let matched = info.ping_nonce == Some(nonce);
                if matched {
                    self.peers
                        .update(id, |p| {
                            p.ping_nonce = None;
                            p.last_pong = now;
                        })
                        .await;
                } else {
                    // Stale or unsolicited; log and move on
                    log::debug!(
                        "peer {id} pong nonce {nonce:#x} does not match {:?}",
                        info.ping_nonce
                    );
                }
            }

            Message::Addr(addrs) => {
                if addrs.len() > MAX_ADDR_PER_MESSAGE {
                    self.peers.misbehaving(id, 20, "oversized addr").await;
                    self.enforce_ban(id).await;
                    return;
                }
                let now = unix_time();
                let source = info.addr.clone();
                let mut added = 0;
                let mut addrman = self.addrman.write().await;
                for addr in &addrs {
                    if addrman.add(addr, &source, 0, now) {
                        added += 1;
                    }
                }
                log::debug!("peer {id} gossiped {} addrs, {added} new", addrs.len());
            }

            Message::GetAddr => {
                let now = unix_time();
                let mut addrs = self.addrman.read().await.get_addrs(now);
                addrs.truncate(MAX_ADDR_PER_MESSAGE);
                if !addrs.is_empty() {
                    let _ = self.peers.send_to(id, Message::Addr(addrs)).await;
                }
            }

            Message::Inv(items) => {
                // An unknown block announcement means our header tree is
                // behind; go get the headers
                let chain = self.chain.read().await;
                let unknown_block = items.iter().any(|item| {
                    item.kind == InvType::Block && chain.tree.lookup(&item.hash).is_none()
                });
                drop(chain);
                if unknown_block {
                    self.sync.request_headers(id).await;
                }
            }

            Message::GetData(items) => {
                // Headers-only node: we have no block bodies to serve
                log::debug!("peer {id} requested {} objects; none stored", items.len());
            }

            Message::GetBlocks(request) => {
                let hashes: Vec<InvItem> = {
                    let chain = self.chain.read().await;
                    chain
                        .headers_after(&request.locator, &request.stop_hash, MAX_BLOCKS_REPLY)
                        .iter()
                        .map(|header| InvItem::block(header.hash()))
                        .collect()
                };
                if !hashes.is_empty() {
                    let _ = self.peers.send_to(id, Message::Inv(hashes)).await;
                }
            }

            Message::GetHeaders(request) => {
                let headers = {
                    let chain = self.chain.read().await;
                    chain.headers_after(
                        &request.locator,
                        &request.stop_hash,
                        crate::network::message::MAX_HEADERS_RESULTS,
                    )
                };
                let best = headers.last().map(|h| h.hash());
                let _ = self.peers.send_to(id, Message::Headers(headers)).await;
                if let Some(best) = best {
                    let handle = self.chain.read().await.tree.lookup(&best);
                    self.peers
                        .update(id, |p| p.best_header_sent = handle)
                        .await;
                }
            }

            Message::Headers(headers) => {
                if !self.sync.handle_headers(id, &headers).await {
                    self.peers
                        .misbehaving(id, 20, "non-connecting headers")
                        .await;
                    self.enforce_ban(id).await;
                }
            }

            Message::Reject(reject) => {
                log::warn!(
                    "peer {id} rejected '{}': {:?} {}",
                    reject.message,
                    reject.code,
                    reject.reason
                );
            }

            Message::SendCmpct { announce, version } => {
                log::debug!("peer {id} sendcmpct announce={announce} version={version}");
                self.peers
                    .update(id, |p| p.compact_blocks = Some(version))
                    .await;
            }

            Message::SendHeaders => {
                self.peers.update(id, |p| p.prefers_headers = true).await;
            }

            Message::Unknown { command, payload } => {
                // Tolerated for protocol extensibility; no penalty
                log::debug!(
                    "peer {id} sent unknown command '{command}' ({} bytes)",
                    payload.len()
                );
            }
        }
    }

    /// If the peer crossed the ban threshold, ban its subnet and drop
    /// every connection from that range
    async fn enforce_ban(&self, id: PeerId) {
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        if !info.should_ban {
            return;
        }
        let subnet = SubNet::single(info.addr.ip);
        let now = unix_time();
        self.bans
            .write()
            .await
            .ban(subnet, BanReason::NodeMisbehaving, DEFAULT_BAN_DURATION, now);
        for peer_id in self.peers.ids_in_subnet(&subnet).await {
            self.peers.close_connection(peer_id).await;
        }
    }

    /// Announce our tip to peers that asked for header announcements
    pub async fn announce_tip(&self) {
        let (header, hash) = {
            let chain = self.chain.read().await;
            let tip = chain.tip();
            (chain.tree.get(tip).header().clone(), chain.tree.get(tip).hash())
        };
        for info in self.peers.infos().await {
            if !info.is_established() {
                continue;
            }
            let msg = if info.prefers_headers {
                Message::Headers(vec![header.clone()])
            } else {
                Message::Inv(vec![InvItem::block(hash)])
            };
            let _ = self.peers.send_to(info.id, msg).await;
        }
    }
}
