//! Network message types for P2P communication
//!
//! The full catalog of wire messages this node speaks, the 24-byte frame
//! header, and the `NetAddr` address representation with its routability
//! classification and anti-Sybil group key.

use crate::chain::BlockLocator;
use crate::core::hash256::Hash256;
use crate::core::header::BlockHeader;
use crate::core::params::Params;
use crate::core::serialize::{DecodeError, Decoder, Encoder};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

// =============================================================================
// Protocol constants
// =============================================================================

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: i32 = 70015;

/// Oldest protocol version we still talk to
pub const MIN_PROTOCOL_VERSION: i32 = 31800;

/// Above this version, ping carries a nonce and expects a matching pong
pub const BIP31_VERSION: i32 = 60000;

/// Peers at or above this version understand `sendheaders`
pub const SENDHEADERS_VERSION: i32 = 70012;

/// Peers at or above this version understand `sendcmpct`
pub const SENDCMPCT_VERSION: i32 = 70014;

/// Hard cap on a single message payload
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum addresses accepted per `addr` message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Maximum entries accepted per `inv`/`getdata`
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

/// Maximum hashes accepted in a block locator
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Maximum headers returned per `headers` message
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Wire width of the zero-padded command field
pub const COMMAND_SIZE: usize = 12;

/// User agent advertised in `version`
pub const USER_AGENT: &str = concat!("/bitnode:", env!("CARGO_PKG_VERSION"), "/");

/// Every command this implementation recognises
pub const KNOWN_COMMANDS: &[&str] = &[
    "version",
    "verack",
    "ping",
    "pong",
    "addr",
    "getaddr",
    "inv",
    "getdata",
    "getblocks",
    "getheaders",
    "headers",
    "reject",
    "sendcmpct",
    "sendheaders",
];

// =============================================================================
// Service flags
// =============================================================================

bitflags! {
    /// Services a node advertises in `version` and `addr`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServiceFlags: u64 {
        /// Full node, can serve the whole chain
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 2;
        const NODE_BLOOM = 4;
        const NODE_WITNESS = 8;
        /// Serves only the last ~2 days of blocks
        const NODE_NETWORK_LIMITED = 1024;
    }
}

impl Serialize for ServiceFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for ServiceFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ServiceFlags::from_bits_retain(u64::deserialize(
            deserializer,
        )?))
    }
}

// =============================================================================
// Network address
// =============================================================================

/// OnionCat prefix used to pack Tor v2 addresses into the IPv6 field
const ONIONCAT_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

/// A peer address as gossiped on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddr {
    pub services: ServiceFlags,
    pub ip: IpAddr,
    pub port: u16,
    /// Last-seen time in unix seconds (zero when unknown)
    pub timestamp: u32,
}

impl NetAddr {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            services,
            ip,
            port,
            timestamp: 0,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The 16-byte wire form of the IP (IPv4 is ::ffff: mapped)
    fn ip_bytes(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Serialize; `addr` entries carry the timestamp, `version` fields do not
    pub fn encode(&self, enc: &mut Encoder, with_time: bool) {
        if with_time {
            enc.write_u32_le(self.timestamp);
        }
        enc.write_u64_le(self.services.bits());
        enc.write_bytes(&self.ip_bytes());
        enc.write_bytes(&self.port.to_be_bytes());
    }

    pub fn decode(dec: &mut Decoder, with_time: bool) -> Result<Self, DecodeError> {
        let timestamp = if with_time {
            dec.read_u32_le("netaddr.time")?
        } else {
            0
        };
        let services = ServiceFlags::from_bits_retain(dec.read_u64_le("netaddr.services")?);
        let raw = dec.read_fixed::<16>("netaddr.ip")?;
        let v6 = Ipv6Addr::from(raw);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port_bytes = dec.read_fixed::<2>("netaddr.port")?;
        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
            timestamp,
        })
    }

    /// True iff the address is a Tor hidden service in OnionCat encoding
    pub fn is_tor(&self) -> bool {
        match self.ip {
            IpAddr::V6(v6) => v6.octets()[..6] == ONIONCAT_PREFIX,
            IpAddr::V4(_) => false,
        }
    }

    /// Whether this address can be dialled from the public internet.
    /// Loopback, unspecified, RFC1918/4193 private space, link-local and
    /// documentation ranges are all unroutable; Tor is routable.
    pub fn is_routable(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => {
                !(v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    // Shared address space, RFC 6598 (100.64.0.0/10)
                    || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
                    || v4.octets()[0] == 0)
            }
            IpAddr::V6(v6) => {
                if self.is_tor() {
                    return true;
                }
                let seg = v6.segments();
                !(v6.is_unspecified()
                    || v6.is_loopback()
                    // Unique local, RFC 4193 (fc00::/7)
                    || (seg[0] & 0xfe00) == 0xfc00
                    // Link local (fe80::/10)
                    || (seg[0] & 0xffc0) == 0xfe80
                    // Documentation, RFC 3849 (2001:db8::/32)
                    || (seg[0] == 0x2001 && seg[1] == 0x0db8))
            }
        }
    }

    /// Routability group used for address-book bucketing: /16 for IPv4,
    /// /32 for IPv6, the first onion byte for Tor. Unroutable addresses
    /// share a single catch-all group.
    pub fn group(&self) -> Vec<u8> {
        if !self.is_routable() {
            return vec![0];
        }
        match self.ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                vec![1, o[0], o[1]]
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                if self.is_tor() {
                    vec![3, o[6]]
                } else {
                    vec![2, o[0], o[1], o[2], o[3]]
                }
            }
        }
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// Inventory item type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    Other(u32),
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CompactBlock => 4,
            InvType::Other(raw) => raw,
        }
    }

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CompactBlock,
            other => InvType::Other(other),
        }
    }
}

/// One announced or requested object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash256,
}

impl InvItem {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.kind.to_u32());
        enc.write_hash(&self.hash);
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            kind: InvType::from_u32(dec.read_u32_le("inv.type")?),
            hash: dec.read_hash("inv.hash")?,
        })
    }
}

// =============================================================================
// Version / reject payloads
// =============================================================================

/// Payload of the `version` handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_i32_le(self.version);
        enc.write_u64_le(self.services.bits());
        enc.write_i64_le(self.timestamp);
        self.addr_recv.encode(enc, false);
        self.addr_from.encode(enc, false);
        enc.write_u64_le(self.nonce);
        enc.write_var_str(&self.user_agent);
        enc.write_i32_le(self.start_height);
        enc.write_u8(self.relay as u8);
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: dec.read_i32_le("version.version")?,
            services: ServiceFlags::from_bits_retain(dec.read_u64_le("version.services")?),
            timestamp: dec.read_i64_le("version.timestamp")?,
            addr_recv: NetAddr::decode(dec, false)?,
            addr_from: NetAddr::decode(dec, false)?,
            nonce: dec.read_u64_le("version.nonce")?,
            user_agent: dec.read_var_str("version.user_agent")?,
            start_height: dec.read_i32_le("version.start_height")?,
            // Old peers omit the relay byte; absence means "relay to me"
            relay: match dec.remaining() {
                0 => true,
                _ => dec.read_u8("version.relay")? != 0,
            },
        })
    }
}

/// `reject` ccode values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl RejectCode {
    pub fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(raw) => raw,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }
}

/// Payload of a `reject` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command the rejection refers to
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Block or tx hash for data rejections
    pub hash: Option<Hash256>,
}

impl RejectMessage {
    pub fn new(message: &str, code: RejectCode, reason: &str) -> Self {
        Self {
            message: message.to_string(),
            code,
            reason: reason.to_string(),
            hash: None,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.write_var_str(&self.message);
        enc.write_u8(self.code.to_u8());
        enc.write_var_str(&self.reason);
        if let Some(hash) = &self.hash {
            enc.write_hash(hash);
        }
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        let message = dec.read_var_str("reject.message")?;
        let code = RejectCode::from_u8(dec.read_u8("reject.code")?);
        let reason = dec.read_var_str("reject.reason")?;
        let hash = if dec.remaining() >= 32 {
            Some(dec.read_hash("reject.hash")?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            hash,
        })
    }
}

/// Shared payload of `getblocks` and `getheaders`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: u32,
    pub locator: BlockLocator,
    /// Stop at this hash, or all-zero for "as many as allowed"
    pub stop_hash: Hash256,
}

impl GetBlocksMessage {
    pub fn new(locator: BlockLocator) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            locator,
            stop_hash: Hash256::ZERO,
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.version);
        enc.write_varint(self.locator.have.len() as u64);
        for hash in &self.locator.have {
            enc.write_hash(hash);
        }
        enc.write_hash(&self.stop_hash);
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        let version = dec.read_u32_le("getblocks.version")?;
        let count = dec.read_varint("getblocks.count")? as usize;
        if count > MAX_LOCATOR_HASHES {
            return Err(DecodeError::OutOfRange("getblocks.count"));
        }
        let mut have = Vec::with_capacity(count);
        for _ in 0..count {
            have.push(dec.read_hash("getblocks.hash")?);
        }
        Ok(Self {
            version,
            locator: BlockLocator { have },
            stop_hash: dec.read_hash("getblocks.stop")?,
        })
    }
}

// =============================================================================
// The message catalog
// =============================================================================

/// Every message this node understands, as a closed sum type.
///
/// Unknown-but-well-framed commands are an explicit variant rather than a
/// decode failure: the protocol requires tolerating them without penalty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    /// Nonce is absent for pre-BIP31 peers
    Ping(Option<u64>),
    Pong(u64),
    Addr(Vec<NetAddr>),
    GetAddr,
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    GetBlocks(GetBlocksMessage),
    GetHeaders(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    Reject(RejectMessage),
    SendCmpct { announce: bool, version: u64 },
    SendHeaders,
    Unknown { command: String, payload: Vec<u8> },
}

impl Message {
    /// Wire command string
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::GetBlocks(_) => "getblocks",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Reject(_) => "reject",
            Message::SendCmpct { .. } => "sendcmpct",
            Message::SendHeaders => "sendheaders",
            Message::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (header not included)
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Message::Version(version) => version.encode(&mut enc),
            Message::Verack | Message::GetAddr | Message::SendHeaders => {}
            Message::Ping(nonce) => {
                if let Some(nonce) = nonce {
                    enc.write_u64_le(*nonce);
                }
            }
            Message::Pong(nonce) => enc.write_u64_le(*nonce),
            Message::Addr(addrs) => {
                enc.write_varint(addrs.len() as u64);
                for addr in addrs {
                    addr.encode(&mut enc, true);
                }
            }
            Message::Inv(items) | Message::GetData(items) => {
                enc.write_varint(items.len() as u64);
                for item in items {
                    item.encode(&mut enc);
                }
            }
            Message::GetBlocks(msg) | Message::GetHeaders(msg) => msg.encode(&mut enc),
            Message::Headers(headers) => {
                enc.write_varint(headers.len() as u64);
                for header in headers {
                    header.encode(&mut enc);
                    // Trailing tx count, always zero for bare headers
                    enc.write_varint(0);
                }
            }
            Message::Reject(reject) => reject.encode(&mut enc),
            Message::SendCmpct { announce, version } => {
                enc.write_u8(*announce as u8);
                enc.write_u64_le(*version);
            }
            Message::Unknown { payload, .. } => enc.write_bytes(payload),
        }
        enc.into_inner()
    }

    /// The factory: command string + raw payload to a typed message.
    /// Commands outside the catalog yield `Message::Unknown`, never an
    /// error — protocol extensibility requires ignoring them.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::decode(&mut dec)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(if payload.is_empty() {
                None
            } else {
                Some(dec.read_u64_le("ping.nonce")?)
            }),
            "pong" => Message::Pong(dec.read_u64_le("pong.nonce")?),
            "addr" => {
                let count = dec.read_varint("addr.count")? as usize;
                if count > MAX_ADDR_PER_MESSAGE {
                    return Err(DecodeError::OutOfRange("addr.count"));
                }
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    addrs.push(NetAddr::decode(&mut dec, true)?);
                }
                Message::Addr(addrs)
            }
            "getaddr" => Message::GetAddr,
            "inv" | "getdata" => {
                let count = dec.read_varint("inv.count")? as usize;
                if count > MAX_INV_PER_MESSAGE {
                    return Err(DecodeError::OutOfRange("inv.count"));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(InvItem::decode(&mut dec)?);
                }
                if command == "inv" {
                    Message::Inv(items)
                } else {
                    Message::GetData(items)
                }
            }
            "getblocks" => Message::GetBlocks(GetBlocksMessage::decode(&mut dec)?),
            "getheaders" => Message::GetHeaders(GetBlocksMessage::decode(&mut dec)?),
            "headers" => {
                let count = dec.read_varint("headers.count")? as usize;
                if count > MAX_HEADERS_RESULTS {
                    return Err(DecodeError::OutOfRange("headers.count"));
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut dec)?);
                    let _tx_count = dec.read_varint("headers.tx_count")?;
                }
                Message::Headers(headers)
            }
            "reject" => Message::Reject(RejectMessage::decode(&mut dec)?),
            "sendcmpct" => Message::SendCmpct {
                announce: dec.read_u8("sendcmpct.announce")? != 0,
                version: dec.read_u64_le("sendcmpct.version")?,
            },
            "sendheaders" => Message::SendHeaders,
            other => Message::Unknown {
                command: other.to_string(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }

    /// Structural validity, independent of the frame header
    pub fn is_valid(&self) -> bool {
        match self {
            Message::Version(version) => {
                version.version > 0 && version.user_agent.len() <= 256
            }
            Message::Addr(addrs) => !addrs.is_empty() && addrs.len() <= MAX_ADDR_PER_MESSAGE,
            Message::Inv(items) | Message::GetData(items) => items.len() <= MAX_INV_PER_MESSAGE,
            Message::GetBlocks(msg) | Message::GetHeaders(msg) => {
                !msg.locator.is_empty() && msg.locator.len() <= MAX_LOCATOR_HASHES
            }
            Message::Headers(headers) => headers.len() <= MAX_HEADERS_RESULTS,
            Message::Reject(reject) => !reject.message.is_empty(),
            _ => true,
        }
    }
}

// =============================================================================
// Frame header
// =============================================================================

/// The fixed 24-byte message header:
/// magic | 12-byte zero-padded command | payload length | checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: [u8; COMMAND_SIZE],
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub const SIZE: usize = 24;

    /// Build a header for an outbound frame. Commands longer than twelve
    /// bytes are truncated, never extended.
    pub fn for_payload(magic: u32, command: &str, payload_len: u32, checksum: [u8; 4]) -> Self {
        let mut bytes = [0u8; COMMAND_SIZE];
        let raw = command.as_bytes();
        let len = raw.len().min(COMMAND_SIZE);
        bytes[..len].copy_from_slice(&raw[..len]);
        Self {
            magic,
            command: bytes,
            payload_len,
            checksum,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.write_u32_le(self.magic);
        enc.write_bytes(&self.command);
        enc.write_u32_le(self.payload_len);
        enc.write_bytes(&self.checksum);
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            magic: dec.read_u32_le("header.magic")?,
            command: dec.read_fixed::<COMMAND_SIZE>("header.command")?,
            payload_len: dec.read_u32_le("header.payload_len")?,
            checksum: dec.read_fixed::<4>("header.checksum")?,
        })
    }

    /// Command with the zero padding stripped; None if not valid ASCII
    pub fn command_str(&self) -> Option<&str> {
        let end = self
            .command
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_SIZE);
        // Padding must be all zeros
        if self.command[end..].iter().any(|byte| *byte != 0) {
            return None;
        }
        std::str::from_utf8(&self.command[..end]).ok()
    }

    /// Header-level validity: known network magic matching ours, a command
    /// from the closed catalog, and a payload within the size cap.
    pub fn is_valid(&self, expected_magic: u32) -> bool {
        if !Params::is_known_magic(self.magic) || self.magic != expected_magic {
            return false;
        }
        if self.payload_len as usize > MAX_MESSAGE_SIZE {
            return false;
        }
        match self.command_str() {
            Some(command) => KNOWN_COMMANDS.contains(&command),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::MAGIC_MAIN;
    use crate::crypto::checksum;
    use std::net::Ipv4Addr;

    fn round_trip(msg: Message) -> Message {
        let payload = msg.encode_payload();
        Message::decode(msg.command(), &payload).unwrap()
    }

    fn sample_addr() -> NetAddr {
        let mut addr = NetAddr::new(
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            8333,
            ServiceFlags::NODE_NETWORK,
        );
        addr.timestamp = 1_700_000_000;
        addr
    }

    #[test]
    fn test_version_round_trip() {
        let msg = Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_WITNESS,
            timestamp: 1_700_000_000,
            addr_recv: sample_addr(),
            addr_from: sample_addr(),
            nonce: 0x0123_4567_89ab_cdef,
            user_agent: USER_AGENT.to_string(),
            start_height: 820_000,
            relay: true,
        });
        assert_eq!(round_trip(msg.clone()), msg);
        assert!(msg.is_valid());
    }

    #[test]
    fn test_version_relay_byte_optional() {
        let msg = Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK,
            timestamp: 1_700_000_000,
            addr_recv: sample_addr(),
            addr_from: sample_addr(),
            nonce: 1,
            user_agent: String::new(),
            start_height: 0,
            relay: false,
        });
        let mut payload = msg.encode_payload();
        payload.pop();
        let Message::Version(decoded) = Message::decode("version", &payload).unwrap() else {
            panic!("expected version");
        };
        assert!(decoded.relay);
    }

    #[test]
    fn test_ping_pong_round_trip() {
        assert_eq!(round_trip(Message::Ping(Some(42))), Message::Ping(Some(42)));
        assert_eq!(round_trip(Message::Ping(None)), Message::Ping(None));
        assert_eq!(round_trip(Message::Pong(99)), Message::Pong(99));
        assert!(Message::Ping(None).encode_payload().is_empty());
    }

    #[test]
    fn test_addr_round_trip_and_caps() {
        let msg = Message::Addr(vec![sample_addr(), sample_addr()]);
        assert_eq!(round_trip(msg.clone()), msg);

        // One entry over the cap is rejected at decode time
        let oversized = Message::Addr(vec![sample_addr(); MAX_ADDR_PER_MESSAGE + 1]);
        let payload = oversized.encode_payload();
        assert!(Message::decode("addr", &payload).is_err());
    }

    #[test]
    fn test_getheaders_round_trip() {
        let locator = BlockLocator {
            have: vec![Hash256::from_bytes([1; 32]), Hash256::ZERO],
        };
        let msg = Message::GetHeaders(GetBlocksMessage::new(locator));
        assert_eq!(round_trip(msg.clone()), msg);
        assert!(msg.is_valid());
    }

    #[test]
    fn test_headers_round_trip() {
        let headers = vec![
            BlockHeader {
                version: 1,
                prev_block: Hash256::ZERO,
                merkle_root: Hash256::from_bytes([7; 32]),
                time: 1_300_000_000,
                bits: 0x1d00ffff,
                nonce: 11,
            };
            3
        ];
        let msg = Message::Headers(headers);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_reject_round_trip() {
        let mut reject = RejectMessage::new("version", RejectCode::Duplicate, "duplicate version");
        let msg = Message::Reject(reject.clone());
        assert_eq!(round_trip(msg.clone()), msg);

        reject.hash = Some(Hash256::from_bytes([9; 32]));
        let msg = Message::Reject(reject);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_command_tolerated() {
        let decoded = Message::decode("fancynewmsg", &[1, 2, 3]).unwrap();
        assert_eq!(
            decoded,
            Message::Unknown {
                command: "fancynewmsg".to_string(),
                payload: vec![1, 2, 3],
            }
        );
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_header_validity() {
        let header = MessageHeader::for_payload(MAGIC_MAIN, "ping", 8, checksum(&[0; 8]));
        assert!(header.is_valid(MAGIC_MAIN));

        // Magic outside {main, testnet, regtest}
        let mut bad = header;
        bad.magic = 0x1234_5678;
        assert!(!bad.is_valid(0x1234_5678));

        // Right set, wrong network
        assert!(!header.is_valid(crate::core::params::MAGIC_TESTNET));

        // Oversized payload
        let mut big = header;
        big.payload_len = (MAX_MESSAGE_SIZE + 1) as u32;
        assert!(!big.is_valid(MAGIC_MAIN));

        // Unknown command
        let unknown = MessageHeader::for_payload(MAGIC_MAIN, "wibble", 0, checksum(&[]));
        assert!(!unknown.is_valid(MAGIC_MAIN));
    }

    #[test]
    fn test_long_command_truncated_and_round_trippable() {
        let header =
            MessageHeader::for_payload(MAGIC_MAIN, "averylongcommandname", 0, checksum(&[]));
        assert_eq!(header.command_str(), Some("averylongcom"));

        let mut enc = Encoder::new();
        header.encode(&mut enc);
        let bytes = enc.into_inner();
        assert_eq!(bytes.len(), MessageHeader::SIZE);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(MessageHeader::decode(&mut dec).unwrap(), header);
    }

    #[test]
    fn test_command_with_garbage_padding_rejected() {
        let mut header = MessageHeader::for_payload(MAGIC_MAIN, "ping", 0, checksum(&[]));
        header.command[10] = 0x41;
        assert_eq!(header.command_str(), None);
        assert!(!header.is_valid(MAGIC_MAIN));
    }

    #[test]
    fn test_netaddr_v4_mapping_round_trip() {
        let addr = sample_addr();
        let mut enc = Encoder::new();
        addr.encode(&mut enc, true);
        let bytes = enc.into_inner();
        assert_eq!(bytes.len(), 30);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(NetAddr::decode(&mut dec, true).unwrap(), addr);
    }

    #[test]
    fn test_routability() {
        let routable = |ip: IpAddr| NetAddr::new(ip, 8333, ServiceFlags::empty()).is_routable();
        assert!(routable("8.8.8.8".parse().unwrap()));
        assert!(routable("2001:4860:4860::8888".parse().unwrap()));
        assert!(!routable("127.0.0.1".parse().unwrap()));
        assert!(!routable("10.1.2.3".parse().unwrap()));
        assert!(!routable("192.168.1.1".parse().unwrap()));
        assert!(!routable("169.254.0.1".parse().unwrap()));
        assert!(!routable("100.64.0.1".parse().unwrap()));
        assert!(!routable("0.0.0.0".parse().unwrap()));
        assert!(!routable("::1".parse().unwrap()));
        assert!(!routable("fe80::1".parse().unwrap()));
        assert!(!routable("2001:db8::1".parse().unwrap()));
        // OnionCat space is routable even though fd00::/8 is not
        assert!(routable("fd87:d87e:eb43::1234".parse().unwrap()));
        assert!(!routable("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_group_keys() {
        let group = |ip: &str| {
            NetAddr::new(ip.parse().unwrap(), 8333, ServiceFlags::empty()).group()
        };
        // Same /16 shares a group, different /16 does not
        assert_eq!(group("8.8.8.8"), group("8.8.4.4"));
        assert_ne!(group("8.8.8.8"), group("8.9.8.8"));
        // IPv6 groups by /32
        assert_eq!(group("2001:4860::1"), group("2001:4860:ffff::2"));
        assert_ne!(group("2001:4860::1"), group("2001:4861::1"));
        // Unroutable collapses to the catch-all group
        assert_eq!(group("127.0.0.1"), group("10.0.0.1"));
    }
}
