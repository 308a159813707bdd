//! Ban list
//!
//! Maps address ranges to ban entries. Entries carry an expiry and are
//! swept lazily; lookups ignore anything already expired. Misbehaving
//! peers are banned by subnet so every connection from the range can be
//! dropped at once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// How long a misbehavior ban lasts by default (24 hours)
pub const DEFAULT_BAN_DURATION: i64 = 24 * 60 * 60;

/// An address-or-CIDR range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubNet {
    network: IpAddr,
    prefix: u8,
}

impl SubNet {
    /// A subnet, normalized so host bits are zero
    pub fn new(ip: IpAddr, prefix: u8) -> Self {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.min(max);
        Self {
            network: mask_ip(ip, prefix),
            prefix,
        }
    }

    /// The host subnet containing exactly one address
    pub fn single(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::new(ip, 32),
            IpAddr::V6(_) => Self::new(ip, 128),
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// True iff `ip` falls inside this range (address families must match)
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_ip(ip, self.prefix) == self.network
            }
            _ => false,
        }
    }
}

fn mask_ip(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let raw = u32::from(v4);
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
            IpAddr::V4((raw & mask).into())
        }
        IpAddr::V6(v6) => {
            let raw = u128::from(v6);
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            IpAddr::V6((raw & mask).into())
        }
    }
}

impl fmt::Display for SubNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for SubNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.parse().map_err(|_| format!("bad subnet ip: {s}"))?;
                let prefix: u8 = prefix.parse().map_err(|_| format!("bad prefix: {s}"))?;
                Ok(SubNet::new(ip, prefix))
            }
            None => {
                let ip: IpAddr = s.parse().map_err(|_| format!("bad subnet: {s}"))?;
                Ok(SubNet::single(ip))
            }
        }
    }
}

// Serialized as the display string so subnets can key a JSON map
impl Serialize for SubNet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SubNet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SubNet::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Why a range was banned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanReason {
    NodeMisbehaving,
    ManuallyAdded,
}

/// One ban record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub create_time: i64,
    pub ban_until: i64,
    pub reason: BanReason,
}

/// The persistent set of banned ranges
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BanList {
    entries: HashMap<SubNet, BanEntry>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ban a range for `duration` seconds from `now`
    pub fn ban(&mut self, subnet: SubNet, reason: BanReason, duration: i64, now: i64) {
        let entry = BanEntry {
            create_time: now,
            ban_until: now + duration,
            reason,
        };
        // A re-ban extends an existing entry rather than shortening it
        match self.entries.get_mut(&subnet) {
            Some(existing) if existing.ban_until >= entry.ban_until => {}
            Some(existing) => *existing = entry,
            None => {
                self.entries.insert(subnet, entry);
            }
        }
        log::info!("banned {subnet} until {}", now + duration);
    }

    pub fn unban(&mut self, subnet: &SubNet) -> bool {
        self.entries.remove(subnet).is_some()
    }

    /// Whether any live entry covers `ip`
    pub fn is_banned(&self, ip: IpAddr, now: i64) -> bool {
        self.entries
            .iter()
            .any(|(subnet, entry)| entry.ban_until > now && subnet.contains(ip))
    }

    /// Drop expired entries; called periodically and before persisting
    pub fn sweep(&mut self, now: i64) {
        self.entries.retain(|_, entry| entry.ban_until > now);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SubNet, &BanEntry)> {
        self.entries.iter()
    }
}
