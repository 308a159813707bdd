//! Static network parameters
//!
//! Per-network constants consumed by the P2P layer: wire magic, default
//! port, DNS seeds and the genesis header. These are configuration, not
//! logic; the node takes a `Params` by reference wherever it needs them.

use crate::core::hash256::Hash256;
use crate::core::header::BlockHeader;
use crate::network::message::ServiceFlags;
use std::str::FromStr;

/// Wire magic for mainnet
pub const MAGIC_MAIN: u32 = 0xd9b4_bef9;
/// Wire magic for testnet3
pub const MAGIC_TESTNET: u32 = 0x0709_110b;
/// Wire magic for regression test networks
pub const MAGIC_REGTEST: u32 = 0xdab5_bffa;

/// Which chain this node follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Consensus-independent parameters of one network
#[derive(Debug, Clone)]
pub struct Params {
    pub network: Network,
    pub magic: u32,
    pub default_port: u16,
    pub dns_seeds: Vec<&'static str>,
    /// Service bits an outbound peer must advertise
    pub required_services: ServiceFlags,
    pub genesis: BlockHeader,
}

impl Params {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Main => Self {
                network,
                magic: MAGIC_MAIN,
                default_port: 8333,
                dns_seeds: vec![
                    "seed.bitcoin.sipa.be:8333",
                    "dnsseed.bluematt.me:8333",
                    "seed.bitcoinstats.com:8333",
                ],
                required_services: ServiceFlags::NODE_NETWORK,
                genesis: genesis_header(1231006505, 0x1d00ffff, 2083236893),
            },
            Network::Testnet => Self {
                network,
                magic: MAGIC_TESTNET,
                default_port: 18333,
                dns_seeds: vec![
                    "testnet-seed.bitcoin.jonasschnelli.ch:18333",
                    "seed.tbtc.petertodd.org:18333",
                ],
                required_services: ServiceFlags::NODE_NETWORK,
                genesis: genesis_header(1296688602, 0x1d00ffff, 414098458),
            },
            Network::Regtest => Self {
                network,
                magic: MAGIC_REGTEST,
                default_port: 18444,
                dns_seeds: vec![],
                required_services: ServiceFlags::empty(),
                genesis: genesis_header(1296688602, 0x207fffff, 2),
            },
        }
    }

    /// True iff `magic` identifies any known network
    pub fn is_known_magic(magic: u32) -> bool {
        matches!(magic, MAGIC_MAIN | MAGIC_TESTNET | MAGIC_REGTEST)
    }
}

fn genesis_header(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: Hash256::ZERO,
        // Hash of the single coinbase transaction in the genesis block;
        // shared by all three networks
        merkle_root: Hash256::from_str(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("static merkle root"),
        time,
        bits,
        nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_genesis_hash() {
        let params = Params::new(Network::Main);
        assert_eq!(
            params.genesis.hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_known_magics() {
        assert!(Params::is_known_magic(MAGIC_MAIN));
        assert!(Params::is_known_magic(MAGIC_TESTNET));
        assert!(Params::is_known_magic(MAGIC_REGTEST));
        assert!(!Params::is_known_magic(0x12345678));
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!(Network::from_str("main").unwrap(), Network::Main);
        assert_eq!(Network::from_str("regtest").unwrap(), Network::Regtest);
        assert!(Network::from_str("banana").is_err());
    }
}
