//! On-disk persistence
//!
//! Save/load for the two files this node owns: `peers.dat` (the address
//! book) and `banlist.dat` (the ban list). Writes go through a temp file
//! and rename so a crash never leaves a half-written file behind.

use crate::network::addrman::AddrManager;
use crate::network::banlist::BanList;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub peers_file: String,
    pub banlist_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".bitnode"),
            peers_file: "peers.dat".to_string(),
            banlist_file: "banlist.dat".to_string(),
        }
    }
}

/// Data-directory manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create the manager, making the data directory if needed
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Result<Self, StorageError> {
        Self::new(StorageConfig::default())
    }

    fn peers_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.peers_file)
    }

    fn banlist_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.banlist_file)
    }

    fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer(writer, value)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// Persist the address book
    pub fn save_peers(&self, addrman: &AddrManager) -> Result<(), StorageError> {
        self.save_json(&self.peers_path(), addrman)?;
        log::debug!("saved {} addresses to {:?}", addrman.len(), self.peers_path());
        Ok(())
    }

    /// Load the address book, or None if there is no file yet
    pub fn load_peers(&self) -> Result<Option<AddrManager>, StorageError> {
        self.load_json(&self.peers_path())
    }

    /// Persist the ban list
    pub fn save_banlist(&self, bans: &BanList) -> Result<(), StorageError> {
        self.save_json(&self.banlist_path(), bans)
    }

    /// Load the ban list, or None if there is no file yet
    pub fn load_banlist(&self) -> Result<Option<BanList>, StorageError> {
        self.load_json(&self.banlist_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::banlist::{BanReason, SubNet};
    use crate::network::message::{NetAddr, ServiceFlags};
    use std::net::IpAddr;

    fn sample_addr(ip: &str) -> NetAddr {
        let mut addr = NetAddr::new(
            ip.parse::<IpAddr>().unwrap(),
            8333,
            ServiceFlags::NODE_NETWORK,
        );
        addr.timestamp = 1_700_000_000;
        addr
    }

    #[test]
    fn test_peers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        assert!(storage.load_peers().unwrap().is_none());

        let mut addrman = AddrManager::with_key(7);
        let source = sample_addr("203.0.113.1");
        for i in 1..=5u8 {
            addrman.add(&sample_addr(&format!("8.{i}.0.1")), &source, 0, 1_700_000_100);
        }
        addrman.make_tried(&sample_addr("8.1.0.1"), 1_700_000_200);
        storage.save_peers(&addrman).unwrap();

        let restored = storage.load_peers().unwrap().unwrap();
        assert_eq!(restored.len(), addrman.len());
        assert_eq!(restored.new_count(), addrman.new_count());
        assert_eq!(restored.tried_count(), 1);
    }

    #[test]
    fn test_banlist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let mut bans = BanList::new();
        bans.ban(
            SubNet::single("8.8.8.8".parse().unwrap()),
            BanReason::NodeMisbehaving,
            1000,
            50,
        );
        storage.save_banlist(&bans).unwrap();

        let restored = storage.load_banlist().unwrap().unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.is_banned("8.8.8.8".parse().unwrap(), 100));
    }
}
