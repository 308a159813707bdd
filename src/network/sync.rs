//! Headers-first chain synchronization
//!
//! Keeps the header tree caught up with the network: picks one peer as the
//! headers source, walks it with getheaders/headers batches, and keeps
//! requesting while the batches come back full.

use crate::chain::ChainState;
use crate::network::message::{GetBlocksMessage, Message, MAX_HEADERS_RESULTS};
use crate::network::peer::{PeerId, PeerManager};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Header sync driver
pub struct HeaderSync {
    chain: Arc<RwLock<ChainState>>,
    peers: Arc<PeerManager>,
}

impl HeaderSync {
    pub fn new(chain: Arc<RwLock<ChainState>>, peers: Arc<PeerManager>) -> Self {
        Self { chain, peers }
    }

    /// Consider starting header sync with a freshly established peer.
    /// Only one peer acts as the headers source at a time.
    pub async fn check_sync(&self, id: PeerId) {
        let our_height = self.chain.read().await.height();
        let Some(info) = self.peers.get(id).await else {
            return;
        };
        if self.peers.sync_started_count() > 0 {
            return;
        }
        if (info.start_height as i64) <= our_height as i64 {
            return;
        }
        if !self.peers.mark_sync_started(id).await {
            return;
        }
        log::info!(
            "starting header sync with peer {id} (their height {}, ours {our_height})",
            info.start_height
        );
        self.request_headers(id).await;
    }

    /// Send a fresh getheaders for everything past our best tip
    pub async fn request_headers(&self, id: PeerId) {
        let locator = self.chain.read().await.best_locator();
        let msg = Message::GetHeaders(GetBlocksMessage::new(locator));
        if let Err(err) = self.peers.send_to(id, msg).await {
            log::warn!("getheaders to peer {id} failed: {err}");
        }
    }

    /// Absorb a headers batch. Returns the number of headers that did not
    /// connect (for the caller's misbehavior accounting).
    pub async fn handle_headers(
        &self,
        from: PeerId,
        headers: &[crate::core::BlockHeader],
    ) -> bool {
        if headers.is_empty() {
            log::debug!("peer {from} has no more headers for us");
            return true;
        }
        let (result, height) = {
            let mut chain = self.chain.write().await;
            let result = chain.connect_headers(headers);
            (result, chain.height())
        };

        if result.unknown_parent {
            log::warn!(
                "peer {from} sent headers that do not connect ({} of {} accepted)",
                result.accepted,
                headers.len()
            );
            return false;
        }

        // Track the best header this peer has shown us
        if let Some(last) = headers.last() {
            let best = self.chain.read().await.tree.lookup(&last.hash());
            self.peers
                .update(from, |info| info.best_known_header = best)
                .await;
        }

        log::info!(
            "accepted {} headers from peer {from}, height now {height}",
            result.accepted
        );

        // A full batch means there is more where that came from
        if headers.len() == MAX_HEADERS_RESULTS {
            self.request_headers(from).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash256::Hash256;
    use crate::core::header::BlockHeader;
    use crate::core::params::{Network, Params};

    fn make_headers(parent: &BlockHeader, count: usize) -> Vec<BlockHeader> {
        let mut headers = Vec::with_capacity(count);
        let mut prev_hash = parent.hash();
        let mut time = parent.time;
        for i in 0..count {
            time += 600;
            let header = BlockHeader {
                version: 1,
                prev_block: prev_hash,
                merkle_root: Hash256::ZERO,
                time,
                bits: 0x207fffff,
                nonce: i as u32,
            };
            prev_hash = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn test_connect_headers_advances_tip() {
        let params = Params::new(Network::Regtest);
        let mut chain = ChainState::new(&params);
        let headers = make_headers(&params.genesis, 10);

        let result = chain.connect_headers(&headers);
        assert_eq!(result.accepted, 10);
        assert!(!result.unknown_parent);
        assert!(result.tip_advanced);
        assert_eq!(chain.height(), 10);
    }

    #[test]
    fn test_connect_headers_unknown_parent() {
        let params = Params::new(Network::Regtest);
        let mut chain = ChainState::new(&params);
        let mut headers = make_headers(&params.genesis, 5);
        // Break the link of the fourth header
        headers[3].prev_block = Hash256::from_bytes([0xee; 32]);

        let result = chain.connect_headers(&headers);
        assert_eq!(result.accepted, 3);
        assert!(result.unknown_parent);
        assert_eq!(chain.height(), 3);
    }

    #[test]
    fn test_headers_after_locator() {
        let params = Params::new(Network::Regtest);
        let mut chain = ChainState::new(&params);
        let headers = make_headers(&params.genesis, 50);
        chain.connect_headers(&headers);

        // A peer that knows up to height 20 asks for more
        let handle = chain.tree.lookup(&headers[19].hash()).unwrap();
        let locator = chain.chain.locator(&chain.tree, Some(handle));
        let reply = chain.headers_after(&locator, &Hash256::ZERO, 2000);
        assert_eq!(reply.len(), 30);
        assert_eq!(reply[0], headers[20]);
        assert_eq!(reply.last().unwrap(), headers.last().unwrap());

        // An unknown locator starts from the block after genesis
        let strange = crate::chain::BlockLocator {
            have: vec![Hash256::from_bytes([0x77; 32])],
        };
        let reply = chain.headers_after(&strange, &Hash256::ZERO, 2000);
        assert_eq!(reply.len(), 50);
        assert_eq!(reply[0], headers[0]);

        // The stop hash cuts the walk short
        let stop = headers[24].hash();
        let reply = chain.headers_after(&locator, &stop, 2000);
        assert_eq!(reply.len(), 5);
        assert_eq!(reply.last().unwrap().hash(), stop);
    }
}
