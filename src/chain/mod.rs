//! Block index and active chain
//!
//! The tree of all accepted headers (arena-backed, skip-linked for
//! O(log n) ancestor queries) and the dense best-chain array built over
//! it, with locator construction and fork finding. `ChainState` bundles
//! both behind one lock at the node layer.

pub mod chain;
pub mod index;

pub use chain::{BlockLocator, Chain};
pub use index::{skip_height, BlockIndex, BlockStatus, BlockTree, BlockValidity, Handle};

use crate::core::header::BlockHeader;
use crate::core::params::Params;

/// Outcome of connecting a batch of headers
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConnectResult {
    /// Headers linked into the tree (new or already known)
    pub accepted: usize,
    /// A header referenced a parent we have never seen
    pub unknown_parent: bool,
    /// The batch moved the active tip
    pub tip_advanced: bool,
}

/// The shared chain: header tree plus the active best branch.
/// Guarded by a single lock where it is shared (see the node).
pub struct ChainState {
    pub tree: BlockTree,
    pub chain: Chain,
}

impl ChainState {
    pub fn new(params: &Params) -> Self {
        let tree = BlockTree::new(&params.genesis);
        let mut chain = Chain::new();
        chain.set_tip(&tree, tree.genesis());
        Self { tree, chain }
    }

    pub fn height(&self) -> usize {
        self.chain.height().unwrap_or(0)
    }

    pub fn tip(&self) -> Handle {
        self.chain.tip().expect("chain always holds genesis")
    }

    /// Locator for the current tip
    pub fn best_locator(&self) -> BlockLocator {
        self.chain.locator(&self.tree, None)
    }

    /// Link a batch of headers into the tree, advancing the active tip
    /// when the batch ends on a branch with more cumulative work.
    pub fn connect_headers(&mut self, headers: &[BlockHeader]) -> ConnectResult {
        let mut result = ConnectResult::default();
        let mut last = None;
        for header in headers {
            match self.tree.insert(header) {
                Some(handle) => {
                    self.tree.raise_validity(handle, BlockValidity::Tree);
                    result.accepted += 1;
                    last = Some(handle);
                }
                None => {
                    result.unknown_parent = true;
                    break;
                }
            }
        }
        if let Some(candidate) = last {
            let tip = self.tip();
            if self.tree.get(candidate).chain_work() > self.tree.get(tip).chain_work() {
                self.chain.set_tip(&self.tree, candidate);
                result.tip_advanced = true;
            }
        }
        result
    }

    /// Headers to answer a `getheaders` request: locate the fork, then
    /// walk the active chain forward, up to `max` entries or `stop`.
    pub fn headers_after(
        &self,
        locator: &BlockLocator,
        stop: &crate::core::Hash256,
        max: usize,
    ) -> Vec<BlockHeader> {
        // First locator hash we recognise wins
        let mut start = None;
        for hash in &locator.have {
            if let Some(handle) = self.tree.lookup(hash) {
                start = self.chain.find_fork(&self.tree, Some(handle));
                break;
            }
        }
        let mut headers = Vec::new();
        let mut walk = match start {
            Some(handle) => self.chain.next(&self.tree, handle),
            // Unrecognised locator: start from genesis' successor
            None => self.chain.get(1),
        };
        while let Some(handle) = walk {
            let index = self.tree.get(handle);
            headers.push(index.header().clone());
            if headers.len() >= max || index.hash() == *stop {
                break;
            }
            walk = self.chain.next(&self.tree, handle);
        }
        headers
    }
}
