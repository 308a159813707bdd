//! Active best chain
//!
//! A dense array of block-tree handles indexed by height, describing the
//! single branch this node currently considers best. All queries take the
//! owning `BlockTree` so the chain itself stays a plain index structure.

use crate::chain::index::{BlockTree, Handle};
use crate::core::hash256::Hash256;

/// Compact description of a chain position for `getblocks`/`getheaders`.
/// First entry is the requested block's hash, last is always genesis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    pub fn is_empty(&self) -> bool {
        self.have.is_empty()
    }

    pub fn len(&self) -> usize {
        self.have.len()
    }
}

/// The active chain: `active[h]` is the block at height `h`
#[derive(Debug, Default)]
pub struct Chain {
    active: Vec<Handle>,
}

impl Chain {
    pub fn new() -> Self {
        Self { active: Vec::new() }
    }

    /// Height of the tip, `None` while the chain is empty
    pub fn height(&self) -> Option<usize> {
        self.active.len().checked_sub(1)
    }

    pub fn tip(&self) -> Option<Handle> {
        self.active.last().copied()
    }

    pub fn genesis(&self) -> Option<Handle> {
        self.active.first().copied()
    }

    /// Block at `height` on the active branch
    pub fn get(&self, height: usize) -> Option<Handle> {
        self.active.get(height).copied()
    }

    /// True iff `handle` lies on the active branch
    pub fn contains(&self, tree: &BlockTree, handle: Handle) -> bool {
        self.get(tree.get(handle).height()) == Some(handle)
    }

    /// Successor of `handle` on the active branch
    pub fn next(&self, tree: &BlockTree, handle: Handle) -> Option<Handle> {
        if self.contains(tree, handle) {
            self.get(tree.get(handle).height() + 1)
        } else {
            None
        }
    }

    /// Make `tip` the new best tip.
    ///
    /// The array is resized and rewritten backwards from the tip, stopping
    /// as soon as a slot already holds the right block — branches that
    /// share a prefix with the old tip only pay for their divergent suffix.
    pub fn set_tip(&mut self, tree: &BlockTree, tip: Handle) {
        let old_len = self.active.len();
        let new_len = tree.get(tip).height() + 1;
        self.active.resize(new_len, tip);
        let mut walk = Some(tip);
        while let Some(handle) = walk {
            let height = tree.get(handle).height();
            if height < old_len && self.active[height] == handle {
                break;
            }
            self.active[height] = handle;
            walk = tree.get(handle).prev();
        }
    }

    /// Build a locator walking back from `from` (default: the tip).
    ///
    /// The first ten steps go back one block each; after that the step
    /// doubles, giving O(log height) entries with geometric spacing.
    pub fn locator(&self, tree: &BlockTree, from: Option<Handle>) -> BlockLocator {
        let mut have = Vec::with_capacity(32);
        let Some(mut index) = from.or_else(|| self.tip()) else {
            return BlockLocator { have };
        };
        let mut step = 1usize;
        loop {
            have.push(tree.get(index).hash());
            let height = tree.get(index).height();
            if height == 0 {
                break;
            }
            let next_height = height.saturating_sub(step);
            if self.contains(tree, index) {
                // On the active branch the jump is a direct array read
                index = self.active[next_height];
            } else {
                index = tree.ancestor(index, next_height);
            }
            if have.len() > 10 {
                step *= 2;
            }
        }
        BlockLocator { have }
    }

    /// Last common block between `handle`'s branch and the active chain
    pub fn find_fork(&self, tree: &BlockTree, handle: Option<Handle>) -> Option<Handle> {
        let mut index = handle?;
        let tip_height = self.height()?;
        if tree.get(index).height() > tip_height {
            index = tree.ancestor(index, tip_height);
        }
        while !self.contains(tree, index) {
            index = tree
                .get(index)
                .prev()
                .expect("walk reached a parentless non-active block");
        }
        Some(index)
    }

    /// First active block whose running-max time is at least `time`
    pub fn find_earliest_at_least(&self, tree: &BlockTree, time: u32) -> Option<Handle> {
        let idx = self
            .active
            .partition_point(|handle| tree.get(*handle).time_max() < time);
        self.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash256::Hash256;
    use crate::core::header::BlockHeader;
    use crate::core::params::{Network, Params};
    use rand::Rng;

    fn extend_chain(tree: &mut BlockTree, from: Handle, count: usize) -> Vec<Handle> {
        let mut handles = Vec::with_capacity(count);
        let mut prev = from;
        for i in 0..count {
            let parent = tree.get(prev);
            let header = BlockHeader {
                version: 1,
                prev_block: parent.hash(),
                merkle_root: Hash256::ZERO,
                time: parent.time() + 600,
                bits: 0x207fffff,
                // Nonce varies per branch so sibling headers never collide
                nonce: (parent.height() as u32) ^ ((i as u32) << 8).wrapping_mul(0x9e37),
            };
            prev = tree.insert(&header).expect("parent is known");
            handles.push(prev);
        }
        handles
    }

    fn tree_with_chain(count: usize) -> (BlockTree, Vec<Handle>, Chain) {
        let mut tree = BlockTree::new(&Params::new(Network::Regtest).genesis);
        let genesis = tree.genesis();
        let handles = extend_chain(&mut tree, genesis, count);
        let mut chain = Chain::new();
        chain.set_tip(&tree, *handles.last().unwrap());
        (tree, handles, chain)
    }

    /// Verify the locator shape: tip first, genesis last, ten consecutive
    /// single steps, then doubling gaps.
    fn assert_locator_shape(tree: &BlockTree, locator: &BlockLocator, tip: Handle) {
        assert_eq!(locator.have.first(), Some(&tree.get(tip).hash()));
        let genesis_hash = tree.get(tree.genesis()).hash();
        assert_eq!(locator.have.last(), Some(&genesis_hash));

        let heights: Vec<usize> = locator
            .have
            .iter()
            .map(|hash| tree.get(tree.lookup(hash).expect("locator entry known")).height())
            .collect();

        let mut expected_gap = 1usize;
        for i in 1..heights.len() {
            let gap = heights[i - 1] - heights[i];
            if heights[i] == 0 {
                // The final jump to genesis may be clamped short
                assert!(gap <= expected_gap);
                break;
            }
            assert_eq!(gap, expected_gap, "entry {i} of {heights:?}");
            if i >= 11 {
                expected_gap *= 2;
            }
        }
    }

    #[test]
    fn test_set_tip_consistency() {
        let (tree, handles, chain) = tree_with_chain(200);
        assert_eq!(chain.height(), Some(200));
        for height in 0..=200usize {
            let handle = chain.get(height).unwrap();
            assert_eq!(tree.get(handle).height(), height);
            if height > 0 {
                assert_eq!(tree.get(handle).prev(), chain.get(height - 1));
            }
        }
        assert_eq!(chain.tip(), Some(*handles.last().unwrap()));
    }

    #[test]
    fn test_set_tip_switches_branches() {
        let (mut tree, main, mut chain) = tree_with_chain(100);
        // Fork at height 50, build a longer branch
        let fork_point = main[49];
        let branch = extend_chain(&mut tree, fork_point, 80);
        chain.set_tip(&tree, *branch.last().unwrap());

        assert_eq!(chain.height(), Some(130));
        for height in 0..=130usize {
            let handle = chain.get(height).unwrap();
            assert_eq!(tree.get(handle).height(), height);
            if height > 0 {
                assert_eq!(tree.get(handle).prev(), chain.get(height - 1));
            }
        }
        // Shared prefix kept, divergent suffix replaced
        assert!(chain.contains(&tree, fork_point));
        assert!(!chain.contains(&tree, main[60]));
        assert!(chain.contains(&tree, branch[0]));

        // Reorg back to the shorter original branch
        chain.set_tip(&tree, *main.last().unwrap());
        assert_eq!(chain.height(), Some(100));
        assert!(chain.contains(&tree, main[60]));
        assert!(!chain.contains(&tree, branch[0]));
    }

    #[test]
    fn test_locator_shape_small_chain() {
        let (tree, handles, chain) = tree_with_chain(64);
        let locator = chain.locator(&tree, None);
        assert_locator_shape(&tree, &locator, *handles.last().unwrap());
    }

    #[test]
    fn test_locator_from_off_chain_block() {
        let (mut tree, main, mut chain) = tree_with_chain(120);
        let branch = extend_chain(&mut tree, main[59], 30);
        chain.set_tip(&tree, *main.last().unwrap());

        let branch_tip = *branch.last().unwrap();
        let locator = chain.locator(&tree, Some(branch_tip));
        assert_locator_shape(&tree, &locator, branch_tip);
    }

    #[test]
    fn test_locator_is_logarithmic() {
        let (tree, _, chain) = tree_with_chain(10_000);
        let locator = chain.locator(&tree, None);
        // 10 single steps plus doubling gaps: well under 32 entries
        assert!(locator.len() < 32, "{} entries", locator.len());
    }

    #[test]
    fn test_find_fork() {
        let (mut tree, main, mut chain) = tree_with_chain(100);
        let branch = extend_chain(&mut tree, main[39], 200);
        chain.set_tip(&tree, *main.last().unwrap());

        // Branch tip is taller than the active tip; fork is at height 40
        let fork = chain.find_fork(&tree, Some(*branch.last().unwrap())).unwrap();
        assert_eq!(fork, main[39]);
        assert_eq!(tree.get(fork).height(), 40);

        // A block on the active chain is its own fork point
        assert_eq!(chain.find_fork(&tree, Some(main[10])), Some(main[10]));
        assert_eq!(chain.find_fork(&tree, None), None);
    }

    #[test]
    fn test_find_earliest_at_least() {
        let (tree, handles, chain) = tree_with_chain(50);
        let target = tree.get(handles[20]).time_max();
        let found = chain.find_earliest_at_least(&tree, target).unwrap();
        assert_eq!(found, handles[20]);
        assert!(tree.get(found).time_max() >= target);
        // Beyond the tip's max time there is no match
        let tip_time = tree.get(*handles.last().unwrap()).time_max();
        assert!(chain.find_earliest_at_least(&tree, tip_time + 1).is_none());
    }

    #[test]
    fn test_scenario_large_fork_locators() {
        // 100_000-block main chain plus a 50_000-block branch forking at
        // height 49_999; locators from random tips on both branches keep
        // their shape and endpoint invariants.
        let mut tree = BlockTree::new(&Params::new(Network::Regtest).genesis);
        let genesis = tree.genesis();
        let main = extend_chain(&mut tree, genesis, 100_000);
        let branch = extend_chain(&mut tree, main[49_998], 50_000);
        let mut chain = Chain::new();
        chain.set_tip(&tree, *main.last().unwrap());

        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let handle = if rng.gen_bool(0.5) {
                main[rng.gen_range(0..main.len())]
            } else {
                branch[rng.gen_range(0..branch.len())]
            };
            let locator = chain.locator(&tree, Some(handle));
            assert_locator_shape(&tree, &locator, handle);
        }
    }
}
