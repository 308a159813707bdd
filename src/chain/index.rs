//! Block index tree
//!
//! Every header this node has accepted lives in an arena-backed tree. A
//! node's `prev` edge points at its parent; `skip` points at a deterministic
//! ancestor chosen so that walking toward any height takes O(log n) hops.
//! Links are integer handles into the arena rather than pointers, so the
//! owning container can grow freely and lifetimes stay trivial.

use crate::core::hash256::Hash256;
use crate::core::header::BlockHeader;
use bitflags::bitflags;
use primitive_types::U256;
use std::collections::HashMap;

/// Index of a `BlockIndex` inside its owning `BlockTree` arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) usize);

impl Handle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How far validation of a block has progressed. Levels form a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockValidity {
    Unknown = 0,
    /// Header parsed, proof of work checked
    Header = 1,
    /// Parent found, height/time/work computed
    Tree = 2,
    /// Transaction structure checked
    Transactions = 3,
    /// Inputs available in ancestor context
    Chain = 4,
    /// Scripts and signatures checked
    Scripts = 5,
}

bitflags! {
    /// Non-validity status bits of a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockStatus: u32 {
        /// Full block data stored
        const HAVE_DATA    = 0x08;
        /// Undo data stored
        const HAVE_UNDO    = 0x10;
        /// This block failed validation
        const FAILED_VALID = 0x20;
        /// Descends from a failed block
        const FAILED_CHILD = 0x40;
        /// Witness data validated
        const OPT_WITNESS  = 0x80;
        const FAILED_MASK  = Self::FAILED_VALID.bits() | Self::FAILED_CHILD.bits();
    }
}

/// One accepted header and its derived chain metadata
#[derive(Debug, Clone)]
pub struct BlockIndex {
    header: BlockHeader,
    hash: Hash256,
    prev: Option<Handle>,
    skip: Option<Handle>,
    height: usize,
    chain_work: U256,
    /// Running maximum of header times along this branch
    time_max: u32,
    tx_num: u64,
    chain_tx_num: u64,
    status: BlockStatus,
    validity: BlockValidity,
    sequence_id: u64,
}

impl BlockIndex {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn prev(&self) -> Option<Handle> {
        self.prev
    }

    pub fn skip(&self) -> Option<Handle> {
        self.skip
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn chain_work(&self) -> U256 {
        self.chain_work
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn time_max(&self) -> u32 {
        self.time_max
    }

    pub fn tx_num(&self) -> u64 {
        self.tx_num
    }

    pub fn chain_tx_num(&self) -> u64 {
        self.chain_tx_num
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// True iff no failure bit is set and validation reached `upto`
    pub fn is_valid(&self, upto: BlockValidity) -> bool {
        if self.status.intersects(BlockStatus::FAILED_MASK) {
            return false;
        }
        self.validity >= upto
    }
}

/// Deterministic height the skip pointer of a block at `height` targets.
///
/// Heights below 2 skip to genesis. Otherwise: even heights clear their
/// lowest set bit; odd heights clear the lowest set bit of `height - 1`
/// twice and add one back. This keeps pairs of skips from both parities
/// converging quickly without ever skipping past a power-of-two boundary
/// in one hop.
pub fn skip_height(height: usize) -> usize {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Clear the least-significant set bit
fn invert_lowest_one(n: usize) -> usize {
    n & (n.wrapping_sub(1))
}

/// Arena of all known block headers, linked into a tree
pub struct BlockTree {
    arena: Vec<BlockIndex>,
    by_hash: HashMap<Hash256, Handle>,
    next_sequence: u64,
}

impl BlockTree {
    /// Build a tree containing only the genesis header
    pub fn new(genesis: &BlockHeader) -> Self {
        let hash = genesis.hash();
        let index = BlockIndex {
            header: genesis.clone(),
            hash,
            prev: None,
            skip: None,
            height: 0,
            chain_work: genesis.work(),
            time_max: genesis.time,
            tx_num: 0,
            chain_tx_num: 0,
            status: BlockStatus::empty(),
            validity: BlockValidity::Scripts,
            sequence_id: 0,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, Handle(0));
        Self {
            arena: vec![index],
            by_hash,
            next_sequence: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn genesis(&self) -> Handle {
        Handle(0)
    }

    pub fn get(&self, handle: Handle) -> &BlockIndex {
        &self.arena[handle.0]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<Handle> {
        self.by_hash.get(hash).copied()
    }

    /// Accept a header whose parent is already known.
    ///
    /// Returns the existing handle on duplicate insert; `None` if the
    /// parent hash is unknown (the caller should fetch more headers first).
    pub fn insert(&mut self, header: &BlockHeader) -> Option<Handle> {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return Some(*existing);
        }
        let prev = self.lookup(&header.prev_block)?;
        let prev_index = self.get(prev);
        let height = prev_index.height + 1;
        let chain_work = prev_index.chain_work + header.work();
        let time_max = prev_index.time_max.max(header.time);
        let skip = Some(self.ancestor(prev, skip_height(height)));
        let handle = Handle(self.arena.len());
        self.arena.push(BlockIndex {
            header: header.clone(),
            hash,
            prev: Some(prev),
            skip,
            height,
            chain_work,
            time_max,
            tx_num: 0,
            chain_tx_num: 0,
            status: BlockStatus::empty(),
            validity: BlockValidity::Header,
            sequence_id: self.next_sequence,
        });
        self.next_sequence += 1;
        self.by_hash.insert(hash, handle);
        Some(handle)
    }

    /// Ancestor of `from` at exactly `height`.
    ///
    /// Panics if `height` exceeds the node's height or a prev link is
    /// missing mid-walk; both indicate a caller bug, not bad peer data.
    pub fn ancestor(&self, from: Handle, height: usize) -> Handle {
        self.ancestor_counting(from, height).0
    }

    /// Skip-walk with a hop count, used to verify the O(log n) bound
    pub(crate) fn ancestor_counting(&self, from: Handle, height: usize) -> (Handle, usize) {
        let mut walk = from;
        let mut height_walk = self.get(from).height;
        assert!(
            height <= height_walk,
            "ancestor query above node height: {height} > {height_walk}"
        );
        let mut hops = 0usize;
        while height_walk > height {
            let height_skip = skip_height(height_walk) as i64;
            let height_skip_prev = skip_height(height_walk - 1) as i64;
            let target = height as i64;
            let node = self.get(walk);
            let take_skip = match node.skip {
                Some(_) => {
                    height_skip == target
                        || (height_skip > target
                            && !(height_skip_prev < height_skip - 2 && height_skip_prev >= target))
                }
                None => false,
            };
            if take_skip {
                walk = node.skip.expect("skip checked above");
                height_walk = height_skip as usize;
            } else {
                walk = node.prev.expect("non-genesis block must have prev");
                height_walk -= 1;
            }
            hops += 1;
        }
        (walk, hops)
    }

    /// Record that full block data arrived for this header
    pub fn set_block_data(&mut self, handle: Handle, tx_num: u64) {
        let chain_tx_prev = self.get(handle).prev.map(|p| self.get(p).chain_tx_num);
        let index = &mut self.arena[handle.0];
        index.tx_num = tx_num;
        index.chain_tx_num = chain_tx_prev.unwrap_or(0) + tx_num;
        index.status |= BlockStatus::HAVE_DATA;
    }

    /// Raise the validity level of a block; levels never go backwards
    pub fn raise_validity(&mut self, handle: Handle, validity: BlockValidity) {
        let index = &mut self.arena[handle.0];
        assert!(
            !index.status.intersects(BlockStatus::FAILED_MASK),
            "raising validity of a failed block"
        );
        if validity > index.validity {
            index.validity = validity;
        }
    }

    /// Mark a block as having failed validation
    pub fn mark_failed(&mut self, handle: Handle) {
        self.arena[handle.0].status |= BlockStatus::FAILED_VALID;
    }

    /// Mark a block as descending from a failed block
    pub fn mark_failed_child(&mut self, handle: Handle) {
        self.arena[handle.0].status |= BlockStatus::FAILED_CHILD;
    }
}
