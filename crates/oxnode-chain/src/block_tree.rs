//! In-memory forest of every known block header.
//!
//! Entries live in an arena and refer to each other by [`BlockId`]; the
//! structure only ever grows, failed blocks are flagged rather than removed.

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::pow::Work;
use bitcoin::BlockHash;
use oxnode_index::DiskBlockIndex;
use oxnode_primitives::{BlockStatus, FilePos, MEDIAN_TIME_SPAN};
use std::collections::HashMap;

/// Handle of an entry in the [`BlockTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub fn zero_work() -> Work {
    Work::from_be_bytes([0u8; 32])
}

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: BlockHash,
    pub header: Header,
    pub parent: Option<BlockId>,
    /// Some ancestor further down, used to jump during ancestor lookups.
    skip: Option<BlockId>,
    pub height: u32,
    /// Cumulative work from genesis up to and including this block.
    pub chain_work: Work,
    pub status: BlockStatus,
    /// Set once some ancestor is known to have failed. Never reset except by
    /// reconsidering a block.
    pub failed_ancestor: bool,
    /// Number of transactions, zero until the block data is stored.
    pub n_tx: u32,
    /// Transactions from genesis up to this block, zero while any ancestor
    /// lacks block data.
    pub chain_tx: u64,
    pub data_pos: Option<FilePos>,
    pub undo_pos: Option<FilePos>,
    /// Arrival order of the block data, earlier wins among equal work.
    pub sequence_id: u64,
}

impl BlockIndexEntry {
    pub fn have_data(&self) -> bool {
        self.data_pos.is_some()
    }

    /// Whether the block itself or one of its ancestors failed validation.
    pub fn is_invalid(&self) -> bool {
        self.status.is_failed() || self.failed_ancestor
    }

    pub fn to_disk(&self) -> DiskBlockIndex {
        DiskBlockIndex::new(
            &self.header,
            self.height,
            self.status,
            self.n_tx,
            self.data_pos,
            self.undo_pos,
        )
    }
}

/// Height the skip pointer of a block at `height` points to.
// https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/chain.cpp#L72
fn skip_height(height: u32) -> u32 {
    fn invert_lowest_one(n: u32) -> u32 {
        n & n.wrapping_sub(1)
    }

    if height < 2 {
        return 0;
    }

    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Debug, Default)]
pub struct BlockTree {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<BlockHash, BlockId>,
}

impl BlockTree {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &BlockHash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    pub fn entry_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        &mut self.entries[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.entries.len() as u32).map(BlockId)
    }

    /// Inserts a header whose parent is already present, or the genesis header.
    ///
    /// Returns the existing id if the header is known.
    pub fn insert(&mut self, header: Header) -> BlockId {
        let hash = header.block_hash();
        if let Some(id) = self.get(&hash) {
            return id;
        }

        let parent = self.get(&header.prev_blockhash);
        let (height, parent_work, failed_ancestor) = match parent {
            Some(parent) => {
                let parent = self.entry(parent);
                (parent.height + 1, parent.chain_work, parent.is_invalid())
            }
            None => (0, zero_work(), false),
        };
        let skip = parent.and_then(|parent| self.ancestor(parent, skip_height(height)));

        let id = BlockId(self.entries.len() as u32);
        self.entries.push(BlockIndexEntry {
            hash,
            header,
            parent,
            skip,
            height,
            chain_work: parent_work + header.work(),
            status: BlockStatus::HeaderOnly,
            failed_ancestor,
            n_tx: 0,
            chain_tx: 0,
            data_pos: None,
            undo_pos: None,
            sequence_id: 0,
        });
        self.by_hash.insert(hash, id);

        id
    }

    /// Rebuilds an entry loaded from the index. The parent must be loaded first.
    pub fn insert_loaded(&mut self, header: Header, disk: &DiskBlockIndex) -> BlockId {
        let id = self.insert(header);
        let entry = self.entry_mut(id);
        entry.status = disk.status;
        entry.n_tx = disk.n_tx;
        entry.data_pos = disk.data_pos;
        entry.undo_pos = disk.undo_pos;
        id
    }

    /// Returns the ancestor of `id` at `height`.
    // https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/chain.cpp#L85
    pub fn ancestor(&self, id: BlockId, height: u32) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.entry(walk).height;
        if height > walk_height {
            return None;
        }

        while walk_height > height {
            let entry = self.entry(walk);
            let skip = skip_height(walk_height);
            let skip_prev = skip_height(walk_height - 1);
            let take_skip = entry.skip.is_some()
                && (skip == height
                    || (skip > height && !(skip_prev + 2 < skip && skip_prev >= height)));
            match (take_skip, entry.skip, entry.parent) {
                (true, Some(skip_id), _) => {
                    walk = skip_id;
                    walk_height = skip;
                }
                (_, _, Some(parent)) => {
                    walk = parent;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }

        Some(walk)
    }

    /// Lowest common ancestor of two entries.
    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let height = self.entry(a).height.min(self.entry(b).height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.entry(a).parent?;
            b = self.entry(b).parent?;
        }
        Some(a)
    }

    /// Whether `ancestor` lies on the path from genesis to `id`.
    pub fn is_ancestor(&self, ancestor: BlockId, id: BlockId) -> bool {
        self.ancestor(id, self.entry(ancestor).height) == Some(ancestor)
    }

    /// Median timestamp of the block and up to ten of its ancestors.
    pub fn median_time_past(&self, id: BlockId) -> u32 {
        let mut timestamps = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if timestamps.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.entry(current);
            timestamps.push(entry.header.time);
            walk = entry.parent;
        }

        timestamps.sort_unstable();

        timestamps[timestamps.len() / 2]
    }

    /// Marks every descendant of a failed block as having a failed ancestor.
    ///
    /// Returns the number of entries touched.
    pub fn poison_descendants(&mut self, failed: BlockId) -> usize {
        self.propagate_failures(failed.index() + 1)
    }

    /// Marks the descendants of all failed blocks at once.
    pub fn poison_all(&mut self) -> usize {
        self.propagate_failures(0)
    }

    /// Copies failure marks from parents to children in a single sweep.
    ///
    /// A parent always sits before its children in the arena, so visiting
    /// entries in arena order sees every parent's final mark first.
    fn propagate_failures(&mut self, from: usize) -> usize {
        let mut poisoned = 0;
        for index in from..self.entries.len() {
            let Some(parent) = self.entries[index].parent else {
                continue;
            };
            if !self.entries[index].failed_ancestor && self.entries[parent.index()].is_invalid() {
                self.entries[index].failed_ancestor = true;
                poisoned += 1;
            }
        }
        poisoned
    }

    /// Clears the failure marks of `id`, its ancestors and descendants.
    ///
    /// Returns the entries whose status changed and must be persisted.
    pub fn clear_failures(&mut self, id: BlockId) -> Vec<BlockId> {
        let mut changed = Vec::new();
        let height = self.entry(id).height;

        for other in self.ids().collect::<Vec<_>>() {
            let related = if self.entry(other).height >= height {
                self.is_ancestor(id, other)
            } else {
                self.is_ancestor(other, id)
            };
            if !related {
                continue;
            }
            let entry = self.entry_mut(other);
            entry.failed_ancestor = false;
            if entry.status.is_failed() {
                entry.status = if entry.have_data() {
                    BlockStatus::HaveData
                } else {
                    BlockStatus::HeaderOnly
                };
                changed.push(other);
            }
        }

        // Descendants of other failed blocks stay poisoned.
        let still_failed = self
            .ids()
            .filter(|id| self.entry(*id).status.is_failed())
            .collect::<Vec<_>>();
        for failed in still_failed {
            self.poison_descendants(failed);
        }

        changed
    }

    /// The genesis entry, if any block is known.
    pub fn genesis(&self) -> Option<BlockId> {
        (!self.entries.is_empty()).then_some(BlockId(0))
            .filter(|id| self.entry(*id).header.prev_blockhash == BlockHash::all_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxnode_test_utils::Miner;

    fn build_tree(length: u32) -> (BlockTree, Vec<BlockId>) {
        let mut miner = Miner::new();
        let mut tree = BlockTree::default();
        let genesis = miner.genesis().header;
        let mut ids = vec![tree.insert(genesis)];
        for block in miner.mine_chain(genesis.block_hash(), 0, length) {
            ids.push(tree.insert(block.header));
        }
        (tree, ids)
    }

    #[test]
    fn skip_heights_match_reference_values() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        assert_eq!(skip_height(2), 0);
        assert_eq!(skip_height(3), 1);
        assert_eq!(skip_height(4), 0);
        assert_eq!(skip_height(6), 4);
        assert_eq!(skip_height(7), 1);
        assert_eq!(skip_height(12), 8);
        for height in 2..10_000u32 {
            assert!(skip_height(height) < height);
        }
    }

    #[test]
    fn ancestor_lookup_agrees_with_parent_walk() {
        let (tree, ids) = build_tree(300);
        for _ in 0..200 {
            let from = fastrand::usize(..ids.len());
            let height = fastrand::u32(..=from as u32);
            assert_eq!(tree.ancestor(ids[from], height), Some(ids[height as usize]));
        }
        assert_eq!(tree.ancestor(ids[10], 11), None);
    }

    #[test]
    fn chain_work_accumulates() {
        let (tree, ids) = build_tree(3);
        let one = tree.entry(ids[0]).header.work();
        assert_eq!(tree.entry(ids[0]).chain_work, one);
        assert_eq!(tree.entry(ids[3]).chain_work, one + one + one + one);
        assert_eq!(tree.entry(ids[3]).height, 3);
    }

    #[test]
    fn common_ancestor_of_fork() {
        let mut miner = Miner::new();
        let (mut tree, ids) = build_tree(5);
        let fork_parent = tree.entry(ids[2]).hash;
        let fork = miner.mine_chain(fork_parent, 2, 4);
        let fork_ids = fork.iter().map(|b| tree.insert(b.header)).collect::<Vec<_>>();

        assert_eq!(tree.last_common_ancestor(ids[5], fork_ids[3]), Some(ids[2]));
        assert!(tree.is_ancestor(ids[2], fork_ids[0]));
        assert!(!tree.is_ancestor(ids[3], fork_ids[0]));
    }

    #[test]
    fn failures_poison_and_clear() {
        let (mut tree, ids) = build_tree(6);
        tree.entry_mut(ids[3]).status = BlockStatus::Failed;
        assert_eq!(tree.poison_descendants(ids[3]), 3);
        assert!(tree.entry(ids[6]).is_invalid());
        assert!(!tree.entry(ids[2]).is_invalid());

        let changed = tree.clear_failures(ids[5]);
        assert_eq!(changed, vec![ids[3]]);
        assert!(ids.iter().all(|id| !tree.entry(*id).is_invalid()));
    }

    #[test]
    fn poisoning_reaches_every_branch_in_one_sweep() {
        let mut miner = Miner::new();
        let (mut tree, ids) = build_tree(40);
        let side_parent = tree.entry(ids[10]).hash;
        let side = miner
            .mine_chain(side_parent, 10, 30)
            .iter()
            .map(|block| tree.insert(block.header))
            .collect::<Vec<_>>();

        // Marks as they would come out of the index, children not yet poisoned.
        tree.entry_mut(ids[20]).status = BlockStatus::Failed;
        tree.entry_mut(side[5]).status = BlockStatus::Failed;
        assert_eq!(tree.poison_all(), 20 + 24);
        assert_eq!(tree.poison_all(), 0);

        assert!(ids[21..].iter().all(|id| tree.entry(*id).failed_ancestor));
        assert!(ids[..=20].iter().all(|id| !tree.entry(*id).failed_ancestor));
        assert!(side[6..].iter().all(|id| tree.entry(*id).failed_ancestor));
        assert!(side[..=5].iter().all(|id| !tree.entry(*id).failed_ancestor));

        // A later failure on the side branch has nothing left to poison below it.
        tree.entry_mut(side[10]).status = BlockStatus::Failed;
        assert_eq!(tree.poison_descendants(side[10]), 0);
    }

    #[test]
    fn median_time_past_uses_eleven_blocks() {
        let (tree, ids) = build_tree(20);
        let times = (10..=20)
            .map(|h| tree.entry(ids[h]).header.time)
            .collect::<Vec<_>>();
        assert_eq!(tree.median_time_past(ids[20]), times[5]);
        assert_eq!(tree.median_time_past(ids[0]), tree.entry(ids[0]).header.time);
    }
}
