use crate::block_tree::{BlockId, BlockTree};
use bitcoin::BlockHash;

/// The active chain as a height indexed array of tree entries.
///
/// The entry at height `h` is always the parent of the entry at `h + 1`.
#[derive(Debug, Default, Clone)]
pub struct ActiveChain {
    chain: Vec<BlockId>,
}

impl ActiveChain {
    pub fn tip(&self) -> Option<BlockId> {
        self.chain.last().copied()
    }

    /// Height of the tip, `None` for an empty chain.
    pub fn height(&self) -> Option<u32> {
        self.chain.len().checked_sub(1).map(|height| height as u32)
    }

    pub fn at(&self, height: u32) -> Option<BlockId> {
        self.chain.get(height as usize).copied()
    }

    pub fn contains(&self, tree: &BlockTree, id: BlockId) -> bool {
        self.at(tree.entry(id).height) == Some(id)
    }

    /// Last entry of the active chain that is an ancestor of `id` (or `id` itself).
    pub fn fork_point(&self, tree: &BlockTree, id: BlockId) -> Option<BlockId> {
        let tip_height = self.height()?;
        let entry_height = tree.entry(id).height;
        let mut walk = tree.ancestor(id, entry_height.min(tip_height))?;
        loop {
            if self.contains(tree, walk) {
                return Some(walk);
            }
            walk = tree.entry(walk).parent?;
        }
    }

    pub fn push(&mut self, tree: &BlockTree, id: BlockId) {
        debug_assert_eq!(tree.entry(id).parent, self.tip());
        self.chain.push(id);
    }

    pub fn pop(&mut self) -> Option<BlockId> {
        self.chain.pop()
    }

    /// Makes `tip` the tip, rebuilding the array from its ancestors.
    pub fn set_tip(&mut self, tree: &BlockTree, tip: Option<BlockId>) {
        let Some(tip) = tip else {
            self.chain.clear();
            return;
        };

        let height = tree.entry(tip).height as usize;
        self.chain.resize(height + 1, tip);

        let mut walk = Some(tip);
        let mut index = height;
        while let Some(id) = walk {
            if self.chain[index] == id && index != height {
                break;
            }
            self.chain[index] = id;
            walk = tree.entry(id).parent;
            index = index.saturating_sub(1);
        }
    }

    /// Block hashes going back from the tip, exponentially spaced after the
    /// first ten, always ending with genesis.
    pub fn locator(&self, tree: &BlockTree) -> Vec<BlockHash> {
        let Some(mut height) = self.height() else {
            return Vec::new();
        };

        let mut hashes = Vec::new();
        let mut step = 1;
        loop {
            if let Some(id) = self.at(height) {
                hashes.push(tree.entry(id).hash);
            }
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }

        hashes
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = BlockId> + '_ {
        self.chain.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxnode_test_utils::Miner;

    #[test]
    fn set_tip_switches_branches() {
        let mut miner = Miner::new();
        let mut tree = BlockTree::default();
        let genesis = miner.genesis().header;
        let mut main = vec![tree.insert(genesis)];
        main.extend(
            miner
                .mine_chain(genesis.block_hash(), 0, 6)
                .iter()
                .map(|b| tree.insert(b.header)),
        );
        let fork = miner
            .mine_chain(tree.entry(main[3]).hash, 3, 2)
            .iter()
            .map(|b| tree.insert(b.header))
            .collect::<Vec<_>>();

        let mut chain = ActiveChain::default();
        assert_eq!(chain.height(), None);
        chain.set_tip(&tree, Some(main[6]));
        assert_eq!(chain.height(), Some(6));
        assert_eq!(chain.fork_point(&tree, fork[1]), Some(main[3]));

        chain.set_tip(&tree, Some(fork[1]));
        assert_eq!(chain.height(), Some(5));
        assert_eq!(chain.at(4), Some(fork[0]));
        assert_eq!(chain.at(3), Some(main[3]));
        assert!(!chain.contains(&tree, main[4]));
        assert_eq!(chain.fork_point(&tree, main[6]), Some(main[3]));

        let locator = chain.locator(&tree);
        assert_eq!(locator.first(), Some(&tree.entry(fork[1]).hash));
        assert_eq!(locator.last(), Some(&genesis.block_hash()));

        chain.set_tip(&tree, None);
        assert_eq!(chain.tip(), None);
    }
}
