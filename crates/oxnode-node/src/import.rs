use crate::error::Result;
use crate::node::Node;
use bitcoin::{Block, BlockHash};
use oxnode_chain::ImportStatus;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Serialized size of the blocks held back while waiting for their parent.
const MAX_ORPHAN_BYTES: usize = 256 * 1024 * 1024;

/// Outcome of [`Node::import_block_files`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub files: usize,
    /// Blocks stored by this import.
    pub imported: usize,
    /// Blocks the node already had.
    pub known: usize,
    pub invalid: usize,
    /// Blocks whose parent never showed up, or that were dropped to keep
    /// the blocks waiting for a parent within memory bounds.
    pub orphans: usize,
    pub interrupted: bool,
}

/// Blocks waiting for their parent, keyed by the parent hash.
///
/// Once the total size exceeds the budget the oldest blocks are dropped.
struct OrphanBlocks {
    by_parent: HashMap<BlockHash, Vec<(Block, usize)>>,
    /// `(parent, hash)` in arrival order, may refer to blocks taken since.
    arrival: VecDeque<(BlockHash, BlockHash)>,
    bytes: usize,
    max_bytes: usize,
    len: usize,
    evicted: usize,
}

impl OrphanBlocks {
    fn new(max_bytes: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            arrival: VecDeque::new(),
            bytes: 0,
            max_bytes,
            len: 0,
            evicted: 0,
        }
    }

    fn insert(&mut self, block: Block, size: usize) {
        let parent = block.header.prev_blockhash;
        self.arrival.push_back((parent, block.block_hash()));
        self.by_parent.entry(parent).or_default().push((block, size));
        self.bytes += size;
        self.len += 1;

        while self.bytes > self.max_bytes {
            let Some((parent, hash)) = self.arrival.pop_front() else {
                break;
            };
            if let Some((_, size)) = self.remove(&parent, &hash) {
                tracing::debug!(%hash, size, "Dropping block waiting for parent {parent}");
                self.evicted += 1;
            }
        }

        // Drop the bookkeeping of blocks that were taken by their parent.
        if self.arrival.len() > 2 * self.len + 64 {
            let by_parent = &self.by_parent;
            self.arrival.retain(|(parent, hash)| {
                by_parent
                    .get(parent)
                    .is_some_and(|children| children.iter().any(|(child, _)| child.block_hash() == *hash))
            });
        }
    }

    fn remove(&mut self, parent: &BlockHash, hash: &BlockHash) -> Option<(Block, usize)> {
        let children = self.by_parent.get_mut(parent)?;
        let index = children
            .iter()
            .position(|(child, _)| child.block_hash() == *hash)?;
        let removed = children.remove(index);
        if children.is_empty() {
            self.by_parent.remove(parent);
        }
        self.bytes -= removed.1;
        self.len -= 1;
        Some(removed)
    }

    /// Takes the blocks waiting for `parent`, with their sizes.
    fn take_children(&mut self, parent: &BlockHash) -> Vec<(Block, usize)> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        self.len -= children.len();
        self.bytes -= children.iter().map(|(_, size)| size).sum::<usize>();
        children
    }

    /// Blocks dropped or still waiting.
    fn orphans(&self) -> usize {
        self.evicted + self.len
    }
}

/// `blk?????.dat` files in `dir`, in file number order.
fn block_files(dir: &Path) -> std::io::Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(number) = name
            .strip_prefix("blk")
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        files.push((number, path));
    }
    files.sort();
    Ok(files)
}

impl Node {
    /// Imports the blocks of a directory of Bitcoin Core block files.
    ///
    /// Blocks may appear before their parent, they are kept aside until the
    /// parent has been processed. `shutdown` is checked between blocks.
    pub fn import_block_files(&self, dir: &Path, shutdown: &AtomicBool) -> Result<ImportStats> {
        let magic = self.config().network.magic().to_bytes();
        let files = block_files(dir)?;

        tracing::info!("Importing {} block files from {}", files.len(), dir.display());

        let mut stats = ImportStats::default();
        let mut pending = OrphanBlocks::new(MAX_ORPHAN_BYTES);
        let mut last_report = Instant::now();
        let mut last_imported = 0;

        'files: for (number, path) in files {
            stats.files += 1;

            for record in oxnode_blockstore::read_records(&path, number, magic)? {
                if shutdown.load(Ordering::Relaxed) {
                    stats.interrupted = true;
                    break 'files;
                }

                let size = record.payload.len();
                let block: Block = match bitcoin::consensus::deserialize(&record.payload) {
                    Ok(block) => block,
                    Err(err) => {
                        tracing::warn!(pos = %record.pos, "Skipping undecodable block: {err}");
                        continue;
                    }
                };

                self.import_with_descendants(block, size, &mut pending, &mut stats)?;

                if last_report.elapsed() >= PROGRESS_INTERVAL {
                    let speed = (stats.imported - last_imported) as f64 / last_report.elapsed().as_secs_f64();
                    tracing::info!(
                        "⚙️  Imported {} blocks, best #{}, {speed:.1} blocks/s",
                        stats.imported,
                        self.get_chain_height()
                    );
                    last_report = Instant::now();
                    last_imported = stats.imported;
                }
            }
        }

        stats.orphans = pending.orphans();

        tracing::info!(
            imported = stats.imported,
            known = stats.known,
            invalid = stats.invalid,
            orphans = stats.orphans,
            "Finished importing block files"
        );

        Ok(stats)
    }

    fn import_with_descendants(
        &self,
        block: Block,
        size: usize,
        pending: &mut OrphanBlocks,
        stats: &mut ImportStats,
    ) -> Result<()> {
        let mut queue = vec![(block, size)];

        while let Some((block, size)) = queue.pop() {
            let hash = block.block_hash();

            match self.process_block(&block)? {
                ImportStatus::Accepted { .. } => stats.imported += 1,
                ImportStatus::AlreadyKnown => stats.known += 1,
                ImportStatus::UnknownParent => {
                    pending.insert(block, size);
                    continue;
                }
                ImportStatus::KnownBad => {
                    stats.invalid += 1;
                    continue;
                }
                ImportStatus::Invalid(err) => {
                    tracing::warn!(%hash, "Imported block is invalid: {err}");
                    stats.invalid += 1;
                    continue;
                }
            }

            queue.extend(pending.take_children(&hash));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;
    use oxnode_test_utils::Miner;

    fn size_of(block: &Block) -> usize {
        bitcoin::consensus::serialize(block).len()
    }

    #[test]
    fn oldest_waiting_blocks_are_dropped_over_budget() {
        let mut miner = Miner::new();
        let genesis = miner.genesis().block_hash();
        let chain = miner.mine_chain(genesis, 0, 4);
        let block_size = size_of(&chain[1]);

        // Room for two blocks.
        let mut orphans = OrphanBlocks::new(2 * block_size + block_size / 2);
        for block in &chain[1..] {
            orphans.insert(block.clone(), size_of(block));
        }

        assert_eq!(orphans.len, 2);
        assert_eq!(orphans.evicted, 1);
        assert_eq!(orphans.orphans(), 3);
        assert!(orphans.take_children(&chain[0].block_hash()).is_empty());

        let released = orphans.take_children(&chain[1].block_hash());
        assert_eq!(
            released.iter().map(|(block, _)| block.block_hash()).collect::<Vec<_>>(),
            vec![chain[2].block_hash()]
        );
        assert_eq!(orphans.len, 1);
        assert_eq!(orphans.bytes, size_of(&chain[3]));
    }

    #[test]
    fn siblings_wait_for_the_same_parent() {
        let mut miner = Miner::new();
        let parent = miner.genesis().block_hash();
        let a = miner.mine(parent, 1, Amount::ZERO, Vec::new());
        let b = miner.mine(parent, 1, Amount::ZERO, Vec::new());

        let mut orphans = OrphanBlocks::new(MAX_ORPHAN_BYTES);
        orphans.insert(a.clone(), size_of(&a));
        orphans.insert(b.clone(), size_of(&b));
        assert_eq!(orphans.take_children(&parent).len(), 2);
        assert_eq!((orphans.len, orphans.bytes, orphans.orphans()), (0, 0, 0));

        // Stale arrival records do not grow without bound.
        for _ in 0..200 {
            let block = miner.mine(parent, 1, Amount::ZERO, Vec::new());
            orphans.insert(block, 100);
            orphans.take_children(&parent);
        }
        assert!(orphans.arrival.len() <= 2 + 64);
    }
}
