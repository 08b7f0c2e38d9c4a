//! The chain state machine.
//!
//! [`ChainState`] owns the block tree, the active chain, the block files,
//! the metadata index and the UTXO cache. Blocks are accepted into the tree
//! first and connected later by [`ChainState::activate_best_chain`], which
//! moves the tip to the valid chain with the most cumulative work.

use crate::active_chain::ActiveChain;
use crate::block_tree::{BlockId, BlockIndexEntry, BlockTree};
use crate::script_check::{ScriptChecker, TxScriptJob};
use crate::verification::{check_block_contextual, check_block_sanity, check_header};
use crate::{BlockError, Error, Result};
use bitcoin::block::Header;
use bitcoin::consensus::encode::VarInt;
use bitcoin::hashes::Hash;
use bitcoin::pow::Work;
use bitcoin::{Amount, Block, BlockHash, Network, OutPoint, Transaction, Txid};
use oxnode_blockstore::{BlockStore, BlockStoreConfig, DEFAULT_MAX_FILE_SIZE};
use oxnode_coins::{BlockUndo, Coin, CoinsDb, CoinsView, CoinsViewCache, TxUndo};
use oxnode_index::{IndexBatch, IndexDb};
use oxnode_primitives::script::{ScriptVerifier, get_block_script_flags};
use oxnode_primitives::{BlockStatus, ChainParams, DiskTxPos, FilePos, IndexedBlock, unix_time};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default memory ceiling of the UTXO cache.
pub const DEFAULT_COINS_CACHE_SIZE: usize = 450 * 1024 * 1024;

/// Default interval between two periodic flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Configuration of [`ChainState`].
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: Network,
    /// Maintain the txid to disk position index.
    pub txindex: bool,
    /// Rebuild the index and the UTXO set from the block files.
    pub reindex: bool,
    /// Memory ceiling of the UTXO cache in bytes.
    pub coins_cache_size: usize,
    pub max_block_file_size: u32,
    /// Maximum time between two flushes while blocks are being connected.
    pub flush_interval: Duration,
    /// Script verification workers, `0` picks the number of CPUs.
    pub script_threads: usize,
}

impl ChainConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            txindex: false,
            reindex: false,
            coins_cache_size: DEFAULT_COINS_CACHE_SIZE,
            max_block_file_size: DEFAULT_MAX_FILE_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            script_threads: 0,
        }
    }
}

/// When [`ChainState::flush_state`] actually writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only when the UTXO cache exceeds its memory ceiling.
    IfNeeded,
    /// Also when the flush interval elapsed.
    Periodic,
    /// Unconditionally.
    Always,
}

/// Outcome of submitting a header or a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    /// Stored in the block tree.
    Accepted { hash: BlockHash, height: u32 },
    /// Already known, nothing was done.
    AlreadyKnown,
    /// The parent header is unknown.
    UnknownParent,
    /// The block or one of its ancestors was marked as failed earlier.
    KnownBad,
    /// The header or the block failed validation.
    Invalid(BlockError),
}

impl ImportStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Change of the active chain tip.
#[derive(Debug, Clone)]
pub enum TipEvent {
    Connected {
        hash: BlockHash,
        height: u32,
        block: Arc<Block>,
    },
    Disconnected {
        hash: BlockHash,
        height: u32,
        block: Arc<Block>,
    },
}

impl TipEvent {
    pub fn block(&self) -> &Arc<Block> {
        match self {
            Self::Connected { block, .. } | Self::Disconnected { block, .. } => block,
        }
    }
}

/// Everything that happened while activating the best chain, in order.
#[derive(Debug, Default)]
pub struct ChainUpdate {
    pub events: Vec<TipEvent>,
    /// Blocks that failed validation while being connected.
    pub invalid: Vec<(BlockHash, BlockError)>,
}

/// Result of undoing a block on a coins view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Every output and prevout matched the undo data.
    Ok,
    /// The block was undone, but the view did not match expectations.
    Unclean,
    /// The undo data does not fit the block.
    Failed,
}

/// Public view of a block index entry.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub height: u32,
    pub chain_work: Work,
    pub previous_hash: Option<BlockHash>,
    pub header: Header,
    pub status: BlockStatus,
    pub failed_ancestor: bool,
    pub n_tx: u32,
    pub in_active_chain: bool,
}

/// Ordering of the blocks the tip may move to: most work first, then
/// earliest received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    work: Reverse<Work>,
    sequence_id: u64,
    id: BlockId,
}

impl Candidate {
    fn new(id: BlockId, entry: &BlockIndexEntry) -> Self {
        Self {
            work: Reverse(entry.chain_work),
            sequence_id: entry.sequence_id,
            id,
        }
    }
}

pub struct ChainState {
    params: ChainParams,
    config: ChainConfig,
    tree: BlockTree,
    active: ActiveChain,
    block_store: BlockStore,
    index: IndexDb,
    coins: CoinsViewCache<CoinsDb>,
    script_checker: ScriptChecker,
    /// Valid blocks with data for all ancestors and at least as much work as the tip.
    candidates: BTreeSet<Candidate>,
    /// Blocks with data waiting for the data of their parent.
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    next_sequence_id: u64,
    dirty_blocks: HashSet<BlockId>,
    /// Transaction locations changed since the last flush, `None` for erased ones.
    dirty_tx_locations: HashMap<Txid, Option<DiskTxPos>>,
    reindex_pending: bool,
    last_flush: Instant,
}

impl ChainState {
    /// Opens the chain state stored in `dir`.
    ///
    /// Unless a reindex is pending the block index is loaded, the genesis
    /// block is stored on first start and the tip is moved to the best
    /// known chain.
    pub fn open(dir: &Path, config: ChainConfig, verifier: Arc<dyn ScriptVerifier>) -> Result<Self> {
        let params = ChainParams::new(config.network);

        let blocks_dir = dir.join("blocks");
        std::fs::create_dir_all(&blocks_dir).map_err(oxnode_blockstore::Error::from)?;

        let index = open_index(&blocks_dir.join("index"), &config)?;
        let coins_db = CoinsDb::open(&dir.join("chainstate"))?;

        let reindex_pending = config.reindex || index.is_reindexing()?;

        let file_infos = if reindex_pending {
            Vec::new()
        } else {
            index.load_file_infos()?
        };
        let mut store_config = BlockStoreConfig::new(blocks_dir, config.network);
        store_config.max_file_size = config.max_block_file_size;
        let block_store = BlockStore::open(store_config, file_infos)?;

        let script_checker = ScriptChecker::new(verifier, config.script_threads)?;

        let mut chain_state = Self {
            params,
            config,
            tree: BlockTree::default(),
            active: ActiveChain::default(),
            block_store,
            index,
            coins: CoinsViewCache::new(coins_db),
            script_checker,
            candidates: BTreeSet::new(),
            unlinked: HashMap::new(),
            next_sequence_id: 1,
            dirty_blocks: HashSet::new(),
            dirty_tx_locations: HashMap::new(),
            reindex_pending,
            last_flush: Instant::now(),
        };

        if reindex_pending {
            tracing::info!("Reindex pending, block index is not loaded");
            return Ok(chain_state);
        }

        chain_state.load()?;

        if chain_state.tree.is_empty() {
            chain_state.init_genesis()?;
        }

        chain_state.activate_best_chain(&mut ChainUpdate::default())?;
        chain_state.flush_state(FlushMode::Always)?;

        Ok(chain_state)
    }

    fn load(&mut self) -> Result<()> {
        let mut records = self.index.load_block_index()?;
        records.sort_by_key(|(_, disk)| disk.height);

        for (hash, disk) in &records {
            let header = disk.header()?;
            if header.block_hash() != *hash {
                return Err(Error::Corruption(format!(
                    "Index record {hash} holds header of {}",
                    header.block_hash()
                )));
            }
            let is_root = header.prev_blockhash == BlockHash::all_zeros();
            if !is_root && self.tree.get(&header.prev_blockhash).is_none() {
                return Err(Error::Corruption(format!(
                    "Parent of indexed block {hash} is missing"
                )));
            }
            self.tree.insert_loaded(header, disk);
        }

        let poisoned = self.tree.poison_all();
        if poisoned > 0 {
            tracing::debug!(poisoned, "Marked descendants of failed blocks");
        }

        for id in self.tree.ids().collect::<Vec<_>>() {
            if self.tree.entry(id).have_data() {
                let sequence_id = self.next_sequence_id();
                self.tree.entry_mut(id).sequence_id = sequence_id;
                self.link_block_data(id);
            }
        }

        let tip = match self.coins.best_block_hash()? {
            Some(hash) => Some(self.tree.get(&hash).ok_or_else(|| {
                Error::Corruption(format!("UTXO set best block {hash} is not in the block index"))
            })?),
            None => None,
        };
        self.active.set_tip(&self.tree, tip);

        let index_best = self.index.best_chain()?;
        let tip_hash = tip.map(|id| self.tree.entry(id).hash);
        if index_best != tip_hash {
            tracing::info!(
                index_best = ?index_best,
                utxo_best = ?tip_hash,
                "Block index is ahead of the UTXO set, resuming from the UTXO set"
            );
        }

        self.rebuild_candidates();

        tracing::info!(
            blocks = self.tree.len(),
            tip = ?self.tip(),
            "Loaded block index"
        );

        Ok(())
    }

    fn init_genesis(&mut self) -> Result<()> {
        let genesis = bitcoin::constants::genesis_block(self.params.network());
        match self.accept_block_inner(&genesis, None)? {
            ImportStatus::Accepted { hash, .. } => {
                tracing::info!(%hash, "Stored genesis block");
                Ok(())
            }
            status => Err(Error::Corruption(format!(
                "Failed to store genesis block: {status:?}"
            ))),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Whether [`Self::reindex`] must run before the chain state is usable.
    pub fn is_reindex_pending(&self) -> bool {
        self.reindex_pending
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    pub fn coins(&self) -> &CoinsViewCache<CoinsDb> {
        &self.coins
    }

    pub fn tip(&self) -> Option<IndexedBlock> {
        self.active.tip().map(|id| {
            let entry = self.tree.entry(id);
            IndexedBlock {
                number: entry.height,
                hash: entry.hash,
            }
        })
    }

    pub fn tip_header(&self) -> Option<Header> {
        self.active.tip().map(|id| self.tree.entry(id).header)
    }

    /// Height of the tip, `None` before genesis is connected.
    pub fn height(&self) -> Option<u32> {
        self.active.height()
    }

    /// Median time past of the tip.
    pub fn median_time_past(&self) -> Option<u32> {
        self.active.tip().map(|id| self.tree.median_time_past(id))
    }

    pub fn block_hash_at(&self, height: u32) -> Option<BlockHash> {
        self.active.at(height).map(|id| self.tree.entry(id).hash)
    }

    pub fn block_info(&self, hash: &BlockHash) -> Option<BlockInfo> {
        let id = self.tree.get(hash)?;
        let entry = self.tree.entry(id);
        Some(BlockInfo {
            hash: entry.hash,
            height: entry.height,
            chain_work: entry.chain_work,
            previous_hash: entry.parent.map(|parent| self.tree.entry(parent).hash),
            header: entry.header,
            status: entry.status,
            failed_ancestor: entry.failed_ancestor,
            n_tx: entry.n_tx,
            in_active_chain: self.active.contains(&self.tree, id),
        })
    }

    /// Raw bytes of a stored block.
    pub fn block_bytes(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>> {
        let Some(pos) = self
            .tree
            .get(hash)
            .and_then(|id| self.tree.entry(id).data_pos)
        else {
            return Ok(None);
        };
        Ok(Some(self.block_store.read_block_bytes(pos)?))
    }

    pub fn block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let Some(pos) = self
            .tree
            .get(hash)
            .and_then(|id| self.tree.entry(id).data_pos)
        else {
            return Ok(None);
        };
        Ok(Some(self.block_store.read_block(pos)?))
    }

    /// Block locator of the active chain.
    pub fn locator(&self) -> Vec<BlockHash> {
        self.active.locator(&self.tree)
    }

    /// Disk position of a confirmed transaction, requires the transaction index.
    pub fn tx_location(&self, txid: &Txid) -> Result<Option<DiskTxPos>> {
        if let Some(pos) = self.dirty_tx_locations.get(txid) {
            return Ok(*pos);
        }
        Ok(self.index.get_tx_location(txid)?)
    }

    /// Reads a transaction and the hash of its block from disk.
    pub fn read_transaction(&self, pos: DiskTxPos) -> Result<(Transaction, BlockHash)> {
        let header_bytes = self
            .block_store
            .read_at(pos.block.file, pos.block.offset, Header::SIZE as u32)?;
        let header: Header = bitcoin::consensus::deserialize(&header_bytes)
            .map_err(|err| Error::Corruption(format!("Bad header at {}: {err}", pos.block)))?;

        let tx_bytes = self.block_store.read_at(
            pos.block.file,
            pos.block.offset + pos.tx_offset,
            pos.tx_len,
        )?;
        let tx = bitcoin::consensus::deserialize(&tx_bytes)
            .map_err(|err| Error::Corruption(format!("Bad transaction at {}: {err}", pos.block)))?;

        Ok((tx, header.block_hash()))
    }

    /// Unspent output at `out_point` in the UTXO set of the tip.
    pub fn coin(&self, out_point: &OutPoint) -> Result<Option<Coin>> {
        Ok(self.coins.peek_coin(out_point)?)
    }

    /// Estimated fraction of the chain history that has been verified.
    // https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/validation.cpp#L5268
    pub fn verification_progress(&self, now: u64) -> f64 {
        let Some(tip) = self.active.tip() else {
            return 0.0;
        };
        let entry = self.tree.entry(tip);
        if entry.chain_tx == 0 {
            return 0.0;
        }

        let data = self.params.chain_tx_data;
        let chain_tx = entry.chain_tx as f64;
        let total = if entry.chain_tx <= data.tx_count {
            data.tx_count as f64 + now.saturating_sub(data.time) as f64 * data.tx_rate
        } else {
            chain_tx + now.saturating_sub(entry.header.time as u64) as f64 * data.tx_rate
        };

        if total <= 0.0 {
            return 1.0;
        }

        (chain_tx / total).min(1.0)
    }

    /// Validates a header and adds it to the block tree.
    pub fn accept_header(&mut self, header: &Header) -> ImportStatus {
        let known = self.tree.get(&header.block_hash()).is_some();
        match self.accept_header_inner(header) {
            Ok(_) if known => ImportStatus::AlreadyKnown,
            Ok(id) => {
                let entry = self.tree.entry(id);
                ImportStatus::Accepted {
                    hash: entry.hash,
                    height: entry.height,
                }
            }
            Err(status) => status,
        }
    }

    /// Returns the tree entry of the header, or the final status when the
    /// header can not be added.
    fn accept_header_inner(&mut self, header: &Header) -> std::result::Result<BlockId, ImportStatus> {
        let hash = header.block_hash();

        if let Some(id) = self.tree.get(&hash) {
            if self.tree.entry(id).is_invalid() {
                return Err(ImportStatus::KnownBad);
            }
            return Ok(id);
        }

        if header.prev_blockhash == BlockHash::all_zeros() {
            let genesis_hash = bitcoin::constants::genesis_block(self.params.network()).block_hash();
            if hash != genesis_hash || !self.tree.is_empty() {
                return Err(ImportStatus::UnknownParent);
            }
            let id = self.tree.insert(*header);
            self.dirty_blocks.insert(id);
            return Ok(id);
        }

        let Some(parent) = self.tree.get(&header.prev_blockhash) else {
            return Err(ImportStatus::UnknownParent);
        };

        if self.tree.entry(parent).is_invalid() {
            return Err(ImportStatus::Invalid(BlockError::FailedParent(
                header.prev_blockhash,
            )));
        }

        check_header(&self.tree, parent, header, &self.params, unix_time())
            .map_err(ImportStatus::Invalid)?;

        let id = self.tree.insert(*header);
        self.dirty_blocks.insert(id);

        Ok(id)
    }

    /// Validates a block and stores it, without connecting it.
    pub fn accept_block(&mut self, block: &Block) -> Result<ImportStatus> {
        self.accept_block_inner(block, None)
    }

    /// `stored_at` is the position of a block already present in the block files.
    fn accept_block_inner(&mut self, block: &Block, stored_at: Option<FilePos>) -> Result<ImportStatus> {
        let id = match self.accept_header_inner(&block.header) {
            Ok(id) => id,
            Err(status) => return Ok(status),
        };

        let entry = self.tree.entry(id);
        let (hash, height, parent) = (entry.hash, entry.height, entry.parent);

        if entry.have_data() {
            return Ok(ImportStatus::AlreadyKnown);
        }

        if let Err(err) = check_block_sanity(block) {
            // A mutated body says nothing about the header.
            if !err.is_mutation() {
                self.mark_failed(id);
            }
            return Ok(ImportStatus::Invalid(err));
        }

        if let Some(parent) = parent {
            let median_time_past = self.tree.median_time_past(parent);
            if let Err(err) = check_block_contextual(block, height, median_time_past, &self.params)
            {
                self.mark_failed(id);
                return Ok(ImportStatus::Invalid(err));
            }
        }

        let pos = match stored_at {
            Some(pos) => {
                self.block_store.note_block(pos.file, height);
                pos
            }
            None => self
                .block_store
                .append_block(&bitcoin::consensus::serialize(block), height)?,
        };

        let sequence_id = self.next_sequence_id();
        let entry = self.tree.entry_mut(id);
        entry.n_tx = block.txdata.len() as u32;
        entry.data_pos = Some(pos);
        entry.sequence_id = sequence_id;
        if entry.status == BlockStatus::HeaderOnly {
            entry.status = BlockStatus::HaveData;
        }
        self.dirty_blocks.insert(id);

        self.link_block_data(id);

        tracing::debug!(%hash, height, %pos, "Stored block");

        Ok(ImportStatus::Accepted { hash, height })
    }

    /// Accepts a block and moves the tip to the best chain.
    ///
    /// Tip changes are recorded in `update` as they happen, so on error it
    /// still describes every block connected or disconnected before the
    /// failure.
    pub fn process_block(&mut self, block: &Block, update: &mut ChainUpdate) -> Result<ImportStatus> {
        let status = self.accept_block(block)?;
        if matches!(status, ImportStatus::Accepted { .. } | ImportStatus::AlreadyKnown) {
            self.activate_best_chain(update)?;
        }
        Ok(status)
    }

    fn next_sequence_id(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }

    /// Computes the cumulative transaction count of a block whose data just
    /// became available, and of the descendants that were waiting for it.
    fn link_block_data(&mut self, id: BlockId) {
        let parent_chain_tx = match self.tree.entry(id).parent {
            None => 0,
            Some(parent) => match self.tree.entry(parent).chain_tx {
                0 => {
                    self.unlinked.entry(parent).or_default().push(id);
                    return;
                }
                chain_tx => chain_tx,
            },
        };

        let mut queue = VecDeque::from([(id, parent_chain_tx)]);
        while let Some((id, parent_chain_tx)) = queue.pop_front() {
            let entry = self.tree.entry_mut(id);
            entry.chain_tx = parent_chain_tx + entry.n_tx as u64;
            let chain_tx = entry.chain_tx;
            self.try_add_candidate(id);
            if let Some(children) = self.unlinked.remove(&id) {
                queue.extend(children.into_iter().map(|child| (child, chain_tx)));
            }
        }
    }

    fn tip_work(&self) -> Option<Work> {
        self.active.tip().map(|tip| self.tree.entry(tip).chain_work)
    }

    fn try_add_candidate(&mut self, id: BlockId) {
        let entry = self.tree.entry(id);
        if entry.is_invalid() || entry.chain_tx == 0 {
            return;
        }
        if self.tip_work().is_some_and(|tip_work| entry.chain_work < tip_work) {
            return;
        }
        self.candidates.insert(Candidate::new(id, entry));
    }

    fn rebuild_candidates(&mut self) {
        self.candidates.clear();
        for id in self.tree.ids().collect::<Vec<_>>() {
            self.try_add_candidate(id);
        }
    }

    fn prune_candidates(&mut self) {
        if let Some(tip_work) = self.tip_work() {
            let tree = &self.tree;
            self.candidates
                .retain(|candidate| tree.entry(candidate.id).chain_work >= tip_work);
        }
    }

    fn mark_failed(&mut self, id: BlockId) {
        self.tree.entry_mut(id).status = BlockStatus::Failed;
        self.dirty_blocks.insert(id);
        let poisoned = self.tree.poison_descendants(id);

        let tree = &self.tree;
        self.candidates
            .retain(|candidate| !tree.entry(candidate.id).is_invalid());

        tracing::debug!(hash = %self.tree.entry(id).hash, poisoned, "Marked block as failed");
    }

    /// Returns the best candidate with strictly more work than the tip whose
    /// path from the active chain is fully valid and stored.
    fn find_most_work_chain(&mut self) -> Option<BlockId> {
        loop {
            let candidate = *self.candidates.iter().next()?;
            let entry = self.tree.entry(candidate.id);

            // Equal work keeps the current tip.
            if self
                .tip_work()
                .is_some_and(|tip_work| entry.chain_work <= tip_work)
            {
                return None;
            }

            let mut usable = true;
            let mut walk = Some(candidate.id);
            while let Some(id) = walk {
                if self.active.contains(&self.tree, id) {
                    break;
                }
                let entry = self.tree.entry(id);
                if entry.is_invalid() || !entry.have_data() {
                    usable = false;
                    break;
                }
                walk = entry.parent;
            }

            if usable {
                return Some(candidate.id);
            }

            self.candidates.remove(&candidate);
        }
    }

    /// Moves the tip to the valid chain with the most work.
    ///
    /// Blocks failing validation on the way are marked as failed together
    /// with their descendants, and the next best chain is tried.
    ///
    /// Every tip change is appended to `update` before the next step runs. A
    /// storage error aborts activation with the tip wherever it got to, and
    /// `update` then holds exactly the changes already applied.
    pub fn activate_best_chain(&mut self, update: &mut ChainUpdate) -> Result<()> {
        let first_event = update.events.len();
        let old_tip = self.tip();

        while let Some(target) = self.find_most_work_chain() {
            self.activate_step(target, update)?;
        }

        self.prune_candidates();

        let new_tip = self.tip();
        if new_tip != old_tip {
            let disconnected = update.events[first_event..]
                .iter()
                .filter(|event| matches!(event, TipEvent::Disconnected { .. }))
                .count();
            if disconnected > 0 {
                tracing::info!(
                    old_tip = ?old_tip,
                    new_tip = ?new_tip,
                    disconnected,
                    "Chain reorganization"
                );
            }
        }

        self.flush_state(FlushMode::Periodic)?;

        Ok(())
    }

    fn activate_step(&mut self, target: BlockId, update: &mut ChainUpdate) -> Result<()> {
        let fork = self.active.fork_point(&self.tree, target);

        while self.active.tip() != fork {
            self.disconnect_tip(update)?;
        }

        let start = fork.map_or(0, |fork| self.tree.entry(fork).height + 1);
        let target_height = self.tree.entry(target).height;
        let path = (start..=target_height)
            .map(|height| {
                self.tree.ancestor(target, height).ok_or_else(|| {
                    Error::Corruption(format!("Missing ancestor at height {height}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut connected = 0;
        for id in path {
            match self.connect_tip(id, update)? {
                Ok(()) => {
                    connected += 1;
                    self.flush_state(FlushMode::IfNeeded)?;
                }
                Err(err) => {
                    let hash = self.tree.entry(id).hash;
                    tracing::warn!(%hash, ?err, "Block failed to connect");
                    self.mark_failed(id);
                    update.invalid.push((hash, err));
                    for _ in 0..connected {
                        self.disconnect_tip(update)?;
                    }
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn connect_tip(
        &mut self,
        id: BlockId,
        update: &mut ChainUpdate,
    ) -> Result<std::result::Result<(), BlockError>> {
        let entry = self.tree.entry(id);
        let (hash, height) = (entry.hash, entry.height);
        let data_pos = entry.data_pos.ok_or(Error::MissingBlockData(hash))?;
        let block = self.block_store.read_block(data_pos)?;

        if height == 0 {
            // Outputs of the genesis block are not spendable.
            self.coins.set_best_block(hash);
        } else {
            match self.connect_block(&block, hash, height, data_pos)? {
                Ok(undo_pos) => self.tree.entry_mut(id).undo_pos = Some(undo_pos),
                Err(err) => return Ok(Err(err)),
            }
        }

        self.tree.entry_mut(id).status = BlockStatus::ValidScripts;
        self.dirty_blocks.insert(id);
        self.active.push(&self.tree, id);

        if self.index.txindex_enabled() {
            let mut offset = (Header::SIZE + VarInt(block.txdata.len() as u64).size()) as u32;
            for tx in &block.txdata {
                let tx_len = tx.total_size() as u32;
                let pos = DiskTxPos {
                    block: data_pos,
                    tx_offset: offset,
                    tx_len,
                };
                self.dirty_tx_locations.insert(tx.compute_txid(), Some(pos));
                offset += tx_len;
            }
        }

        tracing::debug!(%hash, height, txs = block.txdata.len(), "Connected block");

        update.events.push(TipEvent::Connected {
            hash,
            height,
            block: Arc::new(block),
        });

        Ok(Ok(()))
    }

    /// Applies `block` on top of the UTXO set and writes its undo data.
    ///
    /// Nothing reaches the UTXO cache unless the whole block is valid.
    fn connect_block(
        &mut self,
        block: &Block,
        hash: BlockHash,
        height: u32,
        data_pos: FilePos,
    ) -> Result<std::result::Result<FilePos, BlockError>> {
        let mut view = CoinsViewCache::new(&mut self.coins);

        let allow_overwrite = self.params.is_bip30_exception(height, &hash);
        let flags = get_block_script_flags(height, hash, &self.params);

        let mut fees = Amount::ZERO;
        let mut undo = BlockUndo::default();
        let mut jobs = Vec::with_capacity(block.txdata.len().saturating_sub(1));

        for tx in &block.txdata {
            let txid = tx.compute_txid();

            if !tx.is_coinbase() {
                let mut value_in = Amount::ZERO;
                let mut tx_undo = TxUndo::default();
                let mut spent = Vec::with_capacity(tx.input.len());

                for input in &tx.input {
                    let out_point = input.previous_output;
                    let Some(coin) = view.spend_output(&out_point)? else {
                        return Ok(Err(BlockError::MissingInput { txid, out_point }));
                    };

                    if coin.is_coinbase && height - coin.height < self.params.coinbase_maturity {
                        return Ok(Err(BlockError::PrematureCoinbaseSpend { txid, out_point }));
                    }

                    let Some(total) = value_in
                        .checked_add(Amount::from_sat(coin.amount))
                        .filter(|total| *total <= Amount::MAX_MONEY)
                    else {
                        return Ok(Err(BlockError::InputValuesOutOfRange(txid)));
                    };
                    value_in = total;

                    spent.push(coin.to_txout());
                    tx_undo.prevouts.push(coin);
                }

                let value_out = tx
                    .output
                    .iter()
                    .map(|output| output.value)
                    .fold(Amount::ZERO, |acc, value| acc + value);

                let Some(fee) = value_in.checked_sub(value_out) else {
                    return Ok(Err(BlockError::InsufficientFunds(txid)));
                };

                fees = match fees.checked_add(fee) {
                    Some(fees) if fees <= Amount::MAX_MONEY => fees,
                    _ => return Ok(Err(BlockError::InputValuesOutOfRange(txid))),
                };

                jobs.push(TxScriptJob {
                    txid,
                    tx_bytes: bitcoin::consensus::serialize(tx),
                    spent,
                });
                undo.txs.push(tx_undo);
            }

            match view.add_outputs(tx, height, allow_overwrite) {
                Ok(()) => {}
                Err(oxnode_coins::Error::OverwriteUnspent(_)) => {
                    return Ok(Err(BlockError::Bip30(txid)));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let coinbase_value = block.txdata[0]
            .output
            .iter()
            .map(|output| output.value)
            .fold(Amount::ZERO, |acc, value| acc + value);
        let max_reward = self.params.block_subsidy(height) + fees;
        if coinbase_value > max_reward {
            return Ok(Err(BlockError::InvalidBlockReward {
                got: coinbase_value,
                max: max_reward,
            }));
        }

        if let Err(err) = self.script_checker.verify(&jobs, flags) {
            return Ok(Err(err));
        }

        let undo_pos = self
            .block_store
            .append_undo(data_pos.file, &hash, &undo.encode()?)?;

        view.set_best_block(hash);
        view.flush()?;

        Ok(Ok(undo_pos))
    }

    fn disconnect_tip(&mut self, update: &mut ChainUpdate) -> Result<()> {
        let tip = self
            .active
            .tip()
            .ok_or_else(|| Error::Corruption("Disconnecting from an empty chain".to_string()))?;
        let entry = self.tree.entry(tip);
        let (hash, height) = (entry.hash, entry.height);
        let parent = entry
            .parent
            .ok_or_else(|| Error::Corruption("The genesis block can not be disconnected".to_string()))?;
        let data_pos = entry.data_pos.ok_or(Error::MissingBlockData(hash))?;
        let undo_pos = entry.undo_pos.ok_or(Error::MissingUndoData(hash))?;
        let parent_hash = self.tree.entry(parent).hash;

        let block = self.block_store.read_block(data_pos)?;
        let undo = BlockUndo::decode(&self.block_store.read_undo(undo_pos, &hash)?)?;

        let mut view = CoinsViewCache::new(&mut self.coins);
        match disconnect_block(&block, &undo, height, &mut view)? {
            DisconnectResult::Ok => {}
            result => {
                return Err(Error::Corruption(format!(
                    "Failed to disconnect block {hash}: {result:?}"
                )));
            }
        }
        view.set_best_block(parent_hash);
        view.flush()?;

        self.active.pop();

        if self.index.txindex_enabled() {
            for tx in &block.txdata {
                self.dirty_tx_locations.insert(tx.compute_txid(), None);
            }
        }

        tracing::debug!(%hash, height, "Disconnected block");

        update.events.push(TipEvent::Disconnected {
            hash,
            height,
            block: Arc::new(block),
        });

        Ok(())
    }

    /// Marks a block as failed and moves the tip away from it.
    pub fn invalidate_block(&mut self, hash: &BlockHash, update: &mut ChainUpdate) -> Result<()> {
        let id = self.tree.get(hash).ok_or(Error::UnknownBlock(*hash))?;
        if self.tree.entry(id).parent.is_none() {
            return Err(Error::GenesisInvalidation);
        }

        while self.active.contains(&self.tree, id) {
            self.disconnect_tip(update)?;
        }

        self.mark_failed(id);
        self.rebuild_candidates();

        tracing::info!(%hash, "Invalidated block");

        self.activate_best_chain(update)
    }

    /// Clears the failure marks of a block, its ancestors and descendants
    /// and moves the tip to the best chain.
    pub fn reconsider_block(&mut self, hash: &BlockHash, update: &mut ChainUpdate) -> Result<()> {
        let id = self.tree.get(hash).ok_or(Error::UnknownBlock(*hash))?;

        let changed = self.tree.clear_failures(id);
        self.dirty_blocks.extend(changed);

        self.rebuild_candidates();

        tracing::info!(%hash, "Reconsidered block");

        self.activate_best_chain(update)
    }

    /// Writes dirty block index entries, file infos, transaction locations
    /// and the UTXO cache to disk.
    ///
    /// Block files are synced first, then the index is written, then the
    /// UTXO set. A crash in between leaves the index ahead of the UTXO set,
    /// which is resolved on the next start by reconnecting from the UTXO
    /// set's best block.
    pub fn flush_state(&mut self, mode: FlushMode) -> Result<()> {
        let cache_full = self.coins.memory_usage() > self.config.coins_cache_size;
        let interval_elapsed = self.last_flush.elapsed() >= self.config.flush_interval;
        let should_flush = match mode {
            FlushMode::Always => true,
            FlushMode::IfNeeded => cache_full,
            FlushMode::Periodic => cache_full || interval_elapsed,
        };

        if !should_flush {
            return Ok(());
        }

        let now = Instant::now();

        self.block_store.flush(false)?;

        let mut batch = IndexBatch::default();
        for id in &self.dirty_blocks {
            let entry = self.tree.entry(*id);
            batch.put_block(entry.hash, entry.to_disk());
        }
        let dirty_files = self.block_store.take_dirty_file_infos();
        for (file, info) in &dirty_files {
            batch.put_file_info(*file, *info);
        }
        batch.set_last_block_file(self.block_store.current_file());
        for (txid, pos) in &self.dirty_tx_locations {
            match pos {
                Some(pos) => batch.put_tx_location(*txid, *pos),
                None => batch.erase_tx_location(*txid),
            }
        }
        if let Some(tip) = self.active.tip() {
            batch.set_best_chain(self.tree.entry(tip).hash);
        }

        let blocks = batch.block_count();
        if let Err(err) = self.index.write_batch(batch) {
            self.block_store
                .mark_dirty(dirty_files.into_iter().map(|(file, _)| file));
            return Err(err.into());
        }
        self.dirty_blocks.clear();
        self.dirty_tx_locations.clear();

        let coins = self.coins.dirty_count();
        if self.coins.best_block_hash()?.is_some() {
            self.coins.flush()?;
        }

        if cache_full {
            self.coins.evict_clean();
        }

        self.last_flush = Instant::now();

        tracing::debug!(
            ?mode,
            blocks,
            coins,
            elapsed = ?now.elapsed(),
            "Flushed chain state"
        );

        Ok(())
    }

    /// Undoes the last `depth` blocks of the active chain on a scratch view
    /// that is thrown away afterwards, checking the block and undo data.
    pub fn verify_db(&mut self, depth: u32) -> Result<()> {
        let Some(tip) = self.active.tip() else {
            return Ok(());
        };

        let mut view = CoinsViewCache::new(&mut self.coins);
        let mut walk = tip;
        let mut checked = 0;

        while checked < depth {
            let entry = self.tree.entry(walk);
            let Some(parent) = entry.parent else {
                break;
            };
            let hash = entry.hash;

            let data_pos = entry.data_pos.ok_or(Error::MissingBlockData(hash))?;
            let block = self.block_store.read_block(data_pos)?;
            check_block_sanity(&block).map_err(|err| {
                Error::Corruption(format!("Stored block {hash} is invalid: {err}"))
            })?;

            let undo_pos = entry.undo_pos.ok_or(Error::MissingUndoData(hash))?;
            let undo = BlockUndo::decode(&self.block_store.read_undo(undo_pos, &hash)?)?;

            match disconnect_block(&block, &undo, entry.height, &mut view)? {
                DisconnectResult::Ok => {}
                DisconnectResult::Unclean => {
                    tracing::warn!(%hash, "Inconsistent UTXO set while undoing block");
                }
                DisconnectResult::Failed => {
                    return Err(Error::Corruption(format!(
                        "Undo data of block {hash} does not match the block"
                    )));
                }
            }

            walk = parent;
            checked += 1;
        }

        tracing::info!(blocks = checked, "Verified chain state");

        Ok(())
    }

    /// Rebuilds the block index and the UTXO set from the block files.
    ///
    /// Checks `shutdown` between files, an interrupted reindex resumes from
    /// scratch on the next start.
    pub fn reindex(&mut self, shutdown: &AtomicBool) -> Result<ChainUpdate> {
        tracing::info!("Reindexing block files");

        self.index.set_reindexing(true)?;
        self.index.wipe()?;
        self.coins.base().wipe()?;
        self.coins.clear();

        self.tree = BlockTree::default();
        self.active = ActiveChain::default();
        self.candidates.clear();
        self.unlinked.clear();
        self.dirty_blocks.clear();
        self.dirty_tx_locations.clear();
        self.next_sequence_id = 1;
        self.block_store.reset_block_counts();

        let mut update = ChainUpdate::default();
        let mut pending: HashMap<BlockHash, Vec<(Block, FilePos)>> = HashMap::new();
        let mut replayed = 0;

        for file in 0..self.block_store.file_count() {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }

            for record in self.block_store.scan_block_file(file)? {
                let block: Block = match bitcoin::consensus::deserialize(&record.payload) {
                    Ok(block) => block,
                    Err(err) => {
                        tracing::warn!(pos = %record.pos, ?err, "Skipping undecodable block record");
                        continue;
                    }
                };
                replayed += self.reindex_block(block, record.pos, &mut pending)?;
            }

            self.activate_best_chain(&mut update)?;

            tracing::info!(file, blocks = replayed, tip = ?self.tip(), "Replayed block file");
        }

        let orphans = pending.values().map(Vec::len).sum::<usize>();
        if orphans > 0 {
            tracing::warn!(orphans, "Skipped blocks whose parent is not in the block files");
        }

        if self.tree.is_empty() {
            self.init_genesis()?;
            self.activate_best_chain(&mut update)?;
        }

        self.flush_state(FlushMode::Always)?;
        self.index.set_reindexing(false)?;
        self.reindex_pending = false;

        tracing::info!(blocks = replayed, tip = ?self.tip(), "Reindex finished");

        Ok(update)
    }

    fn reindex_block(
        &mut self,
        block: Block,
        pos: FilePos,
        pending: &mut HashMap<BlockHash, Vec<(Block, FilePos)>>,
    ) -> Result<usize> {
        let mut replayed = 0;
        let mut queue = vec![(block, pos)];

        while let Some((block, pos)) = queue.pop() {
            let hash = block.block_hash();
            let prev = block.header.prev_blockhash;

            if prev != BlockHash::all_zeros() && self.tree.get(&prev).is_none() {
                pending.entry(prev).or_default().push((block, pos));
                continue;
            }

            match self.accept_block_inner(&block, Some(pos))? {
                ImportStatus::Accepted { .. } => replayed += 1,
                ImportStatus::AlreadyKnown => {}
                status => tracing::debug!(%hash, ?status, "Skipping block during reindex"),
            }

            if let Some(children) = pending.remove(&hash) {
                queue.extend(children);
            }
        }

        Ok(replayed)
    }
}

/// Undoes `block` on `view` using its undo data.
///
/// Outputs created by the block are removed and the coins spent by it are
/// restored, transactions are processed in reverse order.
// https://github.com/bitcoin/bitcoin/blob/6f9db1ebcab4064065ccd787161bf2b87e03cc1f/src/validation.cpp#L2115
pub fn disconnect_block<V: CoinsView>(
    block: &Block,
    undo: &BlockUndo,
    height: u32,
    view: &mut CoinsViewCache<V>,
) -> Result<DisconnectResult> {
    if undo.txs.len() + 1 != block.txdata.len() {
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;

    for (index, tx) in block.txdata.iter().enumerate().rev() {
        let txid = tx.compute_txid();

        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.is_op_return() {
                continue;
            }
            match view.spend_output(&OutPoint::new(txid, vout as u32))? {
                Some(coin) => {
                    if coin.height != height
                        || coin.is_coinbase != tx.is_coinbase()
                        || coin.amount != output.value.to_sat()
                    {
                        clean = false;
                    }
                }
                None => clean = false,
            }
        }

        if index > 0 {
            let tx_undo = &undo.txs[index - 1];
            if tx_undo.prevouts.len() != tx.input.len() {
                return Ok(DisconnectResult::Failed);
            }
            for (input, coin) in tx.input.iter().zip(&tx_undo.prevouts).rev() {
                if !view.restore_coin(&input.previous_output, coin)? {
                    clean = false;
                }
            }
        }
    }

    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}

fn open_index(path: &Path, config: &ChainConfig) -> Result<IndexDb> {
    match IndexDb::open(path, config.txindex) {
        Err(oxnode_index::Error::TxIndexRequiresReindex) if config.reindex => {
            // The index is rebuilt anyway, drop it so the flag can change.
            IndexDb::open(path, false)?.wipe()?;
            Ok(IndexDb::open(path, config.txindex)?)
        }
        result => Ok(result?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxnode_coins::TxCoins;
    use oxnode_test_utils::{Miner, spend_tx};

    struct MemoryView(HashMap<Txid, TxCoins>);

    impl CoinsView for MemoryView {
        fn get_coins(&self, txid: &Txid) -> oxnode_coins::Result<Option<TxCoins>> {
            Ok(self.0.get(txid).cloned())
        }

        fn best_block(&self) -> oxnode_coins::Result<Option<BlockHash>> {
            Ok(None)
        }

        fn batch_write(
            &mut self,
            _: &oxnode_coins::CoinsMap,
            _: BlockHash,
        ) -> oxnode_coins::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn disconnect_restores_spent_coins() {
        let mut miner = Miner::new();
        let funding = miner.mine(miner.genesis().block_hash(), 1, Amount::ZERO, Vec::new());
        let funding_tx = &funding.txdata[0];
        let out_point = OutPoint::new(funding_tx.compute_txid(), 0);
        let spent_coin = Coin::from_txout(&funding_tx.output[0], 1, true);

        let spend = spend_tx(&[out_point], &[Amount::from_sat(1_000)]);
        let block = miner.mine(funding.block_hash(), 101, Amount::ZERO, vec![spend.clone()]);

        let mut view = CoinsViewCache::new(MemoryView(HashMap::new()));
        for tx in &block.txdata {
            view.add_outputs(tx, 101, false).unwrap();
        }
        let undo = BlockUndo {
            txs: vec![TxUndo {
                prevouts: vec![spent_coin.clone()],
            }],
        };

        assert_eq!(
            disconnect_block(&block, &undo, 101, &mut view).unwrap(),
            DisconnectResult::Ok
        );
        assert_eq!(view.get_coin(&out_point).unwrap(), Some(spent_coin));
        assert!(!view.have_output(&OutPoint::new(spend.compute_txid(), 0)).unwrap());
    }

    #[test]
    fn disconnect_reports_mismatches() {
        let mut miner = Miner::new();
        let block = miner.mine(miner.genesis().block_hash(), 1, Amount::ZERO, Vec::new());

        let mut view = CoinsViewCache::new(MemoryView(HashMap::new()));
        // Outputs of the block are missing from the view.
        assert_eq!(
            disconnect_block(&block, &BlockUndo::default(), 1, &mut view).unwrap(),
            DisconnectResult::Unclean
        );

        let extra = BlockUndo {
            txs: vec![TxUndo::default()],
        };
        assert_eq!(
            disconnect_block(&block, &extra, 1, &mut view).unwrap(),
            DisconnectResult::Failed
        );
    }

    #[test]
    fn candidates_order_by_work_then_arrival() {
        let mut tree = BlockTree::default();
        let mut miner = Miner::new();
        let genesis = tree.insert(miner.genesis().header);
        let a = miner.mine(miner.genesis().block_hash(), 1, Amount::ZERO, Vec::new());
        let b = miner.mine(miner.genesis().block_hash(), 1, Amount::ZERO, Vec::new());
        let a = tree.insert(a.header);
        let b = tree.insert(b.header);
        tree.entry_mut(a).sequence_id = 2;
        tree.entry_mut(b).sequence_id = 1;

        let set = [genesis, a, b]
            .into_iter()
            .map(|id| Candidate::new(id, tree.entry(id)))
            .collect::<BTreeSet<_>>();
        let order = set.iter().map(|candidate| candidate.id).collect::<Vec<_>>();
        assert_eq!(order, vec![b, a, genesis]);
    }
}
