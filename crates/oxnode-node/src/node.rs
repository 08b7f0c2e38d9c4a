use crate::config::NodeConfig;
use crate::error::{Error, Result, StartupError};
use crate::events::{NodeEvent, Subscribers};
use crate::resources::check_resources;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use oxnode_chain::{ChainState, ChainUpdate, FlushMode, ImportStatus, TipEvent};
use oxnode_mempool::fee_estimator::FEE_ESTIMATES_FILENAME;
use oxnode_mempool::{FeeEstimator, FeeEstimatorConfig, Mempool, MempoolInfo, TipContext};
use oxnode_primitives::{IndexedBlock, unix_time};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Block lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Hash(BlockHash),
    Height(u32),
}

/// Block a transaction was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedIn {
    pub block_hash: BlockHash,
    pub height: u32,
    /// Timestamp of the block header.
    pub time: u32,
}

/// Transaction returned by [`Node::get_transaction`].
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub tx: Transaction,
    /// `None` if the transaction was found in the mempool.
    pub confirmed: Option<ConfirmedIn>,
}

impl TransactionInfo {
    pub fn raw_bytes(&self) -> Vec<u8> {
        serialize(&self.tx)
    }
}

/// Metadata of an indexed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexInfo {
    pub height: u32,
    /// Cumulative chain work up to and including the block, as big endian hex.
    pub chain_work: String,
    pub previous_hash: Option<BlockHash>,
}

/// Chain state and mempool, mutated together under one lock.
pub struct NodeState {
    pub chain: ChainState,
    pub mempool: Mempool,
}

fn tip_context(chain: &ChainState) -> TipContext {
    TipContext {
        height: chain.height().unwrap_or_default(),
        median_time_past: chain.median_time_past().unwrap_or_default(),
    }
}

/// Embedded storage and validation engine.
///
/// Queries take the state lock for reading, anything mutating the chain or
/// the mempool takes it for writing, so at most one reorg is in flight and
/// mempool updates never interleave with tip changes.
pub struct Node {
    config: NodeConfig,
    state: RwLock<NodeState>,
    subscribers: Subscribers,
    shutdown: Arc<AtomicBool>,
}

impl Node {
    /// Opens the data directory, replaying a pending reindex and checking
    /// the most recent blocks before serving anything.
    pub fn open(config: NodeConfig) -> std::result::Result<Self, StartupError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        Self::open_with_shutdown(config, shutdown)
    }

    pub fn open_with_shutdown(
        config: NodeConfig,
        shutdown: Arc<AtomicBool>,
    ) -> std::result::Result<Self, StartupError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|err| StartupError::DataDir {
            path: config.data_dir.clone(),
            err,
        })?;

        check_resources(
            &config.data_dir,
            config.min_free_disk_space,
            config.min_file_descriptors,
        )?;

        let verifier = config.script_verifier();

        let mut chain = ChainState::open(&config.data_dir, config.chain_config(), verifier.clone())?;

        if chain.is_reindex_pending() {
            match chain.reindex(&shutdown) {
                Ok(_) => {}
                Err(oxnode_chain::Error::Interrupted) => return Err(StartupError::Interrupted),
                Err(err) => return Err(StartupError::Reindex(err)),
            }
        }

        chain
            .verify_db(config.check_blocks)
            .map_err(StartupError::Verification)?;

        let fee_estimator = load_fee_estimates(&config.data_dir.join(FEE_ESTIMATES_FILENAME));
        let mempool = Mempool::new(config.mempool_options(), verifier).with_fee_estimator(fee_estimator);

        if let Some(tip) = chain.tip() {
            tracing::info!("📦 Highest known block at #{} ({})", tip.number, tip.hash);
        }

        Ok(Self {
            config,
            state: RwLock::new(NodeState { chain, mempool }),
            subscribers: Subscribers::default(),
            shutdown,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Flag polled by long running loops, set it to stop them.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Receives every [`NodeEvent`] emitted after this call.
    pub fn subscribe(&self) -> async_channel::Receiver<NodeEvent> {
        self.subscribers.subscribe()
    }

    /// Runs `f` with shared access to the node state.
    pub fn with_state<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn best_block(&self) -> Option<IndexedBlock> {
        self.state.read().chain.tip()
    }

    pub fn best_block_hash(&self) -> Option<BlockHash> {
        self.best_block().map(|tip| tip.hash)
    }

    /// Raw bytes of a stored block, `None` if unknown.
    pub fn get_block(&self, block: BlockRef) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        let hash = match block {
            BlockRef::Hash(hash) => Some(hash),
            BlockRef::Height(height) => state.chain.block_hash_at(height),
        };
        match hash {
            Some(hash) => Ok(state.chain.block_bytes(&hash)?),
            None => Ok(None),
        }
    }

    /// Looks a transaction up in the mempool (if `search_mempool`), the
    /// transaction index, and finally in the block holding its unspent
    /// outputs.
    pub fn get_transaction(&self, txid: &Txid, search_mempool: bool) -> Result<Option<TransactionInfo>> {
        let state = self.state.read();

        if search_mempool {
            if let Some(tx) = state.mempool.get_transaction(txid) {
                return Ok(Some(TransactionInfo {
                    tx: Transaction::clone(&tx),
                    confirmed: None,
                }));
            }
        }

        let chain = &state.chain;

        if let Some(pos) = chain.tx_location(txid)? {
            let (tx, block_hash) = chain.read_transaction(pos)?;
            let confirmed = chain.block_info(&block_hash).map(|info| ConfirmedIn {
                block_hash,
                height: info.height,
                time: info.header.time,
            });
            return Ok(Some(TransactionInfo { tx, confirmed }));
        }

        // Without the index only transactions with unspent outputs can be found.
        let Some(coins) = chain.coins().peek_coins(txid)? else {
            return Ok(None);
        };
        let Some(block_hash) = chain.block_hash_at(coins.height) else {
            return Ok(None);
        };
        let Some(block) = chain.block(&block_hash)? else {
            return Ok(None);
        };

        Ok(block
            .txdata
            .into_iter()
            .find(|tx| tx.compute_txid() == *txid)
            .map(|tx| TransactionInfo {
                tx,
                confirmed: Some(ConfirmedIn {
                    block_hash,
                    height: coins.height,
                    time: block.header.time,
                }),
            }))
    }

    pub fn get_block_index_info(&self, hash: &BlockHash) -> Option<BlockIndexInfo> {
        self.state.read().chain.block_info(hash).map(|info| BlockIndexInfo {
            height: info.height,
            chain_work: hex::encode(info.chain_work.to_be_bytes()),
            previous_hash: info.previous_hash,
        })
    }

    /// Returns `true` unless the output is unspent in the UTXO set of the
    /// active chain tip.
    ///
    /// Outputs spent by a mempool transaction count as spent only with
    /// `include_mempool`.
    pub fn is_output_spent(&self, txid: Txid, vout: u32, include_mempool: bool) -> Result<bool> {
        let out_point = OutPoint::new(txid, vout);
        let state = self.state.read();
        if include_mempool && state.mempool.spender(&out_point).is_some() {
            return Ok(true);
        }
        Ok(state.chain.coin(&out_point)?.is_none())
    }

    pub fn get_chain_height(&self) -> u32 {
        self.state.read().chain.height().unwrap_or_default()
    }

    /// Whether the tip is recent enough to consider the node caught up.
    pub fn is_synced(&self) -> bool {
        let state = self.state.read();
        let Some(header) = state.chain.tip_header() else {
            return false;
        };
        let tip_age = unix_time().saturating_sub(header.time as u64);
        tip_age <= self.config.max_tip_age.as_secs()
    }

    /// Estimated fraction of the chain verified so far, in `[0, 1]`.
    pub fn get_sync_progress(&self) -> f64 {
        self.state.read().chain.verification_progress(unix_time())
    }

    /// Fee rate in sat/kvB to confirm within `target` blocks, `-1` if unknown.
    pub fn estimate_fee(&self, target: usize) -> i64 {
        self.state
            .read()
            .mempool
            .estimate_fee(target)
            .map(|rate| i64::try_from(rate.as_sat_per_kvb()).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }

    pub fn mempool_info(&self) -> MempoolInfo {
        self.state.read().mempool.info()
    }

    /// Validates a hex encoded transaction and adds it to the mempool.
    pub fn submit_transaction(&self, raw_hex: &str, allow_high_fee: bool) -> Result<Txid> {
        let bytes = hex::decode(raw_hex.trim())?;
        let tx: Transaction = deserialize(&bytes).map_err(|err| Error::Decode {
            what: "transaction",
            err,
        })?;
        self.accept_transaction(tx, allow_high_fee)
    }

    pub fn accept_transaction(&self, tx: Transaction, allow_high_fee: bool) -> Result<Txid> {
        let mut state = self.state.write();
        let NodeState { chain, mempool } = &mut *state;
        let tip = tip_context(chain);
        let accepted = mempool.accept(tx, chain.coins(), tip, unix_time(), allow_high_fee)?;

        self.subscribers
            .notify([NodeEvent::TransactionAccepted { txid: accepted.txid }]);

        Ok(accepted.txid)
    }

    /// Validates a serialized block, stores it and activates the best chain.
    pub fn submit_block(&self, bytes: &[u8]) -> Result<ImportStatus> {
        let block: Block = deserialize(bytes).map_err(|err| Error::Decode { what: "block", err })?;
        self.process_block(&block)
    }

    pub fn process_block(&self, block: &Block) -> Result<ImportStatus> {
        self.update_chain(|chain, update| chain.process_block(block, update))
    }

    /// Marks a block and its descendants as invalid and moves the tip off them.
    pub fn invalidate_block(&self, hash: &BlockHash) -> Result<()> {
        self.update_chain(|chain, update| chain.invalidate_block(hash, update))
    }

    /// Clears the failure marks set by [`Self::invalidate_block`].
    pub fn reconsider_block(&self, hash: &BlockHash) -> Result<()> {
        self.update_chain(|chain, update| chain.reconsider_block(hash, update))
    }

    /// Runs a chain state operation under the write lock, then reconciles the
    /// mempool with every tip change it made and publishes the events.
    ///
    /// Tip changes made before a failure are reconciled and published too.
    /// Events go out before the lock is released, so subscribers see them in
    /// the order the tip moved.
    fn update_chain<T>(
        &self,
        f: impl FnOnce(&mut ChainState, &mut ChainUpdate) -> oxnode_chain::Result<T>,
    ) -> Result<T> {
        let mut state = self.state.write();
        let mut update = ChainUpdate::default();

        let result = f(&mut state.chain, &mut update);
        if let Err(err) = &result {
            if !update.events.is_empty() {
                tracing::error!(
                    tip = ?state.chain.tip(),
                    applied = update.events.len(),
                    "Tip update aborted partway: {err}"
                );
            }
        }

        let events = Self::apply_chain_update(&mut state, update)?;
        self.subscribers.notify(events);

        Ok(result?)
    }

    /// Brings the mempool in line with a chain update and returns the events
    /// to publish.
    ///
    /// Transactions of disconnected blocks are offered back after all
    /// connects, oldest block first, then entries invalidated by the new tip
    /// are dropped.
    fn apply_chain_update(state: &mut NodeState, update: ChainUpdate) -> Result<Vec<NodeEvent>> {
        let NodeState { chain, mempool } = state;
        let now = unix_time();

        for (hash, err) in &update.invalid {
            tracing::warn!(%hash, "❌ Rejected invalid block: {err}");
        }

        if update.events.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(update.events.len() + 1);
        let mut disconnected = Vec::new();

        for event in update.events {
            match event {
                TipEvent::Connected { hash, height, block } => {
                    mempool.remove_for_block(&block, height, now);
                    events.push(NodeEvent::BlockConnected { hash, height });
                }
                TipEvent::Disconnected { hash, height, block } => {
                    disconnected.push(block);
                    events.push(NodeEvent::BlockDisconnected { hash, height });
                }
            }
        }

        let tip = tip_context(chain);

        if !disconnected.is_empty() {
            let txs = disconnected
                .iter()
                .rev()
                .flat_map(|block| block.txdata.iter().skip(1).cloned().map(Arc::new))
                .collect::<Vec<_>>();
            let offered = txs.len();
            let readded = mempool.reinsert_disconnected(txs, chain.coins(), tip, now);
            let removed = mempool.remove_for_reorg(chain.coins(), tip)?;
            tracing::info!(
                blocks = disconnected.len(),
                offered,
                readded,
                removed,
                "Reconciled mempool after reorg"
            );
        }

        if let Some(new_tip) = chain.tip() {
            events.push(NodeEvent::ChainTipChanged {
                hash: new_tip.hash,
                height: new_tip.number,
            });
        }

        Ok(events)
    }

    /// Persists the chain state if the cache is full or the flush interval
    /// elapsed, and drops expired mempool transactions.
    pub fn maintain(&self) -> Result<()> {
        let mut state = self.state.write();
        state.chain.flush_state(FlushMode::Periodic)?;

        let max_age = self.config.mempool_options().expiry_duration();
        state.mempool.expire(unix_time(), max_age);

        Ok(())
    }

    /// Writes everything to disk.
    pub fn flush(&self) -> Result<()> {
        self.state.write().chain.flush_state(FlushMode::Always)?;
        self.write_fee_estimates();
        Ok(())
    }

    /// Persists the fee estimator histogram, failures are only logged.
    pub fn write_fee_estimates(&self) {
        let path = self.fee_estimates_path();
        if let Err(err) = self.state.read().mempool.fee_estimator().write_to(&path) {
            tracing::warn!(path = %path.display(), "Failed to write fee estimates: {err}");
        }
    }

    /// Stops the background loops and flushes the node state.
    pub fn close(self) -> Result<()> {
        self.request_shutdown();
        self.flush()?;
        tracing::info!("Node state flushed, shutting down");
        Ok(())
    }

    fn fee_estimates_path(&self) -> PathBuf {
        self.config.data_dir.join(FEE_ESTIMATES_FILENAME)
    }
}

fn load_fee_estimates(path: &std::path::Path) -> FeeEstimator {
    if !path.exists() {
        return FeeEstimator::default();
    }
    match FeeEstimator::read_from(path, FeeEstimatorConfig::default()) {
        Ok(estimator) => {
            tracing::debug!(best_height = estimator.best_height(), "Loaded fee estimates");
            estimator
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "Ignoring fee estimates: {err}");
            FeeEstimator::default()
        }
    }
}
