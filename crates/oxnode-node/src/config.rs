use bitcoin::Network;
use oxnode_chain::{ChainConfig, DEFAULT_COINS_CACHE_SIZE, DEFAULT_FLUSH_INTERVAL};
use oxnode_mempool::{FeeRate, MempoolOptions};
use crate::resources::{DEFAULT_MIN_FILE_DESCRIPTORS, DEFAULT_MIN_FREE_DISK_SPACE};
use oxnode_primitives::script::ScriptVerifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Number of blocks checked at startup by default.
pub const DEFAULT_CHECK_BLOCKS: u32 = 6;

/// A node whose tip is older than this is considered to be syncing.
pub const DEFAULT_MAX_TIP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration of a [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the data directory.
    pub data_dir: PathBuf,
    pub network: Network,
    /// Maintain the index of confirmed transactions by txid.
    pub txindex: bool,
    /// Rebuild the block index and the UTXO set from the block files on startup.
    pub reindex: bool,
    /// Memory ceiling of the UTXO cache in bytes.
    pub coins_cache_size: usize,
    pub max_block_file_size: u32,
    /// Maximum size of the mempool in MB.
    pub mempool_max_size_mb: usize,
    /// Hours a transaction may stay in the mempool.
    pub mempool_expiry_hours: u32,
    pub min_relay_fee_rate: FeeRate,
    /// Fee rate above which transactions are refused unless high fees are allowed.
    pub max_fee_rate: FeeRate,
    /// Maximum time between two flushes of the chain state.
    pub flush_interval: Duration,
    /// Verify input scripts, disabling it trusts every script.
    pub verify_scripts: bool,
    /// Script verification workers, `0` picks the number of CPUs.
    pub script_threads: usize,
    /// Blocks below the tip whose undo data is checked at startup.
    pub check_blocks: u32,
    pub max_tip_age: Duration,
    /// Free bytes required on the data directory filesystem at startup.
    pub min_free_disk_space: u64,
    pub min_file_descriptors: u64,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>, network: Network) -> Self {
        let mempool = MempoolOptions::default();
        Self {
            data_dir: data_dir.into(),
            network,
            txindex: false,
            reindex: false,
            coins_cache_size: DEFAULT_COINS_CACHE_SIZE,
            max_block_file_size: oxnode_blockstore::DEFAULT_MAX_FILE_SIZE,
            mempool_max_size_mb: mempool.max_size_mb,
            mempool_expiry_hours: mempool.expiry_hours,
            min_relay_fee_rate: mempool.min_relay_fee_rate,
            max_fee_rate: mempool.max_fee_rate,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            verify_scripts: true,
            script_threads: 0,
            check_blocks: DEFAULT_CHECK_BLOCKS,
            max_tip_age: DEFAULT_MAX_TIP_AGE,
            min_free_disk_space: DEFAULT_MIN_FREE_DISK_SPACE,
            min_file_descriptors: DEFAULT_MIN_FILE_DESCRIPTORS,
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            network: self.network,
            txindex: self.txindex,
            reindex: self.reindex,
            coins_cache_size: self.coins_cache_size,
            max_block_file_size: self.max_block_file_size,
            flush_interval: self.flush_interval,
            script_threads: self.script_threads,
        }
    }

    pub fn mempool_options(&self) -> MempoolOptions {
        MempoolOptions::builder()
            .max_size_mb(self.mempool_max_size_mb)
            .expiry_hours(self.mempool_expiry_hours)
            .min_relay_fee_rate(self.min_relay_fee_rate)
            .max_fee_rate(self.max_fee_rate)
            .build()
    }

    /// Script verifier shared by the chain state and the mempool.
    pub fn script_verifier(&self) -> Arc<dyn ScriptVerifier> {
        #[cfg(feature = "bitcoinconsensus")]
        if self.verify_scripts {
            return Arc::new(oxnode_primitives::script::ConsensusScriptVerifier);
        }

        if self.verify_scripts {
            tracing::warn!("Built without libbitcoinconsensus, scripts are not verified");
        }

        Arc::new(oxnode_primitives::script::NoScriptVerification)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(".oxnode", Network::Bitcoin)
    }
}
