//! Primitives shared by the oxnode storage and validation crates.

mod chain_params;
pub mod consensus;
pub mod script;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Weight};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use self::chain_params::{ChainParams, ChainTxData};

/// Maximum block weight as defined in BIP141.
pub const MAX_BLOCK_WEIGHT: Weight = Weight::MAX_BLOCK;

/// Coinbase outputs can only be spent after this many confirmations.
pub const COINBASE_MATURITY: u32 = 100;

/// Height assigned to coins created by transactions that are still in the mempool.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// 6 blocks is the standard confirmation period in the Bitcoin community.
pub const CONFIRMATION_DEPTH: u32 = 6u32;

/// Number of blocks used to compute the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Returns the seconds since the UNIX epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Location of a record payload inside one of the numbered flat files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilePos {
    /// Number of the flat file.
    pub file: u32,
    /// Offset of the payload within the file.
    pub offset: u32,
}

impl FilePos {
    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }
}

impl std::fmt::Display for FilePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// Location of a transaction on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTxPos {
    /// Position of the block containing the transaction.
    pub block: FilePos,
    /// Offset of the transaction relative to the start of the block.
    pub tx_offset: u32,
    /// Serialized length of the transaction.
    pub tx_len: u32,
}

/// Validation status of a block index entry.
///
/// The happy path is `HeaderOnly -> HaveData -> ValidScripts`, a block may
/// be marked `Failed` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Only the header is known.
    HeaderOnly,
    /// Full block data is stored in the block files.
    HaveData,
    /// The block has been connected to the active chain at least once.
    ValidScripts,
    /// The block failed validation.
    Failed,
}

impl BlockStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeaderOnly => "header-only",
            Self::HaveData => "have-data",
            Self::ValidScripts => "valid-scripts",
            Self::Failed => "failed",
        }
    }
}

/// Represents an indexed Bitcoin block, identified by its block number and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedBlock {
    /// Block number.
    pub number: u32,
    /// Block hash.
    pub hash: BlockHash,
}

impl std::fmt::Display for IndexedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{},{}", self.number, self.hash)
    }
}

impl Default for IndexedBlock {
    fn default() -> Self {
        Self {
            number: 0u32,
            hash: BlockHash::all_zeros(),
        }
    }
}
