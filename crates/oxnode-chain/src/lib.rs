//! Block tree, active chain and the state machine connecting blocks to the
//! UTXO set.
//!
//! - [`BlockTree`]: every known header, linked to its parent.
//! - [`ActiveChain`]: the path from genesis to the current tip.
//! - [`ChainState`]: accepts headers and blocks, activates the chain with the
//!   most work and persists the block index and the UTXO set.

mod active_chain;
mod block_tree;
mod chain_state;
mod error;
mod script_check;
pub mod verification;

pub use self::active_chain::ActiveChain;
pub use self::block_tree::{BlockId, BlockIndexEntry, BlockTree, zero_work};
pub use self::chain_state::{
    BlockInfo, ChainConfig, ChainState, ChainUpdate, DEFAULT_COINS_CACHE_SIZE,
    DEFAULT_FLUSH_INTERVAL, DisconnectResult, FlushMode, ImportStatus, TipEvent, disconnect_block,
};
pub use self::error::{BlockError, Error};
pub use self::script_check::{ScriptChecker, TxScriptJob};

pub type Result<T> = std::result::Result<T, Error>;
