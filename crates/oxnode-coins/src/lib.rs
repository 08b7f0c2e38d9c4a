//! UTXO set: a write-back cache of per-transaction output sets over a
//! RocksDB backed database.
//!
//! Caches can be stacked on top of each other, a child cache is committed
//! into its parent with [`CoinsViewCache::flush`]. The chain state connects
//! every block on a scratch cache layered over the tip cache, so a block that
//! fails validation never touches the tip cache.

mod cache;
mod coin;
mod db;
mod error;
mod undo;
mod view;

pub use self::cache::CoinsViewCache;
pub use self::coin::{Coin, TxCoins, key_to_outpoint, outpoint_to_key};
pub use self::db::{CoinsDb, CoinsStats};
pub use self::error::Error;
pub use self::undo::{BlockUndo, TxUndo};
pub use self::view::{CacheEntry, CoinsMap, CoinsView, EntryFlags};

pub type Result<T> = std::result::Result<T, Error>;
