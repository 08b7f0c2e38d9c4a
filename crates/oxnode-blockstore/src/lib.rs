//! Append-only storage of serialized blocks and their undo data.
//!
//! Blocks live in numbered `blk?????.dat` files, the undo data of the blocks
//! of a file lives in the `rev?????.dat` file with the same number. Every
//! record is framed as `magic || length (u32 LE) || payload`, undo records
//! are followed by a double-SHA256 checksum committing to the block hash and
//! the payload.
//!
//! Historical bytes are never rewritten. A failed append may leave bytes on
//! disk that no index entry references, they are skipped forever.

mod error;
mod store;

pub use self::error::Error;
pub use self::store::{
    BlockFileInfo, BlockStore, BlockStoreConfig, DEFAULT_MAX_FILE_SIZE, FileKind, RawRecord,
    read_records,
};

pub type Result<T> = std::result::Result<T, Error>;
