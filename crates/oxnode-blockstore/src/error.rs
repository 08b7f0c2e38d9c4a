use oxnode_primitives::FilePos;
use std::path::PathBuf;

/// Errors that can occur in the block store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A file referenced by the persisted file info is gone.
    #[error("Missing block file: {}", .0.display())]
    MissingFile(PathBuf),

    /// A file is shorter than the size recorded for it.
    #[error("File {} is truncated: {actual} bytes on disk, {expected} recorded", path.display())]
    Truncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The record header does not start with the network magic.
    #[error("Bad record magic at {0}")]
    BadMagic(FilePos),

    /// The undo record checksum does not match.
    #[error("Undo data checksum mismatch at {0}")]
    ChecksumMismatch(FilePos),

    /// A record length points past the end of its file.
    #[error("Corrupt record at {pos}: length {length} exceeds file of {file_len} bytes")]
    Corrupt {
        pos: FilePos,
        length: u32,
        file_len: u64,
    },

    /// Record does not fit in a single block file.
    #[error("Record of {0} bytes exceeds the maximum file size")]
    RecordTooLarge(usize),

    /// Failed to decode a block.
    #[error("Failed to decode block at {pos}: {err}")]
    Decode {
        pos: FilePos,
        err: bitcoin::consensus::encode::Error,
    },
}
