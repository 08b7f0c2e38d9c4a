use bitcoin::Txid;

/// Errors that can occur in the UTXO set.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Column family missing from the opened database.
    #[error("Column family {0} not found")]
    MissingColumnFamily(&'static str),

    /// Adding outputs of a transaction whose earlier outputs are still unspent.
    #[error("Transaction {0} overwrites unspent outputs")]
    OverwriteUnspent(Txid),

    /// A child cache marked an entry FRESH while the parent holds unspent outputs.
    #[error("FRESH entry {0} would overwrite unspent outputs in the parent cache")]
    FreshOverwrite(Txid),

    /// Flushing a cache that has no best block.
    #[error("Best block of the coins cache is not set")]
    MissingBestBlock,

    /// Failure reported by a backing view.
    #[error("Backing view failure: {0}")]
    Backend(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
