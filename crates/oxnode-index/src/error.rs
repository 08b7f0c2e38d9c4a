/// Errors that can occur in the metadata index.
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

    /// The transaction index was enabled on a database built without it.
    #[error("Transaction index can not be enabled without a reindex")]
    TxIndexRequiresReindex,
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
