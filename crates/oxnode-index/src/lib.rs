//! Metadata index: block index records, transaction locations and block file
//! bookkeeping, stored in RocksDB.
//!
//! Every change produced by a connect or disconnect step reaches the
//! database through [`IndexDb::write_batch`], which commits one RocksDB
//! write batch. A crash can therefore never expose part of a batch.

mod error;

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use oxnode_blockstore::BlockFileInfo;
use oxnode_primitives::{BlockStatus, DiskTxPos, FilePos};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use self::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Column family names.
mod cf {
    pub const BLOCK_INDEX: &str = "block_index";
    pub const TX_INDEX: &str = "tx_index";
    pub const FILE_INFO: &str = "file_info";
    pub const META: &str = "meta";
}

/// Keys in the meta column family.
mod meta_keys {
    pub const BEST_CHAIN: &[u8] = b"best_chain";
    pub const LAST_BLOCK_FILE: &[u8] = b"last_block_file";
    pub const REINDEXING: &[u8] = b"reindexing";
    pub const TXINDEX: &[u8] = b"txindex";
}

/// Persisted form of a block index entry.
///
/// The height is informational, heights and chain work are recomputed from
/// the parent links when the index is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBlockIndex {
    /// Consensus encoded header.
    header: Vec<u8>,
    /// Height of the block.
    pub height: u32,
    /// Validation status.
    pub status: BlockStatus,
    /// Number of transactions, zero if the block data was never received.
    pub n_tx: u32,
    /// Position of the block in the block files.
    pub data_pos: Option<FilePos>,
    /// Position of the undo data in the undo files.
    pub undo_pos: Option<FilePos>,
}

impl DiskBlockIndex {
    pub fn new(
        header: &Header,
        height: u32,
        status: BlockStatus,
        n_tx: u32,
        data_pos: Option<FilePos>,
        undo_pos: Option<FilePos>,
    ) -> Self {
        Self {
            header: bitcoin::consensus::serialize(header),
            height,
            status,
            n_tx,
            data_pos,
            undo_pos,
        }
    }

    /// Decodes the block header.
    pub fn header(&self) -> Result<Header> {
        bitcoin::consensus::deserialize(&self.header)
            .map_err(|err| Error::Deserialization(err.to_string()))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| Error::Deserialization(err.to_string()))
    }
}

/// A set of index changes committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    blocks: Vec<(BlockHash, DiskBlockIndex)>,
    tx_locations: Vec<(Txid, DiskTxPos)>,
    erased_tx_locations: Vec<Txid>,
    file_infos: Vec<(u32, BlockFileInfo)>,
    last_block_file: Option<u32>,
    best_chain: Option<BlockHash>,
}

impl IndexBatch {
    pub fn put_block(&mut self, hash: BlockHash, entry: DiskBlockIndex) {
        self.blocks.push((hash, entry));
    }

    pub fn put_tx_location(&mut self, txid: Txid, pos: DiskTxPos) {
        self.tx_locations.push((txid, pos));
    }

    pub fn erase_tx_location(&mut self, txid: Txid) {
        self.erased_tx_locations.push(txid);
    }

    pub fn put_file_info(&mut self, file: u32, info: BlockFileInfo) {
        self.file_infos.push((file, info));
    }

    pub fn set_last_block_file(&mut self, file: u32) {
        self.last_block_file = Some(file);
    }

    pub fn set_best_chain(&mut self, hash: BlockHash) {
        self.best_chain = Some(hash);
    }

    /// Number of block index entries in the batch.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.tx_locations.is_empty()
            && self.erased_tx_locations.is_empty()
            && self.file_infos.is_empty()
            && self.last_block_file.is_none()
            && self.best_chain.is_none()
    }
}

/// Metadata index database.
pub struct IndexDb {
    db: DB,
    txindex: bool,
}

impl IndexDb {
    /// Open or create the index at the given path.
    ///
    /// Enabling the transaction index on a database that already indexes
    /// blocks without it requires a reindex.
    pub fn open(path: &Path, txindex: bool) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(cf::BLOCK_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(cf::TX_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(cf::FILE_INFO, Options::default()),
            ColumnFamilyDescriptor::new(cf::META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let index = Self { db, txindex };

        let stored = index.read_meta(meta_keys::TXINDEX)?.map(|v| v == [1]);
        match stored {
            Some(false) if txindex && index.best_chain()?.is_some() => {
                return Err(Error::TxIndexRequiresReindex);
            }
            Some(enabled) if enabled == txindex => {}
            _ => index.write_txindex_flag(txindex)?,
        }

        tracing::info!(path = %path.display(), txindex, "Opened block index database");

        Ok(index)
    }

    /// Whether transaction locations are indexed.
    pub fn txindex_enabled(&self) -> bool {
        self.txindex
    }

    pub fn put(&self, hash: &BlockHash, entry: &DiskBlockIndex) -> Result<()> {
        let cf = self.cf(cf::BLOCK_INDEX)?;
        self.db.put_cf(cf, hash.as_byte_array(), entry.encode()?)?;
        Ok(())
    }

    pub fn get(&self, hash: &BlockHash) -> Result<Option<DiskBlockIndex>> {
        let cf = self.cf(cf::BLOCK_INDEX)?;
        self.db
            .get_cf(cf, hash.as_byte_array())?
            .map(|bytes| DiskBlockIndex::decode(&bytes))
            .transpose()
    }

    /// Records the location of a transaction, ignored without transaction index.
    pub fn put_tx_location(&self, txid: &Txid, pos: &DiskTxPos) -> Result<()> {
        if !self.txindex {
            return Ok(());
        }
        let cf = self.cf(cf::TX_INDEX)?;
        self.db.put_cf(cf, txid.as_byte_array(), bincode::serialize(pos)?)?;
        Ok(())
    }

    pub fn get_tx_location(&self, txid: &Txid) -> Result<Option<DiskTxPos>> {
        if !self.txindex {
            return Ok(None);
        }
        let cf = self.cf(cf::TX_INDEX)?;
        self.db
            .get_cf(cf, txid.as_byte_array())?
            .map(|bytes| {
                bincode::deserialize(&bytes).map_err(|err| Error::Deserialization(err.to_string()))
            })
            .transpose()
    }

    /// Commits the batch atomically.
    pub fn write_batch(&self, batch: IndexBatch) -> Result<()> {
        self.write_batch_inner(batch, |_| Ok(()))
    }

    /// Builds the RocksDB batch, calling `before_put` ahead of each entry.
    ///
    /// Nothing reaches the database unless every entry was added.
    fn write_batch_inner(
        &self,
        batch: IndexBatch,
        mut before_put: impl FnMut(usize) -> Result<()>,
    ) -> Result<()> {
        let cf_blocks = self.cf(cf::BLOCK_INDEX)?;
        let cf_tx = self.cf(cf::TX_INDEX)?;
        let cf_files = self.cf(cf::FILE_INFO)?;
        let cf_meta = self.cf(cf::META)?;

        let mut write_batch = WriteBatch::default();
        let mut entries = 0usize;

        for (hash, entry) in &batch.blocks {
            before_put(entries)?;
            write_batch.put_cf(cf_blocks, hash.as_byte_array(), entry.encode()?);
            entries += 1;
        }

        if self.txindex {
            for (txid, pos) in &batch.tx_locations {
                before_put(entries)?;
                write_batch.put_cf(cf_tx, txid.as_byte_array(), bincode::serialize(pos)?);
                entries += 1;
            }
            for txid in &batch.erased_tx_locations {
                before_put(entries)?;
                write_batch.delete_cf(cf_tx, txid.as_byte_array());
                entries += 1;
            }
        }

        for (file, info) in &batch.file_infos {
            before_put(entries)?;
            write_batch.put_cf(cf_files, file.to_be_bytes(), bincode::serialize(info)?);
            entries += 1;
        }

        if let Some(file) = batch.last_block_file {
            write_batch.put_cf(cf_meta, meta_keys::LAST_BLOCK_FILE, file.to_le_bytes());
        }

        if let Some(best) = batch.best_chain {
            write_batch.put_cf(cf_meta, meta_keys::BEST_CHAIN, best.as_byte_array());
        }

        self.db.write(write_batch)?;

        tracing::trace!(entries, "Committed index batch");

        Ok(())
    }

    /// Loads every block index record.
    pub fn load_block_index(&self) -> Result<Vec<(BlockHash, DiskBlockIndex)>> {
        let cf = self.cf(cf::BLOCK_INDEX)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let hash = BlockHash::from_slice(&key)
                .map_err(|err| Error::Deserialization(err.to_string()))?;
            entries.push((hash, DiskBlockIndex::decode(&value)?));
        }
        Ok(entries)
    }

    /// Loads the block file infos, ordered by file number.
    pub fn load_file_infos(&self) -> Result<Vec<BlockFileInfo>> {
        let cf = self.cf(cf::FILE_INFO)?;
        let mut infos = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let file = key
                .as_ref()
                .try_into()
                .map(u32::from_be_bytes)
                .map_err(|_| Error::Deserialization("Invalid file info key".to_string()))?;
            let info: BlockFileInfo = bincode::deserialize(&value)
                .map_err(|err| Error::Deserialization(err.to_string()))?;
            if infos.len() <= file as usize {
                infos.resize(file as usize + 1, BlockFileInfo::default());
            }
            infos[file as usize] = info;
        }
        Ok(infos)
    }

    /// Hash of the tip the index was last written for.
    pub fn best_chain(&self) -> Result<Option<BlockHash>> {
        self.read_meta(meta_keys::BEST_CHAIN)?
            .map(|bytes| {
                BlockHash::from_slice(&bytes).map_err(|err| Error::Deserialization(err.to_string()))
            })
            .transpose()
    }

    pub fn last_block_file(&self) -> Result<Option<u32>> {
        Ok(self
            .read_meta(meta_keys::LAST_BLOCK_FILE)?
            .and_then(|bytes| bytes.try_into().ok().map(u32::from_le_bytes)))
    }

    /// Whether a reindex was interrupted.
    pub fn is_reindexing(&self) -> Result<bool> {
        Ok(self.read_meta(meta_keys::REINDEXING)?.is_some())
    }

    pub fn set_reindexing(&self, reindexing: bool) -> Result<()> {
        let cf = self.cf(cf::META)?;
        if reindexing {
            self.db.put_cf(cf, meta_keys::REINDEXING, [1u8])?;
        } else {
            self.db.delete_cf(cf, meta_keys::REINDEXING)?;
        }
        Ok(())
    }

    /// Erases every block index, transaction and file record.
    ///
    /// The reindex marker and the transaction index flag survive.
    pub fn wipe(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for name in [cf::BLOCK_INDEX, cf::TX_INDEX, cf::FILE_INFO] {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        let cf_meta = self.cf(cf::META)?;
        batch.delete_cf(cf_meta, meta_keys::BEST_CHAIN);
        batch.delete_cf(cf_meta, meta_keys::LAST_BLOCK_FILE);
        self.db.write(batch)?;

        tracing::info!("Wiped block index database");

        Ok(())
    }

    fn write_txindex_flag(&self, enabled: bool) -> Result<()> {
        let cf = self.cf(cf::META)?;
        self.db.put_cf(cf, meta_keys::TXINDEX, [enabled as u8])?;
        Ok(())
    }

    fn read_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf::META)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or(Error::MissingColumnFamily(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header(nonce: u32) -> Header {
        let mut header = bitcoin::constants::genesis_block(bitcoin::Network::Regtest).header;
        header.nonce = nonce;
        header
    }

    fn entry(nonce: u32, height: u32) -> (BlockHash, DiskBlockIndex) {
        let header = test_header(nonce);
        let entry = DiskBlockIndex::new(
            &header,
            height,
            BlockStatus::HaveData,
            1,
            Some(FilePos::new(0, 8 + 300 * height)),
            None,
        );
        (header.block_hash(), entry)
    }

    fn batch_of(count: u32) -> IndexBatch {
        let mut batch = IndexBatch::default();
        for n in 0..count {
            let (hash, entry) = entry(n, n);
            batch.put_block(hash, entry);
        }
        batch.put_file_info(
            0,
            BlockFileInfo {
                blocks: count,
                size: 300 * count,
                ..Default::default()
            },
        );
        batch.set_best_chain(test_header(count - 1).block_hash());
        batch.set_last_block_file(0);
        batch
    }

    #[test]
    fn put_and_get_block_index() {
        let tmp = tempfile::tempdir().unwrap();
        let db = IndexDb::open(tmp.path(), false).unwrap();

        let (hash, record) = entry(7, 3);
        assert!(db.get(&hash).unwrap().is_none());
        db.put(&hash, &record).unwrap();

        let loaded = db.get(&hash).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.header().unwrap(), test_header(7));
    }

    #[test]
    fn tx_locations_require_txindex() {
        let tmp = tempfile::tempdir().unwrap();
        let txid = Txid::from_byte_array([3; 32]);
        let pos = DiskTxPos {
            block: FilePos::new(1, 100),
            tx_offset: 81,
            tx_len: 200,
        };

        {
            let db = IndexDb::open(&tmp.path().join("with"), true).unwrap();
            db.put_tx_location(&txid, &pos).unwrap();
            assert_eq!(db.get_tx_location(&txid).unwrap(), Some(pos));

            let mut batch = IndexBatch::default();
            batch.erase_tx_location(txid);
            db.write_batch(batch).unwrap();
            assert_eq!(db.get_tx_location(&txid).unwrap(), None);
        }

        let db = IndexDb::open(&tmp.path().join("without"), false).unwrap();
        db.put_tx_location(&txid, &pos).unwrap();
        assert_eq!(db.get_tx_location(&txid).unwrap(), None);
    }

    #[test]
    fn enabling_txindex_on_populated_index_requires_reindex() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let db = IndexDb::open(tmp.path(), false).unwrap();
            db.write_batch(batch_of(2)).unwrap();
        }
        assert!(matches!(
            IndexDb::open(tmp.path(), true),
            Err(Error::TxIndexRequiresReindex)
        ));
        // Disabling is always possible.
        assert!(IndexDb::open(tmp.path(), false).is_ok());
    }

    #[test]
    fn batch_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let db = IndexDb::open(tmp.path(), false).unwrap();
            db.write_batch(batch_of(5)).unwrap();
        }

        let db = IndexDb::open(tmp.path(), false).unwrap();
        let entries = db.load_block_index().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(db.best_chain().unwrap(), Some(test_header(4).block_hash()));
        assert_eq!(db.last_block_file().unwrap(), Some(0));
        assert_eq!(db.load_file_infos().unwrap()[0].blocks, 5);
    }

    #[test]
    fn interrupted_batch_leaves_no_entries() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let db = IndexDb::open(tmp.path(), false).unwrap();
            db.write_batch(batch_of(2)).unwrap();

            let mut batch = batch_of(6);
            batch.set_best_chain(test_header(5).block_hash());
            let result = db.write_batch_inner(batch, |n| {
                if n == 4 {
                    Err(Error::Serialization("simulated crash".into()))
                } else {
                    Ok(())
                }
            });
            assert!(result.is_err());
        }

        let db = IndexDb::open(tmp.path(), false).unwrap();
        let hashes: Vec<BlockHash> = db
            .load_block_index()
            .unwrap()
            .into_iter()
            .map(|(hash, _)| hash)
            .collect();
        assert_eq!(hashes.len(), 2);
        assert!(db.get(&test_header(3).block_hash()).unwrap().is_none());
        assert_eq!(db.best_chain().unwrap(), Some(test_header(1).block_hash()));
        assert_eq!(db.load_file_infos().unwrap()[0].blocks, 2);
    }

    #[test]
    fn wipe_clears_records_but_keeps_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let db = IndexDb::open(tmp.path(), true).unwrap();
        db.write_batch(batch_of(3)).unwrap();
        db.set_reindexing(true).unwrap();

        db.wipe().unwrap();

        assert!(db.load_block_index().unwrap().is_empty());
        assert!(db.load_file_infos().unwrap().is_empty());
        assert_eq!(db.best_chain().unwrap(), None);
        assert!(db.is_reindexing().unwrap());
        assert!(db.txindex_enabled());

        db.set_reindexing(false).unwrap();
        assert!(!db.is_reindexing().unwrap());
    }
}
