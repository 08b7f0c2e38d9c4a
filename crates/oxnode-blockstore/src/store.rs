use crate::{Error, Result};
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{Block, BlockHash};
use oxnode_primitives::FilePos;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of `magic || length`.
const RECORD_HEADER_SIZE: u32 = 8;

/// Size of the checksum trailing each undo record.
const UNDO_CHECKSUM_SIZE: u32 = 32;

/// Default ceiling of a single block file.
pub const DEFAULT_MAX_FILE_SIZE: u32 = 128 * 1024 * 1024;

/// Kind of a flat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `blk?????.dat`
    Block,
    /// `rev?????.dat`
    Undo,
}

impl FileKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Block => "blk",
            Self::Undo => "rev",
        }
    }
}

/// Configuration of [`BlockStore`].
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Directory holding the flat files.
    pub dir: PathBuf,
    /// Network magic prefixing every record.
    pub magic: [u8; 4],
    /// Once a block file would grow past this size a new one is started.
    pub max_file_size: u32,
}

impl BlockStoreConfig {
    pub fn new(dir: impl Into<PathBuf>, network: bitcoin::Network) -> Self {
        Self {
            dir: dir.into(),
            magic: network.magic().to_bytes(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Bookkeeping of a block file and its undo companion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFileInfo {
    /// Number of blocks stored in the file.
    pub blocks: u32,
    /// Bytes used in the block file.
    pub size: u32,
    /// Bytes used in the undo file.
    pub undo_size: u32,
    /// Lowest height of a block in the file.
    pub height_first: u32,
    /// Highest height of a block in the file.
    pub height_last: u32,
}

impl BlockFileInfo {
    /// Records a block of given height stored in the file.
    pub fn add_block(&mut self, height: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if height > self.height_last {
            self.height_last = height;
        }
        self.blocks += 1;
    }
}

/// A framed record read back from a block file.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Position of the payload.
    pub pos: FilePos,
    /// Record payload.
    pub payload: Vec<u8>,
}

/// Owner of the flat block and undo files.
///
/// No other component opens these files.
pub struct BlockStore {
    config: BlockStoreConfig,
    infos: Vec<BlockFileInfo>,
    current_file: u32,
    writers: HashMap<(FileKind, u32), File>,
    dirty_files: BTreeSet<u32>,
}

impl BlockStore {
    /// Opens the store, reconciling the persisted file infos with the files on disk.
    pub fn open(config: BlockStoreConfig, mut infos: Vec<BlockFileInfo>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        for number in existing_files(&config.dir, FileKind::Block)? {
            if infos.len() <= number as usize {
                infos.resize(number as usize + 1, BlockFileInfo::default());
            }
        }

        if infos.is_empty() {
            infos.push(BlockFileInfo::default());
        }

        for (number, info) in infos.iter_mut().enumerate() {
            let number = number as u32;
            info.size = reconcile_size(&config.dir, FileKind::Block, number, info.size)?;
            info.undo_size = reconcile_size(&config.dir, FileKind::Undo, number, info.undo_size)?;
        }

        let current_file = infos.len() as u32 - 1;

        tracing::info!(
            dir = %config.dir.display(),
            files = infos.len(),
            "Opened block store, current file blk{current_file:05}.dat"
        );

        Ok(Self {
            config,
            infos,
            current_file,
            writers: HashMap::new(),
            dirty_files: BTreeSet::new(),
        })
    }

    /// Directory of the flat files.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Number of the block file new blocks are appended to.
    pub fn current_file(&self) -> u32 {
        self.current_file
    }

    /// Number of block files known to the store.
    pub fn file_count(&self) -> u32 {
        self.infos.len() as u32
    }

    pub fn file_info(&self, file: u32) -> Option<&BlockFileInfo> {
        self.infos.get(file as usize)
    }

    /// Returns the file infos modified since the last call.
    pub fn take_dirty_file_infos(&mut self) -> Vec<(u32, BlockFileInfo)> {
        std::mem::take(&mut self.dirty_files)
            .into_iter()
            .filter_map(|file| self.infos.get(file as usize).map(|info| (file, *info)))
            .collect()
    }

    /// Marks files as modified again after their infos failed to persist.
    pub fn mark_dirty(&mut self, files: impl IntoIterator<Item = u32>) {
        self.dirty_files.extend(files);
    }

    /// Forgets the block counts of all files, used before replaying them.
    pub fn reset_block_counts(&mut self) {
        for (number, info) in self.infos.iter_mut().enumerate() {
            info.blocks = 0;
            info.height_first = 0;
            info.height_last = 0;
            self.dirty_files.insert(number as u32);
        }
    }

    /// Counts a block already present in `file`.
    pub fn note_block(&mut self, file: u32, height: u32) {
        if let Some(info) = self.infos.get_mut(file as usize) {
            info.add_block(height);
            self.dirty_files.insert(file);
        }
    }

    /// Appends a serialized block at `height` and returns the position of its payload.
    ///
    /// The block goes to the current file unless it would exceed the size
    /// ceiling, in which case a new file is started and becomes current.
    pub fn append_block(&mut self, bytes: &[u8], height: u32) -> Result<FilePos> {
        let record_size = RECORD_HEADER_SIZE as usize + bytes.len();
        if record_size > self.config.max_file_size as usize {
            return Err(Error::RecordTooLarge(bytes.len()));
        }

        let current = self.infos[self.current_file as usize];
        if current.size > 0 && current.size as usize + record_size > self.config.max_file_size as usize
        {
            self.roll_over()?;
        }

        let file = self.current_file;
        let pos = self.write_record(FileKind::Block, file, bytes, None)?;

        let info = &mut self.infos[file as usize];
        info.add_block(height);
        info.size = pos.offset + bytes.len() as u32;
        self.dirty_files.insert(file);

        Ok(pos)
    }

    /// Appends the undo data of a block stored in `block_file`.
    pub fn append_undo(
        &mut self,
        block_file: u32,
        block_hash: &BlockHash,
        bytes: &[u8],
    ) -> Result<FilePos> {
        if block_file as usize >= self.infos.len() {
            return Err(Error::MissingFile(self.path_of(FileKind::Block, block_file)));
        }

        let checksum = undo_checksum(block_hash, bytes);
        let pos = self.write_record(FileKind::Undo, block_file, bytes, Some(&checksum))?;

        let info = &mut self.infos[block_file as usize];
        info.undo_size = pos.offset + bytes.len() as u32 + UNDO_CHECKSUM_SIZE;
        self.dirty_files.insert(block_file);

        Ok(pos)
    }

    /// Reads `length` bytes at `offset` of a block file.
    pub fn read_at(&self, file: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.read_raw(FileKind::Block, file, offset, length)
    }

    /// Reads the raw bytes of the block whose payload starts at `pos`.
    pub fn read_block_bytes(&self, pos: FilePos) -> Result<Vec<u8>> {
        let length = self.read_record_length(FileKind::Block, pos)?;
        self.read_raw(FileKind::Block, pos.file, pos.offset, length)
    }

    /// Reads and decodes the block whose payload starts at `pos`.
    pub fn read_block(&self, pos: FilePos) -> Result<Block> {
        let bytes = self.read_block_bytes(pos)?;
        bitcoin::consensus::deserialize(&bytes).map_err(|err| Error::Decode { pos, err })
    }

    /// Reads the undo payload at `pos`, verifying its checksum against `block_hash`.
    pub fn read_undo(&self, pos: FilePos, block_hash: &BlockHash) -> Result<Vec<u8>> {
        let length = self.read_record_length(FileKind::Undo, pos)?;
        let with_checksum = length.saturating_add(UNDO_CHECKSUM_SIZE);
        let mut data = self.read_raw(FileKind::Undo, pos.file, pos.offset, with_checksum)?;
        let checksum = data.split_off(length as usize);

        if checksum != undo_checksum(block_hash, &data) {
            return Err(Error::ChecksumMismatch(pos));
        }

        Ok(data)
    }

    /// Reads every framed record of a block file in order.
    ///
    /// Bytes that do not start with the network magic are skipped, a
    /// truncated trailing record ends the scan. Files written by other
    /// implementations using the same framing can be scanned as well.
    pub fn scan_block_file(&self, file: u32) -> Result<Vec<RawRecord>> {
        read_records(&self.path_of(FileKind::Block, file), file, self.config.magic)
    }

    /// Syncs the files written since the last flush.
    ///
    /// With `finalize` the handles of files no longer appended to are closed.
    pub fn flush(&mut self, finalize: bool) -> Result<()> {
        for file in self.writers.values() {
            file.sync_all()?;
        }

        if finalize {
            let current = self.current_file;
            self.writers.retain(|(_, number), _| *number == current);
        }

        Ok(())
    }

    fn roll_over(&mut self) -> Result<()> {
        if let Some(file) = self.writers.remove(&(FileKind::Block, self.current_file)) {
            file.sync_all()?;
        }

        self.current_file += 1;
        self.infos.push(BlockFileInfo::default());

        tracing::debug!("Leaving block file {}, starting blk{:05}.dat", self.current_file - 1, self.current_file);

        Ok(())
    }

    fn write_record(
        &mut self,
        kind: FileKind,
        file: u32,
        payload: &[u8],
        trailer: Option<&[u8]>,
    ) -> Result<FilePos> {
        let magic = self.config.magic;
        let path = self.path_of(kind, file);
        let writer = match self.writers.entry((kind, file)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => entry.insert(
                OpenOptions::new().create(true).append(true).open(path)?,
            ),
        };

        // The actual end of file is authoritative, a previously failed write
        // may have left unreferenced bytes behind.
        let start = writer.metadata()?.len();
        let payload_offset = start + RECORD_HEADER_SIZE as u64;
        if payload_offset + payload.len() as u64 > u32::MAX as u64 {
            return Err(Error::RecordTooLarge(payload.len()));
        }

        let mut record =
            Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len() + trailer.map_or(0, |t| t.len()));
        record.extend_from_slice(&magic);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        if let Some(trailer) = trailer {
            record.extend_from_slice(trailer);
        }
        writer.write_all(&record)?;

        Ok(FilePos::new(file, payload_offset as u32))
    }

    fn read_record_length(&self, kind: FileKind, pos: FilePos) -> Result<u32> {
        let offset = pos
            .offset
            .checked_sub(RECORD_HEADER_SIZE)
            .ok_or(Error::BadMagic(pos))?;
        let header = self.read_raw(kind, pos.file, offset, RECORD_HEADER_SIZE)?;
        if header[..4] != self.config.magic {
            return Err(Error::BadMagic(pos));
        }
        Ok(u32::from_le_bytes([header[4], header[5], header[6], header[7]]))
    }

    fn read_raw(&self, kind: FileKind, file: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let path = self.path_of(kind, file);
        let mut handle = File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::MissingFile(path.clone()),
            _ => Error::Io(err),
        })?;

        // Lengths come from record headers on disk and are not trusted.
        let file_len = handle.metadata()?.len();
        let oversized = kind == FileKind::Block && length > self.config.max_file_size;
        if oversized || offset as u64 + length as u64 > file_len {
            return Err(Error::Corrupt {
                pos: FilePos::new(file, offset),
                length,
                file_len,
            });
        }

        handle.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; length as usize];
        handle.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn path_of(&self, kind: FileKind, file: u32) -> PathBuf {
        file_path(&self.config.dir, kind, file)
    }
}

fn file_path(dir: &Path, kind: FileKind, file: u32) -> PathBuf {
    dir.join(format!("{}{file:05}.dat", kind.prefix()))
}

fn undo_checksum(block_hash: &BlockHash, payload: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(block_hash.as_byte_array());
    data.extend_from_slice(payload);
    sha256d::Hash::hash(&data).to_byte_array()
}

/// Returns the numbers of the files of given kind in `dir`.
fn existing_files(dir: &Path, kind: FileKind) -> Result<Vec<u32>> {
    let mut numbers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(number) = name
            .strip_prefix(kind.prefix())
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|number| number.parse::<u32>().ok())
        {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Returns the size of a file on disk, failing if it lost bytes that were recorded.
fn reconcile_size(dir: &Path, kind: FileKind, file: u32, recorded: u32) -> Result<u32> {
    let path = file_path(dir, kind, file);
    let actual = match std::fs::metadata(&path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if recorded > 0 {
                return Err(Error::MissingFile(path));
            }
            return Ok(0);
        }
        Err(err) => return Err(err.into()),
    };

    if actual < recorded as u64 {
        return Err(Error::Truncated {
            path,
            expected: recorded as u64,
            actual,
        });
    }

    Ok(actual.min(u32::MAX as u64) as u32)
}

/// Reads every framed record of the file at `path`, numbered `file`.
pub fn read_records(path: &Path, file: u32, magic: [u8; 4]) -> Result<Vec<RawRecord>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };

    let header_size = RECORD_HEADER_SIZE as usize;
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while cursor + header_size <= data.len() {
        if data[cursor..cursor + 4] != magic {
            cursor += 1;
            continue;
        }

        let length = u32::from_le_bytes([
            data[cursor + 4],
            data[cursor + 5],
            data[cursor + 6],
            data[cursor + 7],
        ]) as usize;
        let start = cursor + header_size;

        if start + length > data.len() {
            tracing::warn!(file, offset = cursor, "Truncated record at the end of block file");
            break;
        }

        records.push(RawRecord {
            pos: FilePos::new(file, start as u32),
            payload: data[start..start + length].to_vec(),
        });
        cursor = start + length;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path, max_file_size: u32) -> BlockStore {
        let config = BlockStoreConfig {
            dir: dir.to_path_buf(),
            magic: bitcoin::Network::Regtest.magic().to_bytes(),
            max_file_size,
        };
        BlockStore::open(config, Vec::new()).unwrap()
    }

    fn block_hash(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    #[test]
    fn append_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open_store(tmp.path(), 1024);

        let first = store.append_block(b"first block", 1).unwrap();
        let second = store.append_block(b"second", 2).unwrap();

        assert_eq!(first, FilePos::new(0, 8));
        assert_eq!(second, FilePos::new(0, 8 + 11 + 8));
        assert_eq!(store.read_block_bytes(first).unwrap(), b"first block");
        assert_eq!(store.read_block_bytes(second).unwrap(), b"second");
        assert_eq!(store.read_at(0, first.offset + 6, 5).unwrap(), b"block");

        let info = store.file_info(0).unwrap();
        assert_eq!(info.blocks, 2);
        assert_eq!((info.height_first, info.height_last), (1, 2));
        assert_eq!(info.size, second.offset + 6);
    }

    #[test]
    fn rolls_over_to_new_file_when_full() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open_store(tmp.path(), 64);

        let payload = [7u8; 40];
        let a = store.append_block(&payload, 1).unwrap();
        let b = store.append_block(&payload, 1).unwrap();
        let c = store.append_block(&payload, 1).unwrap();

        assert_eq!((a.file, b.file, c.file), (0, 1, 2));
        assert_eq!(store.current_file(), 2);
        assert!(tmp.path().join("blk00001.dat").exists());
        assert!(matches!(
            store.append_block(&[0u8; 64], 1),
            Err(Error::RecordTooLarge(64))
        ));

        let dirty: Vec<u32> = store.take_dirty_file_infos().into_iter().map(|(n, _)| n).collect();
        assert_eq!(dirty, vec![0, 1, 2]);
        assert!(store.take_dirty_file_infos().is_empty());
    }

    #[test]
    fn reopen_continues_in_last_file() {
        let tmp = tempfile::tempdir().unwrap();
        let infos = {
            let mut store = open_store(tmp.path(), 64);
            store.append_block(&[1u8; 40], 1).unwrap();
            store.append_block(&[2u8; 40], 2).unwrap();
            store.flush(true).unwrap();
            store
                .take_dirty_file_infos()
                .into_iter()
                .map(|(_, info)| info)
                .collect::<Vec<_>>()
        };

        let config = BlockStoreConfig {
            dir: tmp.path().to_path_buf(),
            magic: bitcoin::Network::Regtest.magic().to_bytes(),
            max_file_size: 64,
        };
        let mut store = BlockStore::open(config, infos).unwrap();
        assert_eq!(store.current_file(), 1);
        assert_eq!(store.file_info(1).unwrap().blocks, 1);

        let pos = store.append_block(&[3u8; 8], 3).unwrap();
        assert_eq!(pos, FilePos::new(1, 48 + 8));
    }

    #[test]
    fn undo_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open_store(tmp.path(), 1024);

        let block = store.append_block(b"block", 1).unwrap();
        let undo = store.append_undo(block.file, &block_hash(1), b"undo data").unwrap();

        assert_eq!(store.read_undo(undo, &block_hash(1)).unwrap(), b"undo data");
        // Undo data of another block must not verify.
        assert!(matches!(
            store.read_undo(undo, &block_hash(2)),
            Err(Error::ChecksumMismatch(_))
        ));

        let rev = tmp.path().join("rev00000.dat");
        let mut bytes = std::fs::read(&rev).unwrap();
        bytes[undo.offset as usize] ^= 0xff;
        std::fs::write(&rev, bytes).unwrap();

        assert!(matches!(
            store.read_undo(undo, &block_hash(1)),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn missing_and_truncated_files_are_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let infos = {
            let mut store = open_store(tmp.path(), 1024);
            store.append_block(&[9u8; 100], 1).unwrap();
            store.flush(true).unwrap();
            store
                .take_dirty_file_infos()
                .into_iter()
                .map(|(_, info)| info)
                .collect::<Vec<_>>()
        };
        let config = BlockStoreConfig {
            dir: tmp.path().to_path_buf(),
            magic: bitcoin::Network::Regtest.magic().to_bytes(),
            max_file_size: 1024,
        };

        let blk = tmp.path().join("blk00000.dat");
        let bytes = std::fs::read(&blk).unwrap();
        std::fs::write(&blk, &bytes[..50]).unwrap();
        assert!(matches!(
            BlockStore::open(config.clone(), infos.clone()),
            Err(Error::Truncated { .. })
        ));

        std::fs::remove_file(&blk).unwrap();
        assert!(matches!(
            BlockStore::open(config, infos),
            Err(Error::MissingFile(_))
        ));
    }

    #[test]
    fn scan_skips_garbage_and_truncated_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open_store(tmp.path(), 4096);

        let a = store.append_block(b"aaaa", 1).unwrap();
        store.flush(false).unwrap();

        // Simulate a torn write followed by a successful append.
        let blk = tmp.path().join("blk00000.dat");
        let mut file = OpenOptions::new().append(true).open(&blk).unwrap();
        file.write_all(&[0u8; 5]).unwrap();
        drop(file);

        let b = store.append_block(b"bbbbbb", 2).unwrap();
        store.flush(false).unwrap();

        let mut file = OpenOptions::new().append(true).open(&blk).unwrap();
        file.write_all(&store.config.magic).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"short").unwrap();
        drop(file);

        let records = store.scan_block_file(0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pos, a);
        assert_eq!(records[0].payload, b"aaaa");
        assert_eq!(records[1].pos, b);
        assert_eq!(records[1].payload, b"bbbbbb");
    }

    #[test]
    fn oversized_record_length_is_rejected_before_reading() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open_store(tmp.path(), 1024);

        let pos = store.append_block(b"payload", 1).unwrap();
        store.flush(false).unwrap();

        let blk = tmp.path().join("blk00000.dat");
        let mut bytes = std::fs::read(&blk).unwrap();
        bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&blk, &bytes).unwrap();
        assert!(matches!(
            store.read_block_bytes(pos),
            Err(Error::Corrupt { length: u32::MAX, .. })
        ));

        // Within the size ceiling but past the end of the file.
        bytes[4..8].copy_from_slice(&512u32.to_le_bytes());
        std::fs::write(&blk, &bytes).unwrap();
        assert!(matches!(
            store.read_block_bytes(pos),
            Err(Error::Corrupt { length: 512, file_len: 15, .. })
        ));

        let undo = store.append_undo(pos.file, &block_hash(1), b"undo").unwrap();
        store.flush(false).unwrap();
        let rev = tmp.path().join("rev00000.dat");
        let mut bytes = std::fs::read(&rev).unwrap();
        bytes[4..8].copy_from_slice(&(1u32 << 30).to_le_bytes());
        std::fs::write(&rev, bytes).unwrap();
        assert!(matches!(
            store.read_undo(undo, &block_hash(1)),
            Err(Error::Corrupt { .. })
        ));
    }
}
