use crate::coin::{Coin, OUTPOINT_KEY_SIZE, TxCoins, key_to_outpoint, outpoint_to_key};
use crate::view::{CoinsMap, CoinsView};
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, Txid};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;

/// Column family names.
mod cf {
    pub const COINS: &str = "coins";
    pub const META: &str = "meta";
}

const BEST_BLOCK_KEY: &[u8] = b"best_block";

/// Summary of the stored UTXO set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoinsStats {
    pub utxos: u64,
    pub total_amount: u64,
}

/// UTXO database, one record per unspent output keyed by txid and index.
pub struct CoinsDb {
    db: DB,
}

impl CoinsDb {
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut coins_opts = Options::default();
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        coins_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(cf::COINS, coins_opts),
            ColumnFamilyDescriptor::new(cf::META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "Opened coins database");

        Ok(Self { db })
    }

    /// Iterates over all unspent outputs in key order.
    pub fn for_each_coin(&self, mut f: impl FnMut(OutPoint, Coin)) -> Result<()> {
        let cf = self.cf(cf::COINS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let out_point = key_to_outpoint(&key).ok_or_else(|| {
                Error::Deserialization(format!("malformed coin key of {} bytes", key.len()))
            })?;
            f(out_point, Coin::decode(&value)?);
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<CoinsStats> {
        let mut stats = CoinsStats::default();
        self.for_each_coin(|_, coin| {
            stats.utxos += 1;
            stats.total_amount += coin.amount;
        })?;
        Ok(stats)
    }

    /// Deletes every coin and the best block marker.
    pub fn wipe(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        let cf_coins = self.cf(cf::COINS)?;
        for item in self.db.iterator_cf(cf_coins, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf_coins, key);
        }
        batch.delete_cf(self.cf(cf::META)?, BEST_BLOCK_KEY);
        self.db.write(batch)?;

        tracing::info!("Wiped coins database");

        Ok(())
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or(Error::MissingColumnFamily(name))
    }
}

impl CoinsView for CoinsDb {
    fn get_coins(&self, txid: &Txid) -> Result<Option<TxCoins>> {
        let cf = self.cf(cf::COINS)?;
        let prefix: &[u8] = txid.as_byte_array();

        let mut coins: Option<TxCoins> = None;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != OUTPOINT_KEY_SIZE || !key.starts_with(prefix) {
                break;
            }
            let Some(out_point) = key_to_outpoint(&key) else {
                break;
            };
            let coin = Coin::decode(&value)?;
            coins
                .get_or_insert_with(|| TxCoins::empty(coin.height, coin.is_coinbase))
                .restore(out_point.vout, &coin);
        }

        Ok(coins)
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        let cf = self.cf(cf::META)?;
        self.db
            .get_cf(cf, BEST_BLOCK_KEY)?
            .map(|bytes| {
                BlockHash::from_slice(&bytes).map_err(|err| Error::Deserialization(err.to_string()))
            })
            .transpose()
    }

    fn batch_write(&mut self, entries: &CoinsMap, best_block: BlockHash) -> Result<()> {
        let cf_coins = self.cf(cf::COINS)?;
        let mut batch = WriteBatch::default();
        let mut puts = 0usize;
        let mut deletes = 0usize;

        for (txid, entry) in entries.iter().filter(|(_, entry)| entry.is_dirty()) {
            if entry.is_fresh() && entry.coins.is_pruned() {
                continue;
            }
            for (vout, slot) in entry.coins.slots().iter().enumerate() {
                let key = outpoint_to_key(&OutPoint::new(*txid, vout as u32));
                match slot {
                    Some(txout) => {
                        let coin = Coin::from_txout(txout, entry.coins.height, entry.coins.is_coinbase);
                        batch.put_cf(cf_coins, key, coin.encode()?);
                        puts += 1;
                    }
                    None if !entry.is_fresh() => {
                        batch.delete_cf(cf_coins, key);
                        deletes += 1;
                    }
                    None => {}
                }
            }
        }

        batch.put_cf(self.cf(cf::META)?, BEST_BLOCK_KEY, best_block.as_byte_array());
        self.db.write(batch)?;

        tracing::debug!(puts, deletes, %best_block, "Wrote coins batch");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoinsViewCache;
    use bitcoin::{Amount, ScriptBuf, Transaction, TxIn, TxOut, absolute, transaction};

    fn new_tx(outputs: usize) -> Transaction {
        Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(
                    Txid::from_byte_array(std::array::from_fn(|_| fastrand::u8(..))),
                    0,
                ),
                ..Default::default()
            }],
            output: (0..outputs)
                .map(|i| TxOut {
                    value: Amount::from_sat(1_000 * (i as u64 + 1)),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51, i as u8]),
                })
                .collect(),
        }
    }

    #[test]
    fn outputs_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let tx = new_tx(3);
        let txid = tx.compute_txid();
        let best = BlockHash::from_byte_array([3u8; 32]);

        {
            let mut cache = CoinsViewCache::new(CoinsDb::open(tmp.path()).unwrap());
            cache.add_outputs(&tx, 12, false).unwrap();
            cache.spend_output(&OutPoint::new(txid, 1)).unwrap().unwrap();
            cache.set_best_block(best);
            cache.flush().unwrap();
        }

        let db = CoinsDb::open(tmp.path()).unwrap();
        assert_eq!(db.best_block().unwrap(), Some(best));
        let coins = db.get_coins(&txid).unwrap().unwrap();
        assert_eq!(coins.height, 12);
        assert!(coins.is_available(0));
        assert!(!coins.is_available(1));
        assert!(coins.is_available(2));
        assert_eq!(
            db.stats().unwrap(),
            CoinsStats {
                utxos: 2,
                total_amount: 4_000
            }
        );
    }

    #[test]
    fn lookups_do_not_leak_into_neighbouring_txids() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = CoinsViewCache::new(CoinsDb::open(tmp.path()).unwrap());
        let txs: Vec<_> = (0..20).map(|_| new_tx(1 + fastrand::usize(..4))).collect();
        for tx in &txs {
            cache.add_outputs(tx, 1, false).unwrap();
        }
        cache.set_best_block(BlockHash::all_zeros());
        cache.flush().unwrap();

        let db = cache.base();
        for tx in &txs {
            let coins = db.get_coins(&tx.compute_txid()).unwrap().unwrap();
            assert_eq!(coins.unspent().count(), tx.output.len());
        }
        assert!(db.get_coins(&Txid::all_zeros()).unwrap().is_none());
    }

    #[test]
    fn spent_transaction_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let tx = new_tx(2);
        let txid = tx.compute_txid();

        let mut cache = CoinsViewCache::new(CoinsDb::open(tmp.path()).unwrap());
        cache.add_outputs(&tx, 1, false).unwrap();
        cache.set_best_block(BlockHash::all_zeros());
        cache.flush().unwrap();
        cache.evict_clean();

        cache.spend_output(&OutPoint::new(txid, 0)).unwrap().unwrap();
        cache.spend_output(&OutPoint::new(txid, 1)).unwrap().unwrap();
        cache.flush().unwrap();

        assert!(cache.base().get_coins(&txid).unwrap().is_none());
        assert_eq!(cache.base().stats().unwrap().utxos, 0);
    }

    #[test]
    fn wipe_clears_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = CoinsViewCache::new(CoinsDb::open(tmp.path()).unwrap());
        cache.add_outputs(&new_tx(2), 1, false).unwrap();
        cache.set_best_block(BlockHash::all_zeros());
        cache.flush().unwrap();

        cache.base().wipe().unwrap();
        assert_eq!(cache.base().best_block().unwrap(), None);
        assert_eq!(cache.base().stats().unwrap(), CoinsStats::default());
    }
}
