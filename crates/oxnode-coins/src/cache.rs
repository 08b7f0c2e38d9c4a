use crate::view::{CacheEntry, CoinsMap, CoinsView, EntryFlags};
use crate::{Coin, Error, Result, TxCoins};
use bitcoin::{BlockHash, OutPoint, Transaction, TxOut, Txid};

/// Write-back cache of transaction outputs over another [`CoinsView`].
///
/// Entries loaded from the base view start clean. Mutations mark them
/// [`EntryFlags::DIRTY`]. Entries created for outputs the base view has never
/// seen are also [`EntryFlags::FRESH`]: once all of their outputs are spent
/// they are dropped from the cache and never reach the base view.
pub struct CoinsViewCache<V> {
    base: V,
    entries: CoinsMap,
    best_block: Option<BlockHash>,
    cached_usage: usize,
}

impl<V: CoinsView> CoinsViewCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            entries: CoinsMap::default(),
            best_block: None,
            cached_usage: 0,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut V {
        &mut self.base
    }

    /// Loads `txid` into the cache, returns whether an entry exists afterwards.
    fn fetch(&mut self, txid: &Txid) -> Result<bool> {
        if self.entries.contains_key(txid) {
            return Ok(true);
        }
        match self.base.get_coins(txid)? {
            Some(coins) => {
                let entry = CacheEntry::new(coins, EntryFlags::empty());
                self.cached_usage += entry.memory_usage();
                self.entries.insert(*txid, entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns the unspent outputs of `txid`, loading them from the base view.
    pub fn access_coins(&mut self, txid: &Txid) -> Result<Option<&TxCoins>> {
        if !self.fetch(txid)? {
            return Ok(None);
        }
        Ok(self
            .entries
            .get(txid)
            .map(|entry| &entry.coins)
            .filter(|coins| !coins.is_pruned()))
    }

    pub fn access_output(&mut self, out_point: &OutPoint) -> Result<Option<&TxOut>> {
        Ok(self
            .access_coins(&out_point.txid)?
            .and_then(|coins| coins.output(out_point.vout)))
    }

    pub fn have_output(&mut self, out_point: &OutPoint) -> Result<bool> {
        Ok(self.access_output(out_point)?.is_some())
    }

    pub fn get_coin(&mut self, out_point: &OutPoint) -> Result<Option<Coin>> {
        Ok(self
            .access_coins(&out_point.txid)?
            .and_then(|coins| coins.coin(out_point.vout)))
    }

    /// Returns `true` if every input of `tx` refers to an unspent output.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool> {
        for input in &tx.input {
            if !self.have_output(&input.previous_output)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Looks up `txid` without inserting anything into the cache.
    pub fn peek_coins(&self, txid: &Txid) -> Result<Option<TxCoins>> {
        match self.entries.get(txid) {
            Some(entry) if entry.coins.is_pruned() => Ok(None),
            Some(entry) => Ok(Some(entry.coins.clone())),
            None => self.base.get_coins(txid),
        }
    }

    pub fn peek_coin(&self, out_point: &OutPoint) -> Result<Option<Coin>> {
        Ok(self
            .peek_coins(&out_point.txid)?
            .and_then(|coins| coins.coin(out_point.vout)))
    }

    /// Spends an output, returning the coin for the undo data.
    ///
    /// Returns `None` if the output is unknown or already spent.
    pub fn spend_output(&mut self, out_point: &OutPoint) -> Result<Option<Coin>> {
        if !self.fetch(&out_point.txid)? {
            return Ok(None);
        }
        let Some(entry) = self.entries.get_mut(&out_point.txid) else {
            return Ok(None);
        };
        let before = entry.memory_usage();
        let Some(coin) = entry.coins.spend(out_point.vout) else {
            return Ok(None);
        };
        entry.flags |= EntryFlags::DIRTY;
        let after = entry.memory_usage();
        let drop_entry = entry.is_fresh() && entry.coins.is_pruned();

        self.cached_usage -= before;
        if drop_entry {
            self.entries.remove(&out_point.txid);
        } else {
            self.cached_usage += after;
        }
        Ok(Some(coin))
    }

    /// Adds the spendable outputs of `tx` created at `height`.
    ///
    /// Fails with [`Error::OverwriteUnspent`] if outputs of a transaction with
    /// the same txid are still unspent, unless `allow_overwrite` is set.
    pub fn add_outputs(&mut self, tx: &Transaction, height: u32, allow_overwrite: bool) -> Result<()> {
        let txid = tx.compute_txid();
        let coins = TxCoins::from_tx(tx, height);
        self.fetch(&txid)?;

        match self.entries.get_mut(&txid) {
            Some(entry) => {
                if !entry.coins.is_pruned() && !allow_overwrite {
                    return Err(Error::OverwriteUnspent(txid));
                }
                let before = entry.memory_usage();
                entry.coins.replace_with(&coins);
                entry.flags |= EntryFlags::DIRTY;
                let after = entry.memory_usage();
                let drop_entry = entry.is_fresh() && entry.coins.is_pruned();

                self.cached_usage -= before;
                if drop_entry {
                    self.entries.remove(&txid);
                } else {
                    self.cached_usage += after;
                }
            }
            None => {
                if coins.is_pruned() {
                    return Ok(());
                }
                let entry = CacheEntry::new(coins, EntryFlags::DIRTY | EntryFlags::FRESH);
                self.cached_usage += entry.memory_usage();
                self.entries.insert(txid, entry);
            }
        }

        Ok(())
    }

    /// Puts back a coin recorded in undo data.
    ///
    /// The entry is marked DIRTY but not FRESH since the base view may still
    /// hold a deletion for it. Returns `false` if the output was already
    /// present, which means the disconnect is unclean.
    pub fn restore_coin(&mut self, out_point: &OutPoint, coin: &Coin) -> Result<bool> {
        self.fetch(&out_point.txid)?;

        let before = self
            .entries
            .get(&out_point.txid)
            .map_or(0, CacheEntry::memory_usage);
        let entry = self.entries.entry(out_point.txid).or_insert_with(|| {
            CacheEntry::new(
                TxCoins::empty(coin.height, coin.is_coinbase),
                EntryFlags::empty(),
            )
        });
        if entry.coins.is_pruned() {
            entry.coins.height = coin.height;
            entry.coins.is_coinbase = coin.is_coinbase;
        }
        let clean = entry.coins.restore(out_point.vout, coin);
        entry.flags |= EntryFlags::DIRTY;
        self.cached_usage = self.cached_usage - before + entry.memory_usage();

        Ok(clean)
    }

    /// Block the cached state corresponds to, falling back to the base view.
    pub fn best_block_hash(&self) -> Result<Option<BlockHash>> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }

    pub fn set_best_block(&mut self, hash: BlockHash) {
        self.best_block = Some(hash);
    }

    /// Writes every dirty entry to the base view in one batch.
    ///
    /// On success spent entries are dropped and the rest become clean. On
    /// failure the cache is left untouched so the flush can be retried.
    pub fn flush(&mut self) -> Result<()> {
        let best_block = self.best_block_hash()?.ok_or(Error::MissingBestBlock)?;

        let dirty = self.dirty_count();
        self.base.batch_write(&self.entries, best_block)?;

        self.entries.retain(|_, entry| !entry.coins.is_pruned());
        for entry in self.entries.values_mut() {
            entry.flags = EntryFlags::empty();
        }
        self.best_block = Some(best_block);
        self.recompute_usage();

        tracing::trace!(dirty, %best_block, "Flushed coins cache");

        Ok(())
    }

    /// Drops all clean entries.
    pub fn evict_clean(&mut self) {
        self.entries.retain(|_, entry| entry.is_dirty());
        self.recompute_usage();
    }

    /// Drops every entry, dirty ones included, and forgets the best block.
    ///
    /// Only meaningful after the base view was wiped.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.best_block = None;
        self.cached_usage = 0;
    }

    /// Drops the entry for `txid` if it is clean.
    pub fn uncache(&mut self, txid: &Txid) {
        if self
            .entries
            .get(txid)
            .is_some_and(|entry| !entry.is_dirty())
        {
            if let Some(entry) = self.entries.remove(txid) {
                self.cached_usage -= entry.memory_usage();
            }
        }
    }

    /// Approximate memory used by the cached entries in bytes.
    pub fn memory_usage(&self) -> usize {
        self.cached_usage
    }

    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_dirty()).count()
    }

    pub fn entry(&self, txid: &Txid) -> Option<&CacheEntry> {
        self.entries.get(txid)
    }

    fn recompute_usage(&mut self) {
        self.cached_usage = self.entries.values().map(CacheEntry::memory_usage).sum();
    }
}

impl<V: CoinsView> CoinsView for CoinsViewCache<V> {
    fn get_coins(&self, txid: &Txid) -> Result<Option<TxCoins>> {
        self.peek_coins(txid)
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        self.best_block_hash()
    }

    fn batch_write(&mut self, entries: &CoinsMap, best_block: BlockHash) -> Result<()> {
        let dirty = || entries.iter().filter(|(_, entry)| entry.is_dirty());

        // Validate first so a rejected batch leaves this cache unchanged.
        for (txid, child) in dirty() {
            if child.is_fresh()
                && self
                    .entries
                    .get(txid)
                    .is_some_and(|parent| !parent.coins.is_pruned())
            {
                return Err(Error::FreshOverwrite(*txid));
            }
        }

        for (txid, child) in dirty() {
            match self.entries.get_mut(txid) {
                None => {
                    if child.is_fresh() && child.coins.is_pruned() {
                        continue;
                    }
                    let flags = if child.is_fresh() {
                        EntryFlags::DIRTY | EntryFlags::FRESH
                    } else {
                        EntryFlags::DIRTY
                    };
                    let entry = CacheEntry::new(child.coins.clone(), flags);
                    self.cached_usage += entry.memory_usage();
                    self.entries.insert(*txid, entry);
                }
                Some(parent) => {
                    let before = parent.memory_usage();
                    if parent.is_fresh() && child.coins.is_pruned() {
                        self.cached_usage -= before;
                        self.entries.remove(txid);
                    } else {
                        parent.coins.replace_with(&child.coins);
                        parent.flags |= EntryFlags::DIRTY;
                        self.cached_usage = self.cached_usage - before + parent.memory_usage();
                    }
                }
            }
        }

        self.best_block = Some(best_block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::memory::MemoryCoinsView;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, TxIn, absolute, transaction};

    fn random_hash() -> [u8; 32] {
        std::array::from_fn(|_| fastrand::u8(..))
    }

    fn new_tx(values: &[u64]) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(random_hash()),
                    vout: 0,
                },
                ..Default::default()
            }],
            output: values
                .iter()
                .map(|value| TxOut {
                    value: Amount::from_sat(*value),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                })
                .collect(),
        }
    }

    fn best() -> BlockHash {
        BlockHash::from_byte_array(random_hash())
    }

    #[test]
    fn fresh_output_spent_before_flush_never_reaches_base() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[1000]);
        let out_point = OutPoint::new(tx.compute_txid(), 0);

        cache.add_outputs(&tx, 1, false).unwrap();
        assert!(cache.entry(&out_point.txid).unwrap().is_fresh());
        let coin = cache.spend_output(&out_point).unwrap().unwrap();
        assert_eq!(coin.amount, 1000);
        assert!(cache.entry(&out_point.txid).is_none());

        cache.set_best_block(best());
        cache.flush().unwrap();
        assert_eq!(cache.base().writes, 0);
        assert_eq!(cache.base().deletes, 0);
    }

    #[test]
    fn spending_a_stored_output_writes_a_deletion() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[10, 20]);
        let txid = tx.compute_txid();
        cache.add_outputs(&tx, 1, false).unwrap();
        cache.set_best_block(best());
        cache.flush().unwrap();
        assert_eq!(cache.base().outputs.len(), 2);

        cache.evict_clean();
        assert_eq!(cache.cache_size(), 0);

        cache.spend_output(&OutPoint::new(txid, 1)).unwrap().unwrap();
        assert!(!cache.entry(&txid).unwrap().is_fresh());
        cache.flush().unwrap();
        assert_eq!(cache.base().outputs.len(), 1);
        assert!(cache.base().get_coins(&txid).unwrap().unwrap().is_available(0));
    }

    #[test]
    fn failed_flush_keeps_dirty_entries() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[5]);
        let txid = tx.compute_txid();
        cache.add_outputs(&tx, 3, false).unwrap();
        let hash = best();
        cache.set_best_block(hash);

        cache.base_mut().fail_writes = true;
        assert!(cache.flush().is_err());
        assert_eq!(cache.dirty_count(), 1);
        assert!(cache.base().outputs.is_empty());
        assert!(cache.base().best_block.is_none());

        cache.base_mut().fail_writes = false;
        cache.flush().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.base().best_block, Some(hash));
        assert!(cache.base().have_coins(&txid).unwrap());
    }

    #[test]
    fn flush_without_best_block_fails() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        cache.add_outputs(&new_tx(&[1]), 1, false).unwrap();
        assert!(matches!(cache.flush(), Err(Error::MissingBestBlock)));
    }

    #[test]
    fn overwriting_unspent_outputs_is_rejected() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[7]);
        cache.add_outputs(&tx, 1, false).unwrap();
        assert!(matches!(
            cache.add_outputs(&tx, 2, false),
            Err(Error::OverwriteUnspent(_))
        ));
        cache.add_outputs(&tx, 2, true).unwrap();
        assert_eq!(cache.entry(&tx.compute_txid()).unwrap().coins.height, 2);

        cache.spend_output(&OutPoint::new(tx.compute_txid(), 0)).unwrap();
        cache.add_outputs(&tx, 3, false).unwrap();
    }

    #[test]
    fn unspendable_outputs_are_not_tracked() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let mut tx = new_tx(&[0]);
        tx.output[0].script_pubkey = ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x01]);
        cache.add_outputs(&tx, 1, false).unwrap();
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn restore_marks_dirty_but_not_fresh() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[42]);
        let out_point = OutPoint::new(tx.compute_txid(), 0);
        cache.add_outputs(&tx, 9, true).unwrap();
        cache.set_best_block(best());
        cache.flush().unwrap();

        let coin = cache.spend_output(&out_point).unwrap().unwrap();
        assert!(cache.restore_coin(&out_point, &coin).unwrap());
        let entry = cache.entry(&out_point.txid).unwrap();
        assert!(entry.is_dirty());
        assert!(!entry.is_fresh());
        assert!(!cache.restore_coin(&out_point, &coin).unwrap());
        assert_eq!(cache.get_coin(&out_point).unwrap(), Some(coin));
    }

    #[test]
    fn child_cache_merges_into_parent() {
        let mut parent = CoinsViewCache::new(MemoryCoinsView::default());
        let stored = new_tx(&[100, 200]);
        parent.add_outputs(&stored, 1, false).unwrap();
        parent.set_best_block(best());
        parent.flush().unwrap();

        let created = new_tx(&[300]);
        let transient = new_tx(&[400]);
        let tip = best();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_output(&OutPoint::new(stored.compute_txid(), 0)).unwrap().unwrap();
            child.add_outputs(&created, 2, false).unwrap();
            child.add_outputs(&transient, 2, false).unwrap();
            child
                .spend_output(&OutPoint::new(transient.compute_txid(), 0))
                .unwrap()
                .unwrap();
            child.set_best_block(tip);
            child.flush().unwrap();
        }

        assert_eq!(parent.best_block_hash().unwrap(), Some(tip));
        assert!(parent.entry(&transient.compute_txid()).is_none());
        assert!(parent.entry(&created.compute_txid()).unwrap().is_fresh());
        assert!(!parent.have_output(&OutPoint::new(stored.compute_txid(), 0)).unwrap());
        assert!(parent.have_output(&OutPoint::new(stored.compute_txid(), 1)).unwrap());

        parent.flush().unwrap();
        assert_eq!(parent.base().outputs.len(), 2);
        assert_eq!(parent.base().best_block, Some(tip));
    }

    #[test]
    fn dropped_child_leaves_parent_untouched() {
        let mut parent = CoinsViewCache::new(MemoryCoinsView::default());
        let tx = new_tx(&[1]);
        parent.add_outputs(&tx, 1, false).unwrap();
        let before = parent.entry(&tx.compute_txid()).cloned();
        {
            let mut child = CoinsViewCache::new(&mut parent);
            child.spend_output(&OutPoint::new(tx.compute_txid(), 0)).unwrap();
        }
        assert_eq!(parent.entry(&tx.compute_txid()).cloned(), before);
    }

    #[test]
    fn memory_usage_tracks_entries() {
        let mut cache = CoinsViewCache::new(MemoryCoinsView::default());
        assert_eq!(cache.memory_usage(), 0);
        for _ in 0..10 {
            cache.add_outputs(&new_tx(&[1, 2, 3]), 1, false).unwrap();
        }
        let used = cache.memory_usage();
        assert!(used > 0);
        cache.set_best_block(best());
        cache.flush().unwrap();
        assert_eq!(cache.memory_usage(), used);
        cache.evict_clean();
        assert_eq!(cache.memory_usage(), 0);
    }
}
