use crate::{Result, TxCoins};
use bitcoin::{BlockHash, Txid};
use std::collections::HashMap;

bitflags::bitflags! {
    /// State of a cache entry relative to the parent view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// The entry differs from the parent view.
        const DIRTY = 0b01;
        /// The parent view has no unspent outputs for this txid, so a fully
        /// spent entry can be dropped instead of written as a deletion.
        const FRESH = 0b10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub coins: TxCoins,
    pub flags: EntryFlags,
}

impl CacheEntry {
    pub fn new(coins: TxCoins, flags: EntryFlags) -> Self {
        Self { coins, flags }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(EntryFlags::DIRTY)
    }

    pub fn is_fresh(&self) -> bool {
        self.flags.contains(EntryFlags::FRESH)
    }

    pub(crate) fn memory_usage(&self) -> usize {
        std::mem::size_of::<(Txid, CacheEntry)>() + self.coins.memory_usage()
    }
}

pub type CoinsMap = HashMap<Txid, CacheEntry>;

/// Source of unspent transaction outputs.
pub trait CoinsView {
    /// Returns the outputs of `txid`, `None` if none of them is unspent.
    fn get_coins(&self, txid: &Txid) -> Result<Option<TxCoins>>;

    fn have_coins(&self, txid: &Txid) -> Result<bool> {
        Ok(self.get_coins(txid)?.is_some())
    }

    /// Block up to which this view reflects the chain.
    fn best_block(&self) -> Result<Option<BlockHash>>;

    /// Applies the dirty entries of a child cache and moves the best block.
    ///
    /// Either all entries are applied or none.
    fn batch_write(&mut self, entries: &CoinsMap, best_block: BlockHash) -> Result<()>;
}

impl<V: CoinsView + ?Sized> CoinsView for &mut V {
    fn get_coins(&self, txid: &Txid) -> Result<Option<TxCoins>> {
        (**self).get_coins(txid)
    }

    fn have_coins(&self, txid: &Txid) -> Result<bool> {
        (**self).have_coins(txid)
    }

    fn best_block(&self) -> Result<Option<BlockHash>> {
        (**self).best_block()
    }

    fn batch_write(&mut self, entries: &CoinsMap, best_block: BlockHash) -> Result<()> {
        (**self).batch_write(entries, best_block)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use crate::Error;
    use bitcoin::TxOut;
    use std::collections::BTreeMap;

    /// In-memory view with switchable write failures.
    #[derive(Debug, Default)]
    pub struct MemoryCoinsView {
        pub outputs: BTreeMap<(Txid, u32), (TxOut, u32, bool)>,
        pub best_block: Option<BlockHash>,
        pub fail_writes: bool,
        pub writes: usize,
        pub deletes: usize,
    }

    impl CoinsView for MemoryCoinsView {
        fn get_coins(&self, txid: &Txid) -> Result<Option<TxCoins>> {
            let mut found = self
                .outputs
                .range((*txid, 0)..=(*txid, u32::MAX))
                .peekable();
            let Some((_, (_, height, is_coinbase))) = found.peek() else {
                return Ok(None);
            };
            let mut coins = TxCoins::empty(*height, *is_coinbase);
            for ((_, vout), (txout, height, is_coinbase)) in found {
                let coin = crate::Coin::from_txout(txout, *height, *is_coinbase);
                coins.restore(*vout, &coin);
            }
            Ok(Some(coins))
        }

        fn best_block(&self) -> Result<Option<BlockHash>> {
            Ok(self.best_block)
        }

        fn batch_write(&mut self, entries: &CoinsMap, best_block: BlockHash) -> Result<()> {
            if self.fail_writes {
                return Err(Error::Backend("injected write failure".to_string()));
            }
            for (txid, entry) in entries.iter().filter(|(_, entry)| entry.is_dirty()) {
                if entry.is_fresh() && entry.coins.is_pruned() {
                    continue;
                }
                for (vout, slot) in entry.coins.slots().iter().enumerate() {
                    let key = (*txid, vout as u32);
                    match slot {
                        Some(txout) => {
                            self.writes += 1;
                            self.outputs.insert(
                                key,
                                (txout.clone(), entry.coins.height, entry.coins.is_coinbase),
                            );
                        }
                        None if !entry.is_fresh() => {
                            self.deletes += 1;
                            self.outputs.remove(&key);
                        }
                        None => {}
                    }
                }
            }
            self.best_block = Some(best_block);
            Ok(())
        }
    }
}
