//! UTXO view layering the mempool over the chain UTXO set.
//!
//! - Outputs of mempool transactions are visible at [`MEMPOOL_HEIGHT`].
//! - Outputs spent by mempool transactions appear spent.

use crate::pool::Mempool;
use bitcoin::{BlockHash, OutPoint, Txid};
use oxnode_coins::{CoinsMap, CoinsView, TxCoins};
use oxnode_primitives::MEMPOOL_HEIGHT;

/// Read-only view of the chain UTXO set as seen by the mempool.
pub struct MempoolCoinsView<'a, V> {
    base: &'a V,
    pool: &'a Mempool,
}

impl<'a, V: CoinsView> MempoolCoinsView<'a, V> {
    pub fn new(base: &'a V, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }
}

impl<V: CoinsView> CoinsView for MempoolCoinsView<'_, V> {
    fn get_coins(&self, txid: &Txid) -> oxnode_coins::Result<Option<TxCoins>> {
        let coins = match self.pool.get(txid) {
            Some(entry) => Some(TxCoins::from_tx(&entry.tx, MEMPOOL_HEIGHT)),
            None => self.base.get_coins(txid)?,
        };

        let Some(mut coins) = coins else {
            return Ok(None);
        };

        for vout in 0..coins.len() as u32 {
            if self.pool.spender(&OutPoint::new(*txid, vout)).is_some() {
                coins.spend(vout);
            }
        }

        Ok((!coins.is_pruned()).then_some(coins))
    }

    fn best_block(&self) -> oxnode_coins::Result<Option<BlockHash>> {
        self.base.best_block()
    }

    fn batch_write(&mut self, _entries: &CoinsMap, _best_block: BlockHash) -> oxnode_coins::Result<()> {
        Err(oxnode_coins::Error::Backend(
            "Mempool coins view is read only".to_string(),
        ))
    }
}
