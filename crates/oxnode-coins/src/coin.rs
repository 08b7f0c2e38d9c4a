use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};

/// Size of a database key: txid followed by the big-endian output index.
///
/// The index is big-endian so that all outputs of a transaction are adjacent
/// and sorted in the database.
pub const OUTPOINT_KEY_SIZE: usize = 32 + 4;

pub fn outpoint_to_key(out_point: &OutPoint) -> [u8; OUTPOINT_KEY_SIZE] {
    let mut key = [0u8; OUTPOINT_KEY_SIZE];
    key[..32].copy_from_slice(out_point.txid.as_byte_array());
    key[32..].copy_from_slice(&out_point.vout.to_be_bytes());
    key
}

pub fn key_to_outpoint(key: &[u8]) -> Option<OutPoint> {
    if key.len() != OUTPOINT_KEY_SIZE {
        return None;
    }
    let txid = Txid::from_slice(&key[..32]).ok()?;
    let vout = u32::from_be_bytes(key[32..].try_into().ok()?);
    Some(OutPoint { txid, vout })
}

/// Single unspent output as stored in the database and in undo data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Whether the coin is from a coinbase transaction.
    pub is_coinbase: bool,
    /// Transfer value in satoshis.
    pub amount: u64,
    /// Block height at which this containing transaction was included.
    pub height: u32,
    /// Spending condition of the output.
    pub script_pubkey: Vec<u8>,
}

impl Coin {
    pub fn from_txout(txout: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            is_coinbase,
            amount: txout.value.to_sat(),
            height,
            script_pubkey: txout.script_pubkey.to_bytes(),
        }
    }

    pub fn to_txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: ScriptBuf::from_bytes(self.script_pubkey.clone()),
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        bincode::deserialize(bytes).map_err(|err| crate::Error::Deserialization(err.to_string()))
    }
}

/// Outputs of one transaction tracked by the coins cache.
///
/// Spent outputs are `None`. The vector is never shortened once loaded, the
/// trailing `None` slots tell the database which keys to delete on flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCoins {
    pub height: u32,
    pub is_coinbase: bool,
    outputs: Vec<Option<TxOut>>,
}

impl TxCoins {
    /// Creates the output set of a newly connected transaction.
    ///
    /// Provably unspendable outputs never enter the set.
    pub fn from_tx(tx: &Transaction, height: u32) -> Self {
        let outputs = tx
            .output
            .iter()
            .map(|txout| (!txout.script_pubkey.is_op_return()).then(|| txout.clone()))
            .collect();
        Self {
            height,
            is_coinbase: tx.is_coinbase(),
            outputs,
        }
    }

    pub fn from_outputs(height: u32, is_coinbase: bool, outputs: Vec<Option<TxOut>>) -> Self {
        Self {
            height,
            is_coinbase,
            outputs,
        }
    }

    pub fn empty(height: u32, is_coinbase: bool) -> Self {
        Self::from_outputs(height, is_coinbase, Vec::new())
    }

    /// Returns `true` if every output has been spent.
    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn is_available(&self, vout: u32) -> bool {
        self.output(vout).is_some()
    }

    pub fn output(&self, vout: u32) -> Option<&TxOut> {
        self.outputs.get(vout as usize).and_then(Option::as_ref)
    }

    pub fn coin(&self, vout: u32) -> Option<Coin> {
        self.output(vout)
            .map(|txout| Coin::from_txout(txout, self.height, self.is_coinbase))
    }

    /// Number of output slots, spent ones included.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Iterates over the unspent outputs with their index.
    pub fn unspent(&self) -> impl Iterator<Item = (u32, &TxOut)> {
        self.outputs
            .iter()
            .enumerate()
            .filter_map(|(vout, txout)| txout.as_ref().map(|txout| (vout as u32, txout)))
    }

    pub(crate) fn slots(&self) -> &[Option<TxOut>] {
        &self.outputs
    }

    /// Marks the output as spent and returns the coin that was there.
    pub fn spend(&mut self, vout: u32) -> Option<Coin> {
        let coin = self.coin(vout)?;
        self.outputs[vout as usize] = None;
        Some(coin)
    }

    /// Puts a coin back into its slot. Returns `false` if the slot was
    /// already occupied.
    pub fn restore(&mut self, vout: u32, coin: &Coin) -> bool {
        let index = vout as usize;
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        let was_empty = self.outputs[index].is_none();
        self.outputs[index] = Some(coin.to_txout());
        was_empty
    }

    /// Replaces the outputs with `other`'s while keeping enough slots to
    /// delete every output previously tracked.
    pub fn replace_with(&mut self, other: &TxCoins) {
        let len = self.outputs.len().max(other.outputs.len());
        self.height = other.height;
        self.is_coinbase = other.is_coinbase;
        self.outputs.clone_from(&other.outputs);
        self.outputs.resize(len, None);
    }

    /// Rough number of heap bytes used by this entry.
    pub fn memory_usage(&self) -> usize {
        self.outputs.capacity() * std::mem::size_of::<Option<TxOut>>()
            + self
                .outputs
                .iter()
                .flatten()
                .map(|txout| txout.script_pubkey.len())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txout(value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }
    }

    #[test]
    fn outpoint_key_roundtrip_keeps_order() {
        let txid = Txid::from_byte_array([7u8; 32]);
        let a = outpoint_to_key(&OutPoint { txid, vout: 1 });
        let b = outpoint_to_key(&OutPoint { txid, vout: 256 });
        assert!(a < b);
        assert_eq!(key_to_outpoint(&b), Some(OutPoint { txid, vout: 256 }));
        assert_eq!(key_to_outpoint(&b[..10]), None);
    }

    #[test]
    fn spend_and_restore() {
        let mut coins = TxCoins::from_outputs(5, false, vec![Some(txout(1)), Some(txout(2))]);
        let coin = coins.spend(1).unwrap();
        assert_eq!(coin.amount, 2);
        assert_eq!(coin.height, 5);
        assert!(coins.spend(1).is_none());
        assert!(!coins.is_pruned());
        coins.spend(0).unwrap();
        assert!(coins.is_pruned());
        assert_eq!(coins.len(), 2);

        assert!(coins.restore(1, &coin));
        assert!(!coins.restore(1, &coin));
        assert_eq!(coins.unspent().count(), 1);
    }

    #[test]
    fn replace_keeps_slots_for_deletion() {
        let mut old = TxCoins::from_outputs(1, false, vec![None, None, None]);
        let new = TxCoins::from_outputs(9, true, vec![Some(txout(3))]);
        old.replace_with(&new);
        assert_eq!(old.len(), 3);
        assert_eq!(old.height, 9);
        assert!(old.is_available(0));
        assert!(!old.is_available(2));
    }
}
