use crate::{Coin, Error, Result};
use serde::{Deserialize, Serialize};

/// Coins spent by the inputs of one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub prevouts: Vec<Coin>,
}

/// Undo data of a block, one [`TxUndo`] per non-coinbase transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| Error::Deserialization(err.to_string()))
    }
}
