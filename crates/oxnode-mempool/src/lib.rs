//! Pool of validated transactions waiting for confirmation, and the fee
//! estimator fed by their confirmation times.
//!
//! The mempool validates transactions against the chain UTXO set layered
//! under its own outputs ([`MempoolCoinsView`]), so chains of unconfirmed
//! transactions are accepted. Callers keep it consistent with the chain by
//! reporting connected blocks through [`Mempool::remove_for_block`] and
//! reorgs through [`Mempool::reinsert_disconnected`] and
//! [`Mempool::remove_for_reorg`].

mod coins_view;
mod error;
pub mod fee_estimator;
mod options;
mod pool;
mod types;

pub use self::coins_view::MempoolCoinsView;
pub use self::error::MempoolError;
pub use self::fee_estimator::{FeeEstimator, FeeEstimatorConfig};
pub use self::options::{MempoolOptions, MempoolOptionsBuilder};
pub use self::pool::Mempool;
pub use self::types::{Accepted, FeeRate, MempoolEntry, MempoolInfo, RemovalReason, TipContext};
