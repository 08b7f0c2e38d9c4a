use crate::coins_view::MempoolCoinsView;
use crate::error::MempoolError;
use crate::fee_estimator::FeeEstimator;
use crate::options::MempoolOptions;
use crate::types::{Accepted, FeeRate, MempoolEntry, MempoolInfo, RemovalReason, TipContext};
use bitcoin::{Amount, Block, OutPoint, Transaction, Txid};
use oxnode_coins::{CoinsView, CoinsViewCache};
use oxnode_primitives::consensus::{check_transaction_sanity, is_final};
use oxnode_primitives::script::ScriptVerifier;
use oxnode_primitives::{COINBASE_MATURITY, MEMPOOL_HEIGHT};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Half-life of the rolling minimum fee, in seconds.
const ROLLING_FEE_HALFLIFE: u64 = 60 * 60 * 12;

/// Inputs of a transaction that passed validation.
struct Validated {
    fee: Amount,
    parents: HashSet<Txid>,
    spends_coinbase: bool,
    priority: f64,
}

/// Pool of validated transactions waiting for confirmation.
pub struct Mempool {
    options: MempoolOptions,
    verifier: Arc<dyn ScriptVerifier>,
    entries: HashMap<Txid, MempoolEntry>,
    /// Outpoint -> mempool transaction spending it.
    map_next_tx: HashMap<OutPoint, Txid>,
    /// Sum of the serialized sizes of all entries.
    total_bytes: usize,
    total_fee: Amount,
    /// Fee rate in sat/kvB evicted transactions had to beat.
    rolling_minimum_fee: f64,
    last_rolling_fee_update: u64,
    block_since_last_rolling_fee_bump: bool,
    fee_estimator: FeeEstimator,
}

impl Mempool {
    pub fn new(options: MempoolOptions, verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self {
            options,
            verifier,
            entries: HashMap::new(),
            map_next_tx: HashMap::new(),
            total_bytes: 0,
            total_fee: Amount::ZERO,
            rolling_minimum_fee: 0.0,
            last_rolling_fee_update: 0,
            block_since_last_rolling_fee_bump: false,
            fee_estimator: FeeEstimator::default(),
        }
    }

    pub fn with_fee_estimator(mut self, fee_estimator: FeeEstimator) -> Self {
        self.fee_estimator = fee_estimator;
        self
    }

    pub fn options(&self) -> &MempoolOptions {
        &self.options
    }

    pub fn fee_estimator(&self) -> &FeeEstimator {
        &self.fee_estimator
    }

    /// Fee rate needed to confirm within `target` blocks.
    pub fn estimate_fee(&self, target: usize) -> Option<FeeRate> {
        self.fee_estimator.estimate_fee(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn get_transaction(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.entries.get(txid).map(|entry| entry.tx.clone())
    }

    /// Returns the mempool transaction spending `out_point`.
    pub fn spender(&self, out_point: &OutPoint) -> Option<Txid> {
        self.map_next_tx.get(out_point).copied()
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.entries.keys().copied().collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_fee(&self) -> Amount {
        self.total_fee
    }

    pub fn info(&self) -> MempoolInfo {
        MempoolInfo {
            size: self.entries.len(),
            bytes: self.total_bytes,
            total_fee: self.total_fee,
            max_bytes: self.options.max_size_bytes(),
            min_fee: self.rolling_fee_rate().max(self.options.min_relay_fee_rate),
        }
    }

    fn rolling_fee_rate(&self) -> FeeRate {
        if self.rolling_minimum_fee == 0.0 {
            return FeeRate::ZERO;
        }
        FeeRate(self.rolling_minimum_fee.round() as u64).max(self.options.incremental_relay_fee_rate)
    }

    /// Returns the minimum fee rate to get into the mempool given its current
    /// size, excluding the minimum relay fee.
    ///
    /// The rate rises when transactions are evicted for size and decays with
    /// a 12h half-life once a block has been connected since the last rise.
    pub fn get_min_fee(&mut self, now: u64) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_fee == 0.0 {
            return FeeRate(self.rolling_minimum_fee.round() as u64);
        }

        if now > self.last_rolling_fee_update + 10 {
            let size_limit = self.options.max_size_bytes();
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            if self.total_bytes < size_limit / 4 {
                halflife /= 4.0;
            } else if self.total_bytes < size_limit / 2 {
                halflife /= 2.0;
            }

            let elapsed = (now - self.last_rolling_fee_update) as f64;
            self.rolling_minimum_fee /= 2f64.powf(elapsed / halflife);
            self.last_rolling_fee_update = now;

            if self.rolling_minimum_fee < self.options.incremental_relay_fee_rate.0 as f64 / 2.0 {
                self.rolling_minimum_fee = 0.0;
                return FeeRate::ZERO;
            }
        }

        self.rolling_fee_rate()
    }

    /// Validates `tx` against the chain UTXO set in `view` layered under the
    /// mempool and adds it to the pool.
    pub fn accept<V: CoinsView>(
        &mut self,
        tx: Transaction,
        view: &V,
        tip: TipContext,
        now: u64,
        allow_high_fee: bool,
    ) -> Result<Accepted, MempoolError> {
        self.accept_inner(Arc::new(tx), view, tip, now, allow_high_fee, false)
    }

    fn accept_inner<V: CoinsView>(
        &mut self,
        tx: Arc<Transaction>,
        view: &V,
        tip: TipContext,
        now: u64,
        allow_high_fee: bool,
        bypass_limits: bool,
    ) -> Result<Accepted, MempoolError> {
        check_transaction_sanity(&tx)?;

        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase);
        }

        if !is_final(&tx, tip.height + 1, tip.median_time_past) {
            return Err(MempoolError::NonFinal);
        }

        let txid = tx.compute_txid();

        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyInMempool);
        }

        // No replacement: the first transaction spending an output wins.
        for input in &tx.input {
            if let Some(spender) = self.map_next_tx.get(&input.previous_output) {
                return Err(MempoolError::Conflict(*spender));
            }
        }

        let validated = self.validate(&tx, txid, view, tip)?;

        let size = tx.total_size();
        let vsize = tx.vsize() as u64;
        let fee = validated.fee;
        let fee_rate = FeeRate::from_amount_and_vsize(fee, vsize);

        if !bypass_limits {
            let min_fee_rate = self.get_min_fee(now).max(self.options.min_relay_fee_rate);
            if fee < min_fee_rate.get_fee(vsize) {
                return Err(MempoolError::InsufficientFee {
                    min_kvb: min_fee_rate.as_sat_per_kvb(),
                    actual_kvb: fee_rate.as_sat_per_kvb(),
                });
            }
        }

        if !allow_high_fee {
            let max = self.options.max_fee_rate.get_fee(vsize);
            if fee > max {
                return Err(MempoolError::AbsurdFee { fee, max });
            }
        }

        self.check_scripts(&tx, view)?;

        self.insert_entry(MempoolEntry {
            tx,
            txid,
            fee,
            size,
            vsize,
            time: now,
            entry_height: tip.height,
            priority: validated.priority,
            spends_coinbase: validated.spends_coinbase,
            parents: validated.parents,
            children: HashSet::new(),
        });

        if !bypass_limits {
            self.fee_estimator.process_transaction(txid, tip.height, fee_rate);

            self.trim_to_size(self.options.max_size_bytes());
            if !self.entries.contains_key(&txid) {
                return Err(MempoolError::MempoolFull);
            }
        }

        tracing::debug!(%txid, %fee, vsize, "Accepted transaction into mempool");

        Ok(Accepted { txid, fee, vsize })
    }

    fn validate<V: CoinsView>(
        &self,
        tx: &Transaction,
        txid: Txid,
        view: &V,
        tip: TipContext,
    ) -> Result<Validated, MempoolError> {
        let mut coins = CoinsViewCache::new(MempoolCoinsView::new(view, self));

        if coins.access_coins(&txid)?.is_some() {
            return Err(MempoolError::AlreadyConfirmed);
        }

        let mut missing = Vec::new();
        for input in &tx.input {
            if !coins.have_output(&input.previous_output)? {
                missing.push(input.previous_output.txid);
            }
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(MempoolError::MissingInputs { parents: missing });
        }

        let spend_height = tip.height + 1;
        let mut value_in = Amount::ZERO;
        let mut parents = HashSet::new();
        let mut spends_coinbase = false;
        let mut coin_age = 0f64;

        for input in &tx.input {
            let prevout = input.previous_output;
            let coin = coins
                .get_coin(&prevout)?
                .ok_or_else(|| MempoolError::MissingInputs {
                    parents: vec![prevout.txid],
                })?;

            if coin.height == MEMPOOL_HEIGHT {
                parents.insert(prevout.txid);
            } else {
                coin_age += coin.amount as f64 * spend_height.saturating_sub(coin.height) as f64;
            }

            if coin.is_coinbase {
                spends_coinbase = true;
                if spend_height.saturating_sub(coin.height) < COINBASE_MATURITY {
                    return Err(MempoolError::PrematureCoinbaseSpend);
                }
            }

            value_in = value_in
                .checked_add(Amount::from_sat(coin.amount))
                .filter(|total| *total <= Amount::MAX_MONEY)
                .ok_or(MempoolError::InputValueOverflow)?;
        }

        let value_out = tx
            .output
            .iter()
            .try_fold(Amount::ZERO, |acc, out| acc.checked_add(out.value))
            .ok_or(MempoolError::NegativeFee)?;

        let fee = value_in
            .checked_sub(value_out)
            .ok_or(MempoolError::NegativeFee)?;

        Ok(Validated {
            fee,
            parents,
            spends_coinbase,
            priority: coin_age / tx.total_size().max(1) as f64,
        })
    }

    fn check_scripts<V: CoinsView>(&self, tx: &Transaction, view: &V) -> Result<(), MempoolError> {
        let coins = CoinsViewCache::new(MempoolCoinsView::new(view, self));
        let tx_bytes = bitcoin::consensus::serialize(tx);

        for (index, input) in tx.input.iter().enumerate() {
            let coin = coins
                .peek_coin(&input.previous_output)?
                .ok_or_else(|| MempoolError::MissingInputs {
                    parents: vec![input.previous_output.txid],
                })?;

            self.verifier
                .verify(&coin.to_txout(), &tx_bytes, index, self.options.script_flags)
                .map_err(|err| MempoolError::ScriptValidationFailed(err.to_string()))?;
        }

        Ok(())
    }

    fn insert_entry(&mut self, mut entry: MempoolEntry) {
        let txid = entry.txid;

        for input in &entry.tx.input {
            self.map_next_tx.insert(input.previous_output, txid);
        }

        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(txid);
            }
        }

        // Transactions re-added after a reorg may already have spenders in the pool.
        for vout in 0..entry.tx.output.len() as u32 {
            if let Some(child) = self.map_next_tx.get(&OutPoint::new(txid, vout)).copied() {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.insert(txid);
                    entry.children.insert(child);
                }
            }
        }

        self.total_bytes += entry.size;
        self.total_fee = self.total_fee.checked_add(entry.fee).unwrap_or(Amount::MAX_MONEY);
        self.entries.insert(txid, entry);
    }

    fn remove_entry(&mut self, txid: &Txid, reason: RemovalReason) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;

        for input in &entry.tx.input {
            if self.map_next_tx.get(&input.previous_output) == Some(txid) {
                self.map_next_tx.remove(&input.previous_output);
            }
        }

        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.remove(txid);
            }
        }

        for child in &entry.children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.remove(txid);
            }
        }

        self.total_bytes -= entry.size;
        self.total_fee = self.total_fee.checked_sub(entry.fee).unwrap_or(Amount::ZERO);

        if reason != RemovalReason::Block {
            self.fee_estimator.remove_transaction(txid);
        }

        tracing::trace!(%txid, reason = reason.as_str(), "Removed transaction from mempool");

        Some(entry)
    }

    /// Returns `txid` and every in-mempool transaction depending on it.
    pub fn descendants(&self, txid: &Txid) -> HashSet<Txid> {
        let mut descendants = HashSet::new();
        let mut stack = vec![*txid];
        while let Some(id) = stack.pop() {
            if let Some(entry) = self.entries.get(&id) {
                if descendants.insert(id) {
                    stack.extend(entry.children.iter().copied());
                }
            }
        }
        descendants
    }

    fn remove_with_descendants(&mut self, txid: &Txid, reason: RemovalReason) -> Vec<MempoolEntry> {
        self.descendants(txid)
            .into_iter()
            .filter_map(|id| self.remove_entry(&id, reason))
            .collect()
    }

    /// Removes the transactions confirmed by `block` and every mempool
    /// transaction conflicting with them.
    ///
    /// Returns the number of transactions removed for conflicts.
    pub fn remove_for_block(&mut self, block: &Block, height: u32, now: u64) -> usize {
        let txids: Vec<Txid> = block.txdata.iter().map(|tx| tx.compute_txid()).collect();

        let confirmed: Vec<(Txid, FeeRate)> = txids
            .iter()
            .filter_map(|txid| self.entries.get(txid).map(|entry| (*txid, entry.fee_rate())))
            .collect();

        self.fee_estimator
            .process_block(height, confirmed.iter().map(|(txid, rate)| (txid, *rate)));

        for txid in &txids {
            self.remove_entry(txid, RemovalReason::Block);
        }

        let mut conflicts = 0;
        for tx in block.txdata.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.input {
                if let Some(spender) = self.map_next_tx.get(&input.previous_output).copied() {
                    conflicts += self.remove_with_descendants(&spender, RemovalReason::Conflict).len();
                }
            }
        }

        self.last_rolling_fee_update = now;
        self.block_since_last_rolling_fee_bump = true;

        if !confirmed.is_empty() || conflicts > 0 {
            tracing::debug!(
                height,
                confirmed = confirmed.len(),
                conflicts,
                "Updated mempool for connected block"
            );
        }

        conflicts
    }

    /// Offers transactions of disconnected blocks back to the pool.
    ///
    /// Fee limits are bypassed, transactions failing any other check are
    /// dropped. Returns the number of transactions re-added.
    pub fn reinsert_disconnected<V: CoinsView>(
        &mut self,
        txs: impl IntoIterator<Item = Arc<Transaction>>,
        view: &V,
        tip: TipContext,
        now: u64,
    ) -> usize {
        let mut added = 0;
        for tx in txs.into_iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.compute_txid();
            match self.accept_inner(tx, view, tip, now, true, true) {
                Ok(_) => added += 1,
                Err(err) => tracing::debug!(%txid, "Dropped disconnected transaction: {err}"),
            }
        }
        self.trim_to_size(self.options.max_size_bytes());
        added
    }

    /// Removes transactions that became invalid after the tip moved back:
    /// inputs that no longer exist, coinbase inputs that are no longer
    /// mature, lock times that are no longer final.
    pub fn remove_for_reorg<V: CoinsView>(&mut self, view: &V, tip: TipContext) -> Result<usize, MempoolError> {
        let spend_height = tip.height + 1;
        let mut invalid = Vec::new();

        for (txid, entry) in &self.entries {
            if !is_final(&entry.tx, spend_height, tip.median_time_past) {
                invalid.push(*txid);
                continue;
            }

            for input in &entry.tx.input {
                let prevout = input.previous_output;
                if self.entries.contains_key(&prevout.txid) {
                    continue;
                }
                let coin = view
                    .get_coins(&prevout.txid)?
                    .and_then(|coins| coins.coin(prevout.vout));
                let valid = match coin {
                    Some(coin) => {
                        !coin.is_coinbase || spend_height.saturating_sub(coin.height) >= COINBASE_MATURITY
                    }
                    None => false,
                };
                if !valid {
                    invalid.push(*txid);
                    break;
                }
            }
        }

        let removed = invalid
            .iter()
            .map(|txid| self.remove_with_descendants(txid, RemovalReason::Reorg).len())
            .sum();

        if removed > 0 {
            tracing::debug!(removed, height = tip.height, "Removed transactions invalidated by reorg");
        }

        Ok(removed)
    }

    /// Removes transactions older than `max_age` along with their descendants.
    pub fn expire(&mut self, now: u64, max_age: std::time::Duration) -> usize {
        let cutoff = now.saturating_sub(max_age.as_secs());
        let expired: Vec<Txid> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();

        let removed = expired
            .iter()
            .map(|txid| self.remove_with_descendants(txid, RemovalReason::Expiry).len())
            .sum();

        if removed > 0 {
            tracing::debug!(removed, "Expired mempool transactions");
        }

        removed
    }

    /// Package of `txid` and its descendants: fee rate of the whole package
    /// and the larger of that rate and the entry's own rate.
    fn descendant_score(&self, txid: &Txid) -> (FeeRate, FeeRate) {
        let (fees, vsize) = self
            .descendants(txid)
            .iter()
            .filter_map(|id| self.entries.get(id))
            .fold((0u64, 0u64), |(fees, vsize), entry| {
                (fees + entry.fee.to_sat(), vsize + entry.vsize)
            });
        let package_rate = FeeRate::from_amount_and_vsize(Amount::from_sat(fees), vsize);
        let own_rate = self.entries.get(txid).map(MempoolEntry::fee_rate).unwrap_or_default();
        (package_rate, package_rate.max(own_rate))
    }

    /// Evicts packages with the lowest descendant score until the pool
    /// takes at most `max_bytes`, raising the rolling minimum fee above the
    /// rate of every evicted package.
    pub fn trim_to_size(&mut self, max_bytes: usize) -> usize {
        let mut removed = 0;
        let mut max_fee_rate_removed = FeeRate::ZERO;

        while self.total_bytes > max_bytes {
            let Some((txid, package_rate)) = self
                .entries
                .keys()
                .map(|txid| {
                    let (package_rate, score) = self.descendant_score(txid);
                    (*txid, package_rate, score)
                })
                .min_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)))
                .map(|(txid, package_rate, _)| (txid, package_rate))
            else {
                break;
            };

            let evicted_rate = package_rate.saturating_add(self.options.incremental_relay_fee_rate);
            if evicted_rate.0 as f64 > self.rolling_minimum_fee {
                self.rolling_minimum_fee = evicted_rate.0 as f64;
                self.block_since_last_rolling_fee_bump = false;
            }
            max_fee_rate_removed = max_fee_rate_removed.max(evicted_rate);

            removed += self.remove_with_descendants(&txid, RemovalReason::SizeLimit).len();
        }

        if removed > 0 {
            tracing::debug!(removed, %max_fee_rate_removed, "Trimmed mempool to size limit");
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::BlockHash;
    use oxnode_coins::{CoinsMap, TxCoins};
    use oxnode_primitives::script::{NoScriptVerification, ScriptError};
    use oxnode_test_utils::{coinbase_tx, spend_tx};
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    #[derive(Default)]
    struct TestUtxos(HashMap<Txid, TxCoins>);

    impl TestUtxos {
        fn add(&mut self, tx: &Transaction, height: u32) {
            self.0.insert(tx.compute_txid(), TxCoins::from_tx(tx, height));
        }
    }

    impl CoinsView for TestUtxos {
        fn get_coins(&self, txid: &Txid) -> oxnode_coins::Result<Option<TxCoins>> {
            Ok(self.0.get(txid).cloned())
        }

        fn best_block(&self) -> oxnode_coins::Result<Option<BlockHash>> {
            Ok(None)
        }

        fn batch_write(&mut self, _: &CoinsMap, _: BlockHash) -> oxnode_coins::Result<()> {
            Ok(())
        }
    }

    fn tip(height: u32) -> TipContext {
        TipContext {
            height,
            median_time_past: 1_600_000_000,
        }
    }

    fn btc(sat: u64) -> Amount {
        Amount::from_sat(sat)
    }

    /// Chain with one mature coinbase per extra nonce.
    fn funded_utxos(count: u32) -> (TestUtxos, Vec<OutPoint>) {
        let mut utxos = TestUtxos::default();
        let out_points = (0..count)
            .map(|i| {
                let coinbase = coinbase_tx(1, i, btc(50_000));
                utxos.add(&coinbase, 1);
                OutPoint::new(coinbase.compute_txid(), 0)
            })
            .collect();
        (utxos, out_points)
    }

    fn mempool() -> Mempool {
        Mempool::new(MempoolOptions::default(), Arc::new(NoScriptVerification))
    }

    #[test]
    fn chained_transactions_are_accepted() {
        let (utxos, funds) = funded_utxos(1);
        let mut pool = mempool();

        let parent = spend_tx(&funds, &[btc(40_000)]);
        let parent_txid = pool.accept(parent, &utxos, tip(200), NOW, false).unwrap().txid;

        let child = spend_tx(&[OutPoint::new(parent_txid, 0)], &[btc(30_000)]);
        let accepted = pool.accept(child, &utxos, tip(200), NOW, false).unwrap();

        assert_eq!(accepted.fee, btc(10_000));
        assert_eq!(pool.len(), 2);
        let entry = pool.get(&accepted.txid).unwrap();
        assert_eq!(entry.parents().collect::<Vec<_>>(), vec![&parent_txid]);
        assert!(!entry.spends_coinbase);
        assert!(pool.get(&parent_txid).unwrap().spends_coinbase);
        assert_eq!(pool.spender(&funds[0]), Some(parent_txid));
        assert_eq!(pool.total_fee(), btc(20_000));
    }

    #[test]
    fn missing_inputs_report_parents() {
        let (utxos, _) = funded_utxos(0);
        let mut pool = mempool();
        let unknown = OutPoint::new(oxnode_test_utils::random_txid(), 3);

        let err = pool
            .accept(spend_tx(&[unknown], &[btc(1_000)]), &utxos, tip(200), NOW, false)
            .unwrap_err();

        assert!(matches!(err, MempoolError::MissingInputs { parents } if parents == vec![unknown.txid]));
    }

    #[test]
    fn double_spend_conflicts() {
        let (utxos, funds) = funded_utxos(1);
        let mut pool = mempool();

        let first = pool
            .accept(spend_tx(&funds, &[btc(40_000)]), &utxos, tip(200), NOW, false)
            .unwrap();
        let err = pool
            .accept(spend_tx(&funds, &[btc(30_000)]), &utxos, tip(200), NOW, false)
            .unwrap_err();

        assert!(matches!(err, MempoolError::Conflict(txid) if txid == first.txid));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn fee_below_relay_minimum_is_rejected() {
        let (utxos, funds) = funded_utxos(1);
        let mut pool = mempool();

        let err = pool
            .accept(spend_tx(&funds, &[btc(50_000)]), &utxos, tip(200), NOW, false)
            .unwrap_err();

        assert!(matches!(err, MempoolError::InsufficientFee { min_kvb: 1000, actual_kvb: 0 }));
    }

    #[test]
    fn absurd_fee_requires_permission() {
        let (utxos, funds) = funded_utxos(1);
        let options = MempoolOptions::builder().max_fee_rate(FeeRate(10_000)).build();
        let mut pool = Mempool::new(options, Arc::new(NoScriptVerification));
        let tx = spend_tx(&funds, &[btc(1_000)]);

        let err = pool.accept(tx.clone(), &utxos, tip(200), NOW, false).unwrap_err();
        assert!(matches!(err, MempoolError::AbsurdFee { .. }));

        pool.accept(tx, &utxos, tip(200), NOW, true).unwrap();
    }

    #[test]
    fn immature_coinbase_and_coinbase_txs_are_rejected() {
        let (utxos, funds) = funded_utxos(1);
        let mut pool = mempool();

        let err = pool
            .accept(spend_tx(&funds, &[btc(40_000)]), &utxos, tip(99), NOW, false)
            .unwrap_err();
        assert!(matches!(err, MempoolError::PrematureCoinbaseSpend));

        let err = pool
            .accept(coinbase_tx(5, 0, btc(100)), &utxos, tip(99), NOW, false)
            .unwrap_err();
        assert!(matches!(err, MempoolError::Coinbase));
    }

    #[test]
    fn confirmed_transaction_is_not_accepted_again() {
        let (mut utxos, funds) = funded_utxos(1);
        let mut pool = mempool();
        let tx = spend_tx(&funds, &[btc(40_000)]);
        utxos.add(&tx, 150);

        let err = pool.accept(tx, &utxos, tip(200), NOW, false).unwrap_err();
        assert!(matches!(err, MempoolError::AlreadyConfirmed));
    }

    #[test]
    fn failing_scripts_are_rejected() {
        struct RejectAll;

        impl ScriptVerifier for RejectAll {
            fn verify(&self, _: &bitcoin::TxOut, _: &[u8], input_index: usize, _: u32) -> Result<(), ScriptError> {
                Err(ScriptError {
                    input_index,
                    reason: "rejected".to_string(),
                })
            }
        }

        let (utxos, funds) = funded_utxos(1);
        let mut pool = Mempool::new(MempoolOptions::default(), Arc::new(RejectAll));

        let err = pool
            .accept(spend_tx(&funds, &[btc(40_000)]), &utxos, tip(200), NOW, false)
            .unwrap_err();
        assert!(matches!(err, MempoolError::ScriptValidationFailed(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn block_removes_confirmed_and_conflicting_transactions() {
        let (mut utxos, funds) = funded_utxos(2);
        let mut pool = mempool();

        let confirmed = spend_tx(&funds[..1], &[btc(40_000)]);
        let confirmed_txid = pool.accept(confirmed.clone(), &utxos, tip(200), NOW, false).unwrap().txid;
        let child = pool
            .accept(
                spend_tx(&[OutPoint::new(confirmed_txid, 0)], &[btc(39_000)]),
                &utxos,
                tip(200),
                NOW,
                false,
            )
            .unwrap()
            .txid;

        let loser = pool
            .accept(spend_tx(&funds[1..], &[btc(40_000)]), &utxos, tip(200), NOW, false)
            .unwrap()
            .txid;
        let loser_child = pool
            .accept(
                spend_tx(&[OutPoint::new(loser, 0)], &[btc(39_000)]),
                &utxos,
                tip(200),
                NOW,
                false,
            )
            .unwrap()
            .txid;

        // The block confirms `confirmed` and a different spend of the second coinbase.
        let winner = spend_tx(&funds[1..], &[btc(45_000)]);
        let block = Block {
            header: oxnode_test_utils::Miner::new().genesis().header,
            txdata: vec![coinbase_tx(201, 0, btc(50_000)), confirmed.clone(), winner.clone()],
        };
        utxos.add(&confirmed, 201);
        utxos.add(&winner, 201);

        let conflicts = pool.remove_for_block(&block, 201, NOW);

        assert_eq!(conflicts, 2);
        assert!(!pool.contains(&confirmed_txid));
        assert!(!pool.contains(&loser));
        assert!(!pool.contains(&loser_child));
        assert!(pool.contains(&child));
        assert_eq!(pool.get(&child).unwrap().parents().count(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn trimming_raises_the_minimum_fee() {
        let (utxos, funds) = funded_utxos(3);
        let mut pool = mempool();

        let cheap = pool
            .accept(spend_tx(&funds[..1], &[btc(49_000)]), &utxos, tip(200), NOW, false)
            .unwrap();
        let pricey = pool
            .accept(spend_tx(&funds[1..2], &[btc(40_000)]), &utxos, tip(200), NOW, false)
            .unwrap();

        let limit = pool.total_bytes() - 1;
        assert_eq!(pool.trim_to_size(limit), 1);
        assert!(!pool.contains(&cheap.txid));
        assert!(pool.contains(&pricey.txid));

        let cheap_rate = FeeRate::from_amount_and_vsize(cheap.fee, cheap.vsize);
        let min_fee = pool.get_min_fee(NOW);
        assert_eq!(min_fee, cheap_rate.saturating_add(FeeRate(1000)));

        // Paying the evicted rate is no longer enough.
        let err = pool
            .accept(spend_tx(&funds[2..], &[btc(49_000)]), &utxos, tip(200), NOW, false)
            .unwrap_err();
        assert!(matches!(err, MempoolError::InsufficientFee { .. }));

        // The rate decays once a block is connected.
        let block = Block {
            header: oxnode_test_utils::Miner::new().genesis().header,
            txdata: vec![coinbase_tx(201, 0, btc(50_000))],
        };
        pool.remove_for_block(&block, 201, NOW);
        assert_eq!(pool.get_min_fee(NOW), min_fee);
        let later = pool.get_min_fee(NOW + 2 * 60 * 60 * 12);
        assert!(later < min_fee);
    }

    #[test]
    fn expiry_removes_descendants() {
        let (utxos, funds) = funded_utxos(2);
        let mut pool = mempool();

        let old = pool
            .accept(spend_tx(&funds[..1], &[btc(40_000)]), &utxos, tip(200), NOW, false)
            .unwrap()
            .txid;
        let old_child = pool
            .accept(
                spend_tx(&[OutPoint::new(old, 0)], &[btc(39_000)]),
                &utxos,
                tip(200),
                NOW + 7200,
                false,
            )
            .unwrap()
            .txid;
        let fresh = pool
            .accept(spend_tx(&funds[1..], &[btc(40_000)]), &utxos, tip(200), NOW + 7200, false)
            .unwrap()
            .txid;

        assert_eq!(pool.expire(NOW + 3600 + 1, Duration::from_secs(3600)), 2);
        assert!(!pool.contains(&old_child));
        assert!(pool.contains(&fresh));
        assert_eq!(pool.spender(&funds[0]), None);
    }

    #[test]
    fn reorg_drops_transactions_with_vanished_inputs() {
        let (mut utxos, funds) = funded_utxos(1);
        let mut pool = mempool();

        // A transaction that was confirmed in a block that is now disconnected.
        let disconnected = spend_tx(&funds, &[btc(40_000)]);
        utxos.add(&disconnected, 201);
        let child = pool
            .accept(
                spend_tx(&[OutPoint::new(disconnected.compute_txid(), 0)], &[btc(39_000)]),
                &utxos,
                tip(201),
                NOW,
                false,
            )
            .unwrap()
            .txid;

        utxos.0.remove(&disconnected.compute_txid());
        let readded = pool.reinsert_disconnected([Arc::new(disconnected.clone())], &utxos, tip(200), NOW);
        assert_eq!(readded, 1);
        assert_eq!(pool.remove_for_reorg(&utxos, tip(200)).unwrap(), 0);
        assert_eq!(
            pool.get(&child).unwrap().parents().copied().collect::<Vec<_>>(),
            vec![disconnected.compute_txid()]
        );

        // The funding coinbase vanishes too, taking the whole chain with it.
        utxos.0.remove(&funds[0].txid);
        assert_eq!(pool.remove_for_reorg(&utxos, tip(100)).unwrap(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.total_bytes(), 0);
    }
}
