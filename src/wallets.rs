//! Wallet clustering.
//!
//! Addresses spent together as inputs of one transaction belong to the same
//! owner. The engine walks transactions in id order, gives unassigned input
//! addresses a wallet and merges wallets that turn out to share an owner.
//!
//! Each batch runs in two phases. Classification fans the batch out over a
//! worker pool and only reads: a transaction needs work when one of its
//! input addresses has no wallet or when they span more than one wallet.
//! Resolution then walks the flagged transactions in id order on the
//! calling thread, re-reading wallet ids since earlier transactions of the
//! same batch may have changed them.

pub mod cursor;
pub mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use serde::Deserialize;
use threadpool::ThreadPool;
use tracing::{debug, info, warn};

use crate::cache::router::AddressRouter;
use crate::cache::output::OutputCache;
use crate::cache::Caches;
use crate::error::{StoreError, WalletError};
use crate::model::{Address, AddressType, Transaction, TransactionId, WalletId, UNASSIGNED_WALLET};
use crate::store::{Store, TransactionStore, WalletStore};
use cursor::{Cursor, StopSignal};
use pool::FreeWallets;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    /// Transaction id to start from, or the path of a cursor file.
    pub start_from: String,
    pub batch_size: i32,
    pub threads: usize,
    pub stop_file: PathBuf,
    pub idle_wait_secs: u64,
    pub exit_when_caught_up: bool,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            start_from: "1".to_string(),
            batch_size: 10_000,
            threads: 20,
            stop_file: PathBuf::from("/tmp/btc-update-wallet-stop"),
            idle_wait_secs: 30,
            exit_when_caught_up: false,
        }
    }
}

/// Counters of one batch, or of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub transactions: usize,
    pub flagged: usize,
    /// Transactions with inputs but no input address that could be resolved.
    pub skipped: usize,
    pub new_wallets: usize,
    pub merged: usize,
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, other: Self) {
        self.transactions += other.transactions;
        self.flagged += other.flagged;
        self.skipped += other.skipped;
        self.new_wallets += other.new_wallets;
        self.merged += other.merged;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Consistent,
    NeedsAction,
    Unresolvable,
}

/// Resolves the distinct input addresses of a transaction. Cloned into
/// every classification task.
#[derive(Clone)]
struct InputAddresses {
    transactions: Arc<dyn TransactionStore>,
    outputs: Arc<OutputCache>,
    addresses: Arc<AddressRouter>,
}

impl InputAddresses {
    fn of(&self, transaction_id: TransactionId) -> Result<Vec<Address>, StoreError> {
        let mut found = BTreeMap::new();
        for input in self.transactions.inputs(transaction_id)? {
            let spent = input.spent_output();
            let Some(output) = self.outputs.get_output(spent)? else {
                warn!(
                    "Input {}:{} spends unknown output {}:{}",
                    input.transaction_id, input.pos, spent.transaction_id, spent.pos
                );
                continue;
            };
            if output.address_id == 0 {
                continue;
            }
            match self.addresses.get_address(output.address_id)? {
                Some(address) => {
                    found.insert(address.address_id, address);
                }
                None => warn!(
                    "Output {}:{} refers to unknown address {}",
                    output.transaction_id, output.pos, output.address_id
                ),
            }
        }
        Ok(found.into_values().collect())
    }

    /// Flags the transaction when its input addresses are not all in one
    /// assigned wallet.
    fn needs_action(&self, transaction_id: TransactionId) -> Result<Verdict, StoreError> {
        let wallets: BTreeSet<WalletId> = self
            .of(transaction_id)?
            .iter()
            .map(|address| address.wallet_id)
            .collect();
        if wallets.is_empty() {
            warn!("Transaction {} has no resolvable input addresses", transaction_id);
            return Ok(Verdict::Unresolvable);
        }
        if wallets.contains(&UNASSIGNED_WALLET) || wallets.len() > 1 {
            Ok(Verdict::NeedsAction)
        } else {
            Ok(Verdict::Consistent)
        }
    }
}

pub struct WalletClusterer {
    transactions: Arc<dyn TransactionStore>,
    wallet_store: Arc<dyn WalletStore>,
    caches: Arc<Caches>,
    inputs: InputAddresses,
    free_wallets: FreeWallets,
    settings: WalletSettings,
    transaction_pool: ThreadPool,
    partition_pool: ThreadPool,
}

impl WalletClusterer {
    pub fn new<S: Store + 'static>(store: Arc<S>, caches: Arc<Caches>, settings: WalletSettings) -> Self {
        let transactions: Arc<dyn TransactionStore> = store.clone();
        let inputs = InputAddresses {
            transactions: transactions.clone(),
            outputs: caches.outputs.clone(),
            addresses: caches.addresses.clone(),
        };
        Self {
            transactions,
            wallet_store: store,
            inputs,
            caches,
            free_wallets: FreeWallets::new(),
            transaction_pool: ThreadPool::with_name(
                "classify".to_string(),
                settings.threads.max(1),
            ),
            partition_pool: ThreadPool::with_name(
                "replace-wallet".to_string(),
                AddressType::ALL.len(),
            ),
            settings,
        }
    }

    pub fn free_wallets(&self) -> &FreeWallets {
        &self.free_wallets
    }

    /// Runs batches from the cursor until the stop signal fires or, with
    /// `exit_when_caught_up`, until no transaction is left.
    pub fn run(
        &self,
        cursor: &mut Cursor,
        stop: &dyn StopSignal,
    ) -> Result<BatchStats, WalletError> {
        info!(
            "Updating wallets from transaction {} in batches of {} using {} threads",
            cursor.position(),
            self.settings.batch_size,
            self.settings.threads
        );
        self.reconcile()?;

        let batch_size = self.settings.batch_size.max(1);
        let mut totals = BatchStats::default();
        let mut first = cursor.position();
        loop {
            cursor.store(first)?;
            if stop.should_stop() {
                info!("Stop requested, next transaction is {}", first);
                break;
            }

            let last_known = self.transactions.last_transaction_id()?.unwrap_or(0);
            if first > last_known {
                if self.settings.exit_when_caught_up {
                    info!("Caught up at transaction {}", last_known);
                    break;
                }
                debug!(
                    "Caught up at transaction {}, waiting {}s",
                    last_known, self.settings.idle_wait_secs
                );
                thread::sleep(Duration::from_secs(self.settings.idle_wait_secs));
                continue;
            }

            let last = first.saturating_add(batch_size - 1);
            let stats = self.process_batch(first, last)?;
            self.caches.checkpoint()?;
            totals += stats;
            first = last.saturating_add(1);
        }
        info!(
            "Processed {} transactions: {} new wallet assignments, {} wallets merged",
            totals.transactions, totals.new_wallets, totals.merged
        );
        Ok(totals)
    }

    /// Brings wallet rows in line with the addresses: records wallet ids in
    /// use without a row and makes rows no address uses reusable.
    pub fn reconcile(&self) -> Result<(), WalletError> {
        let missing = self.wallet_store.missing_wallet_ids()?;
        if !missing.is_empty() {
            info!("Recording {} missing wallet rows", missing.len());
            self.caches.wallets.record(&missing);
            self.caches.checkpoint()?;
        }
        let unused = self.wallet_store.unused_wallet_ids()?;
        if !unused.is_empty() {
            warn!(
                "{} wallets are not used by any address and will be reused",
                unused.len()
            );
            self.free_wallets.extend(unused);
        }
        Ok(())
    }

    pub fn process_batch(
        &self,
        first: TransactionId,
        last: TransactionId,
    ) -> Result<BatchStats, WalletError> {
        let transactions = self.transactions.transactions_in_range(first, last)?;
        let (flagged, skipped) = self.classify(&transactions)?;
        let mut stats = BatchStats {
            transactions: transactions.len(),
            flagged: flagged.len(),
            skipped,
            ..BatchStats::default()
        };
        for transaction_id in flagged {
            self.resolve(transaction_id, &mut stats)?;
        }
        if stats.new_wallets > 0 || stats.merged > 0 {
            info!(
                "Transactions {}..={}: {} flagged, {} new wallet assignments, {} merged",
                first, last, stats.flagged, stats.new_wallets, stats.merged
            );
        } else {
            debug!(
                "Transactions {}..={}: {} checked, nothing to do",
                first, last, stats.transactions
            );
        }
        if stats.skipped > 0 {
            warn!(
                "Transactions {}..={}: {} skipped without resolvable input addresses",
                first, last, stats.skipped
            );
        }
        Ok(stats)
    }

    /// Ids of the transactions that need resolving, in ascending order, and
    /// how many could not be resolved at all.
    fn classify(
        &self,
        transactions: &[Transaction],
    ) -> Result<(Vec<TransactionId>, usize), WalletError> {
        let (sender, receiver) = unbounded();
        let mut expected = 0;
        for transaction in transactions.iter().filter(|t| t.n_inputs > 0) {
            let sender = sender.clone();
            let inputs = self.inputs.clone();
            let transaction_id = transaction.transaction_id;
            self.transaction_pool.execute(move || {
                let verdict = inputs.needs_action(transaction_id);
                let _ = sender.send((transaction_id, verdict));
            });
            expected += 1;
        }
        drop(sender);

        let mut flagged = Vec::new();
        let mut skipped = 0;
        let mut failure = None;
        for _ in 0..expected {
            let (transaction_id, verdict) =
                receiver.recv().map_err(|_| WalletError::WorkerLost)?;
            match verdict {
                Ok(Verdict::NeedsAction) => flagged.push(transaction_id),
                Ok(Verdict::Unresolvable) => skipped += 1,
                Ok(Verdict::Consistent) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e.into());
        }
        flagged.sort_unstable();
        Ok((flagged, skipped))
    }

    fn resolve(&self, transaction_id: TransactionId, stats: &mut BatchStats) -> Result<(), WalletError> {
        let addresses = self.inputs.of(transaction_id)?;
        if addresses.is_empty() {
            warn!("Transaction {} has no resolvable input addresses", transaction_id);
            return Ok(());
        }
        let mut wallets: BTreeSet<WalletId> = addresses.iter().map(|a| a.wallet_id).collect();

        if wallets.remove(&UNASSIGNED_WALLET) {
            let target = match wallets.first() {
                Some(existing) => *existing,
                None => self.next_wallet_id()?,
            };
            for address in addresses.iter().filter(|a| a.wallet_id == UNASSIGNED_WALLET) {
                self.caches.addresses.update_wallet(address.address_id, target);
            }
            wallets.insert(target);
            stats.new_wallets += 1;
        }

        if wallets.len() > 1 {
            let mut merging = wallets.iter().copied();
            if let Some(keep) = merging.next() {
                for replace in merging {
                    self.merge(keep, replace)?;
                    stats.merged += 1;
                }
            }
        }
        Ok(())
    }

    fn next_wallet_id(&self) -> Result<WalletId, WalletError> {
        match self.free_wallets.take() {
            Some(reused) => Ok(reused),
            None => Ok(self.caches.wallets.allocate()?),
        }
    }

    /// Moves every address of wallet `replace` into wallet `keep` across all
    /// partitions, then frees `replace`.
    fn merge(&self, keep: WalletId, replace: WalletId) -> Result<(), WalletError> {
        if keep == UNASSIGNED_WALLET || replace == UNASSIGNED_WALLET || keep == replace {
            return Err(WalletError::InvalidMerge { keep, replace });
        }

        let (sender, receiver) = unbounded();
        let partitions = self.caches.addresses.partitions();
        for partition in partitions {
            let partition = partition.clone();
            let sender = sender.clone();
            self.partition_pool.execute(move || {
                let _ = sender.send(partition.replace_wallet(replace, keep));
            });
        }
        drop(sender);

        let mut updated = 0;
        let mut failure = None;
        for _ in 0..partitions.len() {
            match receiver.recv().map_err(|_| WalletError::WorkerLost)? {
                Ok(n) => updated += n,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e.into());
        }
        self.free_wallets.release(replace);
        debug!(
            "Merged wallet {} into {} ({} addresses)",
            replace, keep, updated
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
