//! In-memory store used by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver};

use bitcoin::{BlockHash, Txid};
use parking_lot::Mutex;

use super::{
    AddressChange, AddressStore, BlockStore, OutputChange, OutputStore, TransactionStore,
    WalletStore,
};
use crate::cache::Flushable;
use crate::error::StoreError;
use crate::model::{
    Address, AddressId, AddressType, Block, OutputKey, Transaction, TransactionId, TxInput,
    TxOutput, WalletId,
};

#[derive(Default)]
struct Tables {
    addresses: HashMap<AddressType, BTreeMap<AddressId, Address>>,
    outputs: BTreeMap<OutputKey, TxOutput>,
    blocks: BTreeMap<i32, Block>,
    transactions: BTreeMap<TransactionId, Transaction>,
    inputs: BTreeMap<OutputKey, TxInput>,
    wallets: BTreeSet<WalletId>,
}

type ReadHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    after_read: Mutex<Option<ReadHook>>,
    fail_next_batch: AtomicBool,
    reads: AtomicUsize,
    batches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next batch write fail after discarding its rows.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    /// Number of point/range reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of batch writes executed so far.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn put_address(&self, address: Address) {
        let address_type =
            AddressType::from_address_id(address.address_id).expect("typed address id");
        self.tables
            .lock()
            .addresses
            .entry(address_type)
            .or_default()
            .insert(address.address_id, address);
    }

    pub fn put_output(&self, output: TxOutput) {
        self.tables.lock().outputs.insert(output.key(), output);
    }

    pub fn put_transaction(&self, transaction: Transaction) {
        self.tables
            .lock()
            .transactions
            .insert(transaction.transaction_id, transaction);
    }

    pub fn put_input(&self, input: TxInput) {
        self.tables
            .lock()
            .inputs
            .insert(OutputKey::new(input.transaction_id, input.pos), input);
    }

    pub fn put_wallet(&self, wallet_id: WalletId) {
        self.tables.lock().wallets.insert(wallet_id);
    }

    /// Persisted row, bypassing every cache.
    pub fn address(&self, address_id: AddressId) -> Option<Address> {
        let address_type = AddressType::from_address_id(address_id)?;
        self.tables
            .lock()
            .addresses
            .get(&address_type)
            .and_then(|rows| rows.get(&address_id))
            .cloned()
    }

    pub fn persisted_output(&self, key: OutputKey) -> Option<TxOutput> {
        self.tables.lock().outputs.get(&key).cloned()
    }

    pub fn wallets(&self) -> BTreeSet<WalletId> {
        self.tables.lock().wallets.clone()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().blocks.len()
    }

    /// Runs `hook` once, after the next address or output read has taken
    /// its rows and before it returns them.
    pub fn after_next_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_read.lock() = Some(Box::new(hook));
    }

    /// After the next address or output read, flushes `target` on another
    /// thread and gives that flush up to 100ms to finish before the read
    /// returns. The receiver yields the flush result once it is done.
    pub fn flush_during_next_read(
        &self,
        target: Arc<dyn Flushable>,
    ) -> Receiver<Result<usize, StoreError>> {
        let (done, finished) = unbounded();
        self.after_next_read(move || {
            let (settled, waiting) = bounded(1);
            thread::spawn(move || {
                let result = target.flush_all();
                let _ = settled.send(());
                let _ = done.send(result);
            });
            let _ = waiting.recv_timeout(Duration::from_millis(100));
        });
        finished
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn served<T>(&self, rows: T) -> T {
        let hook = self.after_read.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        rows
    }

    fn batch(&self) -> Result<(), StoreError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Integrity("injected batch failure".to_string()));
        }
        Ok(())
    }
}

impl AddressStore for MemoryStore {
    fn find_by_id(
        &self,
        address_type: AddressType,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        self.read();
        let found = self
            .tables
            .lock()
            .addresses
            .get(&address_type)
            .and_then(|rows| rows.get(&address_id))
            .cloned();
        Ok(self.served(found))
    }

    fn find_by_address(
        &self,
        address_type: AddressType,
        address: &[u8],
    ) -> Result<Option<Address>, StoreError> {
        self.read();
        let found = self
            .tables
            .lock()
            .addresses
            .get(&address_type)
            .and_then(|rows| rows.values().find(|a| a.address == address))
            .cloned();
        Ok(self.served(found))
    }

    fn last_address_id(&self, address_type: AddressType) -> Result<Option<AddressId>, StoreError> {
        self.read();
        Ok(self
            .tables
            .lock()
            .addresses
            .get(&address_type)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    fn apply_address_changes(
        &self,
        address_type: AddressType,
        changes: &[AddressChange],
    ) -> Result<(), StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        let rows = tables.addresses.entry(address_type).or_default();
        for change in changes {
            match change {
                AddressChange::Insert(address) => {
                    rows.insert(address.address_id, address.clone());
                }
                AddressChange::Wallet {
                    address_id,
                    wallet_id,
                } => {
                    if let Some(row) = rows.get_mut(address_id) {
                        row.wallet_id = *wallet_id;
                    }
                }
            }
        }
        Ok(())
    }

    fn replace_wallet(
        &self,
        address_type: AddressType,
        from: WalletId,
        to: WalletId,
    ) -> Result<usize, StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        let mut updated = 0;
        if let Some(rows) = tables.addresses.get_mut(&address_type) {
            for row in rows.values_mut().filter(|a| a.wallet_id == from) {
                row.wallet_id = to;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

impl OutputStore for MemoryStore {
    fn outputs(&self, transaction_id: TransactionId) -> Result<Vec<TxOutput>, StoreError> {
        self.read();
        let found: Vec<TxOutput> = self
            .tables
            .lock()
            .outputs
            .range(OutputKey::new(transaction_id, i16::MIN)..=OutputKey::new(transaction_id, i16::MAX))
            .map(|(_, output)| output.clone())
            .collect();
        Ok(self.served(found))
    }

    fn output(&self, key: OutputKey) -> Result<Option<TxOutput>, StoreError> {
        self.read();
        let found = self.tables.lock().outputs.get(&key).cloned();
        Ok(self.served(found))
    }

    fn apply_output_changes(&self, changes: &[OutputChange]) -> Result<(), StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        for change in changes {
            match change {
                OutputChange::Insert(output) => {
                    tables.outputs.insert(output.key(), output.clone());
                }
                OutputChange::Delete(key) => {
                    tables.outputs.remove(key);
                }
                OutputChange::Status(key, status) => {
                    if let Some(row) = tables.outputs.get_mut(key) {
                        row.status = *status;
                    }
                }
                OutputChange::Address(key, address_id) => {
                    if let Some(row) = tables.outputs.get_mut(key) {
                        row.address_id = *address_id;
                    }
                }
                OutputChange::Amount(key, amount) => {
                    if let Some(row) = tables.outputs.get_mut(key) {
                        row.amount = *amount;
                    }
                }
            }
        }
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn block_by_height(&self, height: i32) -> Result<Option<Block>, StoreError> {
        self.read();
        Ok(self.tables.lock().blocks.get(&height).cloned())
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        self.read();
        Ok(self
            .tables
            .lock()
            .blocks
            .values()
            .find(|b| &b.hash == hash)
            .cloned())
    }

    fn last_block_height(&self) -> Result<Option<i32>, StoreError> {
        self.read();
        Ok(self.tables.lock().blocks.keys().next_back().copied())
    }

    fn insert_blocks(&self, blocks: &[Block]) -> Result<(), StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        for block in blocks {
            tables.blocks.insert(block.height, block.clone());
        }
        Ok(())
    }
}

impl TransactionStore for MemoryStore {
    fn transactions_in_range(
        &self,
        first: TransactionId,
        last: TransactionId,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.read();
        Ok(self
            .tables
            .lock()
            .transactions
            .range(first..=last)
            .map(|(_, tx)| tx.clone())
            .filter(|tx| tx.n_inputs > 0)
            .collect())
    }

    fn inputs(&self, transaction_id: TransactionId) -> Result<Vec<TxInput>, StoreError> {
        self.read();
        Ok(self
            .tables
            .lock()
            .inputs
            .range(OutputKey::new(transaction_id, i16::MIN)..=OutputKey::new(transaction_id, i16::MAX))
            .map(|(_, input)| input.clone())
            .collect())
    }

    fn last_transaction_id(&self) -> Result<Option<TransactionId>, StoreError> {
        self.read();
        Ok(self.tables.lock().transactions.keys().next_back().copied())
    }

    fn transaction_id_by_hash(&self, txid: &Txid) -> Result<Option<TransactionId>, StoreError> {
        self.read();
        Ok(self
            .tables
            .lock()
            .transactions
            .values()
            .find(|tx| &tx.txid == txid)
            .map(|tx| tx.transaction_id))
    }

    fn insert_transactions(&self, transactions: &[Transaction]) -> Result<(), StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        for tx in transactions {
            tables.transactions.insert(tx.transaction_id, tx.clone());
        }
        Ok(())
    }

    fn insert_inputs(&self, inputs: &[TxInput]) -> Result<(), StoreError> {
        self.batch()?;
        let mut tables = self.tables.lock();
        for input in inputs {
            tables
                .inputs
                .insert(OutputKey::new(input.transaction_id, input.pos), input.clone());
        }
        Ok(())
    }
}

impl WalletStore for MemoryStore {
    fn last_wallet_id(&self) -> Result<Option<WalletId>, StoreError> {
        self.read();
        Ok(self.tables.lock().wallets.iter().next_back().copied())
    }

    fn insert_wallets(&self, wallet_ids: &[WalletId]) -> Result<(), StoreError> {
        self.batch()?;
        self.tables.lock().wallets.extend(wallet_ids.iter().copied());
        Ok(())
    }

    fn missing_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError> {
        self.read();
        let tables = self.tables.lock();
        let referenced: BTreeSet<WalletId> = tables
            .addresses
            .values()
            .flat_map(|rows| rows.values().map(|a| a.wallet_id))
            .filter(|w| *w != 0)
            .collect();
        Ok(referenced.difference(&tables.wallets).copied().collect())
    }

    fn unused_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError> {
        self.read();
        let tables = self.tables.lock();
        let referenced: BTreeSet<WalletId> = tables
            .addresses
            .values()
            .flat_map(|rows| rows.values().map(|a| a.wallet_id))
            .collect();
        Ok(tables.wallets.difference(&referenced).copied().collect())
    }
}
