use std::sync::Arc;

use bitcoin::Txid;
use parking_lot::Mutex;

use super::queue::{Pending, QueueLimits, WriteQueue};
use super::read::ReadCache;
use super::Flushable;
use crate::error::StoreError;
use crate::model::{OutputKey, Transaction, TransactionId, TxInput};
use crate::store::TransactionStore;

impl Pending for Transaction {
    type Key = TransactionId;
    type View = Transaction;

    fn key(&self) -> TransactionId {
        self.transaction_id
    }

    fn fold(&self, _staged: Option<Transaction>) -> Transaction {
        self.clone()
    }
}

impl Pending for TxInput {
    type Key = OutputKey;
    type View = TxInput;

    fn key(&self) -> OutputKey {
        OutputKey::new(self.transaction_id, self.pos)
    }

    fn fold(&self, _staged: Option<TxInput>) -> TxInput {
        self.clone()
    }
}

/// Assigns transaction ids during ingestion and resolves txids back to them.
pub struct TransactionCache {
    queue: WriteQueue<Transaction>,
    ids: Mutex<ReadCache<Txid, TransactionId>>,
    last_transaction_id: Mutex<Option<TransactionId>>,
    store: Arc<dyn TransactionStore>,
}

impl TransactionCache {
    pub fn new(store: Arc<dyn TransactionStore>, limits: QueueLimits, capacity: usize) -> Self {
        Self {
            queue: WriteQueue::new("transaction", limits),
            ids: Mutex::new(ReadCache::new(capacity)),
            last_transaction_id: Mutex::new(None),
            store,
        }
    }

    pub fn add(
        &self,
        txid: Txid,
        block_height: i32,
        n_inputs: i32,
        n_outputs: i32,
    ) -> Result<Transaction, StoreError> {
        let transaction = Transaction {
            transaction_id: self.next_transaction_id()?,
            txid,
            block_height,
            n_inputs,
            n_outputs,
        };
        self.queue.add(transaction.clone());
        self.ids.lock().insert(txid, transaction.transaction_id);
        Ok(transaction)
    }

    pub fn find_id(&self, txid: &Txid) -> Result<Option<TransactionId>, StoreError> {
        // Rows are immutable, so tier order only affects speed.
        if let Some(id) = self.ids.lock().get(txid) {
            return Ok(Some(*id));
        }
        if let Some((id, _)) = self
            .queue
            .staged_matching(|_, tx| &tx.txid == txid)
            .into_iter()
            .next()
        {
            return Ok(Some(id));
        }
        let persisted = self.store.transaction_id_by_hash(txid)?;
        if let Some(id) = persisted {
            self.ids.lock().insert(*txid, id);
        }
        Ok(persisted)
    }

    fn next_transaction_id(&self) -> Result<TransactionId, StoreError> {
        let mut last = self.last_transaction_id.lock();
        let current = match *last {
            Some(id) => id,
            None => self.store.last_transaction_id()?.unwrap_or(0),
        };
        let next = current + 1;
        *last = Some(next);
        Ok(next)
    }
}

impl Flushable for TransactionCache {
    fn name(&self) -> &str {
        self.queue.name()
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn need_flush(&self) -> bool {
        self.queue.need_flush()
    }

    fn flush(&self) -> Result<usize, StoreError> {
        self.queue
            .flush(|batch| self.store.insert_transactions(batch))
    }
}

/// Write-only queue of transaction inputs.
pub struct InputWriter {
    queue: WriteQueue<TxInput>,
    store: Arc<dyn TransactionStore>,
}

impl InputWriter {
    pub fn new(store: Arc<dyn TransactionStore>, limits: QueueLimits) -> Self {
        Self {
            queue: WriteQueue::new("input", limits),
            store,
        }
    }

    pub fn add(&self, input: TxInput) {
        self.queue.add(input);
    }
}

impl Flushable for InputWriter {
    fn name(&self) -> &str {
        self.queue.name()
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn need_flush(&self) -> bool {
        self.queue.need_flush()
    }

    fn flush(&self) -> Result<usize, StoreError> {
        self.queue.flush(|batch| self.store.insert_inputs(batch))
    }
}
