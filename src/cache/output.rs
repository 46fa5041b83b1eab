use std::sync::Arc;

use parking_lot::Mutex;

use super::queue::{Pending, QueueLimits, WriteQueue};
use super::read::ReadCache;
use super::Flushable;
use crate::error::StoreError;
use crate::model::{AddressId, OutputKey, TransactionId, TxOutput};
use crate::store::{OutputChange, OutputStore};

/// Net effect of the staged changes of one output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPatch {
    insert: Option<TxOutput>,
    deleted: bool,
    status: Option<i16>,
    address_id: Option<AddressId>,
    amount: Option<i64>,
}

impl OutputPatch {
    fn is_complete(&self) -> bool {
        self.deleted || self.insert.is_some()
    }

    fn apply(&self, persisted: Option<TxOutput>) -> Option<TxOutput> {
        if self.deleted {
            return None;
        }
        let mut output = self.insert.clone().or(persisted)?;
        if let Some(status) = self.status {
            output.status = status;
        }
        if let Some(address_id) = self.address_id {
            output.address_id = address_id;
        }
        if let Some(amount) = self.amount {
            output.amount = amount;
        }
        Some(output)
    }
}

impl Pending for OutputChange {
    type Key = OutputKey;
    type View = OutputPatch;

    fn key(&self) -> OutputKey {
        OutputChange::key(self)
    }

    fn fold(&self, staged: Option<OutputPatch>) -> OutputPatch {
        let mut patch = staged.unwrap_or_default();
        match self {
            OutputChange::Insert(output) => {
                patch = OutputPatch {
                    insert: Some(output.clone()),
                    ..OutputPatch::default()
                }
            }
            OutputChange::Delete(_) => {
                patch = OutputPatch {
                    deleted: true,
                    ..OutputPatch::default()
                }
            }
            OutputChange::Status(_, status) => patch.status = Some(*status),
            OutputChange::Address(_, address_id) => patch.address_id = Some(*address_id),
            OutputChange::Amount(_, amount) => patch.amount = Some(*amount),
        }
        patch
    }
}

/// Outputs of one transaction ordered by position. `complete` is set once
/// the list reflects every persisted and pending output of the transaction.
#[derive(Debug, Clone, Default)]
struct OutputsList {
    outputs: Vec<TxOutput>,
    complete: bool,
}

impl OutputsList {
    fn find(&self, pos: i16) -> Option<&TxOutput> {
        self.outputs
            .binary_search_by_key(&pos, |o| o.pos)
            .ok()
            .map(|i| &self.outputs[i])
    }

    fn find_mut(&mut self, pos: i16) -> Option<&mut TxOutput> {
        match self.outputs.binary_search_by_key(&pos, |o| o.pos) {
            Ok(i) => Some(&mut self.outputs[i]),
            Err(_) => None,
        }
    }

    fn merge(&mut self, output: TxOutput) {
        match self.outputs.binary_search_by_key(&output.pos, |o| o.pos) {
            Ok(i) => self.outputs[i] = output,
            Err(i) => self.outputs.insert(i, output),
        }
    }

    fn remove(&mut self, pos: i16) {
        if let Ok(i) = self.outputs.binary_search_by_key(&pos, |o| o.pos) {
            self.outputs.remove(i);
        }
    }

    /// Applies a staged patch to the entry at `pos`.
    fn overlay(&mut self, pos: i16, patch: &OutputPatch) {
        let current = self.find(pos).cloned();
        match patch.apply(current) {
            Some(output) => self.merge(output),
            None => self.remove(pos),
        }
    }
}

/// Cached store of transaction outputs, cached per transaction.
pub struct OutputCache {
    queue: WriteQueue<OutputChange>,
    cache: Mutex<ReadCache<TransactionId, OutputsList>>,
    store: Arc<dyn OutputStore>,
}

impl OutputCache {
    pub fn new(store: Arc<dyn OutputStore>, limits: QueueLimits, capacity: usize) -> Self {
        Self {
            queue: WriteQueue::new("output", limits),
            cache: Mutex::new(ReadCache::new(capacity)),
            store,
        }
    }

    pub fn add(&self, output: TxOutput) {
        self.queue.add(OutputChange::Insert(output.clone()));
        let mut cache = self.cache.lock();
        match cache.get_mut(&output.transaction_id) {
            Some(list) => list.merge(output),
            None => {
                let mut list = OutputsList::default();
                let transaction_id = output.transaction_id;
                list.merge(output);
                cache.insert(transaction_id, list);
            }
        }
    }

    pub fn delete(&self, key: OutputKey) {
        self.queue.add(OutputChange::Delete(key));
        let mut cache = self.cache.lock();
        let emptied = match cache.get_mut(&key.transaction_id) {
            Some(list) => {
                list.remove(key.pos);
                list.outputs.is_empty()
            }
            None => false,
        };
        if emptied {
            cache.remove(&key.transaction_id);
        }
    }

    pub fn update_status(&self, key: OutputKey, status: i16) {
        self.update(OutputChange::Status(key, status), |o| o.status = status);
    }

    pub fn update_address(&self, key: OutputKey, address_id: AddressId) {
        self.update(OutputChange::Address(key, address_id), |o| {
            o.address_id = address_id
        });
    }

    pub fn update_amount(&self, key: OutputKey, amount: i64) {
        self.update(OutputChange::Amount(key, amount), |o| o.amount = amount);
    }

    /// Every output of a transaction, ordered by position.
    pub fn get_outputs(&self, transaction_id: TransactionId) -> Result<Vec<TxOutput>, StoreError> {
        if let Some(list) = self
            .cache
            .lock()
            .get(&transaction_id)
            .filter(|list| list.complete)
        {
            return Ok(list.outputs.clone());
        }

        self.queue.read_through(|| -> Result<_, StoreError> {
            let persisted = self.store.outputs(transaction_id)?;
            let mut cache = self.cache.lock();
            let mut list = OutputsList {
                outputs: persisted,
                complete: true,
            };
            list.outputs.sort_by_key(|o| o.pos);
            for (key, patch) in self
                .queue
                .staged_matching(|key, _| key.transaction_id == transaction_id)
            {
                list.overlay(key.pos, &patch);
            }
            let outputs = list.outputs.clone();
            cache.insert(transaction_id, list);
            Ok(outputs)
        })
    }

    pub fn get_output(&self, key: OutputKey) -> Result<Option<TxOutput>, StoreError> {
        let patch = self.queue.staged(&key);
        if let Some(patch) = patch.as_ref().filter(|p| p.is_complete()) {
            return Ok(patch.apply(None));
        }
        let cached = {
            let cache = self.cache.lock();
            cache.get(&key.transaction_id).and_then(|list| {
                match list.find(key.pos) {
                    Some(output) => Some(Some(output.clone())),
                    None if list.complete => Some(None),
                    None => None,
                }
            })
        };
        if let Some(cached) = cached {
            return Ok(match patch {
                Some(patch) => patch.apply(cached),
                None => cached,
            });
        }

        self.queue.read_through(|| -> Result<_, StoreError> {
            let Some(persisted) = self.store.output(key)? else {
                return Ok(None);
            };
            let mut cache = self.cache.lock();
            let resolved = match self.queue.staged(&key) {
                Some(patch) => patch.apply(Some(persisted)),
                None => Some(persisted),
            };
            if let Some(output) = &resolved {
                match cache.get_mut(&key.transaction_id) {
                    Some(list) => list.merge(output.clone()),
                    None => {
                        let mut list = OutputsList::default();
                        list.merge(output.clone());
                        cache.insert(key.transaction_id, list);
                    }
                }
            }
            Ok(resolved)
        })
    }

    pub fn cached_transactions(&self) -> usize {
        self.cache.lock().len()
    }

    fn update<F>(&self, change: OutputChange, apply: F)
    where
        F: FnOnce(&mut TxOutput),
    {
        let key = change.key();
        self.queue.add(change);
        if let Some(output) = self
            .cache
            .lock()
            .get_mut(&key.transaction_id)
            .and_then(|list| list.find_mut(key.pos))
        {
            apply(output);
        }
    }
}

impl Flushable for OutputCache {
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
            .flush(|batch| self.store.apply_output_changes(batch))
    }
}
