use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::queue::{Pending, QueueLimits, WriteQueue};
use super::Flushable;
use crate::error::StoreError;
use crate::model::WalletId;
use crate::store::WalletStore;

impl Pending for WalletId {
    type Key = WalletId;
    type View = ();

    fn key(&self) -> WalletId {
        *self
    }

    fn fold(&self, _staged: Option<()>) {}
}

/// Allocates fresh wallet ids and queues their wallet rows.
pub struct WalletIds {
    queue: WriteQueue<WalletId>,
    last_wallet_id: Mutex<Option<WalletId>>,
    store: Arc<dyn WalletStore>,
}

impl WalletIds {
    pub fn new(store: Arc<dyn WalletStore>, limits: QueueLimits) -> Self {
        Self {
            queue: WriteQueue::new("wallet", limits),
            last_wallet_id: Mutex::new(None),
            store,
        }
    }

    /// A wallet id above every id recorded so far, pending rows included.
    pub fn allocate(&self) -> Result<WalletId, StoreError> {
        let mut last = self.last_wallet_id.lock();
        let current = match *last {
            Some(id) => id,
            None => {
                let persisted = self.store.last_wallet_id()?.unwrap_or(0);
                let staged = self
                    .queue
                    .staged_matching(|_, _| true)
                    .into_iter()
                    .map(|(id, ())| id)
                    .max()
                    .unwrap_or(0);
                persisted.max(staged)
            }
        };
        let next = current + 1;
        *last = Some(next);
        self.queue.add(next);
        trace!("Allocated wallet {}", next);
        Ok(next)
    }

    /// Queues rows for wallet ids already in use by addresses.
    pub fn record(&self, wallet_ids: &[WalletId]) {
        let mut last = self.last_wallet_id.lock();
        for id in wallet_ids {
            self.queue.add(*id);
        }
        if let (Some(current), Some(highest)) = (*last, wallet_ids.iter().max()) {
            *last = Some(current.max(*highest));
        }
    }
}

impl Flushable for WalletIds {
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
        self.queue.flush(|batch| self.store.insert_wallets(batch))
    }
}
