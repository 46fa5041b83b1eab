use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::model::{WalletId, UNASSIGNED_WALLET};

/// Wallet ids that no address carries any more and may be handed out again.
/// The smallest id is reused first.
#[derive(Default)]
pub struct FreeWallets {
    ids: Mutex<BTreeSet<WalletId>>,
}

impl FreeWallets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<WalletId> {
        self.ids.lock().pop_first()
    }

    pub fn release(&self, wallet_id: WalletId) {
        if wallet_id != UNASSIGNED_WALLET {
            self.ids.lock().insert(wallet_id);
        }
    }

    pub fn extend<I: IntoIterator<Item = WalletId>>(&self, wallet_ids: I) {
        for id in wallet_ids {
            self.release(id);
        }
    }

    pub fn contains(&self, wallet_id: WalletId) -> bool {
        self.ids.lock().contains(&wallet_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_smallest_id_first() {
        let pool = FreeWallets::new();
        pool.extend([9, 3, 0, 5]);
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(0));
        assert_eq!(pool.take(), Some(3));
        assert_eq!(pool.take(), Some(5));
        pool.release(3);
        assert_eq!(pool.take(), Some(3));
        assert_eq!(pool.take(), Some(9));
        assert_eq!(pool.take(), None);
        assert!(pool.is_empty());
    }
}
