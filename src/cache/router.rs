use std::sync::Arc;

use tracing::warn;

use super::address::AddressCache;
use super::queue::QueueLimits;
use super::Flushable;
use crate::error::StoreError;
use crate::model::{Address, AddressId, AddressType, WalletId, UNASSIGNED_WALLET};
use crate::store::AddressStore;

/// Dispatches address operations to the partition that owns them.
pub struct AddressRouter {
    partitions: Vec<Arc<AddressCache>>,
}

impl AddressRouter {
    pub fn new(store: Arc<dyn AddressStore>, limits: QueueLimits, capacity: usize) -> Self {
        let partitions = AddressType::ALL
            .iter()
            .map(|address_type| {
                Arc::new(AddressCache::new(
                    *address_type,
                    store.clone(),
                    limits,
                    capacity,
                ))
            })
            .collect();
        Self { partitions }
    }

    pub fn partition(&self, address_type: AddressType) -> &Arc<AddressCache> {
        &self.partitions[address_type.index()]
    }

    pub fn partitions(&self) -> &[Arc<AddressCache>] {
        &self.partitions
    }

    pub fn get_or_add(
        &self,
        address_type: AddressType,
        address: &[u8],
    ) -> Result<Address, StoreError> {
        self.partition(address_type).get_or_add(address)
    }

    pub fn get_address(&self, address_id: AddressId) -> Result<Option<Address>, StoreError> {
        match AddressType::from_address_id(address_id) {
            Some(address_type) => self.partition(address_type).get(address_id),
            None => Ok(None),
        }
    }

    /// Looks up raw address bytes without a type hint, probing the
    /// partitions whose payload length matches.
    pub fn get_address_by_bytes(&self, address: &[u8]) -> Result<Option<Address>, StoreError> {
        for address_type in AddressType::candidates_for_len(address.len()) {
            if let Some(found) = self.partition(*address_type).get_by_address(address)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn get_wallet_id(&self, address_id: AddressId) -> Result<WalletId, StoreError> {
        match AddressType::from_address_id(address_id) {
            Some(address_type) => self.partition(address_type).get_wallet_id(address_id),
            None => Ok(UNASSIGNED_WALLET),
        }
    }

    /// Returns false when the id belongs to no partition.
    pub fn update_wallet(&self, address_id: AddressId, wallet_id: WalletId) -> bool {
        match AddressType::from_address_id(address_id) {
            Some(address_type) => {
                self.partition(address_type)
                    .update_wallet(address_id, wallet_id);
                true
            }
            None => {
                warn!("Address id {} belongs to no partition", address_id);
                false
            }
        }
    }

    pub fn flushables(&self) -> Vec<Arc<dyn Flushable>> {
        self.partitions
            .iter()
            .map(|partition| partition.clone() as Arc<dyn Flushable>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn router(store: &Arc<MemoryStore>) -> AddressRouter {
        AddressRouter::new(store.clone(), QueueLimits::default(), 100)
    }

    #[test]
    fn routes_by_id_partition() {
        let store = Arc::new(MemoryStore::new());
        let router = router(&store);
        let p2sh = router.get_or_add(AddressType::P2sh, &[1; 20]).unwrap();
        let p2wsh = router.get_or_add(AddressType::P2wsh, &[2; 32]).unwrap();
        assert_eq!(p2sh.address_type(), Some(AddressType::P2sh));
        assert_eq!(p2wsh.address_type(), Some(AddressType::P2wsh));
        assert_eq!(router.get_address(p2sh.address_id).unwrap(), Some(p2sh));
        assert_eq!(router.get_address(0).unwrap(), None);
        assert_eq!(router.get_wallet_id(0).unwrap(), UNASSIGNED_WALLET);
    }

    #[test]
    fn untyped_lookup_probes_by_length() {
        let store = Arc::new(MemoryStore::new());
        let router = router(&store);
        let p2wpkh = router.get_or_add(AddressType::P2wpkh, &[3; 20]).unwrap();
        let p2wsh = router.get_or_add(AddressType::P2wsh, &[4; 32]).unwrap();
        assert_eq!(router.get_address_by_bytes(&[3; 20]).unwrap(), Some(p2wpkh));
        assert_eq!(router.get_address_by_bytes(&[4; 32]).unwrap(), Some(p2wsh));
        assert_eq!(router.get_address_by_bytes(&[5; 20]).unwrap(), None);
    }

    #[test]
    fn wallet_updates_reach_the_owning_partition() {
        let store = Arc::new(MemoryStore::new());
        let router = router(&store);
        let address = router.get_or_add(AddressType::P2wpkh, &[6; 20]).unwrap();
        assert!(router.update_wallet(address.address_id, 12));
        assert!(!router.update_wallet(0, 12));
        assert_eq!(router.get_wallet_id(address.address_id).unwrap(), 12);
        assert_eq!(router.partition(AddressType::P2wpkh).pending(), 2);
        assert_eq!(router.partition(AddressType::P2pkh).pending(), 0);
    }
}
