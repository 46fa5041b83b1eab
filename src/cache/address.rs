use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::queue::{Pending, QueueLimits, WriteQueue};
use super::read::ReadCache;
use super::Flushable;
use crate::error::StoreError;
use crate::model::{Address, AddressId, AddressType, WalletId, UNASSIGNED_WALLET};
use crate::store::{AddressChange, AddressStore};

/// Net effect of the staged changes of one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPatch {
    insert: Option<Address>,
    wallet_id: Option<WalletId>,
}

impl AddressPatch {
    /// True when the patch alone defines the row.
    fn is_complete(&self) -> bool {
        self.insert.is_some()
    }

    fn apply(&self, persisted: Option<Address>) -> Option<Address> {
        let mut address = self.insert.clone().or(persisted)?;
        if let Some(wallet_id) = self.wallet_id {
            address.wallet_id = wallet_id;
        }
        Some(address)
    }
}

impl Pending for AddressChange {
    type Key = AddressId;
    type View = AddressPatch;

    fn key(&self) -> AddressId {
        match self {
            AddressChange::Insert(address) => address.address_id,
            AddressChange::Wallet { address_id, .. } => *address_id,
        }
    }

    fn fold(&self, staged: Option<AddressPatch>) -> AddressPatch {
        let mut patch = staged.unwrap_or_default();
        match self {
            AddressChange::Insert(address) => {
                patch.insert = Some(address.clone());
                patch.wallet_id = None;
            }
            AddressChange::Wallet { wallet_id, .. } => patch.wallet_id = Some(*wallet_id),
        }
        patch
    }
}

struct CachedAddresses {
    by_id: ReadCache<AddressId, Address>,
    by_bytes: HashMap<Vec<u8>, AddressId>,
}

/// Cached store of one address partition.
///
/// Lookups go through three tiers: the staged changes of the write queue,
/// then the read cache, then the store. Lock order is `add_lock`, then the
/// queue's read-through guard, then cache, then queue state.
pub struct AddressCache {
    address_type: AddressType,
    name: String,
    queue: WriteQueue<AddressChange>,
    cache: Mutex<CachedAddresses>,
    last_address_id: Mutex<Option<AddressId>>,
    add_lock: Mutex<()>,
    store: Arc<dyn AddressStore>,
}

impl AddressCache {
    pub fn new(
        address_type: AddressType,
        store: Arc<dyn AddressStore>,
        limits: QueueLimits,
        capacity: usize,
    ) -> Self {
        let name = address_type.table_name().to_string();
        Self {
            address_type,
            queue: WriteQueue::new(name.clone(), limits),
            name,
            cache: Mutex::new(CachedAddresses {
                by_id: ReadCache::new(capacity),
                by_bytes: HashMap::new(),
            }),
            last_address_id: Mutex::new(None),
            add_lock: Mutex::new(()),
            store,
        }
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn get(&self, address_id: AddressId) -> Result<Option<Address>, StoreError> {
        let patch = self.queue.staged(&address_id);
        if let Some(patch) = patch.as_ref().filter(|p| p.is_complete()) {
            return Ok(patch.apply(None));
        }
        if let Some(cached) = self.cached(address_id) {
            return Ok(match patch {
                Some(patch) => patch.apply(Some(cached)),
                None => Some(cached),
            });
        }
        self.queue.read_through(|| -> Result<_, StoreError> {
            let persisted = self.store.find_by_id(self.address_type, address_id)?;
            Ok(persisted.and_then(|address| self.promote(address)))
        })
    }

    pub fn get_by_address(&self, address: &[u8]) -> Result<Option<Address>, StoreError> {
        if let Some(found) = self.find_unpersisted(address) {
            return Ok(Some(found));
        }
        self.queue.read_through(|| -> Result<_, StoreError> {
            let persisted = self.store.find_by_address(self.address_type, address)?;
            Ok(persisted.and_then(|address| self.promote(address)))
        })
    }

    /// Returns the address for `address`, creating it with the next id of
    /// the partition and no wallet if it is unknown.
    pub fn get_or_add(&self, address: &[u8]) -> Result<Address, StoreError> {
        if let Some(found) = self.get_by_address(address)? {
            return Ok(found);
        }
        let _adding = self.add_lock.lock();
        // Another thread may have created it since the lookup above, and it
        // may already be flushed and evicted.
        if let Some(found) = self.get_by_address(address)? {
            return Ok(found);
        }
        let created = Address {
            address_id: self.next_address_id()?,
            address: address.to_vec(),
            wallet_id: UNASSIGNED_WALLET,
        };
        self.queue.add(AddressChange::Insert(created.clone()));
        self.remember(created.clone());
        trace!("Added {} address {}", self.address_type, created);
        Ok(created)
    }

    pub fn get_wallet_id(&self, address_id: AddressId) -> Result<WalletId, StoreError> {
        Ok(self
            .get(address_id)?
            .map_or(UNASSIGNED_WALLET, |address| address.wallet_id))
    }

    pub fn update_wallet(&self, address_id: AddressId, wallet_id: WalletId) {
        self.queue.add(AddressChange::Wallet {
            address_id,
            wallet_id,
        });
        if let Some(cached) = self.cache.lock().by_id.get_mut(&address_id) {
            cached.wallet_id = wallet_id;
        }
    }

    /// Moves every address of the partition from wallet `from` to `to`.
    ///
    /// Pending changes are flushed first so the bulk update sees them, and
    /// no other flush of this partition can interleave with it.
    pub fn replace_wallet(&self, from: WalletId, to: WalletId) -> Result<usize, StoreError> {
        let (_, updated) = self.queue.flush_all_then(
            |batch| self.store.apply_address_changes(self.address_type, batch),
            || self.store.replace_wallet(self.address_type, from, to),
        )?;
        let mut cache = self.cache.lock();
        for cached in cache.by_id.values_mut().filter(|a| a.wallet_id == from) {
            cached.wallet_id = to;
        }
        debug!(
            "{}: moved {} addresses from wallet {} to {}",
            self.name, updated, from, to
        );
        Ok(updated)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().by_id.len()
    }

    fn cached(&self, address_id: AddressId) -> Option<Address> {
        self.cache.lock().by_id.get(&address_id).cloned()
    }

    /// Pending and cached tiers of a lookup by raw bytes.
    fn find_unpersisted(&self, address: &[u8]) -> Option<Address> {
        let cached_id = self.cache.lock().by_bytes.get(address).copied();
        if let Some(address_id) = cached_id {
            let patch = self.queue.staged(&address_id);
            let cached = self.cached(address_id);
            if let Some(found) = match patch {
                Some(patch) => patch.apply(cached),
                None => cached,
            } {
                return Some(found);
            }
        }
        self.queue
            .staged_matching(|_, patch| {
                patch
                    .insert
                    .as_ref()
                    .is_some_and(|inserted| inserted.address == address)
            })
            .into_iter()
            .find_map(|(_, patch)| patch.apply(None))
    }

    /// Caches a value read from the store, with any staged change applied
    /// under the cache lock so a concurrent update cannot be lost. Called
    /// inside a read-through so the staged view still holds every change the
    /// store read missed.
    fn promote(&self, persisted: Address) -> Option<Address> {
        let mut cache = self.cache.lock();
        let resolved = match self.queue.staged(&persisted.address_id) {
            Some(patch) => patch.apply(Some(persisted))?,
            None => persisted,
        };
        Self::insert_locked(&mut cache, resolved.clone());
        Some(resolved)
    }

    fn remember(&self, address: Address) {
        Self::insert_locked(&mut self.cache.lock(), address);
    }

    fn insert_locked(cache: &mut CachedAddresses, address: Address) {
        cache.by_bytes.insert(address.address.clone(), address.address_id);
        for (_, evicted) in cache.by_id.insert(address.address_id, address) {
            cache.by_bytes.remove(&evicted.address);
        }
    }

    fn next_address_id(&self) -> Result<AddressId, StoreError> {
        let mut last = self.last_address_id.lock();
        let current = match *last {
            Some(id) => id,
            None => self
                .store
                .last_address_id(self.address_type)?
                .unwrap_or_else(|| self.address_type.id_base()),
        };
        let next = current + 1;
        *last = Some(next);
        Ok(next)
    }
}

impl Flushable for AddressCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn need_flush(&self) -> bool {
        self.queue.need_flush()
    }

    fn flush(&self) -> Result<usize, StoreError> {
        self.queue
            .flush(|batch| self.store.apply_address_changes(self.address_type, batch))
    }
}
