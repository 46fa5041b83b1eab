use std::sync::Arc;

use bitcoin::BlockHash;
use parking_lot::Mutex;

use super::queue::{Pending, QueueLimits, WriteQueue};
use super::read::ReadCache;
use super::Flushable;
use crate::error::StoreError;
use crate::model::Block;
use crate::store::BlockStore;

impl Pending for Block {
    type Key = i32;
    type View = Block;

    fn key(&self) -> i32 {
        self.height
    }

    fn fold(&self, _staged: Option<Block>) -> Block {
        self.clone()
    }
}

/// Cached store of block headers, keyed by height.
pub struct BlockCache {
    queue: WriteQueue<Block>,
    cache: Mutex<ReadCache<i32, Block>>,
    store: Arc<dyn BlockStore>,
}

impl BlockCache {
    pub fn new(store: Arc<dyn BlockStore>, limits: QueueLimits, capacity: usize) -> Self {
        Self {
            queue: WriteQueue::new("block", limits),
            cache: Mutex::new(ReadCache::new(capacity)),
            store,
        }
    }

    pub fn add(&self, block: Block) {
        self.queue.add(block.clone());
        self.cache.lock().insert(block.height, block);
    }

    pub fn get_block(&self, height: i32) -> Result<Option<Block>, StoreError> {
        if let Some(block) = self.queue.staged(&height) {
            return Ok(Some(block));
        }
        if let Some(block) = self.cache.lock().get(&height) {
            return Ok(Some(block.clone()));
        }
        let persisted = self.store.block_by_height(height)?;
        if let Some(block) = &persisted {
            self.cache.lock().insert(block.height, block.clone());
        }
        Ok(persisted)
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError> {
        if let Some((_, block)) = self
            .queue
            .staged_matching(|_, block| &block.hash == hash)
            .into_iter()
            .next()
        {
            return Ok(Some(block));
        }
        if let Some(block) = self.cache.lock().values().find(|b| &b.hash == hash) {
            return Ok(Some(block.clone()));
        }
        let persisted = self.store.block_by_hash(hash)?;
        if let Some(block) = &persisted {
            self.cache.lock().insert(block.height, block.clone());
        }
        Ok(persisted)
    }

    /// Highest known height, pending blocks included.
    pub fn last_height(&self) -> Result<Option<i32>, StoreError> {
        let pending = self
            .queue
            .staged_matching(|_, _| true)
            .into_iter()
            .map(|(height, _)| height)
            .max();
        let persisted = self.store.last_block_height()?;
        Ok(pending.max(persisted))
    }
}

impl Flushable for BlockCache {
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
        self.queue.flush(|batch| self.store.insert_blocks(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use bitcoin::hashes::Hash;

    fn block(height: i32) -> Block {
        Block {
            height,
            hash: BlockHash::from_byte_array([height as u8; 32]),
            txn_count: 1,
        }
    }

    #[test]
    fn blocks_are_visible_before_and_after_flush() {
        let store = Arc::new(MemoryStore::new());
        let cache = BlockCache::new(store.clone(), QueueLimits::default(), 2);
        assert_eq!(cache.last_height().unwrap(), None);

        for height in 0..4 {
            cache.add(block(height));
        }
        assert_eq!(cache.last_height().unwrap(), Some(3));
        assert_eq!(cache.get_block(0).unwrap(), Some(block(0)));
        assert_eq!(store.block_count(), 0);

        assert_eq!(cache.flush_all().unwrap(), 4);
        assert_eq!(store.block_count(), 4);
        assert_eq!(cache.get_block(0).unwrap(), Some(block(0)));
        assert_eq!(cache.get_block_by_hash(&block(1).hash).unwrap(), Some(block(1)));
        assert_eq!(cache.last_height().unwrap(), Some(3));
        assert_eq!(cache.get_block(7).unwrap(), None);
    }
}
