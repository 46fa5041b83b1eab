//! Bounded write-back queue of pending row mutations for one table.
//!
//! Producers append with [`WriteQueue::add`], which suspends on a condition
//! variable while the queue sits at its high-water mark. A flush drains up to
//! `max_batch_size` items and hands them to the store as one batch.
//!
//! Besides the ordered items the queue keeps a per-key *staged view*: every
//! mutation folded on top of the previous ones for the same key. Readers use
//! it as the first tier of a lookup. A key leaves the staged view only once
//! the batch holding its last mutation has executed, so a value is never
//! invisible while it is in flight to the store.
//!
//! Store reads that get merged with the staged view go through
//! [`WriteQueue::read_through`], which keeps batches from settling until the
//! merge is done. Otherwise a batch could land between the store read and
//! the staged lookup and be missing from both.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Deserialize;
use tracing::trace;

use crate::error::StoreError;

/// A row mutation that can sit in a [`WriteQueue`].
pub trait Pending: Clone + Send {
    type Key: Eq + Hash + Clone + Send;
    type View: Clone + Send;

    fn key(&self) -> Self::Key;

    /// Folds this mutation on top of what is already staged for its key.
    fn fold(&self, staged: Option<Self::View>) -> Self::View;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QueueLimits {
    /// Queue length at which a flush is worth doing.
    pub min_batch_size: usize,
    /// Most items executed by one flush.
    pub max_batch_size: usize,
    /// High-water mark: `add` blocks at or above this length.
    pub max_queue_length: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 10_000,
            max_queue_length: 30_000,
        }
    }
}

struct Staged<V> {
    count: usize,
    view: V,
}

struct QueueState<T: Pending> {
    items: VecDeque<T>,
    staged: HashMap<T::Key, Staged<T::View>>,
}

pub struct WriteQueue<T: Pending> {
    name: String,
    limits: QueueLimits,
    state: Mutex<QueueState<T>>,
    drained: Condvar,
    // Written from drain to the end of execution so batches reach the store
    // in queue order even with several flushing threads. Read by
    // read-throughs.
    exec: RwLock<()>,
}

impl<T: Pending> WriteQueue<T> {
    pub fn new(name: impl Into<String>, limits: QueueLimits) -> Self {
        Self {
            name: name.into(),
            limits: QueueLimits {
                min_batch_size: limits.min_batch_size.max(1),
                max_batch_size: limits.max_batch_size.max(1),
                max_queue_length: limits.max_queue_length.max(1),
            },
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                staged: HashMap::new(),
            }),
            drained: Condvar::new(),
            exec: RwLock::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Appends a mutation, blocking while the queue is full.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        while state.items.len() >= self.limits.max_queue_length {
            trace!("{}: queue full ({} items), waiting for a flush", self.name, state.items.len());
            self.drained.wait(&mut state);
        }
        let key = item.key();
        let staged = match state.staged.remove(&key) {
            Some(previous) => Staged {
                count: previous.count + 1,
                view: item.fold(Some(previous.view)),
            },
            None => Staged {
                count: 1,
                view: item.fold(None),
            },
        };
        state.staged.insert(key, staged);
        state.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn need_flush(&self) -> bool {
        self.len() >= self.limits.min_batch_size
    }

    /// Staged view for a key, if it has mutations not yet executed.
    pub fn staged(&self, key: &T::Key) -> Option<T::View> {
        self.state.lock().staged.get(key).map(|s| s.view.clone())
    }

    /// Every staged entry accepted by `filter`. Linear in the number of
    /// staged keys.
    pub fn staged_matching<F>(&self, mut filter: F) -> Vec<(T::Key, T::View)>
    where
        F: FnMut(&T::Key, &T::View) -> bool,
    {
        self.state
            .lock()
            .staged
            .iter()
            .filter(|(key, staged)| filter(key, &staged.view))
            .map(|(key, staged)| (key.clone(), staged.view.clone()))
            .collect()
    }

    /// Runs `read` while no batch of this queue can execute or settle.
    ///
    /// `read` must not add to or flush this queue.
    pub fn read_through<F, R>(&self, read: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _settled = self.exec.read();
        read()
    }

    /// Drains one batch and executes it. Returns the number of items
    /// executed, 0 when the queue was empty.
    ///
    /// A failed batch is not re-queued: its items are dropped and the error
    /// is returned.
    pub fn flush<F>(&self, mut execute: F) -> Result<usize, StoreError>
    where
        F: FnMut(&[T]) -> Result<(), StoreError>,
    {
        let _exec = self.exec.write();
        self.flush_locked(&mut execute)
    }

    /// Flushes until the queue is empty.
    pub fn flush_all<F>(&self, execute: F) -> Result<usize, StoreError>
    where
        F: FnMut(&[T]) -> Result<(), StoreError>,
    {
        self.flush_all_then(execute, || Ok(()))
            .map(|(flushed, ())| flushed)
    }

    /// Flushes until the queue is empty, then runs `then` before any other
    /// flush of this queue can start.
    pub fn flush_all_then<F, G, R>(&self, mut execute: F, then: G) -> Result<(usize, R), StoreError>
    where
        F: FnMut(&[T]) -> Result<(), StoreError>,
        G: FnOnce() -> Result<R, StoreError>,
    {
        let _exec = self.exec.write();
        let mut flushed = 0;
        loop {
            match self.flush_locked(&mut execute)? {
                0 => break,
                n => flushed += n,
            }
        }
        Ok((flushed, then()?))
    }

    fn flush_locked<F>(&self, execute: &mut F) -> Result<usize, StoreError>
    where
        F: FnMut(&[T]) -> Result<(), StoreError>,
    {
        let batch: Vec<T> = {
            let mut state = self.state.lock();
            let n = state.items.len().min(self.limits.max_batch_size);
            state.items.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        self.drained.notify_all();
        let result = execute(&batch);
        self.settle(&batch);
        result.map(|()| batch.len())
    }

    fn settle(&self, batch: &[T]) {
        let mut state = self.state.lock();
        for item in batch {
            if let Entry::Occupied(mut entry) = state.staged.entry(item.key()) {
                entry.get_mut().count -= 1;
                if entry.get().count == 0 {
                    entry.remove();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Put(u32, &'static str);

    impl Pending for Put {
        type Key = u32;
        type View = &'static str;

        fn key(&self) -> u32 {
            self.0
        }

        fn fold(&self, _staged: Option<&'static str>) -> &'static str {
            self.1
        }
    }

    fn limits(max_batch_size: usize, max_queue_length: usize) -> QueueLimits {
        QueueLimits {
            min_batch_size: 2,
            max_batch_size,
            max_queue_length,
        }
    }

    #[test]
    fn flush_drains_in_order_up_to_batch_size() {
        let queue = WriteQueue::new("test", limits(2, 10));
        for i in 0..5 {
            queue.add(Put(i, "v"));
        }
        let mut seen = Vec::new();
        let flushed = queue
            .flush(|batch| {
                seen.extend(batch.iter().map(|p| p.0));
                Ok(())
            })
            .unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.flush_all(|_| Ok(())).unwrap(), 3);
        assert_eq!(queue.flush(|_| panic!("nothing to execute")).unwrap(), 0);
    }

    #[test]
    fn need_flush_follows_low_water_mark() {
        let queue = WriteQueue::new("test", limits(10, 10));
        queue.add(Put(1, "a"));
        assert!(!queue.need_flush());
        queue.add(Put(2, "b"));
        assert!(queue.need_flush());
    }

    #[test]
    fn staged_view_keeps_latest_value_until_executed() {
        let queue = WriteQueue::new("test", limits(1, 10));
        queue.add(Put(7, "old"));
        queue.add(Put(7, "new"));
        assert_eq!(queue.staged(&7), Some("new"));

        // First batch holds only the older mutation: the key stays staged.
        queue.flush(|_| Ok(())).unwrap();
        assert_eq!(queue.staged(&7), Some("new"));

        queue
            .flush(|_| {
                assert_eq!(queue.staged(&7), Some("new"), "visible while in flight");
                Ok(())
            })
            .unwrap();
        assert_eq!(queue.staged(&7), None);
    }

    #[test]
    fn failed_batch_is_dropped_and_reported() {
        let queue = WriteQueue::new("test", limits(10, 10));
        queue.add(Put(1, "a"));
        queue.add(Put(2, "b"));
        let result = queue.flush(|_| Err(StoreError::Integrity("boom".to_string())));
        assert!(matches!(result, Err(StoreError::Integrity(_))));
        assert!(queue.is_empty());
        assert_eq!(queue.staged(&1), None);
    }

    #[test]
    fn add_blocks_at_high_water_mark_until_flushed() {
        let queue = Arc::new(WriteQueue::new("test", limits(1, 2)));
        queue.add(Put(1, "a"));
        queue.add(Put(2, "b"));

        let added = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = queue.clone();
            let added = added.clone();
            thread::spawn(move || {
                queue.add(Put(3, "c"));
                added.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!added.load(Ordering::SeqCst), "producer must wait for a flush");
        assert_eq!(queue.len(), 2);

        queue.flush(|_| Ok(())).unwrap();
        producer.join().unwrap();
        assert!(added.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn flush_all_then_runs_after_queue_is_empty() {
        let queue = WriteQueue::new("test", limits(1, 10));
        queue.add(Put(1, "a"));
        queue.add(Put(2, "b"));
        let (flushed, remaining) = queue
            .flush_all_then(|_| Ok(()), || Ok(queue.len()))
            .unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn read_through_holds_back_concurrent_flush() {
        let queue = Arc::new(WriteQueue::new("test", limits(1, 10)));
        queue.add(Put(1, "a"));
        let flushed = Arc::new(AtomicBool::new(false));

        let (during, flusher) = queue.read_through(|| {
            let flusher = {
                let queue = queue.clone();
                let flushed = flushed.clone();
                thread::spawn(move || {
                    queue.flush_all(|_| Ok(())).unwrap();
                    flushed.store(true, Ordering::SeqCst);
                })
            };
            thread::sleep(Duration::from_millis(100));
            ((flushed.load(Ordering::SeqCst), queue.staged(&1)), flusher)
        });
        assert_eq!(during, (false, Some("a")));

        flusher.join().unwrap();
        assert!(flushed.load(Ordering::SeqCst));
        assert_eq!(queue.staged(&1), None);
    }
}
