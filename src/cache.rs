//! Write-back caches in front of the relational store.
//!
//! Each cached table owns a [`queue::WriteQueue`] of staged mutations and,
//! for tables that are read back, a bounded [`read::ReadCache`]. Reads look
//! at staged mutations first, then the read cache, then the store.

pub mod address;
pub mod block;
pub mod output;
pub mod queue;
pub mod read;
pub mod router;
pub mod transaction;
pub mod wallet;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::store::Store;
use block::BlockCache;
use output::OutputCache;
use queue::QueueLimits;
use router::AddressRouter;
use transaction::{InputWriter, TransactionCache};
use wallet::WalletIds;

/// A cached table whose staged mutations can be pushed to the store.
pub trait Flushable: Send + Sync {
    fn name(&self) -> &str;

    /// Number of staged mutations not yet drained.
    fn pending(&self) -> usize;

    fn need_flush(&self) -> bool;

    /// Executes at most one batch; returns how many mutations it held.
    fn flush(&self) -> Result<usize, StoreError>;

    fn flush_all(&self) -> Result<usize, StoreError> {
        let mut flushed = 0;
        loop {
            match self.flush()? {
                0 => return Ok(flushed),
                n => flushed += n,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub max_queue_length: usize,
    pub address_cache_size: usize,
    pub output_cache_size: usize,
    pub block_cache_size: usize,
    pub transaction_cache_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let limits = QueueLimits::default();
        Self {
            min_batch_size: limits.min_batch_size,
            max_batch_size: limits.max_batch_size,
            max_queue_length: limits.max_queue_length,
            address_cache_size: 100_000,
            output_cache_size: 50_000,
            block_cache_size: 1_000,
            transaction_cache_size: 100_000,
            flush_interval_ms: 200,
        }
    }
}

impl CacheSettings {
    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            max_queue_length: self.max_queue_length,
        }
    }
}

/// Background thread that flushes any target above its low-water mark.
///
/// The first flush error is kept and surfaced by [`Flusher::take_failure`];
/// the thread keeps running so producers blocked on a full queue are not
/// stranded.
pub struct Flusher {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<StoreError>>>,
}

impl Flusher {
    pub fn spawn(targets: Vec<Arc<dyn Flushable>>, interval: Duration) -> io::Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let failure = Arc::new(Mutex::new(None));
        let handle = {
            let failure = failure.clone();
            thread::Builder::new()
                .name("cache-flusher".to_string())
                .spawn(move || loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    for target in &targets {
                        while target.need_flush() {
                            match target.flush() {
                                Ok(0) => break,
                                Ok(n) => debug!("{}: flushed {} rows", target.name(), n),
                                Err(e) => {
                                    error!("{}: flush failed: {}", target.name(), e);
                                    failure.lock().get_or_insert(e);
                                    break;
                                }
                            }
                        }
                    }
                })?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
            failure,
        })
    }

    pub fn take_failure(&self) -> Option<StoreError> {
        self.failure.lock().take()
    }

    /// Stops the thread after its current round and returns any failure it
    /// has not reported yet.
    pub fn stop(mut self) -> Option<StoreError> {
        self.join();
        self.take_failure()
    }

    fn join(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Cache flusher thread panicked");
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.join();
    }
}

/// Every cached table of the scanner, built over one store.
pub struct Caches {
    pub addresses: Arc<AddressRouter>,
    pub outputs: Arc<OutputCache>,
    pub blocks: Arc<BlockCache>,
    pub transactions: Arc<TransactionCache>,
    pub inputs: Arc<InputWriter>,
    pub wallets: Arc<WalletIds>,
    flusher: Mutex<Option<Flusher>>,
    failure: Mutex<Option<StoreError>>,
}

impl Caches {
    pub fn new<S: Store + 'static>(store: Arc<S>, settings: &CacheSettings) -> Self {
        let limits = settings.queue_limits();
        Self {
            addresses: Arc::new(AddressRouter::new(
                store.clone(),
                limits,
                settings.address_cache_size,
            )),
            outputs: Arc::new(OutputCache::new(
                store.clone(),
                limits,
                settings.output_cache_size,
            )),
            blocks: Arc::new(BlockCache::new(
                store.clone(),
                limits,
                settings.block_cache_size,
            )),
            transactions: Arc::new(TransactionCache::new(
                store.clone(),
                limits,
                settings.transaction_cache_size,
            )),
            inputs: Arc::new(InputWriter::new(store.clone(), limits)),
            wallets: Arc::new(WalletIds::new(store, limits)),
            flusher: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    /// Tables in the order they must reach the store: rows other rows
    /// refer to go first. Blocks come last so a persisted block implies its
    /// transactions are persisted too.
    pub fn flushables(&self) -> Vec<Arc<dyn Flushable>> {
        let mut targets: Vec<Arc<dyn Flushable>> = vec![self.wallets.clone()];
        targets.extend(self.addresses.flushables());
        targets.push(self.transactions.clone());
        targets.push(self.outputs.clone());
        targets.push(self.inputs.clone());
        targets.push(self.blocks.clone());
        targets
    }

    /// Starts background flushing of every table except blocks, which only
    /// reach the store through [`Caches::checkpoint`].
    pub fn start_background_flush(&self, interval: Duration) -> io::Result<()> {
        let mut targets = self.flushables();
        targets.pop();
        let flusher = Flusher::spawn(targets, interval)?;
        info!("Background cache flushing every {:?}", interval);
        *self.flusher.lock() = Some(flusher);
        Ok(())
    }

    pub fn stop_background_flush(&self) {
        let stopped = self.flusher.lock().take();
        if let Some(failure) = stopped.and_then(Flusher::stop) {
            self.failure.lock().get_or_insert(failure);
        }
    }

    pub fn flush_all(&self) -> Result<usize, StoreError> {
        let mut flushed = 0;
        for target in self.flushables() {
            flushed += target.flush_all()?;
        }
        Ok(flushed)
    }

    /// Reports a background flush failure, if any, then flushes everything.
    /// Once this returns Ok every mutation staged before the call is
    /// persisted.
    pub fn checkpoint(&self) -> Result<usize, StoreError> {
        let background = self
            .flusher
            .lock()
            .as_ref()
            .and_then(|flusher| flusher.take_failure());
        if let Some(failure) = self.failure.lock().take().or(background) {
            return Err(failure);
        }
        self.flush_all()
    }

    pub fn pending(&self) -> usize {
        self.flushables().iter().map(|t| t.pending()).sum()
    }
}
