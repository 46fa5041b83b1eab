use anyhow::{Context, Result};
use bitcoin::blockdata::script::Instruction;
use bitcoin::script::Script;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::bitcoin_client::BitcoinClient;
use crate::cache::Caches;
use crate::model::output_status::{SPENT, UNSPENT};
use crate::model::{AddressType, Block, OutputKey, TxInput, TxOutput};
use crate::wallets::cursor::StopSignal;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub stop_file: PathBuf,
    /// Seconds between chain tip polls once caught up.
    pub poll_interval_secs: u64,
    /// Blocks between two full flushes of the caches.
    pub checkpoint_interval: u32,
    /// Stop after this height instead of following the tip.
    pub to_height: Option<i32>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("/tmp/btc-sync-blocks-stop"),
            poll_interval_secs: 10,
            checkpoint_interval: 100,
            to_height: None,
        }
    }
}

/// Writes the rows of one block into the caches
pub struct BlockRecorder {
    caches: Arc<Caches>,
}

impl BlockRecorder {
    pub fn new(caches: Arc<Caches>) -> Self {
        Self { caches }
    }

    /// Records every transaction of the block, then the block row itself
    pub fn record_block(&self, height: i32, block: &bitcoin::Block) -> Result<()> {
        if height > 0 {
            if let Some(parent) = self.caches.blocks.get_block(height - 1)? {
                if parent.hash != block.header.prev_blockhash {
                    anyhow::bail!(
                        "Block {} at height {} does not extend stored block {}",
                        block.block_hash(),
                        height,
                        parent.hash
                    );
                }
            }
        }

        for tx in &block.txdata {
            self.record_transaction(height, tx)?;
        }

        self.caches.blocks.add(Block {
            height,
            hash: block.block_hash(),
            txn_count: block.txdata.len() as i32,
        });
        debug!(
            "Recorded block {} with {} transactions",
            height,
            block.txdata.len()
        );
        Ok(())
    }

    fn record_transaction(&self, height: i32, tx: &bitcoin::Transaction) -> Result<()> {
        let txid = tx.compute_txid();
        let is_coinbase = tx.is_coinbase();
        // Coinbase inputs spend nothing, so they are not recorded
        let n_inputs = if is_coinbase { 0 } else { tx.input.len() as i32 };

        let record = self
            .caches
            .transactions
            .add(txid, height, n_inputs, tx.output.len() as i32)
            .with_context(|| format!("Failed to record transaction {}", txid))?;

        self.record_outputs(record.transaction_id, tx)?;
        if !is_coinbase {
            self.record_inputs(record.transaction_id, tx)?;
        }
        Ok(())
    }

    fn record_outputs(&self, transaction_id: i32, tx: &bitcoin::Transaction) -> Result<()> {
        for (index, output) in tx.output.iter().enumerate() {
            let Ok(pos) = i16::try_from(index) else {
                warn!(
                    "Transaction {} has more outputs than can be recorded, stopping at {}",
                    tx.compute_txid(),
                    index
                );
                break;
            };
            let address_id = match extract_address_from_script(&output.script_pubkey) {
                Some((address_type, bytes)) => {
                    self.caches
                        .addresses
                        .get_or_add(address_type, &bytes)?
                        .address_id
                }
                None => 0,
            };
            self.caches.outputs.add(TxOutput {
                transaction_id,
                pos,
                address_id,
                amount: output.value.to_sat() as i64,
                status: UNSPENT,
            });
        }
        Ok(())
    }

    fn record_inputs(&self, transaction_id: i32, tx: &bitcoin::Transaction) -> Result<()> {
        for (index, input) in tx.input.iter().enumerate() {
            let prev = input.previous_output;
            let (Ok(pos), Ok(in_pos)) = (i16::try_from(index), i16::try_from(prev.vout)) else {
                warn!(
                    "Input {} of transaction {} is out of range, skipping",
                    index,
                    tx.compute_txid()
                );
                continue;
            };
            let Some(in_transaction_id) = self.caches.transactions.find_id(&prev.txid)? else {
                warn!(
                    "Transaction {} spends {}:{} which has not been recorded",
                    tx.compute_txid(),
                    prev.txid,
                    prev.vout
                );
                continue;
            };
            self.caches.inputs.add(TxInput {
                transaction_id,
                pos,
                in_transaction_id,
                in_pos,
            });
            self.caches
                .outputs
                .update_status(OutputKey::new(in_transaction_id, in_pos), SPENT);
        }
        Ok(())
    }
}

/// Follows the node's chain and ingests every block into the store
pub struct BlockProcessor {
    bitcoin_client: BitcoinClient,
    caches: Arc<Caches>,
    recorder: BlockRecorder,
    settings: SyncSettings,
}

impl BlockProcessor {
    /// Creates a new block processor
    pub fn new(bitcoin_client: BitcoinClient, caches: Arc<Caches>, settings: SyncSettings) -> Self {
        Self {
            bitcoin_client,
            recorder: BlockRecorder::new(caches.clone()),
            caches,
            settings,
        }
    }

    /// Gets the current blockchain tip height from the Bitcoin node
    pub async fn get_current_blockchain_tip(&self) -> Result<u64> {
        self.bitcoin_client
            .get_block_count()
            .await
            .context("Failed to get current blockchain tip from bitcoin_client")
    }

    const RETRY_DELAY: Duration = Duration::from_secs(2);
    const MAX_RETRIES: u32 = 3;

    /// Height to continue from, after checking the last stored block is
    /// still where the node has it
    async fn resume_height(&self) -> Result<i32> {
        let Some(last) = self.caches.blocks.last_height()? else {
            info!("No blocks stored yet, starting from genesis");
            return Ok(0);
        };
        let stored = self
            .caches
            .blocks
            .get_block(last)?
            .with_context(|| format!("Stored block at height {} vanished", last))?;

        let node = self
            .bitcoin_client
            .get_block_info_by_hash(&stored.hash)
            .await
            .with_context(|| format!("Node does not know stored block {}", stored.hash))?;
        if node.height != last {
            anyhow::bail!(
                "Stored block {} is at height {} but the node has it at {}",
                stored.hash,
                last,
                node.height
            );
        }
        let active = self.bitcoin_client.get_block_info(last as u64).await?;
        if active.hash != stored.hash {
            anyhow::bail!(
                "Stored block {} at height {} is not on the node's active chain (has {})",
                stored.hash,
                last,
                active.hash
            );
        }

        info!("Last stored block {} at height {} verified", stored.hash, last);
        Ok(last + 1)
    }

    /// Ingests blocks until the stop signal fires or `to_height` is reached
    pub async fn run(&self, stop: &dyn StopSignal) -> Result<()> {
        let mut height = self.resume_height().await?;
        info!("Syncing blocks from height {}", height);

        let mut since_checkpoint = 0;
        loop {
            let tip = self.get_current_blockchain_tip().await?;
            let target = match self.settings.to_height {
                Some(to_height) => tip.min(to_height.max(0) as u64),
                None => tip,
            };

            while (height as u64) <= target {
                if stop.should_stop() {
                    info!("Stop requested, next block is {}", height);
                    return self.checkpoint(height);
                }
                self.process_single_block(height).await?;
                height += 1;
                since_checkpoint += 1;
                if since_checkpoint >= self.settings.checkpoint_interval {
                    self.checkpoint(height)?;
                    since_checkpoint = 0;
                }
            }

            if self.settings.to_height.is_some_and(|to_height| height > to_height) {
                info!("Reached height {}", height - 1);
                return self.checkpoint(height);
            }
            self.checkpoint(height)?;
            since_checkpoint = 0;
            if stop.should_stop() {
                info!("Stop requested, next block is {}", height);
                return Ok(());
            }

            debug!("No new blocks to process. Waiting...");
            sleep(Duration::from_secs(self.settings.poll_interval_secs)).await;
        }
    }

    fn checkpoint(&self, next_height: i32) -> Result<()> {
        let flushed = self
            .caches
            .checkpoint()
            .with_context(|| format!("Failed to flush caches before block {}", next_height))?;
        debug!("Checkpoint before block {}: {} rows flushed", next_height, flushed);
        Ok(())
    }

    async fn fetch_block(&self, height: i32) -> Result<bitcoin::Block> {
        let mut retries = 0;
        loop {
            match self.bitcoin_client.get_block_by_height(height as u64).await {
                Ok(block) => return Ok(block),
                Err(e) if retries < Self::MAX_RETRIES => {
                    retries += 1;
                    error!(
                        "Retry {} fetching block {} after error: {}",
                        retries, height, e
                    );
                    sleep(Self::RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to fetch block {} after {} retries",
                            height,
                            Self::MAX_RETRIES
                        )
                    })
                }
            }
        }
    }

    async fn process_single_block(&self, height: i32) -> Result<()> {
        debug!("Processing block at height {}", height);
        let block = self.fetch_block(height).await?;
        self.recorder
            .record_block(height, &block)
            .with_context(|| format!("Failed to record block {}", height))?;
        if height % 1000 == 0 {
            info!("Processed block at height {}", height);
        }
        Ok(())
    }
}

/// Address partition and raw address bytes paid by an output script
fn extract_address_from_script(script: &Script) -> Option<(AddressType, Vec<u8>)> {
    // P2PKH is of the form: OP_DUP OP_HASH160 <20-byte hash> OP_EQUALVERIFY OP_CHECKSIG
    // The push opcode is folded into the hash element of the instructions vector
    if script.is_p2pkh() {
        if let Some(Ok(Instruction::PushBytes(hash160))) = script.instructions().nth(2) {
            return Some((AddressType::P2pkh, hash160.as_bytes().to_vec()));
        }
    }
    // P2SH is of the form: OP_HASH160 <20-byte hash> OP_EQUAL
    else if script.is_p2sh() {
        if let Some(Ok(Instruction::PushBytes(hash160))) = script.instructions().nth(1) {
            return Some((AddressType::P2sh, hash160.as_bytes().to_vec()));
        }
    }
    // Witness v0 programs: OP_0 <20 or 32 bytes>
    else if script.is_p2wpkh() {
        return Some((AddressType::P2wpkh, script.as_bytes().get(2..22)?.to_vec()));
    } else if script.is_p2wsh() {
        return Some((AddressType::P2wsh, script.as_bytes().get(2..34)?.to_vec()));
    }
    None
}
