//! Seams between the caches and the relational store.
//!
//! Caches and the wallet engine only ever talk to these traits; the diesel
//! implementation lives in [`crate::db::PgStore`].

use bitcoin::{BlockHash, Txid};

use crate::error::StoreError;
use crate::model::{
    Address, AddressId, AddressType, Block, OutputKey, Transaction, TransactionId, TxInput,
    TxOutput, WalletId,
};

#[cfg(test)]
pub(crate) mod memory;

/// A staged mutation of one address row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressChange {
    Insert(Address),
    Wallet {
        address_id: AddressId,
        wallet_id: WalletId,
    },
}

/// A staged mutation of one output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChange {
    Insert(TxOutput),
    Delete(OutputKey),
    Status(OutputKey, i16),
    Address(OutputKey, AddressId),
    Amount(OutputKey, i64),
}

impl OutputChange {
    pub fn key(&self) -> OutputKey {
        match self {
            OutputChange::Insert(output) => output.key(),
            OutputChange::Delete(key)
            | OutputChange::Status(key, _)
            | OutputChange::Address(key, _)
            | OutputChange::Amount(key, _) => *key,
        }
    }
}

pub trait AddressStore: Send + Sync {
    fn find_by_id(
        &self,
        address_type: AddressType,
        address_id: AddressId,
    ) -> Result<Option<Address>, StoreError>;

    fn find_by_address(
        &self,
        address_type: AddressType,
        address: &[u8],
    ) -> Result<Option<Address>, StoreError>;

    /// Highest address id persisted in the partition, if any.
    fn last_address_id(&self, address_type: AddressType) -> Result<Option<AddressId>, StoreError>;

    /// Executes one flush batch, in order.
    fn apply_address_changes(
        &self,
        address_type: AddressType,
        changes: &[AddressChange],
    ) -> Result<(), StoreError>;

    /// Repoints every address of the partition carrying `from` to `to`.
    /// Returns the number of rows updated.
    fn replace_wallet(
        &self,
        address_type: AddressType,
        from: WalletId,
        to: WalletId,
    ) -> Result<usize, StoreError>;
}

pub trait OutputStore: Send + Sync {
    /// All outputs of a transaction ordered by position.
    fn outputs(&self, transaction_id: TransactionId) -> Result<Vec<TxOutput>, StoreError>;

    fn output(&self, key: OutputKey) -> Result<Option<TxOutput>, StoreError>;

    fn apply_output_changes(&self, changes: &[OutputChange]) -> Result<(), StoreError>;
}

pub trait BlockStore: Send + Sync {
    fn block_by_height(&self, height: i32) -> Result<Option<Block>, StoreError>;

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, StoreError>;

    fn last_block_height(&self) -> Result<Option<i32>, StoreError>;

    fn insert_blocks(&self, blocks: &[Block]) -> Result<(), StoreError>;
}

pub trait TransactionStore: Send + Sync {
    /// Transactions with at least one input whose id lies in `[first, last]`,
    /// ordered by id.
    fn transactions_in_range(
        &self,
        first: TransactionId,
        last: TransactionId,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Inputs of a transaction ordered by position.
    fn inputs(&self, transaction_id: TransactionId) -> Result<Vec<TxInput>, StoreError>;

    fn last_transaction_id(&self) -> Result<Option<TransactionId>, StoreError>;

    fn transaction_id_by_hash(&self, txid: &Txid) -> Result<Option<TransactionId>, StoreError>;

    fn insert_transactions(&self, transactions: &[Transaction]) -> Result<(), StoreError>;

    fn insert_inputs(&self, inputs: &[TxInput]) -> Result<(), StoreError>;
}

pub trait WalletStore: Send + Sync {
    fn last_wallet_id(&self) -> Result<Option<WalletId>, StoreError>;

    /// Inserts wallet rows, ignoring ids that already exist.
    fn insert_wallets(&self, wallet_ids: &[WalletId]) -> Result<(), StoreError>;

    /// Wallet ids referenced by some address but without a wallet row.
    fn missing_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError>;

    /// Wallet rows no address refers to.
    fn unused_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError>;
}

/// Everything the scanner needs from the persisted store.
pub trait Store: AddressStore + OutputStore + BlockStore + TransactionStore + WalletStore {}

impl<T> Store for T where T: AddressStore + OutputStore + BlockStore + TransactionStore + WalletStore
{}
