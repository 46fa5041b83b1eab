use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bytea, Integer, Nullable};

use super::schema::{block, input, output, transaction};
use crate::error::StoreError;
use crate::model;

// Row of the 'block' table
#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = block)]
pub struct Block {
    pub height: i32,
    pub hash: Vec<u8>, // internal byte order
    pub txn_count: i32,
}

// Row of the 'transaction' table
#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = transaction)]
pub struct Transaction {
    pub id: i32,
    pub txid: Vec<u8>, // internal byte order
    pub block_height: i32,
    pub n_inputs: i32,
    pub n_outputs: i32,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = output)]
pub struct Output {
    pub transaction_id: i32,
    pub pos: i16,
    pub address_id: i64,
    pub amount: i64,
    pub spent_status: i16,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = input)]
pub struct Input {
    pub transaction_id: i32,
    pub pos: i16,
    pub in_transaction_id: i32,
    pub in_pos: i16,
}

// Row of any of the per-type address tables, read through sql_query
#[derive(QueryableByName)]
pub struct Address {
    #[diesel(sql_type = BigInt)]
    pub address_id: i64,
    #[diesel(sql_type = Bytea)]
    pub address: Vec<u8>,
    #[diesel(sql_type = Integer)]
    pub wallet_id: i32,
}

#[derive(QueryableByName)]
pub struct MaxAddressId {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub max_id: Option<i64>,
}

#[derive(QueryableByName)]
pub struct WalletIdRow {
    #[diesel(sql_type = Integer)]
    pub id: i32,
}

impl From<Address> for model::Address {
    fn from(row: Address) -> Self {
        model::Address {
            address_id: row.address_id,
            address: row.address,
            wallet_id: row.wallet_id,
        }
    }
}

impl From<&model::Block> for Block {
    fn from(block: &model::Block) -> Self {
        Block {
            height: block.height,
            hash: block.hash.to_byte_array().to_vec(),
            txn_count: block.txn_count,
        }
    }
}

impl TryFrom<Block> for model::Block {
    type Error = StoreError;

    fn try_from(row: Block) -> Result<Self, StoreError> {
        let hash = BlockHash::from_slice(&row.hash).map_err(|e| {
            StoreError::Integrity(format!("block {} has a malformed hash: {}", row.height, e))
        })?;
        Ok(model::Block {
            height: row.height,
            hash,
            txn_count: row.txn_count,
        })
    }
}

impl From<&model::Transaction> for Transaction {
    fn from(tx: &model::Transaction) -> Self {
        Transaction {
            id: tx.transaction_id,
            txid: tx.txid.to_byte_array().to_vec(),
            block_height: tx.block_height,
            n_inputs: tx.n_inputs,
            n_outputs: tx.n_outputs,
        }
    }
}

impl TryFrom<Transaction> for model::Transaction {
    type Error = StoreError;

    fn try_from(row: Transaction) -> Result<Self, StoreError> {
        let txid = Txid::from_slice(&row.txid).map_err(|e| {
            StoreError::Integrity(format!("transaction {} has a malformed txid: {}", row.id, e))
        })?;
        Ok(model::Transaction {
            transaction_id: row.id,
            txid,
            block_height: row.block_height,
            n_inputs: row.n_inputs,
            n_outputs: row.n_outputs,
        })
    }
}

impl From<Output> for model::TxOutput {
    fn from(row: Output) -> Self {
        model::TxOutput {
            transaction_id: row.transaction_id,
            pos: row.pos,
            address_id: row.address_id,
            amount: row.amount,
            status: row.spent_status,
        }
    }
}

impl From<&model::TxOutput> for Output {
    fn from(output: &model::TxOutput) -> Self {
        Output {
            transaction_id: output.transaction_id,
            pos: output.pos,
            address_id: output.address_id,
            amount: output.amount,
            spent_status: output.status,
        }
    }
}

impl From<Input> for model::TxInput {
    fn from(row: Input) -> Self {
        model::TxInput {
            transaction_id: row.transaction_id,
            pos: row.pos,
            in_transaction_id: row.in_transaction_id,
            in_pos: row.in_pos,
        }
    }
}

impl From<&model::TxInput> for Input {
    fn from(input: &model::TxInput) -> Self {
        Input {
            transaction_id: input.transaction_id,
            pos: input.pos,
            in_transaction_id: input.in_transaction_id,
            in_pos: input.in_pos,
        }
    }
}
