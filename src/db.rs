use anyhow::{Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sql_types::{Array, BigInt, Bytea, Integer};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

use crate::error::StoreError;
use crate::model::{
    self, AddressId, AddressType, OutputKey, TransactionId, TxInput, TxOutput, WalletId,
};
use crate::store::{
    AddressChange, AddressStore, BlockStore, OutputChange, OutputStore, TransactionStore,
    WalletStore,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub mod models;
pub mod schema;

/// Type alias for database connection pool
pub type DbPool = Pool<ConnectionManager<PgConnection>>;

type DbConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Creates a Postgres connection pool
pub fn create_connection_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);

    Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(30))
        .test_on_check_out(true)
        .build(manager)
        .context("Failed to create database connection pool")
}

/// Runs database migrations
pub fn run_migrations(conn: &mut PgConnection) -> Result<()> {
    info!("Running database migrations");

    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            info!("Database migrations completed, {} applied", applied.len());
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("Failed to run database migrations: {}", e)
        }
    }
}

/// Splits `items` into maximal runs of consecutive items of the same kind.
fn runs<T, K: PartialEq>(items: &[T], kind: impl Fn(&T) -> K) -> Vec<&[T]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=items.len() {
        if i == items.len() || kind(&items[i]) != kind(&items[start]) {
            runs.push(&items[start..i]);
            start = i;
        }
    }
    runs
}

/// Postgres implementation of every store seam.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConnection, StoreError> {
        Ok(self.pool.get()?)
    }
}

fn insert_addresses(
    conn: &mut PgConnection,
    address_type: AddressType,
    inserts: &[AddressChange],
) -> QueryResult<usize> {
    let mut ids = Vec::with_capacity(inserts.len());
    let mut bytes = Vec::with_capacity(inserts.len());
    let mut wallets = Vec::with_capacity(inserts.len());
    for change in inserts {
        if let AddressChange::Insert(address) = change {
            ids.push(address.address_id);
            bytes.push(address.address.clone());
            wallets.push(address.wallet_id);
        }
    }
    diesel::sql_query(format!(
        "INSERT INTO {} (address_id, address, wallet_id) \
         SELECT * FROM UNNEST($1::bigint[], $2::bytea[], $3::integer[])",
        address_type.table_name()
    ))
    .bind::<Array<BigInt>, _>(ids)
    .bind::<Array<Bytea>, _>(bytes)
    .bind::<Array<Integer>, _>(wallets)
    .execute(conn)
}

fn update_address_wallets(
    conn: &mut PgConnection,
    address_type: AddressType,
    updates: &[AddressChange],
) -> QueryResult<usize> {
    // Last update of an address in the run wins.
    let mut latest = BTreeMap::new();
    for change in updates {
        if let AddressChange::Wallet {
            address_id,
            wallet_id,
        } = change
        {
            latest.insert(*address_id, *wallet_id);
        }
    }
    let (ids, wallets): (Vec<AddressId>, Vec<WalletId>) = latest.into_iter().unzip();
    diesel::sql_query(format!(
        "UPDATE {} AS a SET wallet_id = v.wallet_id \
         FROM UNNEST($1::bigint[], $2::integer[]) AS v(address_id, wallet_id) \
         WHERE a.address_id = v.address_id",
        address_type.table_name()
    ))
    .bind::<Array<BigInt>, _>(ids)
    .bind::<Array<Integer>, _>(wallets)
    .execute(conn)
}

impl AddressStore for PgStore {
    fn find_by_id(
        &self,
        address_type: AddressType,
        address_id: AddressId,
    ) -> Result<Option<model::Address>, StoreError> {
        let mut conn = self.conn()?;
        let row = diesel::sql_query(format!(
            "SELECT address_id, address, wallet_id FROM {} WHERE address_id = $1",
            address_type.table_name()
        ))
        .bind::<BigInt, _>(address_id)
        .get_result::<models::Address>(&mut conn)
        .optional()?;
        Ok(row.map(model::Address::from))
    }

    fn find_by_address(
        &self,
        address_type: AddressType,
        address: &[u8],
    ) -> Result<Option<model::Address>, StoreError> {
        let mut conn = self.conn()?;
        let row = diesel::sql_query(format!(
            "SELECT address_id, address, wallet_id FROM {} WHERE address = $1",
            address_type.table_name()
        ))
        .bind::<Bytea, _>(address.to_vec())
        .get_result::<models::Address>(&mut conn)
        .optional()?;
        Ok(row.map(model::Address::from))
    }

    fn last_address_id(&self, address_type: AddressType) -> Result<Option<AddressId>, StoreError> {
        let mut conn = self.conn()?;
        let row = diesel::sql_query(format!(
            "SELECT MAX(address_id) AS max_id FROM {}",
            address_type.table_name()
        ))
        .get_result::<models::MaxAddressId>(&mut conn)?;
        Ok(row.max_id)
    }

    fn apply_address_changes(
        &self,
        address_type: AddressType,
        changes: &[AddressChange],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            for run in runs(changes, |c| matches!(c, AddressChange::Insert(_))) {
                match run.first() {
                    Some(AddressChange::Insert(_)) => insert_addresses(conn, address_type, run)?,
                    Some(AddressChange::Wallet { .. }) => {
                        update_address_wallets(conn, address_type, run)?
                    }
                    None => 0,
                };
            }
            Ok(())
        })?;
        Ok(())
    }

    fn replace_wallet(
        &self,
        address_type: AddressType,
        from: WalletId,
        to: WalletId,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let updated = diesel::sql_query(format!(
            "UPDATE {} SET wallet_id = $1 WHERE wallet_id = $2",
            address_type.table_name()
        ))
        .bind::<Integer, _>(to)
        .bind::<Integer, _>(from)
        .execute(&mut conn)?;
        Ok(updated)
    }
}

impl OutputStore for PgStore {
    fn outputs(&self, transaction_id: TransactionId) -> Result<Vec<TxOutput>, StoreError> {
        use schema::output;

        let mut conn = self.conn()?;
        let rows = output::table
            .filter(output::transaction_id.eq(transaction_id))
            .order(output::pos.asc())
            .select(models::Output::as_select())
            .load(&mut conn)?;
        Ok(rows.into_iter().map(TxOutput::from).collect())
    }

    fn output(&self, key: OutputKey) -> Result<Option<TxOutput>, StoreError> {
        use schema::output;

        let mut conn = self.conn()?;
        let row = output::table
            .find((key.transaction_id, key.pos))
            .select(models::Output::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(row.map(TxOutput::from))
    }

    fn apply_output_changes(&self, changes: &[OutputChange]) -> Result<(), StoreError> {
        use schema::output;

        let mut conn = self.conn()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            for run in runs(changes, |c| matches!(c, OutputChange::Insert(_))) {
                if let Some(OutputChange::Insert(_)) = run.first() {
                    let rows: Vec<models::Output> = run
                        .iter()
                        .filter_map(|c| match c {
                            OutputChange::Insert(o) => Some(models::Output::from(o)),
                            _ => None,
                        })
                        .collect();
                    diesel::insert_into(output::table)
                        .values(&rows)
                        .execute(conn)?;
                    continue;
                }
                for change in run {
                    let key = change.key();
                    let target = output::table.find((key.transaction_id, key.pos));
                    match change {
                        OutputChange::Insert(_) => 0,
                        OutputChange::Delete(_) => diesel::delete(target).execute(conn)?,
                        OutputChange::Status(_, status) => diesel::update(target)
                            .set(output::spent_status.eq(*status))
                            .execute(conn)?,
                        OutputChange::Address(_, address_id) => diesel::update(target)
                            .set(output::address_id.eq(*address_id))
                            .execute(conn)?,
                        OutputChange::Amount(_, amount) => diesel::update(target)
                            .set(output::amount.eq(*amount))
                            .execute(conn)?,
                    };
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl BlockStore for PgStore {
    fn block_by_height(&self, height: i32) -> Result<Option<model::Block>, StoreError> {
        use schema::block;

        let mut conn = self.conn()?;
        block::table
            .find(height)
            .select(models::Block::as_select())
            .first(&mut conn)
            .optional()?
            .map(model::Block::try_from)
            .transpose()
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<model::Block>, StoreError> {
        use schema::block;

        let mut conn = self.conn()?;
        block::table
            .filter(block::hash.eq(hash.to_byte_array().to_vec()))
            .select(models::Block::as_select())
            .first(&mut conn)
            .optional()?
            .map(model::Block::try_from)
            .transpose()
    }

    fn last_block_height(&self) -> Result<Option<i32>, StoreError> {
        use schema::block;

        let mut conn = self.conn()?;
        Ok(block::table
            .select(diesel::dsl::max(block::height))
            .first::<Option<i32>>(&mut conn)?)
    }

    fn insert_blocks(&self, blocks: &[model::Block]) -> Result<(), StoreError> {
        use schema::block;

        let rows: Vec<models::Block> = blocks.iter().map(models::Block::from).collect();
        let mut conn = self.conn()?;
        diesel::insert_into(block::table)
            .values(&rows)
            .execute(&mut conn)?;
        Ok(())
    }
}

impl TransactionStore for PgStore {
    fn transactions_in_range(
        &self,
        first: TransactionId,
        last: TransactionId,
    ) -> Result<Vec<model::Transaction>, StoreError> {
        use schema::transaction;

        let mut conn = self.conn()?;
        let rows = transaction::table
            .filter(transaction::id.between(first, last))
            .filter(transaction::n_inputs.gt(0))
            .order(transaction::id.asc())
            .select(models::Transaction::as_select())
            .load(&mut conn)?;
        rows.into_iter().map(model::Transaction::try_from).collect()
    }

    fn inputs(&self, transaction_id: TransactionId) -> Result<Vec<TxInput>, StoreError> {
        use schema::input;

        let mut conn = self.conn()?;
        let rows = input::table
            .filter(input::transaction_id.eq(transaction_id))
            .order(input::pos.asc())
            .select(models::Input::as_select())
            .load(&mut conn)?;
        Ok(rows.into_iter().map(TxInput::from).collect())
    }

    fn last_transaction_id(&self) -> Result<Option<TransactionId>, StoreError> {
        use schema::transaction;

        let mut conn = self.conn()?;
        Ok(transaction::table
            .select(diesel::dsl::max(transaction::id))
            .first::<Option<i32>>(&mut conn)?)
    }

    fn transaction_id_by_hash(&self, txid: &Txid) -> Result<Option<TransactionId>, StoreError> {
        use schema::transaction;

        let mut conn = self.conn()?;
        Ok(transaction::table
            .filter(transaction::txid.eq(txid.to_byte_array().to_vec()))
            .order(transaction::id.desc())
            .select(transaction::id)
            .first::<i32>(&mut conn)
            .optional()?)
    }

    fn insert_transactions(&self, transactions: &[model::Transaction]) -> Result<(), StoreError> {
        use schema::transaction;

        let rows: Vec<models::Transaction> =
            transactions.iter().map(models::Transaction::from).collect();
        let mut conn = self.conn()?;
        diesel::insert_into(transaction::table)
            .values(&rows)
            .execute(&mut conn)?;
        Ok(())
    }

    fn insert_inputs(&self, inputs: &[TxInput]) -> Result<(), StoreError> {
        use schema::input;

        let rows: Vec<models::Input> = inputs.iter().map(models::Input::from).collect();
        let mut conn = self.conn()?;
        diesel::insert_into(input::table)
            .values(&rows)
            .execute(&mut conn)?;
        Ok(())
    }
}

fn referenced_wallets_union() -> String {
    AddressType::ALL
        .iter()
        .map(|t| format!("SELECT wallet_id FROM {}", t.table_name()))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

impl WalletStore for PgStore {
    fn last_wallet_id(&self) -> Result<Option<WalletId>, StoreError> {
        use schema::wallet;

        let mut conn = self.conn()?;
        Ok(wallet::table
            .select(diesel::dsl::max(wallet::id))
            .first::<Option<i32>>(&mut conn)?)
    }

    fn insert_wallets(&self, wallet_ids: &[WalletId]) -> Result<(), StoreError> {
        use schema::wallet;

        let rows: Vec<_> = wallet_ids.iter().map(|id| wallet::id.eq(*id)).collect();
        let mut conn = self.conn()?;
        diesel::insert_into(wallet::table)
            .values(&rows)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        Ok(())
    }

    fn missing_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError> {
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(format!(
            "SELECT DISTINCT a.wallet_id AS id FROM ({}) a \
             WHERE a.wallet_id <> 0 \
             AND NOT EXISTS (SELECT 1 FROM wallet w WHERE w.id = a.wallet_id) \
             ORDER BY 1",
            referenced_wallets_union()
        ))
        .load::<models::WalletIdRow>(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    fn unused_wallet_ids(&self) -> Result<Vec<WalletId>, StoreError> {
        let unreferenced = AddressType::ALL
            .iter()
            .map(|t| {
                format!(
                    "NOT EXISTS (SELECT 1 FROM {} a WHERE a.wallet_id = w.id)",
                    t.table_name()
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let mut conn = self.conn()?;
        let rows = diesel::sql_query(format!(
            "SELECT w.id FROM wallet w WHERE {} ORDER BY w.id",
            unreferenced
        ))
        .load::<models::WalletIdRow>(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}
