use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use btc_wallet_scanner::bitcoin_client::BitcoinClient;
use btc_wallet_scanner::cache::Caches;
use btc_wallet_scanner::config::Settings;
use btc_wallet_scanner::db::{self, PgStore};
use btc_wallet_scanner::model::AddressType;
use btc_wallet_scanner::processor::BlockProcessor;
use btc_wallet_scanner::wallets::cursor::{Cursor, StopFile};
use btc_wallet_scanner::wallets::WalletClusterer;

/// Bitcoin block ingestion and address-to-wallet clustering
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file layered under SCANNER__* environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster input addresses of stored transactions into wallets
    UpdateWallets {
        /// Transaction id to start from, or a file holding it (rewritten after each batch)
        #[arg(short, long)]
        start_from: Option<String>,
        /// Transactions per batch
        #[arg(short, long)]
        batch_size: Option<i32>,
        /// Worker threads classifying transactions
        #[arg(short, long)]
        threads: Option<usize>,
        /// Creating this file stops the run at the next batch boundary
        #[arg(long)]
        stop_file: Option<PathBuf>,
        /// Return once the last stored transaction is processed instead of waiting
        #[arg(long)]
        exit_when_caught_up: bool,
    },
    /// Ingest blocks from the node's REST interface
    SyncBlocks {
        /// Creating this file stops the sync before the next block
        #[arg(long)]
        stop_file: Option<PathBuf>,
        /// Stop after ingesting this height
        #[arg(long)]
        to_height: Option<i32>,
    },
}

fn apply_overrides(settings: &mut Settings, command: &Commands) {
    match command {
        Commands::UpdateWallets {
            start_from,
            batch_size,
            threads,
            stop_file,
            exit_when_caught_up,
        } => {
            let wallets = &mut settings.wallets;
            if let Some(start_from) = start_from {
                wallets.start_from = start_from.clone();
            }
            if let Some(batch_size) = batch_size {
                wallets.batch_size = *batch_size;
            }
            if let Some(threads) = threads {
                wallets.threads = *threads;
            }
            if let Some(stop_file) = stop_file {
                wallets.stop_file = stop_file.clone();
            }
            wallets.exit_when_caught_up |= *exit_when_caught_up;
        }
        Commands::SyncBlocks {
            stop_file,
            to_height,
        } => {
            if let Some(stop_file) = stop_file {
                settings.sync.stop_file = stop_file.clone();
            }
            if to_height.is_some() {
                settings.sync.to_height = *to_height;
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Load environment variables
    dotenv().ok();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    apply_overrides(&mut settings, &cli.command);

    // Init DB connection
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    // Every classification worker, every partition updater and the flusher
    // may hold a connection at once
    let pool_size = settings.wallets.threads + AddressType::ALL.len() + 2;
    let db_pool = db::create_connection_pool(&database_url, pool_size as u32)
        .context("Failed to create database connection pool")?;
    info!("Database connection pool of {} created", pool_size);

    let mut conn = db_pool
        .get()
        .context("Failed to get database connection for migrations")?;
    db::run_migrations(&mut conn).context("Failed to run database migrations")?;
    drop(conn);

    let store = Arc::new(PgStore::new(db_pool));
    let caches = Arc::new(Caches::new(store.clone(), &settings.cache));
    caches
        .start_background_flush(Duration::from_millis(settings.cache.flush_interval_ms))
        .context("Failed to start the cache flusher")?;

    let result = match cli.command {
        Commands::UpdateWallets { .. } => update_wallets(store, caches.clone(), &settings),
        Commands::SyncBlocks { .. } => sync_blocks(caches.clone(), &settings),
    };

    caches.stop_background_flush();
    result?;
    let flushed = caches.checkpoint().context("Final cache flush failed")?;
    info!("Final flush wrote {} rows", flushed);
    Ok(())
}

fn update_wallets(store: Arc<PgStore>, caches: Arc<Caches>, settings: &Settings) -> Result<()> {
    let mut cursor = Cursor::parse(&settings.wallets.start_from, 1)?;
    let stop = StopFile::new(settings.wallets.stop_file.clone());
    let engine = WalletClusterer::new(store, caches, settings.wallets.clone());
    let stats = engine.run(&mut cursor, &stop)?;
    info!(
        "Wallet update finished at transaction {}: {} flagged, {} skipped, {} new wallets, {} merged",
        cursor.position(),
        stats.flagged,
        stats.skipped,
        stats.new_wallets,
        stats.merged
    );
    Ok(())
}

fn sync_blocks(caches: Arc<Caches>, settings: &Settings) -> Result<()> {
    // Init Bitcoin REST client
    let bitcoin_rest_url =
        env::var("BITCOIN_REST_URL").unwrap_or_else(|_| "http://127.0.0.1:8332".to_string());
    info!("Bitcoin REST URL: {}", bitcoin_rest_url);

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async {
        // Retry Bitcoin client connection with exponential backoff
        let mut retry_delay = Duration::from_secs(5);
        let max_retry_delay = Duration::from_secs(300); // 5 minutes

        let bitcoin_client = loop {
            match BitcoinClient::new(bitcoin_rest_url.clone()).await {
                Ok(client) => {
                    info!("Successfully connected to Bitcoin REST API!");
                    break client;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to Bitcoin REST API: {}. Retrying in {}s...",
                        e,
                        retry_delay.as_secs()
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = std::cmp::min(retry_delay * 2, max_retry_delay);
                }
            }
        };

        let stop = StopFile::new(settings.sync.stop_file.clone());
        let processor = BlockProcessor::new(bitcoin_client, caches, settings.sync.clone());
        processor.run(&stop).await
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            println!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        error!("Application error: {:#}", e);
        process::exit(1);
    }
    info!("Application has finished and is shutting down.");
}
