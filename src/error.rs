//! Error types of the store, cache and wallet layers.
//!
//! The binary wraps these in `anyhow` at the top level; library code keeps
//! them typed so callers can tell a failed flush from a broken invariant.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::WalletId;

/// Errors raised by the persisted store or by a cache flushing into it.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Query or batch statement failure reported by Postgres.
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// No connection could be checked out of the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A persisted row does not decode into a domain record.
    #[error("Integrity error: {0}")]
    Integrity(String),
}

/// Errors raised by the wallet-clustering engine.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A merge was requested with a zero id on either side or with itself.
    /// This is a caller bug and is never retried.
    #[error("Invalid wallet merge: keep={keep}, replace={replace}")]
    InvalidMerge { keep: WalletId, replace: WalletId },

    /// A worker thread went away before reporting its result.
    #[error("Worker pool lost a task result")]
    WorkerLost,

    #[error("Cursor file {path}: {source}")]
    Cursor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cursor file {path} holds an invalid value {value:?}")]
    CursorValue { path: PathBuf, value: String },
}
