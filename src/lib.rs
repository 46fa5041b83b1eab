pub mod bitcoin_client;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod processor;
pub mod store;
pub mod wallets;
