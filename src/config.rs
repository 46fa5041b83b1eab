use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::cache::CacheSettings;
use crate::processor::SyncSettings;
use crate::wallets::WalletSettings;

/// Tuning knobs of both commands. Every field has a default, so an empty
/// configuration is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub wallets: WalletSettings,
    pub sync: SyncSettings,
}

impl Settings {
    /// Layers `path` (or an optional `scanner.toml` in the working directory)
    /// under `SCANNER__*` environment variables, e.g.
    /// `SCANNER__WALLETS__BATCH_SIZE=5000`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("scanner").required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix("SCANNER").try_parsing(true).separator("__"))
            .build()?
            .try_deserialize::<Settings>()?;
        debug!("{:#?}", settings);
        Ok(settings)
    }
}
