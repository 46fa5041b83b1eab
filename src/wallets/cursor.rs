use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::WalletError;
use crate::model::TransactionId;

/// First transaction id of the next batch, kept in memory or in a file so
/// a restarted process resumes where the last one stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Memory(TransactionId),
    File {
        path: PathBuf,
        position: TransactionId,
    },
}

impl Cursor {
    /// `start_from` is either a transaction id or a path to a cursor file.
    /// A missing file starts at `default`.
    pub fn parse(start_from: &str, default: TransactionId) -> Result<Self, WalletError> {
        if let Ok(position) = start_from.trim().parse::<TransactionId>() {
            return Ok(Cursor::Memory(position));
        }
        let path = PathBuf::from(start_from);
        let position = match fs::read_to_string(&path) {
            Ok(content) => {
                let value = content.trim();
                value
                    .parse::<TransactionId>()
                    .map_err(|_| WalletError::CursorValue {
                        path: path.clone(),
                        value: value.to_string(),
                    })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Cursor file {} does not exist yet, starting at transaction {}",
                    path.display(),
                    default
                );
                default
            }
            Err(source) => return Err(WalletError::Cursor { path, source }),
        };
        Ok(Cursor::File { path, position })
    }

    pub fn position(&self) -> TransactionId {
        match self {
            Cursor::Memory(position) => *position,
            Cursor::File { position, .. } => *position,
        }
    }

    pub fn store(&mut self, next: TransactionId) -> Result<(), WalletError> {
        match self {
            Cursor::Memory(position) => *position = next,
            Cursor::File { path, position } => {
                write_atomically(path, &format!("{}\n", next))
                    .map_err(|source| WalletError::Cursor {
                        path: path.clone(),
                        source,
                    })?;
                *position = next;
            }
        }
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    fs::write(&staging, content)?;
    fs::rename(&staging, path)
}

/// Asked between batches whether the engine should stop.
pub trait StopSignal {
    fn should_stop(&self) -> bool;
}

/// Stop request signalled by the presence of a file. The file is renamed
/// away when seen so the next run does not stop immediately.
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StopSignal for StopFile {
    fn should_stop(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        let mut consumed = self.path.as_os_str().to_owned();
        consumed.push("1");
        if let Err(e) = fs::rename(&self.path, &consumed) {
            warn!("Could not rename stop file {}: {}", self.path.display(), e);
        }
        true
    }
}
