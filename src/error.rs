use std::io;

use crate::archive::ArchiveError;
use crate::catalog::{CatalogError, SyncError};
use crate::config::ConfigError;
use crate::transfer::TransferError;

/// Erreurs exposées par la bibliothèque.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Transfer(TransferError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Sync(SyncError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: String },
    /// Annulation demandée : ce n'est pas un échec.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Error::Cancelled,
            other => Error::Transfer(other),
        }
    }
}

impl From<SyncError> for Error {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Cancelled => Error::Cancelled,
            other => Error::Sync(other),
        }
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Vrai pour « another user updated the library at the same time; please retry ».
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Sync(err) if err.is_conflict())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
