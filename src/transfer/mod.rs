//! Transferts réseau : envoi multipart parallèle et reconstruction creuse.

use std::io;

use crate::archive::ArchiveError;
use crate::storage::StoreError;

pub mod fetch;
pub mod progress;
pub mod retry;
pub mod upload;

pub use fetch::{fetch_archive_index, FetchOutput, FetchedArchive, Fetcher};
pub use progress::{PhaseProgress, ProgressFn};
pub use retry::{retry, RetryPolicy};
pub use upload::{plan_parts, BatchReport, UploadConfig, UploadCounters, UploadEngine, UploadOutcome, UploadPart};

/// Erreurs des transferts (envoi et récupération).
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Annulation demandée par l'appelant : distincte d'un échec.
    #[error("transfer cancelled")]
    Cancelled,
    #[error("file of {size} bytes needs {parts} parts; multipart uploads allow fewer than {max}")]
    TooManyParts { size: u64, parts: u64, max: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("upload worker pool stopped")]
    PoolClosed,
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Store(err) if err.is_transient())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}
