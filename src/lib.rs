//! cinevault : bibliothèque de films chiffrée sur stockage objet compatible S3.
//!
//! - `archive` : archives zip AES-256 avec index de disposition physique en trailer.
//! - `transfer` : envoi multipart parallèle et reconstruction creuse par plages.
//! - `catalog` : miroir SQLite du catalogue et synchronisation optimiste.
//! - `library` : façade qui enchaîne le tout.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod library;
pub mod range;
pub mod storage;
pub mod transfer;

pub use archive::{ArchiveError, ArchiveIndex, ArchiveReader, ArchiveWriter, MovieSource, SparseView};
pub use catalog::{CatalogSnapshot, LocalCatalog, Movie, SyncDownOutcome, SyncError, Tag, TagType};
pub use config::{StoreConfig, VaultConfig};
pub use crypto::ArchivePassword;
pub use error::{Error, Result};
pub use library::Library;
pub use range::OffsetLength;
pub use storage::{MemoryStore, ObjectStore, S3Store, StoreError};
pub use transfer::{Fetcher, TransferError, UploadConfig, UploadCounters, UploadEngine};

/// Installe `env_logger` (niveau `info` par défaut, `RUST_LOG` sinon).
///
/// Sans effet si un logger est déjà installé.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
