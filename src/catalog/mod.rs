//! Catalogue de la bibliothèque : films, types d'étiquettes, étiquettes et liens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod diff;
pub mod store;
pub mod sync;

pub use diff::{CatalogDiff, TableDiff};
pub use store::{CatalogWriter, LocalCatalog};
pub use sync::{CatalogSync, SyncDownOutcome, SyncError, CONFLICT_MESSAGE, DOCUMENT_NAME};

/// Identifiant opaque et stable d'une ligne du catalogue.
pub type RowId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: RowId,
    pub title: String,
    /// Clé de l'archive du film dans le bucket.
    pub archive_key: String,
    pub file_name: String,
    pub file_size: u64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagType {
    pub id: RowId,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: RowId,
    pub tag_type_id: RowId,
    pub name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieTag {
    pub movie_id: RowId,
    pub tag_id: RowId,
}

/// État complet du catalogue, tel que synchronisé dans `library.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSnapshot {
    pub movies: Vec<Movie>,
    pub tag_types: Vec<TagType>,
    pub tags: Vec<Tag>,
    pub movie_tags: Vec<MovieTag>,
}

/// Ligne identifiée par sa clé primaire.
pub trait Keyed {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;
}

impl Keyed for Movie {
    type Key = RowId;

    fn key(&self) -> RowId {
        self.id.clone()
    }
}

impl Keyed for TagType {
    type Key = RowId;

    fn key(&self) -> RowId {
        self.id.clone()
    }
}

impl Keyed for Tag {
    type Key = RowId;

    fn key(&self) -> RowId {
        self.id.clone()
    }
}

impl Keyed for MovieTag {
    type Key = (RowId, RowId);

    fn key(&self) -> (RowId, RowId) {
        (self.movie_id.clone(), self.tag_id.clone())
    }
}

/// Erreurs du catalogue local.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("catalog lock poisoned")]
    Poisoned,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
