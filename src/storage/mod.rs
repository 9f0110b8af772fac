//! Accès au stockage objet compatible S3.
//!
//! Le reste du crate ne parle qu'au trait [`ObjectStore`] : [`S3Store`] en
//! production, [`MemoryStore`] hors ligne et dans les tests.

use async_trait::async_trait;

use crate::range::OffsetLength;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Métadonnées renvoyées par HEAD. L'ETag sert de tampon de version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub e_tag: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub data: Vec<u8>,
    pub e_tag: String,
}

/// Derniers octets d'un objet, avec la longueur totale de l'objet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTail {
    pub data: Vec<u8>,
    pub object_len: u64,
}

impl ObjectTail {
    /// Offset absolu du premier octet de `data`.
    pub fn window_start(&self) -> u64 {
        self.object_len - self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Condition d'écriture évaluée atomiquement par le stockage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    #[default]
    None,
    /// L'objet doit encore porter cet ETag.
    IfMatch(String),
    /// L'objet ne doit pas exister.
    IfAbsent,
}

/// Erreurs du module Storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Object not found")]
    NotFound,
    #[error("write condition failed: the object changed")]
    PreconditionFailed,
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Limitation de débit, 5xx, délais : à réessayer.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>, StoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError>;

    async fn get_range(&self, bucket: &str, key: &str, range: OffsetLength) -> Result<Vec<u8>, StoreError>;

    /// Lit au plus `len` octets en fin d'objet.
    async fn get_tail(&self, bucket: &str, key: &str, len: u64) -> Result<ObjectTail, StoreError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError>;

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<String, StoreError>;

    /// `parts` doit être trié par numéro croissant. Renvoie l'ETag de l'objet.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        condition: WriteCondition,
    ) -> Result<String, StoreError>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError>;
}
