use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cinevault::archive::{open_document, seal_document};
use cinevault::catalog::{CatalogSnapshot, CatalogSync, LocalCatalog, SyncDownOutcome, SyncError, TagType, DOCUMENT_NAME};
use cinevault::config::{StoreConfig, VaultConfig};
use cinevault::crypto::ArchivePassword;
use cinevault::range::OffsetLength;
use cinevault::storage::{
    CompletedPart, MemoryStore, ObjectData, ObjectHead, ObjectStore, ObjectTail, StoreError, WriteCondition,
};
use cinevault::transfer::{RetryPolicy, UploadConfig, UploadEngine};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "vault";
const CATALOG_KEY: &str = "library.zip";

fn password() -> ArchivePassword {
    ArchivePassword::new("shared secret")
}

fn config(dir: &Path) -> VaultConfig {
    VaultConfig {
        store: StoreConfig::new(
            "key".to_string(),
            "secret".to_string(),
            "http://localhost:9000".to_string(),
            BUCKET.to_string(),
        ),
        catalog_key: CATALOG_KEY.to_string(),
        password: password(),
        database_path: dir.join("library.db"),
        scratch_dir: dir.join("scratch"),
        media_dir: dir.join("media"),
        upload: UploadConfig {
            part_size: 512,
            workers: 2,
            retry: RetryPolicy::immediate(3),
        },
    }
}

fn device(dir: &TempDir, store: Arc<dyn ObjectStore>) -> CatalogSync {
    let config = config(dir.path());
    let catalog = Arc::new(LocalCatalog::open(&config.database_path).unwrap());
    let uploader = Arc::new(UploadEngine::new(Arc::clone(&store), config.upload.clone()));
    CatalogSync::new(&config, catalog, store, uploader)
}

fn tag_type(id: &str, name: &str) -> TagType {
    TagType {
        id: id.to_string(),
        name: name.to_string(),
        sort_order: 0,
    }
}

/// Écrit un autre catalogue sur la clé au moment où un envoi démarre,
/// entre la vérification préalable et l'écriture conditionnelle.
struct InterferingStore {
    inner: MemoryStore,
    armed: AtomicBool,
    foreign: Vec<u8>,
}

#[async_trait]
impl ObjectStore for InterferingStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        self.inner.head(bucket, key).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError> {
        self.inner.get(bucket, key).await
    }

    async fn get_range(&self, bucket: &str, key: &str, range: OffsetLength) -> Result<Vec<u8>, StoreError> {
        self.inner.get_range(bucket, key, range).await
    }

    async fn get_tail(&self, bucket: &str, key: &str, len: u64) -> Result<ObjectTail, StoreError> {
        self.inner.get_tail(bucket, key, len).await
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>, condition: WriteCondition) -> Result<String, StoreError> {
        self.inner.put(bucket, key, data, condition).await
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        if key == CATALOG_KEY && self.armed.swap(false, Ordering::SeqCst) {
            self.inner
                .put(bucket, key, self.foreign.clone(), WriteCondition::None)
                .await?;
        }
        self.inner.create_multipart_upload(bucket, key).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<String, StoreError> {
        self.inner
            .upload_part(bucket, key, upload_id, part_number, data, progress)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, parts, condition)
            .await
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.inner.abort_multipart_upload(bucket, key, upload_id).await
    }
}

#[tokio::test]
async fn second_sync_down_is_a_no_op() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let (alice_dir, bob_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let alice = device(&alice_dir, Arc::clone(&store));
    let bob = device(&bob_dir, store);
    let cancel = CancellationToken::new();

    alice
        .mutate(&cancel, |w| w.upsert_tag_type(&tag_type("genre", "Genre")))
        .await
        .unwrap();

    let first = bob.sync_down(&cancel).await.unwrap();
    assert!(matches!(first, SyncDownOutcome::Applied { changes: 1, .. }));
    let stamp = bob.catalog().version_stamp().unwrap();
    let snapshot = bob.catalog().snapshot().unwrap();

    // Aucune écriture distante entre les deux appels.
    assert_eq!(bob.sync_down(&cancel).await.unwrap(), SyncDownOutcome::UpToDate);
    assert_eq!(bob.catalog().version_stamp().unwrap(), stamp);
    assert_eq!(bob.catalog().snapshot().unwrap(), snapshot);
}

#[tokio::test]
async fn write_between_check_and_upload_is_a_conflict() {
    let foreign_snapshot = CatalogSnapshot {
        tag_types: vec![tag_type("decade", "Decade")],
        ..CatalogSnapshot::default()
    };
    let foreign = seal_document(
        DOCUMENT_NAME,
        &serde_json::to_vec(&foreign_snapshot).unwrap(),
        &password(),
    )
    .unwrap();
    let store = Arc::new(InterferingStore {
        inner: MemoryStore::new(),
        armed: AtomicBool::new(false),
        foreign,
    });
    let dir = TempDir::new().unwrap();
    let alice = device(&dir, store.clone());
    let cancel = CancellationToken::new();

    alice
        .mutate(&cancel, |w| w.upsert_tag_type(&tag_type("genre", "Genre")))
        .await
        .unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let err = alice
        .mutate(&cancel, |w| w.upsert_tag_type(&tag_type("studio", "Studio")))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict));

    // L'objet distant est celui de l'autre écrivain, et le miroir local l'a rattrapé.
    let remote = store.inner.object(BUCKET, CATALOG_KEY).unwrap();
    let document = open_document(&remote, DOCUMENT_NAME, &password()).unwrap();
    let remote_snapshot: CatalogSnapshot = serde_json::from_slice(&document).unwrap();
    assert_eq!(remote_snapshot, foreign_snapshot);
    assert_eq!(alice.catalog().snapshot().unwrap(), foreign_snapshot);
    assert_eq!(
        alice.catalog().version_stamp().unwrap(),
        store.inner.head(BUCKET, CATALOG_KEY).await.unwrap().map(|head| head.e_tag)
    );
    assert_eq!(store.inner.pending_uploads(), 0);
}
