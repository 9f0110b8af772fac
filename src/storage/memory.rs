use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    CompletedPart, ObjectData, ObjectHead, ObjectStore, ObjectTail, StoreError,
    WriteCondition,
};
use crate::range::OffsetLength;

/// Granularité des notifications de progression d'une partie.
const PROGRESS_CHUNK: usize = 64 * 1024;

struct StoredObject {
    data: Vec<u8>,
    e_tag: String,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, (String, Vec<u8>)>,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
}

/// Stockage objet en mémoire, avec ETags dérivés du contenu et écritures
/// conditionnelles atomiques. Sert au mode hors ligne et aux tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn content_tag(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(data)[..16]))
}

fn multipart_tag(parts: &[CompletedPart]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.e_tag.as_bytes());
    }
    format!("\"{}-{}\"", hex::encode(&hasher.finalize()[..16]), parts.len())
}

fn check_condition(existing: Option<&StoredObject>, condition: &WriteCondition) -> Result<(), StoreError> {
    match (condition, existing) {
        (WriteCondition::None, _) => Ok(()),
        (WriteCondition::IfMatch(expected), Some(object)) if object.e_tag == *expected => Ok(()),
        (WriteCondition::IfAbsent, None) => Ok(()),
        _ => Err(StoreError::PreconditionFailed),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Fatal("memory store lock poisoned".to_string()))
    }

    /// Contenu actuel d'un objet, s'il existe.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.lock().ok()?;
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.data.clone())
    }

    /// Nombre de sessions multipart ni terminées ni abandonnées.
    pub fn pending_uploads(&self) -> usize {
        self.lock().map(|state| state.uploads.len()).unwrap_or_default()
    }

    pub fn object_count(&self) -> usize {
        self.lock().map(|state| state.objects.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| ObjectHead {
                e_tag: object.e_tag.clone(),
                size: object.data.len() as u64,
            }))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError> {
        let state = self.lock()?;
        let object = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or(StoreError::NotFound)?;
        Ok(ObjectData {
            data: object.data.clone(),
            e_tag: object.e_tag.clone(),
        })
    }

    async fn get_range(&self, bucket: &str, key: &str, range: OffsetLength) -> Result<Vec<u8>, StoreError> {
        let state = self.lock()?;
        let object = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or(StoreError::NotFound)?;
        if range.end() > object.data.len() as u64 {
            return Err(StoreError::Fatal(format!(
                "range {} past object end {}",
                range.http_range(),
                object.data.len()
            )));
        }
        Ok(object.data[range.offset as usize..range.end() as usize].to_vec())
    }

    async fn get_tail(&self, bucket: &str, key: &str, len: u64) -> Result<ObjectTail, StoreError> {
        let state = self.lock()?;
        let object = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or(StoreError::NotFound)?;
        let object_len = object.data.len() as u64;
        let start = object_len.saturating_sub(len) as usize;
        Ok(ObjectTail {
            data: object.data[start..].to_vec(),
            object_len,
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        let mut state = self.lock()?;
        let id = (bucket.to_string(), key.to_string());
        check_condition(state.objects.get(&id), &condition)?;
        let e_tag = content_tag(&data);
        state.objects.insert(
            id,
            StoredObject {
                data,
                e_tag: e_tag.clone(),
            },
        );
        Ok(e_tag)
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let mut state = self.lock()?;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<String, StoreError> {
        for chunk in data.chunks(PROGRESS_CHUNK) {
            progress(chunk.len() as u64);
            tokio::task::yield_now().await;
        }
        let e_tag = content_tag(&data);
        let mut state = self.lock()?;
        let upload = state.uploads.get_mut(upload_id).ok_or(StoreError::NotFound)?;
        upload.parts.insert(part_number, (e_tag.clone(), data));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        condition: WriteCondition,
    ) -> Result<String, StoreError> {
        let mut state = self.lock()?;
        let upload = state.uploads.get(upload_id).ok_or(StoreError::NotFound)?;
        if upload.bucket != bucket || upload.key != key {
            return Err(StoreError::Fatal(format!(
                "upload {upload_id} belongs to {}/{}",
                upload.bucket, upload.key
            )));
        }
        if parts.windows(2).any(|pair| pair[0].part_number >= pair[1].part_number) {
            return Err(StoreError::Fatal("InvalidPartOrder: parts must ascend".to_string()));
        }
        let mut data = Vec::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((e_tag, bytes)) if *e_tag == part.e_tag => data.extend_from_slice(bytes),
                _ => {
                    return Err(StoreError::Fatal(format!(
                        "InvalidPart: part {} is unknown or has another ETag",
                        part.part_number
                    )))
                }
            }
        }

        let id = (bucket.to_string(), key.to_string());
        check_condition(state.objects.get(&id), &condition)?;
        let e_tag = multipart_tag(&parts);
        state.uploads.remove(upload_id);
        state.objects.insert(
            id,
            StoredObject {
                data,
                e_tag: e_tag.clone(),
            },
        );
        Ok(e_tag)
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: &str = "bucket";

    #[tokio::test]
    async fn conditional_put_is_checked_atomically() {
        let store = MemoryStore::new();
        let first = store
            .put(BUCKET, "k", b"one".to_vec(), WriteCondition::IfAbsent)
            .await
            .unwrap();
        assert_eq!(
            store.put(BUCKET, "k", b"two".to_vec(), WriteCondition::IfAbsent).await,
            Err(StoreError::PreconditionFailed)
        );
        assert_eq!(
            store
                .put(BUCKET, "k", b"two".to_vec(), WriteCondition::IfMatch("\"stale\"".to_string()))
                .await,
            Err(StoreError::PreconditionFailed)
        );
        let second = store
            .put(BUCKET, "k", b"two".to_vec(), WriteCondition::IfMatch(first.clone()))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(store.head(BUCKET, "k").await.unwrap().unwrap().e_tag, second);
    }

    #[tokio::test]
    async fn multipart_reports_chunked_progress_and_assembles_in_order() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart_upload(BUCKET, "big").await.unwrap();
        let seen = std::sync::atomic::AtomicU64::new(0);
        let progress = |n: u64| {
            seen.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        };

        let second = store
            .upload_part(BUCKET, "big", &upload_id, 2, vec![2u8; 100_000], &progress)
            .await
            .unwrap();
        let first = store
            .upload_part(BUCKET, "big", &upload_id, 1, vec![1u8; 10], &progress)
            .await
            .unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 100_010);

        let parts = vec![
            CompletedPart { part_number: 2, e_tag: second.clone() },
            CompletedPart { part_number: 1, e_tag: first.clone() },
        ];
        assert!(store
            .complete_multipart_upload(BUCKET, "big", &upload_id, parts, WriteCondition::None)
            .await
            .is_err());

        let parts = vec![
            CompletedPart { part_number: 1, e_tag: first },
            CompletedPart { part_number: 2, e_tag: second },
        ];
        let e_tag = store
            .complete_multipart_upload(BUCKET, "big", &upload_id, parts, WriteCondition::None)
            .await
            .unwrap();
        assert!(e_tag.ends_with("-2\""));
        let data = store.object(BUCKET, "big").unwrap();
        assert_eq!(data.len(), 100_010);
        assert_eq!(&data[..10], &[1u8; 10]);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn tail_and_range_reads() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..=255).collect();
        store.put(BUCKET, "obj", data, WriteCondition::None).await.unwrap();

        let tail = store.get_tail(BUCKET, "obj", 16).await.unwrap();
        assert_eq!(tail.object_len, 256);
        assert_eq!(tail.window_start(), 240);
        assert_eq!(tail.data[0], 240);

        let whole = store.get_tail(BUCKET, "obj", 1_000).await.unwrap();
        assert_eq!(whole.data.len(), 256);

        let range = store.get_range(BUCKET, "obj", OffsetLength::new(10, 3)).await.unwrap();
        assert_eq!(range, vec![10, 11, 12]);
        assert!(store.get_range(BUCKET, "obj", OffsetLength::new(250, 10)).await.is_err());
        assert_eq!(store.get(BUCKET, "missing").await, Err(StoreError::NotFound));
    }
}
