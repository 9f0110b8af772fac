//! Envoi multipart parallèle, avec nouvelles tentatives par partie et
//! comptage précis des octets pour l'affichage de progression et d'ETA.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry::{retry, RetryPolicy};
use super::TransferError;
use crate::range::OffsetLength;
use crate::storage::{CompletedPart, ObjectStore, WriteCondition};

pub const DEFAULT_PART_SIZE: u64 = 10_000_000;
pub const DEFAULT_WORKERS: usize = 8;
/// Un fichier doit se découper en strictement moins de parties que cette limite.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub part_size: u64,
    /// Taille fixe du pool, indépendante du nombre de parties.
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: i32,
    pub range: OffsetLength,
}

/// Découpe `size` octets en parties de `part_size` (la dernière peut être plus courte).
///
/// Un fichier vide donne une seule partie vide. Refusé avant tout appel réseau
/// si le nombre de parties atteint [`MAX_PARTS`].
pub fn plan_parts(size: u64, part_size: u64) -> Result<Vec<UploadPart>, TransferError> {
    let part_size = part_size.clamp(1, u32::MAX as u64);
    let count = size.div_ceil(part_size).max(1);
    if count >= MAX_PARTS {
        return Err(TransferError::TooManyParts {
            size,
            parts: count,
            max: MAX_PARTS,
        });
    }
    Ok((0..count)
        .map(|i| {
            let offset = i * part_size;
            let length = part_size.min(size - offset) as u32;
            UploadPart {
                part_number: i as i32 + 1,
                range: OffsetLength::new(offset, length),
            }
        })
        .collect())
}

/// Compteurs d'octets lus en continu par l'interface (jamais verrouillés).
#[derive(Debug, Default)]
pub struct UploadCounters {
    transmitted: AtomicU64,
    banked: AtomicU64,
}

impl UploadCounters {
    /// Tous les octets jamais émis, tentatives échouées comprises (débit).
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::SeqCst)
    }

    /// Octets réellement acquis : les tentatives échouées sont retranchées (ETA).
    pub fn banked(&self) -> u64 {
        self.banked.load(Ordering::SeqCst)
    }

    fn record(&self, bytes: u64) {
        self.transmitted.fetch_add(bytes, Ordering::SeqCst);
        self.banked.fetch_add(bytes, Ordering::SeqCst);
    }

    fn roll_back(&self, bytes: u64) {
        let _ = self
            .banked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub key: String,
    pub e_tag: String,
    pub size: u64,
    pub parts: usize,
}

/// Bilan d'un lot : l'échec d'un fichier n'interrompt pas les autres.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub uploaded: Vec<UploadOutcome>,
    pub failed: Vec<(PathBuf, TransferError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
enum PartSource {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl PartSource {
    async fn len(&self) -> std::io::Result<u64> {
        match self {
            PartSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            PartSource::Memory(data) => Ok(data.len() as u64),
        }
    }

    async fn read(&self, range: OffsetLength) -> std::io::Result<Vec<u8>> {
        match self {
            PartSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.offset)).await?;
                let mut buffer = vec![0u8; range.length as usize];
                file.read_exact(&mut buffer).await?;
                Ok(buffer)
            }
            PartSource::Memory(data) => Ok(data[range.offset as usize..range.end() as usize].to_vec()),
        }
    }
}

/// Session multipart d'un fichier.
struct FileUpload {
    store: Arc<dyn ObjectStore>,
    counters: Arc<UploadCounters>,
    policy: RetryPolicy,
    bucket: String,
    key: String,
    upload_id: String,
    source: PartSource,
    /// Dérivé du jeton de l'appelant ; levé quand une partie échoue définitivement.
    cancel: CancellationToken,
    /// Octets comptés pour ce fichier et pas encore retranchés.
    provisional: AtomicU64,
}

impl FileUpload {
    async fn attempt_part(&self, part_number: i32, attempt: u32, data: Vec<u8>) -> Result<String, TransferError> {
        let sent = AtomicU64::new(0);
        let progress = |bytes: u64| {
            sent.fetch_add(bytes, Ordering::SeqCst);
            self.provisional.fetch_add(bytes, Ordering::SeqCst);
            self.counters.record(bytes);
        };
        let result = tokio::select! {
            result = self.store.upload_part(
                &self.bucket,
                &self.key,
                &self.upload_id,
                part_number,
                data,
                &progress,
            ) => result.map_err(TransferError::from),
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
        };
        if let Err(err) = &result {
            let sent = sent.load(Ordering::SeqCst);
            self.provisional.fetch_sub(sent, Ordering::SeqCst);
            self.counters.roll_back(sent);
            log::warn!(
                "UploadEngine::upload_part: key={}, part={}, attempt={}, rolled_back={}, error={}",
                self.key,
                part_number,
                attempt,
                sent,
                err
            );
        }
        result
    }
}

async fn upload_part(file: &Arc<FileUpload>, part: UploadPart) -> Result<CompletedPart, TransferError> {
    if file.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    let data = file.source.read(part.range).await?;
    let label = format!("upload_part({}#{})", file.key, part.part_number);
    let e_tag = retry(&file.policy, &file.cancel, &label, |attempt| {
        let file = Arc::clone(file);
        let data = data.clone();
        async move { file.attempt_part(part.part_number, attempt, data).await }
    })
    .await?;
    Ok(CompletedPart {
        part_number: part.part_number,
        e_tag,
    })
}

/// Garde la première erreur réelle ; une annulation induite ne masque pas la cause.
fn keep_first_failure(slot: &mut Option<TransferError>, err: TransferError) {
    let replace = match slot {
        None => true,
        Some(existing) => existing.is_cancelled() && !err.is_cancelled(),
    };
    if replace {
        *slot = Some(err);
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Moteur d'envoi : pool fixe de tâches tokio vidant une file commune.
///
/// Doit être créé depuis un runtime tokio.
pub struct UploadEngine {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
    counters: Arc<UploadCounters>,
    /// Le verrou garantit que les parties d'un fichier sont enfilées d'un bloc.
    queue: AsyncMutex<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let workers = (0..config.workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut receiver = receiver.lock().await;
                            receiver.recv().await
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();
        log::info!(
            "UploadEngine::new: workers={}, part_size={}, max_attempts={}",
            config.workers.max(1),
            config.part_size,
            config.retry.max_attempts
        );
        Self {
            store,
            config,
            counters: Arc::new(UploadCounters::default()),
            queue: AsyncMutex::new(sender),
            workers,
        }
    }

    pub fn counters(&self) -> Arc<UploadCounters> {
        Arc::clone(&self.counters)
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Envoie un fichier local sous `key` et renvoie la clé et l'ETag final.
    pub async fn upload_file(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        self.upload_source(
            PartSource::File(path.to_path_buf()),
            bucket,
            key,
            WriteCondition::None,
            cancel,
        )
        .await
    }

    /// Envoie un tampon en mémoire ; `condition` s'applique à la finalisation.
    pub async fn upload_bytes(
        &self,
        data: Vec<u8>,
        bucket: &str,
        key: &str,
        condition: WriteCondition,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        self.upload_source(PartSource::Memory(Arc::new(data)), bucket, key, condition, cancel)
            .await
    }

    /// Envoie plusieurs fichiers en parallèle ; chaque échec reste isolé.
    pub async fn upload_many(
        &self,
        files: Vec<(PathBuf, String)>,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let results = join_all(files.into_iter().map(|(path, key)| async move {
            let result = self.upload_file(&path, bucket, &key, cancel).await;
            (path, result)
        }))
        .await;

        let mut report = BatchReport::default();
        for (path, result) in results {
            match result {
                Ok(outcome) => report.uploaded.push(outcome),
                Err(err) => {
                    log::error!("UploadEngine::upload_many: path={}, error={}", path.display(), err);
                    report.failed.push((path, err));
                }
            }
        }
        report
    }

    async fn upload_source(
        &self,
        source: PartSource,
        bucket: &str,
        key: &str,
        condition: WriteCondition,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, TransferError> {
        let size = source.len().await?;
        let parts = plan_parts(size, self.config.part_size)?;
        let part_count = parts.len();
        log::info!(
            "UploadEngine::upload: bucket={}, key={}, size={}, parts={}",
            bucket,
            key,
            size,
            part_count
        );

        let store = &self.store;
        let upload_id = retry(&self.config.retry, cancel, "create_multipart_upload", |_| async move {
            store
                .create_multipart_upload(bucket, key)
                .await
                .map_err(TransferError::from)
        })
        .await?;

        let file = Arc::new(FileUpload {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            policy: self.config.retry.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            source,
            cancel: cancel.child_token(),
            provisional: AtomicU64::new(0),
        });

        let result = match self.run_parts(&file, parts).await {
            Ok(mut completed) => {
                completed.sort_by_key(|part| part.part_number);
                self.complete(&file, completed, condition, cancel).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(e_tag) => {
                log::info!("UploadEngine::upload success: key={}, etag={}", key, e_tag);
                Ok(UploadOutcome {
                    key: key.to_string(),
                    e_tag,
                    size,
                    parts: part_count,
                })
            }
            Err(err) => {
                file.cancel.cancel();
                self.abort(&file).await;
                let provisional = file.provisional.swap(0, Ordering::SeqCst);
                self.counters.roll_back(provisional);
                let err = if cancel.is_cancelled() {
                    TransferError::Cancelled
                } else {
                    err
                };
                log::error!(
                    "UploadEngine::upload failed: key={}, rolled_back={}, error={}",
                    key,
                    provisional,
                    err
                );
                Err(err)
            }
        }
    }

    async fn run_parts(
        &self,
        file: &Arc<FileUpload>,
        parts: Vec<UploadPart>,
    ) -> Result<Vec<CompletedPart>, TransferError> {
        let mut pending = Vec::with_capacity(parts.len());
        {
            let queue = self.queue.lock().await;
            for part in parts {
                let (done, receiver) = oneshot::channel();
                let file = Arc::clone(file);
                let job: Job = Box::pin(async move {
                    let result = upload_part(&file, part).await;
                    if matches!(&result, Err(err) if !err.is_cancelled()) {
                        file.cancel.cancel();
                    }
                    let _ = done.send(result);
                });
                queue.send(job).map_err(|_| TransferError::PoolClosed)?;
                pending.push(receiver);
            }
        }

        let mut completed = Vec::with_capacity(pending.len());
        let mut failure = None;
        for receiver in pending {
            match receiver.await {
                Ok(Ok(part)) => completed.push(part),
                Ok(Err(err)) => keep_first_failure(&mut failure, err),
                Err(_) => keep_first_failure(&mut failure, TransferError::PoolClosed),
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(completed),
        }
    }

    async fn complete(
        &self,
        file: &FileUpload,
        parts: Vec<CompletedPart>,
        condition: WriteCondition,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        retry(&self.config.retry, cancel, "complete_multipart_upload", |_| {
            let parts = parts.clone();
            let condition = condition.clone();
            async move {
                file.store
                    .complete_multipart_upload(&file.bucket, &file.key, &file.upload_id, parts, condition)
                    .await
                    .map_err(TransferError::from)
            }
        })
        .await
    }

    /// Abandon au mieux : son échec est journalisé puis ignoré.
    async fn abort(&self, file: &FileUpload) {
        match file
            .store
            .abort_multipart_upload(&file.bucket, &file.key, &file.upload_id)
            .await
        {
            Ok(()) => log::warn!(
                "UploadEngine::abort: key={}, upload_id={}",
                file.key,
                file.upload_id
            ),
            Err(err) => log::warn!(
                "UploadEngine::abort failed (ignored): key={}, upload_id={}, error={}",
                file.key,
                file.upload_id,
                err
            ),
        }
    }
}

impl Drop for UploadEngine {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, ObjectData, ObjectHead, ObjectTail, StoreError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const BUCKET: &str = "bucket";

    fn config(part_size: u64, workers: usize) -> UploadConfig {
        UploadConfig {
            part_size,
            workers,
            retry: RetryPolicy::immediate(3),
        }
    }

    #[test]
    fn parts_cover_file_and_last_is_short() {
        let parts = plan_parts(25, 10).unwrap();
        assert_eq!(
            parts,
            vec![
                UploadPart { part_number: 1, range: OffsetLength::new(0, 10) },
                UploadPart { part_number: 2, range: OffsetLength::new(10, 10) },
                UploadPart { part_number: 3, range: OffsetLength::new(20, 5) },
            ]
        );
        let empty = plan_parts(0, 10).unwrap();
        assert_eq!(empty.len(), 1);
        assert!(empty[0].range.is_empty());
    }

    #[test]
    fn part_ceiling_is_exclusive() {
        assert_eq!(plan_parts(9_999 * 10, 10).unwrap().len(), 9_999);
        assert!(matches!(
            plan_parts(9_999 * 10 + 1, 10),
            Err(TransferError::TooManyParts { parts: 10_000, .. })
        ));
    }

    /// Fait échouer définitivement une partie donnée, après avoir émis ses octets.
    struct BrokenPartStore {
        inner: MemoryStore,
        broken_part: i32,
        aborts: Mutex<u32>,
    }

    #[async_trait]
    impl ObjectStore for BrokenPartStore {
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
            if part_number == self.broken_part {
                progress(data.len() as u64);
                return Err(StoreError::Fatal("AccessDenied".to_string()));
            }
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
            *self.aborts.lock().unwrap() += 1;
            self.inner.abort_multipart_upload(bucket, key, upload_id).await
        }
    }

    #[tokio::test]
    async fn file_upload_round_trips_and_counts_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.zip");
        let data: Vec<u8> = (0..10_500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = UploadEngine::new(store.clone(), config(1_000, 3));
        let outcome = engine
            .upload_file(&path, BUCKET, "movie.zip", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.key, "movie.zip");
        assert_eq!(outcome.parts, 11);
        assert_eq!(store.object(BUCKET, "movie.zip").unwrap(), data);
        assert_eq!(engine.counters().transmitted(), 10_500);
        assert_eq!(engine.counters().banked(), 10_500);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn too_many_parts_is_refused_before_any_call() {
        let store = Arc::new(MemoryStore::new());
        let engine = UploadEngine::new(store.clone(), config(1, 2));
        let err = engine
            .upload_bytes(vec![0u8; 10_000], BUCKET, "big", WriteCondition::None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooManyParts { .. }));
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn irrecoverable_part_aborts_session_and_rolls_back() {
        let store = Arc::new(BrokenPartStore {
            inner: MemoryStore::new(),
            broken_part: 3,
            aborts: Mutex::new(0),
        });
        let engine = UploadEngine::new(store.clone(), config(100, 2));
        let err = engine
            .upload_bytes(vec![1u8; 1_000], BUCKET, "k", WriteCondition::None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Store(StoreError::Fatal(_))));
        assert_eq!(*store.aborts.lock().unwrap(), 1);
        assert_eq!(store.inner.pending_uploads(), 0);
        assert!(store.inner.object(BUCKET, "k").is_none());
        assert_eq!(engine.counters().banked(), 0);
        assert!(engine.counters().transmitted() >= 100);
    }

    #[tokio::test]
    async fn caller_cancellation_is_distinct_from_failure() {
        let store = Arc::new(MemoryStore::new());
        let engine = UploadEngine::new(store.clone(), config(100, 2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .upload_bytes(vec![1u8; 1_000], BUCKET, "k", WriteCondition::None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(engine.counters().banked(), 0);
    }

    #[tokio::test]
    async fn conditional_complete_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(BUCKET, "library.zip", b"theirs".to_vec(), WriteCondition::None)
            .await
            .unwrap();
        let engine = UploadEngine::new(store.clone(), config(4, 2));
        let err = engine
            .upload_bytes(
                b"ours, longer".to_vec(),
                BUCKET,
                "library.zip",
                WriteCondition::IfAbsent,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Store(StoreError::PreconditionFailed)));
        assert_eq!(store.object(BUCKET, "library.zip").unwrap(), b"theirs");
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.bin");
        std::fs::write(&good, vec![5u8; 300]).unwrap();
        let missing = dir.path().join("missing.bin");

        let store = Arc::new(MemoryStore::new());
        let engine = UploadEngine::new(store.clone(), config(100, 4));
        let report = engine
            .upload_many(
                vec![(good, "good".to_string()), (missing.clone(), "missing".to_string())],
                BUCKET,
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.is_complete());
        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.uploaded[0].key, "good");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, missing);
        assert!(matches!(report.failed[0].1, TransferError::Io(_)));
    }
}
