//! Synchronisation entre le miroir local et l'objet catalogue chiffré distant.
//!
//! Concurrence optimiste : le tag de version (ETag) de l'objet distant est
//! comparé au dernier tag connu localement avant toute écriture, et
//! l'écriture elle-même est conditionnée à ce tag.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use super::diff::CatalogDiff;
use super::store::{CatalogWriter, LocalCatalog, MovieFile};
use super::{CatalogError, CatalogSnapshot, Movie};
use crate::archive::writer::{CLIP_NAME, PLAYLIST_NAME};
use crate::archive::{open_document, seal_document, ArchiveError};
use crate::config::VaultConfig;
use crate::crypto::ArchivePassword;
use crate::storage::{ObjectStore, StoreError, WriteCondition};
use crate::transfer::fetch::{FetchedArchive, Fetcher, HEADER_FILE_NAME, INDEX_FILE_NAME};
use crate::transfer::{retry, RetryPolicy, TransferError, UploadEngine};

pub const CONFLICT_MESSAGE: &str = "another user updated the library at the same time; please retry";

/// Nom du document JSON dans l'archive catalogue.
pub const DOCUMENT_NAME: &str = "library.json";

/// Membres nécessaires à la lecture d'un film.
pub const PLAYBACK_MEMBERS: [&str; 2] = [PLAYLIST_NAME, CLIP_NAME];

/// Erreurs de synchronisation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Le catalogue distant a changé depuis la dernière synchronisation.
    #[error("another user updated the library at the same time; please retry")]
    Conflict,
    #[error("sync cancelled")]
    Cancelled,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Transfer(TransferError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("invalid catalog document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransferError> for SyncError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => SyncError::Cancelled,
            other => SyncError::Transfer(other),
        }
    }
}

impl SyncError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict)
    }
}

/// Résultat d'un SyncDown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncDownOutcome {
    /// Tag local identique au tag distant (ou aucun catalogue distant) : rien à faire.
    UpToDate,
    Applied {
        stamp: String,
        changes: usize,
        new_movies: usize,
    },
}

/// Copie les fichiers extraits d'une archive dans `media_dir/<movie_id>/`.
///
/// L'en-tête brut et l'index sont conservés pour l'extraction à la demande.
pub(crate) fn persist_fetched(media_dir: &Path, movie_id: &str, archive: &FetchedArchive) -> io::Result<Vec<MovieFile>> {
    let dir = media_dir.join(movie_id);
    fs::create_dir_all(&dir)?;

    let mut files = Vec::with_capacity(archive.members.len() + 2);
    let mut keep = |member: &str, source: &Path| -> io::Result<()> {
        let target = dir.join(member);
        fs::copy(source, &target)?;
        files.push((movie_id.to_string(), member.to_string(), target));
        Ok(())
    };
    for (member, path) in &archive.members {
        keep(member, path)?;
    }
    keep(HEADER_FILE_NAME, &archive.header_path)?;
    keep(INDEX_FILE_NAME, &archive.index_path)?;
    Ok(files)
}

/// Supprime `media_dir/<movie_id>/` ; un dossier déjà absent n'est pas une erreur.
pub(crate) fn remove_media(media_dir: &Path, movie_id: &str) -> io::Result<()> {
    match fs::remove_dir_all(media_dir.join(movie_id)) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Pilote SyncDown / SyncUp pour une bibliothèque.
pub struct CatalogSync {
    catalog: Arc<LocalCatalog>,
    store: Arc<dyn ObjectStore>,
    uploader: Arc<UploadEngine>,
    fetcher: Fetcher,
    bucket: String,
    catalog_key: String,
    password: ArchivePassword,
    scratch_dir: PathBuf,
    media_dir: PathBuf,
    policy: RetryPolicy,
}

impl CatalogSync {
    pub fn new(
        config: &VaultConfig,
        catalog: Arc<LocalCatalog>,
        store: Arc<dyn ObjectStore>,
        uploader: Arc<UploadEngine>,
    ) -> Self {
        let policy = config.upload.retry.clone();
        Self {
            fetcher: Fetcher::new(Arc::clone(&store), config.bucket(), config.password.clone(), policy.clone()),
            catalog,
            store,
            uploader,
            bucket: config.bucket().to_string(),
            catalog_key: config.catalog_key.clone(),
            password: config.password.clone(),
            scratch_dir: config.scratch_dir.clone(),
            media_dir: config.media_dir.clone(),
            policy,
        }
    }

    pub fn catalog(&self) -> &LocalCatalog {
        &self.catalog
    }

    /// Tag de version courant du catalogue distant, `None` s'il n'existe pas.
    async fn remote_stamp(&self, cancel: &CancellationToken) -> Result<Option<String>, SyncError> {
        self.head_stamp(&self.catalog_key, "head(catalog)", cancel).await
    }

    async fn head_stamp(&self, key: &str, label: &str, cancel: &CancellationToken) -> Result<Option<String>, SyncError> {
        let store = self.store.as_ref();
        let bucket = self.bucket.as_str();
        let head = retry(&self.policy, cancel, label, |_| async move {
            match store.head(bucket, key).await {
                Ok(head) => Ok(head.map(|head| head.e_tag)),
                Err(StoreError::NotFound) => Ok(None),
                Err(err) => Err(TransferError::from(err)),
            }
        })
        .await?;
        Ok(head)
    }

    /// Rattrape le catalogue distant s'il a changé depuis le dernier tag connu.
    pub async fn sync_down(&self, cancel: &CancellationToken) -> Result<SyncDownOutcome, SyncError> {
        let local_stamp = self.catalog.version_stamp()?;
        let Some(remote_stamp) = self.remote_stamp(cancel).await? else {
            log::info!("CatalogSync::sync_down: no remote catalog at key={}", self.catalog_key);
            return Ok(SyncDownOutcome::UpToDate);
        };
        if local_stamp.as_deref() == Some(remote_stamp.as_str()) {
            log::info!("CatalogSync::sync_down: up to date, stamp={}", remote_stamp);
            return Ok(SyncDownOutcome::UpToDate);
        }

        let store = self.store.as_ref();
        let bucket = self.bucket.as_str();
        let key = self.catalog_key.as_str();
        let object = retry(&self.policy, cancel, "get(catalog)", |_| async move {
            match store.get(bucket, key).await {
                Ok(object) => Ok(Some(object)),
                Err(StoreError::NotFound) => Ok(None),
                Err(err) => Err(TransferError::from(err)),
            }
        })
        .await?;
        let Some(object) = object else {
            log::warn!("CatalogSync::sync_down: catalog vanished, key={}", self.catalog_key);
            return Ok(SyncDownOutcome::UpToDate);
        };

        let content = open_document(&object.data, DOCUMENT_NAME, &self.password)?;
        let remote: CatalogSnapshot = serde_json::from_slice(&content)?;
        let local = self.catalog.snapshot()?;
        let diff = CatalogDiff::between(&local, &remote);

        let files = self.fetch_new_movies(diff.new_movies(), cancel).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let changes = self.catalog.apply_remote(&diff, &object.e_tag, &files)?;
        for movie in &diff.movies.deletes {
            // La transaction est validée : un échec ici ne laisse qu'un dossier orphelin.
            if let Err(err) = remove_media(&self.media_dir, &movie.id) {
                log::warn!(
                    "CatalogSync::sync_down: could not remove media of deleted movie={}: {}",
                    movie.id,
                    err
                );
            }
        }
        log::info!(
            "CatalogSync::sync_down: applied stamp={}, changes={}, new_movies={}",
            object.e_tag,
            changes,
            diff.new_movies().len()
        );
        Ok(SyncDownOutcome::Applied {
            stamp: object.e_tag,
            changes,
            new_movies: diff.new_movies().len(),
        })
    }

    /// Récupère les fichiers de lecture des nouveaux films avant la transaction.
    ///
    /// Un film dont l'archive est introuvable est enregistré sans fichiers en
    /// cache ; ils seront récupérés à la première lecture.
    async fn fetch_new_movies(&self, movies: &[Movie], cancel: &CancellationToken) -> Result<Vec<MovieFile>, SyncError> {
        if movies.is_empty() {
            return Ok(Vec::new());
        }
        let stamps = try_join_all(
            movies
                .iter()
                .map(|movie| self.head_stamp(&movie.archive_key, "head(archive)", cancel)),
        )
        .await?;
        let movies: Vec<&Movie> = movies
            .iter()
            .zip(stamps)
            .filter_map(|(movie, stamp)| {
                if stamp.is_none() {
                    log::warn!(
                        "CatalogSync::fetch_new_movies: archive missing, movie={}, key={}",
                        movie.id,
                        movie.archive_key
                    );
                }
                stamp.map(|_| movie)
            })
            .collect();
        if movies.is_empty() {
            return Ok(Vec::new());
        }

        fs::create_dir_all(&self.scratch_dir)?;
        let keys: Vec<String> = movies.iter().map(|movie| movie.archive_key.clone()).collect();
        let output = self
            .fetcher
            .fetch_selected_members(&keys, &PLAYBACK_MEMBERS, &self.scratch_dir, cancel, Arc::new(|_: f64| {}))
            .await?;

        let mut files = Vec::new();
        for (movie, archive) in movies.iter().zip(&output.archives) {
            files.extend(persist_fetched(&self.media_dir, &movie.id, archive)?);
        }
        Ok(files)
    }

    /// Publie le catalogue local si personne n'a écrit depuis le dernier tag connu.
    ///
    /// En cas de conflit, un SyncDown est forcé puis [`SyncError::Conflict`] est renvoyé.
    pub async fn sync_up(&self, cancel: &CancellationToken) -> Result<String, SyncError> {
        let local_stamp = self.catalog.version_stamp()?;
        let remote_stamp = self.remote_stamp(cancel).await?;
        let condition = match (&local_stamp, &remote_stamp) {
            (_, None) => WriteCondition::IfAbsent,
            (Some(local), Some(remote)) if local == remote => WriteCondition::IfMatch(remote.clone()),
            _ => return Err(self.conflict(cancel).await),
        };

        let snapshot = self.catalog.snapshot()?;
        let sealed = seal_document(DOCUMENT_NAME, &serde_json::to_vec(&snapshot)?, &self.password)?;
        let uploaded = self
            .uploader
            .upload_bytes(sealed, &self.bucket, &self.catalog_key, condition, cancel)
            .await;
        match uploaded {
            Ok(outcome) => {
                self.catalog.set_version_stamp(&outcome.e_tag)?;
                log::info!(
                    "CatalogSync::sync_up: published movies={}, stamp={}",
                    snapshot.movies.len(),
                    outcome.e_tag
                );
                Ok(outcome.e_tag)
            }
            Err(TransferError::Store(StoreError::PreconditionFailed)) => Err(self.conflict(cancel).await),
            Err(err) => Err(err.into()),
        }
    }

    async fn conflict(&self, cancel: &CancellationToken) -> SyncError {
        log::warn!("CatalogSync::sync_up: conflict on key={}, forcing sync down", self.catalog_key);
        if let Err(err) = self.sync_down(cancel).await {
            log::error!("CatalogSync::sync_up: sync down after conflict failed: {}", err);
        }
        SyncError::Conflict
    }

    /// SyncDown, mutation locale, puis SyncUp.
    pub async fn mutate<T, F>(&self, cancel: &CancellationToken, mutation: F) -> Result<T, SyncError>
    where
        F: FnOnce(&CatalogWriter<'_>) -> Result<T, CatalogError> + Send,
        T: Send,
    {
        self.sync_down(cancel).await?;
        let value = self.catalog.write(mutation)?;
        self.sync_up(cancel).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::catalog::{Tag, TagType};
    use crate::config::StoreConfig;
    use crate::storage::MemoryStore;
    use crate::transfer::UploadConfig;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Peer {
        dir: TempDir,
        sync: CatalogSync,
    }

    impl Peer {
        fn media(&self, movie_id: &str) -> PathBuf {
            self.dir.path().join("media").join(movie_id)
        }
    }

    fn config(dir: &Path) -> VaultConfig {
        VaultConfig {
            store: StoreConfig::new(
                "key".to_string(),
                "secret".to_string(),
                "http://localhost:9000".to_string(),
                "vault".to_string(),
            ),
            catalog_key: "library.zip".to_string(),
            password: ArchivePassword::new("shared secret"),
            database_path: dir.join("library.db"),
            scratch_dir: dir.join("scratch"),
            media_dir: dir.join("media"),
            upload: UploadConfig {
                part_size: 1_024,
                workers: 2,
                retry: RetryPolicy::immediate(3),
            },
        }
    }

    fn peer(store: &Arc<MemoryStore>) -> Peer {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let store: Arc<dyn ObjectStore> = store.clone();
        let catalog = Arc::new(LocalCatalog::open(&config.database_path).unwrap());
        let uploader = Arc::new(UploadEngine::new(Arc::clone(&store), config.upload.clone()));
        let sync = CatalogSync::new(&config, catalog, store, uploader);
        Peer { dir, sync }
    }

    fn movie(id: &str, archive_key: &str) -> Movie {
        Movie {
            id: id.to_string(),
            title: "Alien".to_string(),
            archive_key: archive_key.to_string(),
            file_name: "alien.mkv".to_string(),
            file_size: 1_234,
            added_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
        }
    }

    async fn put_movie_archive(store: &MemoryStore, dir: &Path, key: &str) {
        let path = dir.join(key);
        let mut writer = ArchiveWriter::create(&path, ArchivePassword::new("shared secret")).unwrap();
        writer.add_bytes(PLAYLIST_NAME, b"#EXTM3U\nseg_000.ts\n").unwrap();
        writer.add_bytes(CLIP_NAME, &[5u8; 2_000]).unwrap();
        writer.finish().unwrap();
        store
            .put("vault", key, fs::read(&path).unwrap(), WriteCondition::None)
            .await
            .unwrap();
    }

    fn genre() -> TagType {
        TagType {
            id: "genre".to_string(),
            name: "Genre".to_string(),
            sort_order: 0,
        }
    }

    #[tokio::test]
    async fn first_sync_up_creates_the_remote_catalog() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let cancel = CancellationToken::new();

        assert_eq!(alice.sync.sync_down(&cancel).await.unwrap(), SyncDownOutcome::UpToDate);
        alice.sync.mutate(&cancel, |w| w.upsert_tag_type(&genre())).await.unwrap();

        let stamp = alice.sync.catalog().version_stamp().unwrap().unwrap();
        assert_eq!(store.head("vault", "library.zip").await.unwrap().unwrap().e_tag, stamp);
    }

    #[tokio::test]
    async fn second_peer_pulls_changes_then_is_idle() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let bob = peer(&store);
        let cancel = CancellationToken::new();

        alice.sync.mutate(&cancel, |w| w.upsert_tag_type(&genre())).await.unwrap();

        let outcome = bob.sync.sync_down(&cancel).await.unwrap();
        assert!(matches!(outcome, SyncDownOutcome::Applied { changes: 1, new_movies: 0, .. }));
        assert_eq!(bob.sync.catalog().snapshot().unwrap().tag_types, vec![genre()]);
        assert_eq!(bob.sync.sync_down(&cancel).await.unwrap(), SyncDownOutcome::UpToDate);
    }

    #[tokio::test]
    async fn stale_writer_gets_a_conflict_and_is_refreshed() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let bob = peer(&store);
        let cancel = CancellationToken::new();

        alice.sync.mutate(&cancel, |w| w.upsert_tag_type(&genre())).await.unwrap();
        bob.sync.sync_down(&cancel).await.unwrap();
        alice
            .sync
            .mutate(&cancel, |w| {
                w.upsert_tag(&Tag {
                    id: "noir".to_string(),
                    tag_type_id: "genre".to_string(),
                    name: "Noir".to_string(),
                    sort_order: 0,
                })
            })
            .await
            .unwrap();

        // Bob modifie sans SyncDown préalable.
        bob.sync
            .catalog()
            .write(|w| w.delete_tag_type("genre").map(|_| ()))
            .unwrap();
        let err = bob.sync.sync_up(&cancel).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), CONFLICT_MESSAGE);
        assert_eq!(
            bob.sync.catalog().snapshot().unwrap(),
            alice.sync.catalog().snapshot().unwrap()
        );
    }

    #[tokio::test]
    async fn cancelled_sync_leaves_local_state_untouched() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let bob = peer(&store);
        let cancel = CancellationToken::new();
        alice.sync.mutate(&cancel, |w| w.upsert_tag_type(&genre())).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = bob.sync.sync_down(&cancelled).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(bob.sync.catalog().version_stamp().unwrap(), None);
        assert!(bob.sync.catalog().snapshot().unwrap().tag_types.is_empty());
    }

    #[tokio::test]
    async fn movie_deleted_elsewhere_loses_its_cached_media() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let bob = peer(&store);
        let cancel = CancellationToken::new();
        put_movie_archive(&store, alice.dir.path(), "m1.zip").await;
        alice.sync.mutate(&cancel, |w| w.upsert_movie(&movie("m1", "m1.zip"))).await.unwrap();

        // Bob récupère les fichiers de lecture du nouveau film.
        let outcome = bob.sync.sync_down(&cancel).await.unwrap();
        assert!(matches!(outcome, SyncDownOutcome::Applied { new_movies: 1, .. }));
        assert!(bob.media("m1").join(PLAYLIST_NAME).is_file());

        // Alice supprime le film ; Bob rattrape la suppression.
        alice.sync.mutate(&cancel, |w| w.delete_movie("m1")).await.unwrap();
        bob.sync.sync_down(&cancel).await.unwrap();

        assert!(bob.sync.catalog().movie("m1").unwrap().is_none());
        assert!(bob.sync.catalog().movie_files("m1").unwrap().is_empty());
        assert!(!bob.media("m1").exists());
    }

    #[tokio::test]
    async fn missing_archive_does_not_block_sync_down() {
        let store = Arc::new(MemoryStore::new());
        let alice = peer(&store);
        let bob = peer(&store);
        let cancel = CancellationToken::new();
        put_movie_archive(&store, alice.dir.path(), "m1.zip").await;
        alice
            .sync
            .mutate(&cancel, |w| {
                w.upsert_movie(&movie("m1", "m1.zip"))?;
                w.upsert_movie(&movie("m2", "gone.zip"))
            })
            .await
            .unwrap();

        let outcome = bob.sync.sync_down(&cancel).await.unwrap();
        assert!(matches!(outcome, SyncDownOutcome::Applied { new_movies: 2, .. }));

        // Les deux films sont catalogués ; seul m1 a des fichiers en cache.
        assert!(bob.sync.catalog().movie("m2").unwrap().is_some());
        assert!(bob.sync.catalog().movie_files("m1").unwrap().contains_key(PLAYLIST_NAME));
        assert!(bob.sync.catalog().movie_files("m2").unwrap().is_empty());
        assert!(!bob.media("m2").exists());
        assert_eq!(bob.sync.sync_down(&cancel).await.unwrap(), SyncDownOutcome::UpToDate);
    }
}
