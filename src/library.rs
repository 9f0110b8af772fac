//! Façade de la bibliothèque : chaque mutation du catalogue est encadrée par
//! SyncDown → mutation locale → SyncUp.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::writer::PLAYLIST_NAME;
use crate::archive::{build_movie_archive, ArchiveError, ArchiveIndex, MovieSource};
use crate::catalog::store::{MovieFile, SortedTable};
use crate::catalog::sync::{persist_fetched, remove_media, PLAYBACK_MEMBERS};
use crate::catalog::{CatalogSnapshot, CatalogSync, LocalCatalog, Movie, SyncDownOutcome, Tag, TagType};
use crate::config::VaultConfig;
use crate::crypto::content_key;
use crate::error::{Error, Result};
use crate::storage::{ObjectStore, S3Store};
use crate::transfer::fetch::{Fetcher, HEADER_FILE_NAME, INDEX_FILE_NAME};
use crate::transfer::{ProgressFn, UploadCounters, UploadEngine};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(err))
}

/// Bibliothèque de films chiffrée sur un stockage objet.
pub struct Library {
    config: VaultConfig,
    catalog: Arc<LocalCatalog>,
    uploader: Arc<UploadEngine>,
    fetcher: Fetcher,
    sync: CatalogSync,
}

impl Library {
    /// Ouvre la bibliothèque sur `store`. Doit être appelé depuis un runtime tokio.
    pub fn open(config: VaultConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.scratch_dir)?;
        fs::create_dir_all(&config.media_dir)?;
        if let Some(parent) = config.database_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let catalog = Arc::new(LocalCatalog::open(&config.database_path)?);
        let uploader = Arc::new(UploadEngine::new(Arc::clone(&store), config.upload.clone()));
        let fetcher = Fetcher::new(
            Arc::clone(&store),
            config.bucket(),
            config.password.clone(),
            config.upload.retry.clone(),
        );
        let sync = CatalogSync::new(&config, Arc::clone(&catalog), store, Arc::clone(&uploader));
        log::info!(
            "Library::open: bucket={}, catalog_key={}, database={}",
            config.bucket(),
            config.catalog_key,
            config.database_path.display()
        );
        Ok(Self {
            config,
            catalog,
            uploader,
            fetcher,
            sync,
        })
    }

    /// Ouvre la bibliothèque sur le stockage S3 décrit par la configuration.
    pub async fn connect(config: VaultConfig) -> Result<Self> {
        let store = if config.has_static_credentials() {
            S3Store::new(&config.store)
        } else {
            S3Store::from_environment(&config.store).await
        };
        Self::open(config, Arc::new(store))
    }

    pub fn catalog(&self) -> &LocalCatalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> Result<CatalogSnapshot> {
        Ok(self.catalog.snapshot()?)
    }

    /// Compteurs d'octets envoyés, lus par l'interface pour le débit et l'ETA.
    pub fn counters(&self) -> Arc<UploadCounters> {
        self.uploader.counters()
    }

    pub async fn sync_down(&self, cancel: &CancellationToken) -> Result<SyncDownOutcome> {
        Ok(self.sync.sync_down(cancel).await?)
    }

    pub async fn sync_up(&self, cancel: &CancellationToken) -> Result<String> {
        Ok(self.sync.sync_up(cancel).await?)
    }

    /// Archive un film déjà segmenté, l'envoie, puis l'ajoute au catalogue.
    pub async fn add_movie(&self, source: &MovieSource, title: &str, cancel: &CancellationToken) -> Result<Movie> {
        let scratch = tempfile::Builder::new()
            .prefix("movie-")
            .tempdir_in(&self.config.scratch_dir)?;
        let archive_path = scratch.path().join("movie.zip");

        let build_source = source.clone();
        let build_path = archive_path.clone();
        let password = self.config.password.clone();
        let (index, meta, key) = tokio::task::spawn_blocking(move || -> Result<_> {
            let (index, meta) = build_movie_archive(&build_source, &build_path, password)?;
            let key = content_key(&build_path)?;
            Ok((index, meta, key))
        })
        .await
        .map_err(join_error)??;

        let outcome = self
            .uploader
            .upload_file(&archive_path, self.config.bucket(), &key, cancel)
            .await?;

        let movie = Movie {
            id: new_id(),
            title: title.to_string(),
            archive_key: outcome.key,
            file_name: meta.original_file_name,
            file_size: meta.size,
            added_at: Utc::now().trunc_subsecs(0),
        };
        let files = self.keep_local_copies(&movie.id, source, &archive_path, &index)?;

        let record = movie.clone();
        if let Err(err) = self.sync.mutate(cancel, move |w| w.upsert_movie(&record)).await {
            if let Err(cleanup) = fs::remove_dir_all(self.config.media_dir.join(&movie.id)) {
                log::warn!("Library::add_movie: cleanup failed: {}", cleanup);
            }
            return Err(err.into());
        }
        self.catalog.record_movie_files(&files)?;
        log::info!(
            "Library::add_movie: id={}, key={}, size={}",
            movie.id,
            movie.archive_key,
            movie.file_size
        );
        Ok(movie)
    }

    /// Conserve localement les fichiers de lecture, l'en-tête brut et l'index.
    fn keep_local_copies(
        &self,
        movie_id: &str,
        source: &MovieSource,
        archive_path: &Path,
        index: &ArchiveIndex,
    ) -> Result<Vec<MovieFile>> {
        let dir = self.config.media_dir.join(movie_id);
        fs::create_dir_all(&dir)?;
        let mut files = Vec::new();

        for member in PLAYBACK_MEMBERS {
            let from = source.segments_dir.join(member);
            if from.is_file() {
                let to = dir.join(member);
                fs::copy(&from, &to)?;
                files.push((movie_id.to_string(), member.to_string(), to));
            }
        }

        let mut archive = File::open(archive_path)?;
        archive.seek(SeekFrom::Start(index.header.offset))?;
        let mut header = vec![0u8; index.header.length as usize];
        archive.read_exact(&mut header)?;
        let header_path = dir.join(HEADER_FILE_NAME);
        fs::write(&header_path, header)?;
        files.push((movie_id.to_string(), HEADER_FILE_NAME.to_string(), header_path));

        let index_path = dir.join(INDEX_FILE_NAME);
        fs::write(&index_path, serde_json::to_vec(index).map_err(ArchiveError::from)?)?;
        files.push((movie_id.to_string(), INDEX_FILE_NAME.to_string(), index_path));
        Ok(files)
    }

    pub async fn add_tag_type(&self, name: &str, cancel: &CancellationToken) -> Result<TagType> {
        let name = name.to_string();
        let tag_type = self
            .sync
            .mutate(cancel, move |w| {
                let tag_type = TagType {
                    id: new_id(),
                    name,
                    sort_order: w.next_sort_order(SortedTable::TagTypes, None)?,
                };
                w.upsert_tag_type(&tag_type)?;
                Ok(tag_type)
            })
            .await?;
        Ok(tag_type)
    }

    pub async fn add_tag(&self, tag_type_id: &str, name: &str, cancel: &CancellationToken) -> Result<Tag> {
        let tag_type_id = tag_type_id.to_string();
        let name = name.to_string();
        let lookup = tag_type_id.clone();
        let tag = self
            .sync
            .mutate(cancel, move |w| {
                if !w.tag_type_exists(&tag_type_id)? {
                    return Ok(None);
                }
                let tag = Tag {
                    id: new_id(),
                    sort_order: w.next_sort_order(SortedTable::Tags, Some(&tag_type_id))?,
                    tag_type_id,
                    name,
                };
                w.upsert_tag(&tag)?;
                Ok(Some(tag))
            })
            .await?;
        tag.ok_or(Error::NotFound {
            kind: "tag type",
            id: lookup,
        })
    }

    pub async fn tag_movie(&self, movie_id: &str, tag_id: &str, cancel: &CancellationToken) -> Result<()> {
        let (movie, tag) = (movie_id.to_string(), tag_id.to_string());
        let missing = self
            .sync
            .mutate(cancel, move |w| {
                if !w.movie_exists(&movie)? {
                    return Ok(Some(("movie", movie)));
                }
                if !w.tag_exists(&tag)? {
                    return Ok(Some(("tag", tag)));
                }
                w.link(&movie, &tag)?;
                Ok(None)
            })
            .await?;
        match missing {
            Some((kind, id)) => Err(Error::NotFound { kind, id }),
            None => Ok(()),
        }
    }

    /// Renvoie `false` si le lien n'existait pas.
    pub async fn untag_movie(&self, movie_id: &str, tag_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let (movie, tag) = (movie_id.to_string(), tag_id.to_string());
        Ok(self.sync.mutate(cancel, move |w| w.unlink(&movie, &tag)).await?)
    }

    /// Retire le film du catalogue et ses fichiers locaux. L'archive distante est conservée.
    pub async fn remove_movie(&self, movie_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let id = movie_id.to_string();
        let removed = self.sync.mutate(cancel, move |w| w.delete_movie(&id)).await?;
        remove_media(&self.config.media_dir, movie_id)?;
        Ok(removed)
    }

    /// Fichiers de lecture locaux des films demandés ; les absents sont
    /// récupérés par reconstruction creuse.
    pub async fn fetch_playback_files(
        &self,
        movie_ids: &[String],
        cancel: &CancellationToken,
        progress: ProgressFn,
    ) -> Result<BTreeMap<String, BTreeMap<String, PathBuf>>> {
        let mut result = BTreeMap::new();
        let mut missing = Vec::new();
        for id in movie_ids {
            let movie = self.catalog.movie(id)?.ok_or_else(|| Error::NotFound {
                kind: "movie",
                id: id.clone(),
            })?;
            let files = self.catalog.movie_files(id)?;
            let cached = files.contains_key(PLAYLIST_NAME) && files.values().all(|path| path.is_file());
            if cached {
                result.insert(movie.id, files);
            } else {
                missing.push(movie);
            }
        }

        if missing.is_empty() {
            progress(100.0);
            return Ok(result);
        }
        let keys: Vec<String> = missing.iter().map(|movie| movie.archive_key.clone()).collect();
        let output = self
            .fetcher
            .fetch_selected_members(&keys, &PLAYBACK_MEMBERS, &self.config.scratch_dir, cancel, progress)
            .await?;

        let mut recorded = Vec::new();
        for (movie, archive) in missing.iter().zip(&output.archives) {
            let files = persist_fetched(&self.config.media_dir, &movie.id, archive)?;
            result.insert(
                movie.id.clone(),
                files
                    .iter()
                    .map(|(_, member, path)| (member.clone(), path.clone()))
                    .collect(),
            );
            recorded.extend(files);
        }
        self.catalog.record_movie_files(&recorded)?;
        Ok(result)
    }

    /// Extrait un membre quelconque (ex. un segment) à partir de l'en-tête conservé.
    pub async fn fetch_member(&self, movie_id: &str, name: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let movie = self.catalog.movie(movie_id)?.ok_or_else(|| Error::NotFound {
            kind: "movie",
            id: movie_id.to_string(),
        })?;
        let mut files = self.catalog.movie_files(movie_id)?;
        let saved = |files: &BTreeMap<String, PathBuf>| {
            [HEADER_FILE_NAME, INDEX_FILE_NAME]
                .iter()
                .all(|name| files.get(*name).is_some_and(|path| path.is_file()))
        };
        if !saved(&files) {
            self.fetch_playback_files(&[movie.id.clone()], cancel, Arc::new(|_: f64| {}))
                .await?;
            files = self.catalog.movie_files(movie_id)?;
        }
        let (Some(header_path), Some(index_path)) = (files.get(HEADER_FILE_NAME), files.get(INDEX_FILE_NAME)) else {
            return Err(Error::NotFound {
                kind: "archive header",
                id: movie.id,
            });
        };

        let header = fs::read(header_path)?;
        let index: ArchiveIndex = serde_json::from_slice(&fs::read(index_path)?).map_err(ArchiveError::from)?;
        index.check_bounds(index.archive_len())?;
        Ok(self
            .fetcher
            .fetch_member_on_demand(&movie.archive_key, &index, header, name, cancel)
            .await?)
    }
}
