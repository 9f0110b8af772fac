//! Reconstruction creuse : récupérer uniquement l'index, l'en-tête et
//! quelques membres d'archives distantes, puis les déchiffrer localement.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rayon::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::progress::{PhaseProgress, ProgressFn};
use super::retry::{retry, RetryPolicy};
use super::TransferError;
use crate::archive::reader::{extract_member_with_header, reconstruct, ArchiveReader};
use crate::archive::{decode_trailer, ArchiveError, ArchiveIndex, TrailerWindow, TRAILER_WINDOW};
use crate::crypto::ArchivePassword;
use crate::range::OffsetLength;
use crate::storage::ObjectStore;

/// Requêtes de plage simultanées au plus, par phase.
pub const FETCH_CONCURRENCY: usize = 64;

/// Poids des phases : index, téléchargements bruts, déchiffrement.
pub const PHASE_WEIGHTS: [f64; 3] = [20.0, 60.0, 20.0];

pub const HEADER_FILE_NAME: &str = "header.bin";
pub const INDEX_FILE_NAME: &str = "index.json";

/// Résultat par archive : chemins des fichiers extraits dans le répertoire temporaire.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub key: String,
    pub index: ArchiveIndex,
    /// Octets bruts (non déchiffrés) de la plage d'en-tête.
    pub header_path: PathBuf,
    pub index_path: PathBuf,
    pub members: BTreeMap<String, PathBuf>,
}

/// Le répertoire temporaire est supprimé au drop : l'appelant persiste ce qu'il garde.
#[derive(Debug)]
pub struct FetchOutput {
    pub scratch: TempDir,
    pub archives: Vec<FetchedArchive>,
}

struct RawArchive {
    key: String,
    index: ArchiveIndex,
    header: Vec<u8>,
    members: Vec<(String, OffsetLength, Vec<u8>)>,
}

fn scratch_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    base.replace(['/', '\\'], "_")
}

fn join_error(err: tokio::task::JoinError) -> TransferError {
    TransferError::Io(io::Error::other(err))
}

/// Lit l'index en trailer d'une archive distante : fenêtre de fin, puis une
/// seconde lecture exactement bornée si le JSON commence avant la fenêtre.
pub async fn fetch_archive_index(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ArchiveIndex, TransferError> {
    let tail = retry(policy, cancel, "get_tail", |_| async move {
        store
            .get_tail(bucket, key, TRAILER_WINDOW)
            .await
            .map_err(TransferError::from)
    })
    .await?;
    let window_start = tail.window_start();

    match decode_trailer(&tail.data, window_start)? {
        TrailerWindow::Index(index) => Ok(index),
        TrailerWindow::Incomplete { json_start } => {
            let missing = OffsetLength::from_bounds(json_start, window_start).ok_or_else(|| {
                ArchiveError::BadTrailer(format!(
                    "index of {} bytes cannot be fetched as one range",
                    window_start - json_start
                ))
            })?;
            log::info!(
                "fetch_archive_index: key={}, index_start={}, second_read={}",
                key,
                json_start,
                missing.length
            );
            let mut bytes = retry(policy, cancel, "get_range(index)", |_| async move {
                store
                    .get_range(bucket, key, missing)
                    .await
                    .map_err(TransferError::from)
            })
            .await?;
            bytes.extend_from_slice(&tail.data);
            match decode_trailer(&bytes, json_start)? {
                TrailerWindow::Index(index) => Ok(index),
                TrailerWindow::Incomplete { .. } => Err(ArchiveError::BadTrailer(
                    "index still incomplete after the second read".to_string(),
                )
                .into()),
            }
        }
    }
}

fn extract_archive(raw: RawArchive, root: &Path, password: &ArchivePassword) -> Result<FetchedArchive, ArchiveError> {
    let dir = root.join(scratch_name(&raw.key));
    fs::create_dir_all(&dir)?;
    let header_path = dir.join(HEADER_FILE_NAME);
    fs::write(&header_path, &raw.header)?;
    let index_path = dir.join(INDEX_FILE_NAME);
    fs::write(&index_path, serde_json::to_vec(&raw.index)?)?;

    let names: Vec<String> = raw.members.iter().map(|(name, _, _)| name.clone()).collect();
    let view = reconstruct(
        &raw.index,
        raw.header,
        raw.members
            .into_iter()
            .map(|(_, range, data)| (range, data))
            .collect(),
    );
    let mut reader = ArchiveReader::open(view, password)?;

    let mut members = BTreeMap::new();
    for name in names {
        let path = dir.join(scratch_name(&name));
        let mut out = BufWriter::new(File::create(&path)?);
        reader.extract_to(&name, &mut out)?;
        out.flush()?;
        members.insert(name, path);
    }
    Ok(FetchedArchive {
        key: raw.key,
        index: raw.index,
        header_path,
        index_path,
        members,
    })
}

/// Récupération creuse de membres choisis sur un lot d'archives.
pub struct Fetcher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    password: ArchivePassword,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, password: ArchivePassword, policy: RetryPolicy) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            password,
            policy,
        }
    }

    /// Index de plusieurs archives, au plus [`FETCH_CONCURRENCY`] à la fois, dans l'ordre de `keys`.
    pub async fn fetch_archive_indexes(
        &self,
        keys: &[String],
        cancel: &CancellationToken,
        on_done: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Result<Vec<ArchiveIndex>, TransferError> {
        let store = self.store.as_ref();
        let bucket = self.bucket.as_str();
        let policy = &self.policy;
        let total = keys.len();
        let mut indexes: Vec<Option<ArchiveIndex>> = vec![None; total];
        let mut done = 0;

        let mut pending = stream::iter(keys.iter().enumerate())
            .map(|(position, key)| async move {
                let result = fetch_archive_index(store, bucket, key, policy, cancel).await;
                (position, result)
            })
            .buffer_unordered(FETCH_CONCURRENCY);
        while let Some((position, result)) = pending.next().await {
            indexes[position] = Some(result?);
            done += 1;
            on_done(done, total);
        }
        Ok(indexes.into_iter().flatten().collect())
    }

    /// Récupère l'index, l'en-tête et les `members` demandés de chaque archive,
    /// puis les déchiffre sur le pool rayon. Les membres absents d'un index
    /// sont ignorés.
    pub async fn fetch_selected_members(
        &self,
        keys: &[String],
        members: &[&str],
        scratch_root: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn,
    ) -> Result<FetchOutput, TransferError> {
        let progress = Arc::new(PhaseProgress::new(&PHASE_WEIGHTS, progress));
        log::info!(
            "Fetcher::fetch_selected_members: archives={}, members={:?}",
            keys.len(),
            members
        );

        // Phase 1 : index.
        let indexes = self
            .fetch_archive_indexes(keys, cancel, &|done: usize, total: usize| progress.update(0, done, total))
            .await?;

        // Phase 2 : plages brutes (en-tête + membres).
        let mut jobs = Vec::new();
        for (position, index) in indexes.iter().enumerate() {
            jobs.push((position, None, index.header));
            for &name in members {
                match index.entry(name) {
                    Some(entry) => jobs.push((position, Some(name.to_string()), entry.range)),
                    None => log::warn!(
                        "Fetcher::fetch_selected_members: key={}, missing member={}",
                        keys[position],
                        name
                    ),
                }
            }
        }
        let store = self.store.as_ref();
        let bucket = self.bucket.as_str();
        let policy = &self.policy;
        let total = jobs.len();
        let mut headers: Vec<Vec<u8>> = vec![Vec::new(); indexes.len()];
        let mut fetched: Vec<Vec<(String, OffsetLength, Vec<u8>)>> = vec![Vec::new(); indexes.len()];
        let mut done = 0;

        let mut pending = stream::iter(jobs)
            .map(|(position, name, range)| {
                let key = keys[position].as_str();
                async move {
                    let data = retry(policy, cancel, "get_range", |_| async move {
                        store
                            .get_range(bucket, key, range)
                            .await
                            .map_err(TransferError::from)
                    })
                    .await;
                    (position, name, range, data)
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY);
        while let Some((position, name, range, data)) = pending.next().await {
            let data = data?;
            match name {
                None => headers[position] = data,
                Some(name) => fetched[position].push((name, range, data)),
            }
            done += 1;
            progress.update(1, done, total);
        }
        drop(pending);

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        // Phase 3 : déchiffrement, borné par le nombre de processeurs.
        let raws: Vec<RawArchive> = keys
            .iter()
            .cloned()
            .zip(indexes)
            .zip(headers.into_iter().zip(fetched))
            .map(|((key, index), (header, members))| RawArchive {
                key,
                index,
                header,
                members,
            })
            .collect();
        let scratch = tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(scratch_root)?;
        let root = scratch.path().to_path_buf();
        let password = self.password.clone();
        let extract_progress = Arc::clone(&progress);

        let extracted = tokio::task::spawn_blocking(move || {
            let total = raws.len();
            let done = AtomicUsize::new(0);
            raws.into_par_iter()
                .map(|raw| {
                    let archive = extract_archive(raw, &root, &password)?;
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    extract_progress.update(2, finished, total);
                    Ok(archive)
                })
                .collect::<Result<Vec<_>, ArchiveError>>()
        })
        .await
        .map_err(join_error)?;
        let archives = extracted?;

        progress.finish();
        log::info!(
            "Fetcher::fetch_selected_members: extracted archives={}, scratch={}",
            archives.len(),
            scratch.path().display()
        );
        Ok(FetchOutput { scratch, archives })
    }

    /// Extrait plus tard un autre membre grâce à l'en-tête conservé.
    pub async fn fetch_member_on_demand(
        &self,
        key: &str,
        index: &ArchiveIndex,
        header: Vec<u8>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let range = index
            .entry(name)
            .ok_or_else(|| ArchiveError::MissingEntry(name.to_string()))?
            .range;
        let store = self.store.as_ref();
        let bucket = self.bucket.as_str();
        let member = retry(&self.policy, cancel, "get_range(member)", |_| async move {
            store
                .get_range(bucket, key, range)
                .await
                .map_err(TransferError::from)
        })
        .await?;

        let index = index.clone();
        let name = name.to_string();
        let password = self.password.clone();
        let data = tokio::task::spawn_blocking(move || {
            extract_member_with_header(&index, header, &name, member, &password)
        })
        .await
        .map_err(join_error)??;
        Ok(data)
    }
}
