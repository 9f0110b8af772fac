use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zip::write::{FileOptions, SimpleFileOptions};
use zip::{AesMode, CompressionMethod, ZipWriter};

use super::layout::discover_layout;
use super::{ArchiveError, ArchiveIndex};
use crate::crypto::ArchivePassword;

pub const PLAYLIST_NAME: &str = "movie.m3u8";
pub const CLIP_NAME: &str = "clip.mp4";
pub const META_NAME: &str = "meta.json";
pub const SEGMENT_EXTENSION: &str = "ts";

/// Options d'un membre : AES-256, stocké sans compression (vidéo déjà compressée).
fn entry_options(password: &str, size: u64) -> FileOptions<'_, ()> {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(size >= u32::MAX as u64)
        .with_aes_encryption(AesMode::Aes256, password)
}

/// Écrit une archive zip chiffrée puis lui ajoute son index en trailer.
pub struct ArchiveWriter {
    path: PathBuf,
    zip: ZipWriter<File>,
    password: ArchivePassword,
}

impl ArchiveWriter {
    pub fn create(path: &Path, password: ArchivePassword) -> Result<Self, ArchiveError> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            zip: ZipWriter::new(file),
            password,
        })
    }

    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
        let options = entry_options(self.password.expose(), data.len() as u64);
        self.zip.start_file(name, options)?;
        io::Write::write_all(&mut self.zip, data)?;
        Ok(())
    }

    /// Copie un fichier local en flux dans l'archive.
    pub fn add_file(&mut self, name: &str, source: &Path) -> Result<(), ArchiveError> {
        let mut input = File::open(source)?;
        let size = input.metadata()?.len();
        let options = entry_options(self.password.expose(), size);
        self.zip.start_file(name, options)?;
        io::copy(&mut input, &mut self.zip)?;
        Ok(())
    }

    /// Termine le zip, découvre sa disposition physique et ajoute le trailer.
    pub fn finish(self) -> Result<ArchiveIndex, ArchiveError> {
        let file = self.zip.finish()?;
        file.sync_all()?;
        drop(file);

        let index = discover_layout(&self.path, &self.password)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let total = index.append_to(&mut file)?;
        log::info!(
            "ArchiveWriter::finish: path={}, entries={}, total_len={}",
            self.path.display(),
            index.entries.len(),
            total
        );
        Ok(index)
    }
}

/// Répertoire d'un film déjà segmenté par l'encodeur externe.
///
/// Attendu : `movie.m3u8`, des segments `*.ts` et éventuellement `clip.mp4`.
#[derive(Debug, Clone)]
pub struct MovieSource {
    pub original: PathBuf,
    pub segments_dir: PathBuf,
}

/// Contenu de `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieMeta {
    pub original_file_name: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl MovieMeta {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let original_file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            original_file_name,
            size: metadata.len(),
            // Certains systèmes de fichiers n'exposent pas la date de création.
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

fn segment_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

/// Construit l'archive d'un film : playlist, extrait, `meta.json`, segments.
pub fn build_movie_archive(
    source: &MovieSource,
    output: &Path,
    password: ArchivePassword,
) -> Result<(ArchiveIndex, MovieMeta), ArchiveError> {
    let playlist = source.segments_dir.join(PLAYLIST_NAME);
    if !playlist.is_file() {
        return Err(ArchiveError::MissingEntry(PLAYLIST_NAME.to_string()));
    }
    let meta = MovieMeta::from_file(&source.original)?;

    let mut writer = ArchiveWriter::create(output, password)?;
    writer.add_file(PLAYLIST_NAME, &playlist)?;
    let clip = source.segments_dir.join(CLIP_NAME);
    if clip.is_file() {
        writer.add_file(CLIP_NAME, &clip)?;
    }
    writer.add_bytes(META_NAME, &serde_json::to_vec_pretty(&meta)?)?;
    for segment in segment_files(&source.segments_dir)? {
        let name = segment
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        writer.add_file(&name, &segment)?;
    }
    let index = writer.finish()?;
    Ok((index, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::reader::{read_local_index, ArchiveReader};
    use tempfile::TempDir;

    #[test]
    fn movie_archive_contains_expected_members() {
        let dir = TempDir::new().unwrap();
        let segments = dir.path().join("segments");
        fs::create_dir(&segments).unwrap();
        fs::write(segments.join(PLAYLIST_NAME), "#EXTM3U\nseg_001.ts\nseg_000.ts\n").unwrap();
        fs::write(segments.join(CLIP_NAME), vec![9u8; 2_000]).unwrap();
        fs::write(segments.join("seg_001.ts"), vec![1u8; 3_000]).unwrap();
        fs::write(segments.join("seg_000.ts"), vec![0u8; 3_000]).unwrap();
        fs::write(segments.join("notes.txt"), "ignored").unwrap();
        let original = dir.path().join("Holiday.mkv");
        fs::write(&original, vec![7u8; 4_096]).unwrap();

        let output = dir.path().join("movie.zip");
        let password = ArchivePassword::new("movie-pw");
        let source = MovieSource {
            original,
            segments_dir: segments,
        };
        let (index, meta) = build_movie_archive(&source, &output, password.clone()).unwrap();

        let names: Vec<&str> = index.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![PLAYLIST_NAME, CLIP_NAME, META_NAME, "seg_000.ts", "seg_001.ts"]
        );
        assert_eq!(meta.original_file_name, "Holiday.mkv");
        assert_eq!(meta.size, 4_096);

        assert_eq!(read_local_index(&output).unwrap(), index);
        let mut reader = ArchiveReader::open(File::open(&output).unwrap(), &password).unwrap();
        let stored: MovieMeta =
            serde_json::from_slice(&reader.read_member(META_NAME).unwrap()).unwrap();
        assert_eq!(stored, meta);
    }

    #[test]
    fn movie_archive_requires_playlist() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("film.mkv");
        fs::write(&original, b"x").unwrap();
        let source = MovieSource {
            original,
            segments_dir: dir.path().to_path_buf(),
        };
        let err = build_movie_archive(&source, &dir.path().join("out.zip"), ArchivePassword::new("pw"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::MissingEntry(name) if name == PLAYLIST_NAME));
    }
}
