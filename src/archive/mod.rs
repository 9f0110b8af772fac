//! Archives chiffrées lisibles par plages d'octets.
//!
//! Format sur disque :
//! `[octets zip chiffrés][JSON UTF-8 de l'ArchiveIndex][offset absolu du JSON (u64 LE)]`

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use zip::result::ZipError;

use crate::range::OffsetLength;

pub mod document;
pub mod layout;
pub mod reader;
pub mod sparse;
pub mod tracking;
pub mod writer;

pub use document::{open_document, seal_document};
pub use layout::discover_layout;
pub use reader::{extract_member_with_header, read_local_index, reconstruct, ArchiveReader};
pub use sparse::{SparseError, SparseRange, SparseView};
pub use tracking::ReadRangeTracker;
pub use writer::{build_movie_archive, ArchiveWriter, MovieMeta, MovieSource};

/// Taille de la fenêtre lue en fin d'objet pour trouver l'index (100 Kio).
pub const TRAILER_WINDOW: u64 = 100 * 1024;

/// Taille du pointeur final vers le début du JSON.
pub const TRAILER_POINTER_LEN: usize = 8;

/// Signature d'en-tête local zip (`PK\x03\x04`).
pub const LOCAL_FILE_SIGNATURE: [u8; 4] = *b"PK\x03\x04";

/// Emplacement physique (encore chiffré) d'un membre de l'archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntryLocation {
    pub name: String,
    pub range: OffsetLength,
}

/// Index produit une seule fois à la création de l'archive, jamais modifié ensuite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub entries: Vec<ArchiveEntryLocation>,
    pub header: OffsetLength,
}

impl ArchiveIndex {
    pub fn entry(&self, name: &str) -> Option<&ArchiveEntryLocation> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Longueur logique de l'archive zip d'origine (sans le trailer).
    pub fn archive_len(&self) -> u64 {
        self.header.end()
    }

    /// Vérifie qu'un index lu depuis un objet tient dans `[0, limit)`.
    ///
    /// Aucune plage ne doit déborder de `u64` ni dépasser la fin de l'archive zip.
    pub fn check_bounds(&self, limit: u64) -> Result<(), ArchiveError> {
        let archive_len = self.header.checked_end().ok_or_else(|| {
            ArchiveError::BadTrailer(format!(
                "header {}+{} overflows",
                self.header.offset, self.header.length
            ))
        })?;
        if archive_len > limit {
            return Err(ArchiveError::BadTrailer(format!(
                "header ends at {archive_len} but the index starts at {limit}"
            )));
        }
        for entry in &self.entries {
            match entry.range.checked_end() {
                Some(end) if end <= archive_len => {}
                _ => {
                    return Err(ArchiveError::BadTrailer(format!(
                        "entry {} at {}+{} lies outside the {archive_len}-byte archive",
                        entry.name, entry.range.offset, entry.range.length
                    )))
                }
            }
        }
        Ok(())
    }

    /// Sérialise le trailer complet (JSON + pointeur) pour un JSON placé à `json_start`.
    pub fn to_trailer(&self, json_start: u64) -> Result<Vec<u8>, ArchiveError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.extend_from_slice(&json_start.to_le_bytes());
        Ok(bytes)
    }

    /// Ajoute le trailer à la fin du fichier et renvoie la nouvelle longueur totale.
    pub fn append_to(&self, file: &mut File) -> Result<u64, ArchiveError> {
        let json_start = file.seek(SeekFrom::End(0))?;
        let trailer = self.to_trailer(json_start)?;
        file.write_all(&trailer)?;
        file.flush()?;
        Ok(json_start + trailer.len() as u64)
    }
}

/// Résultat du décodage d'une fenêtre de fin d'objet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrailerWindow {
    Index(ArchiveIndex),
    /// Le JSON commence avant la fenêtre : il faut relire à partir de `json_start`.
    Incomplete { json_start: u64 },
}

/// Décode le trailer à partir des derniers octets d'un objet.
///
/// `window` contient les octets `[window_start, fin de l'objet)`.
pub fn decode_trailer(window: &[u8], window_start: u64) -> Result<TrailerWindow, ArchiveError> {
    if window.len() < TRAILER_POINTER_LEN {
        return Err(ArchiveError::BadTrailer(format!(
            "window of {} bytes cannot hold the {TRAILER_POINTER_LEN}-byte pointer",
            window.len()
        )));
    }
    let split = window.len() - TRAILER_POINTER_LEN;
    let mut pointer = [0u8; TRAILER_POINTER_LEN];
    pointer.copy_from_slice(&window[split..]);
    let json_start = u64::from_le_bytes(pointer);
    let json_end = window_start
        .checked_add(split as u64)
        .ok_or_else(|| ArchiveError::BadTrailer(format!("window start {window_start} overflows")))?;

    if json_start > json_end {
        return Err(ArchiveError::BadTrailer(format!(
            "index starts at {json_start}, after its own end {json_end}"
        )));
    }
    if json_start < window_start {
        return Ok(TrailerWindow::Incomplete { json_start });
    }

    let from = (json_start - window_start) as usize;
    let index: ArchiveIndex = serde_json::from_slice(&window[from..split])?;
    index.check_bounds(json_start)?;
    Ok(TrailerWindow::Index(index))
}

/// Erreurs du module Archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(io::Error),
    #[error("zip error: {0}")]
    Zip(ZipError),
    #[error("wrong archive password")]
    InvalidPassword,
    #[error("invalid archive index JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive has no entry named {0}")]
    MissingEntry(String),
    #[error("invalid archive trailer: {0}")]
    BadTrailer(String),
    #[error("layout discovery failed: {0}")]
    Layout(String),
    #[error("entry {name} spans more than 4 GiB and cannot be addressed as one range")]
    EntryTooLarge { name: String },
    #[error(transparent)]
    Sparse(#[from] SparseError),
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        // Une lecture hors plage traverse le lecteur zip sous forme d'io::Error.
        if let Some(sparse) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<SparseError>())
        {
            return ArchiveError::Sparse(sparse.clone());
        }
        ArchiveError::Io(err)
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(io) => io.into(),
            ZipError::InvalidPassword => ArchiveError::InvalidPassword,
            other => ArchiveError::Zip(other),
        }
    }
}
