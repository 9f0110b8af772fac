use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use zip::result::ZipError;
use zip::ZipArchive;

use super::sparse::{SparseRange, SparseView};
use super::{decode_trailer, ArchiveError, ArchiveIndex, TrailerWindow, LOCAL_FILE_SIGNATURE, TRAILER_WINDOW};
use crate::crypto::ArchivePassword;
use crate::range::OffsetLength;

/// Lecteur d'archive chiffrée sur n'importe quel flux Read+Seek :
/// fichier complet ou [`SparseView`] partiellement peuplée.
pub struct ArchiveReader<R: Read + Seek> {
    zip: ZipArchive<R>,
    password: ArchivePassword,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn open(reader: R, password: &ArchivePassword) -> Result<Self, ArchiveError> {
        Ok(Self {
            zip: ZipArchive::new(reader)?,
            password: password.clone(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.zip.file_names().map(str::to_owned).collect()
    }

    /// Déchiffre le membre `name` vers `out` et renvoie le nombre d'octets écrits.
    pub fn extract_to<W: Write>(&mut self, name: &str, out: &mut W) -> Result<u64, ArchiveError> {
        let mut entry = match self.zip.by_name_decrypt(name, self.password.expose().as_bytes()) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(name.to_string())),
            Err(err) => return Err(err.into()),
        };
        Ok(io::copy(&mut entry, out)?)
    }

    pub fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut data = Vec::new();
        self.extract_to(name, &mut data)?;
        Ok(data)
    }

    pub fn into_inner(self) -> R {
        self.zip.into_inner()
    }
}

/// Lit l'index en trailer d'une archive présente sur disque.
pub fn read_local_index(path: &Path) -> Result<ArchiveIndex, ArchiveError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let window_start = len.saturating_sub(TRAILER_WINDOW);
    file.seek(SeekFrom::Start(window_start))?;
    let mut window = Vec::with_capacity((len - window_start) as usize);
    file.read_to_end(&mut window)?;

    match decode_trailer(&window, window_start)? {
        TrailerWindow::Index(index) => Ok(index),
        TrailerWindow::Incomplete { json_start } => {
            file.seek(SeekFrom::Start(json_start))?;
            let mut full = Vec::new();
            file.read_to_end(&mut full)?;
            match decode_trailer(&full, json_start)? {
                TrailerWindow::Index(index) => Ok(index),
                TrailerWindow::Incomplete { .. } => Err(ArchiveError::BadTrailer(
                    "index still incomplete after re-reading from its start".to_string(),
                )),
            }
        }
    }
}

/// Reconstitue une vue creuse de l'archive d'origine à partir de l'en-tête
/// et des plages brutes (encore chiffrées) de quelques membres.
pub fn reconstruct(
    index: &ArchiveIndex,
    header: Vec<u8>,
    members: Vec<(OffsetLength, Vec<u8>)>,
) -> SparseView {
    let mut ranges = Vec::with_capacity(members.len() + 2);
    ranges.push(SparseRange::new(0, LOCAL_FILE_SIGNATURE.to_vec()));
    ranges.push(SparseRange::new(index.header.offset, header));
    ranges.extend(
        members
            .into_iter()
            .map(|(range, data)| SparseRange::new(range.offset, data)),
    );
    SparseView::new(ranges, index.archive_len())
}

/// Extrait à la demande un membre supplémentaire à partir des octets
/// d'en-tête conservés lors de la récupération initiale.
pub fn extract_member_with_header(
    index: &ArchiveIndex,
    header: Vec<u8>,
    name: &str,
    member: Vec<u8>,
    password: &ArchivePassword,
) -> Result<Vec<u8>, ArchiveError> {
    let location = index
        .entry(name)
        .ok_or_else(|| ArchiveError::MissingEntry(name.to_string()))?;
    let view = reconstruct(index, header, vec![(location.range, member)]);
    let mut reader = ArchiveReader::open(view, password)?;
    reader.read_member(name)
}
