//! Conteneur d'un document unique (le catalogue `library.json`) dans une
//! archive AES-256, entièrement en mémoire et sans trailer.

use std::io::{Cursor, Write};

use zeroize::Zeroizing;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

use super::reader::ArchiveReader;
use super::ArchiveError;
use crate::crypto::ArchivePassword;

/// Chiffre `content` sous le nom `name` et renvoie les octets de l'archive.
pub fn seal_document(name: &str, content: &[u8], password: &ArchivePassword) -> Result<Vec<u8>, ArchiveError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .with_aes_encryption(AesMode::Aes256, password.expose());
    zip.start_file(name, options)?;
    zip.write_all(content)?;
    Ok(zip.finish()?.into_inner())
}

/// Déchiffre le document `name` ; le clair est effacé de la mémoire au drop.
pub fn open_document(
    archive: &[u8],
    name: &str,
    password: &ArchivePassword,
) -> Result<Zeroizing<Vec<u8>>, ArchiveError> {
    let mut reader = ArchiveReader::open(Cursor::new(archive), password)?;
    let mut content = Zeroizing::new(Vec::new());
    reader.extract_to(name, &mut *content)?;
    Ok(content)
}
