//! Découverte empirique de la disposition physique d'une archive.
//!
//! Le lecteur zip n'expose pas les offsets physiques des membres : on les
//! déduit en observant les octets qu'il lit réellement. Les constantes de
//! marge ci-dessous ont été établies contre `zip` 2.x (lecture EOCD par
//! fenêtres de 2048 octets depuis la fin, en-tête local de 30 octets, données
//! AES lues via `Take`). Tout changement de bibliothèque zip impose de les
//! revalider avec `round_trip_through_sparse_view`.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use zip::ZipArchive;

use super::tracking::ReadRangeTracker;
use super::{ArchiveEntryLocation, ArchiveError, ArchiveIndex};
use crate::crypto::ArchivePassword;
use crate::range::OffsetLength;

/// Élargissement vers l'arrière de la plage d'en-tête.
pub const HEADER_SLOP: u64 = 1024;

/// Un membre dont la plage commence avant cet offset est ancré à 0.
pub const LOW_OFFSET_THRESHOLD: u64 = 1000;

/// Élargissement vers l'arrière des plages de membres au-delà du seuil.
pub const ENTRY_SLOP: u64 = 0;

/// Construit l'index d'une archive zip fraîchement écrite (sans trailer).
///
/// Séquentiel, membre par membre, pour que l'intervalle observé soit sans ambiguïté.
pub fn discover_layout(path: &Path, password: &ArchivePassword) -> Result<ArchiveIndex, ArchiveError> {
    let file = File::open(path)?;
    let archive_len = file.metadata()?.len();
    let tracker = ReadRangeTracker::new(BufReader::new(file))?;
    let probe = tracker.probe();

    // Ouvrir la table des matières force la lecture de l'EOCD et du répertoire central.
    let mut zip = ZipArchive::new(tracker)?;
    let (header_min, _) = probe
        .touched()
        .ok_or_else(|| ArchiveError::Layout("opening the archive read no bytes".to_string()))?;
    let header_start = header_min.saturating_sub(HEADER_SLOP);
    let header = OffsetLength::from_bounds(header_start, archive_len).ok_or_else(|| {
        ArchiveError::Layout(format!(
            "header span {header_start}..{archive_len} does not fit one range"
        ))
    })?;

    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        probe.reset();
        let name = {
            let mut entry = zip.by_index_decrypt(i, password.expose().as_bytes())?;
            let name = entry.name().to_string();
            io::copy(&mut entry, &mut io::sink())?;
            name
        };
        let (start, end) = probe
            .touched()
            .ok_or_else(|| ArchiveError::Layout(format!("entry {name} read no bytes")))?;
        let start = if start < LOW_OFFSET_THRESHOLD {
            0
        } else {
            start.saturating_sub(ENTRY_SLOP)
        };
        let range = OffsetLength::from_bounds(start, end.min(archive_len))
            .ok_or_else(|| ArchiveError::EntryTooLarge { name: name.clone() })?;
        log::debug!(
            "layout::discover_layout: entry={}, offset={}, length={}",
            name,
            range.offset,
            range.length
        );
        entries.push(ArchiveEntryLocation { name, range });
    }

    log::info!(
        "layout::discover_layout: path={}, entries={}, header_offset={}, header_len={}",
        path.display(),
        entries.len(),
        header.offset,
        header.length
    );
    Ok(ArchiveIndex { entries, header })
}
