use std::io::{self, Read, Seek, SeekFrom};

/// Violation du contrat d'une [`SparseView`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SparseError {
    #[error("read outside provided ranges: {len} bytes at offset {offset}")]
    OutOfRange { offset: u64, len: u64 },
    #[error("seek to {target} outside a view of {length} bytes")]
    SeekOutOfBounds { target: i128, length: u64 },
}

impl From<SparseError> for io::Error {
    fn from(err: SparseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Plage d'octets matérialisée en mémoire, à sa position réelle dans l'objet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseRange {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl SparseRange {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.data.len() as u64)
    }

    fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset.saturating_add(len) <= self.end()
    }
}

/// Flux virtuel en lecture seule d'une longueur déclarée, dont seules les
/// plages fournies sont lisibles.
///
/// On peut se positionner n'importe où dans `[0, len]`, mais chaque lecture
/// doit tenir entièrement dans **une** plage fournie ; sinon elle échoue avec
/// [`SparseError::OutOfRange`] plutôt que de renvoyer de faux octets.
/// Les plages peuvent se chevaucher.
#[derive(Debug)]
pub struct SparseView {
    ranges: Vec<SparseRange>,
    length: u64,
    position: u64,
}

impl SparseView {
    pub fn new(mut ranges: Vec<SparseRange>, length: u64) -> Self {
        ranges.sort_by_key(|range| range.offset);
        Self {
            ranges,
            length,
            position: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn covering(&self, offset: u64, len: u64) -> Option<&SparseRange> {
        let upper = self.ranges.partition_point(|range| range.offset <= offset);
        self.ranges[..upper]
            .iter()
            .rev()
            .find(|range| range.covers(offset, len))
    }
}

impl Read for SparseView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.length - self.position);
        let range = self
            .covering(self.position, want)
            .ok_or(SparseError::OutOfRange {
                offset: self.position,
                len: want,
            })?;
        let start = (self.position - range.offset) as usize;
        let want = want as usize;
        buf[..want].copy_from_slice(&range.data[start..start + want]);
        self.position += want as u64;
        Ok(want)
    }
}

impl Seek for SparseView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.length as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 || target > self.length as i128 {
            return Err(SparseError::SeekOutOfBounds {
                target,
                length: self.length,
            }
            .into());
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse_error(err: io::Error) -> SparseError {
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<SparseError>())
            .cloned()
            .unwrap()
    }

    fn view() -> SparseView {
        SparseView::new(
            vec![
                SparseRange::new(50, vec![5u8; 10]),
                SparseRange::new(10, (10..20).collect()),
            ],
            100,
        )
    }

    #[test]
    fn covered_read_returns_exact_bytes() {
        let mut view = view();
        view.seek(SeekFrom::Start(12)).unwrap();
        let mut buf = [0u8; 4];
        view.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [12, 13, 14, 15]);
        assert_eq!(view.position(), 16);
    }

    #[test]
    fn partially_covered_read_fails() {
        let mut view = view();
        view.seek(SeekFrom::Start(18)).unwrap();
        let mut buf = [0u8; 4];
        let err = view.read(&mut buf).unwrap_err();
        assert_eq!(
            sparse_error(err),
            SparseError::OutOfRange { offset: 18, len: 4 }
        );
    }

    #[test]
    fn read_must_not_span_two_ranges() {
        let mut view = SparseView::new(
            vec![
                SparseRange::new(0, vec![1u8; 10]),
                SparseRange::new(10, vec![2u8; 10]),
            ],
            20,
        );
        view.seek(SeekFrom::Start(8)).unwrap();
        let mut buf = [0u8; 4];
        assert!(view.read(&mut buf).is_err());
    }

    #[test]
    fn overlapping_ranges_pick_a_covering_one() {
        // Signature synthétique qui chevauche le premier membre.
        let mut view = SparseView::new(
            vec![
                SparseRange::new(0, b"PK\x03\x04".to_vec()),
                SparseRange::new(0, (0..32).collect()),
            ],
            32,
        );
        let mut buf = [0u8; 8];
        view.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn seek_beyond_length_fails_and_length_is_invariant() {
        let mut view = view();
        assert_eq!(view.seek(SeekFrom::End(0)).unwrap(), 100);
        let err = view.seek(SeekFrom::Start(101)).unwrap_err();
        assert!(matches!(
            sparse_error(err),
            SparseError::SeekOutOfBounds { target: 101, length: 100 }
        ));
        assert!(view.seek(SeekFrom::Current(-500)).is_err());
        assert_eq!(view.len(), 100);
        assert_eq!(view.position(), 100);
    }

    #[test]
    fn read_at_end_returns_zero() {
        let mut view = view();
        view.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(view.read(&mut buf).unwrap(), 0);
    }
}
