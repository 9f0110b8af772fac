use serde::{Deserialize, Serialize};

/// Plage d'octets `[offset, offset + length)` dans un objet distant nommé.
///
/// Le type n'impose rien au-delà de la non-négativité : c'est à l'appelant
/// de ne pas construire de plages qui se chevauchent ou qui débordent de
/// l'objet décrit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetLength {
    pub offset: u64,
    pub length: u32,
}

impl OffsetLength {
    pub const fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// Construit la plage `[start, end)`.
    ///
    /// Renvoie `None` si `end < start` ou si la longueur ne tient pas sur 32 bits.
    pub fn from_bounds(start: u64, end: u64) -> Option<Self> {
        let length = u32::try_from(end.checked_sub(start)?).ok()?;
        Some(Self::new(start, length))
    }

    /// Offset de fin (exclusif), plafonné à `u64::MAX`.
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.length as u64)
    }

    /// Offset de fin, ou `None` s'il déborde de `u64`.
    pub const fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length as u64)
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.offset && offset.saturating_add(len) <= self.end()
    }

    /// Valeur de l'en-tête HTTP `Range` (bornes inclusives).
    pub fn http_range(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_range_is_inclusive() {
        let range = OffsetLength::new(100, 50);
        assert_eq!(range.http_range(), "bytes=100-149");
        assert_eq!(range.end(), 150);
    }

    #[test]
    fn from_bounds_rejects_inverted_span() {
        assert_eq!(OffsetLength::from_bounds(10, 4), None);
        assert_eq!(
            OffsetLength::from_bounds(4, 10),
            Some(OffsetLength::new(4, 6))
        );
    }

    #[test]
    fn end_near_the_top_of_u64_does_not_wrap() {
        let range = OffsetLength::new(u64::MAX - 10, 50);
        assert_eq!(range.checked_end(), None);
        assert_eq!(range.end(), u64::MAX);
        assert!(!range.covers(u64::MAX - 5, 10));
    }

    #[test]
    fn covers_checks_both_ends() {
        let range = OffsetLength::new(10, 10);
        assert!(range.covers(10, 10));
        assert!(range.covers(15, 0));
        assert!(!range.covers(9, 2));
        assert!(!range.covers(19, 2));
    }
}
