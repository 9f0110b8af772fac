use std::cell::Cell;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

/// Flux Read+Seek qui mémorise l'intervalle contigu `[min, max)` touché
/// par toutes les lectures depuis la dernière remise à zéro.
///
/// Le lecteur zip prend possession du flux ; l'intervalle est donc partagé
/// via une [`RangeProbe`]. Mono-thread par construction.
pub struct ReadRangeTracker<R> {
    inner: R,
    position: u64,
    touched: Rc<Cell<Option<(u64, u64)>>>,
}

/// Poignée d'observation de l'intervalle touché par un [`ReadRangeTracker`].
#[derive(Clone)]
pub struct RangeProbe(Rc<Cell<Option<(u64, u64)>>>);

impl RangeProbe {
    pub fn reset(&self) {
        self.0.set(None);
    }

    /// Intervalle `[min, max)` lu depuis la dernière remise à zéro.
    pub fn touched(&self) -> Option<(u64, u64)> {
        self.0.get()
    }
}

impl<R: Seek> ReadRangeTracker<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self {
            inner,
            position,
            touched: Rc::new(Cell::new(None)),
        })
    }

    pub fn probe(&self) -> RangeProbe {
        RangeProbe(Rc::clone(&self.touched))
    }

    fn record(&self, start: u64, end: u64) {
        let widened = match self.touched.get() {
            Some((min, max)) => (min.min(start), max.max(end)),
            None => (start, end),
        };
        self.touched.set(Some(widened));
    }
}

impl<R: Read + Seek> Read for ReadRangeTracker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let start = self.position;
            self.position += n as u64;
            self.record(start, self.position);
        }
        Ok(n)
    }
}

impl<R: Seek> Seek for ReadRangeTracker<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.inner.seek(pos)?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tracker_records_min_max_of_reads() {
        let data: Vec<u8> = (0..100).collect();
        let mut tracker = ReadRangeTracker::new(Cursor::new(data)).unwrap();
        let probe = tracker.probe();
        let mut buf = [0u8; 5];

        tracker.seek(SeekFrom::Start(40)).unwrap();
        tracker.read_exact(&mut buf).unwrap();
        tracker.seek(SeekFrom::Start(10)).unwrap();
        tracker.read_exact(&mut buf).unwrap();
        assert_eq!(probe.touched(), Some((10, 45)));

        probe.reset();
        assert_eq!(probe.touched(), None);

        // Un seek seul ne compte pas comme une lecture.
        tracker.seek(SeekFrom::End(-3)).unwrap();
        assert_eq!(probe.touched(), None);
        let mut tail = Vec::new();
        tracker.read_to_end(&mut tail).unwrap();
        assert_eq!(probe.touched(), Some((97, 100)));
    }
}
