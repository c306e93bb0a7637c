use alloc::vec::Vec;
use core::fmt;

use bytes::Bytes;

use crate::wire::TcpSeqNumber;

/// Received data that arrived ahead of the next expected sequence number.
///
/// Segments are kept sorted by starting sequence number and never overlap each
/// other; the caller trims incoming data against its neighbours before inserting.
#[derive(Default, Clone)]
pub struct ReorderBuffer {
    segments: Vec<(TcpSeqNumber, Bytes)>,
    size: usize,
}

impl fmt::Display for ReorderBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for (seq, data) in self.segments.iter() {
            write!(f, "{}+{} ", seq, data.len())?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReorderBuffer {self}")
    }
}

impl ReorderBuffer {
    /// Create an empty reorder buffer.
    pub const fn new() -> ReorderBuffer {
        ReorderBuffer {
            segments: Vec::new(),
            size: 0,
        }
    }

    /// Return whether no data is buffered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of buffered bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.size = 0;
    }

    /// Starting sequence number of the first segment that starts strictly after `seq`.
    pub fn next_after(&self, seq: TcpSeqNumber) -> Option<TcpSeqNumber> {
        self.segments
            .iter()
            .map(|(start, _)| *start)
            .find(|start| *start > seq)
    }

    /// End sequence number of the last segment that starts strictly before `seq`.
    pub fn end_before(&self, seq: TcpSeqNumber) -> Option<TcpSeqNumber> {
        self.segments
            .iter()
            .rev()
            .find(|(start, _)| *start < seq)
            .map(|(start, data)| *start + data.len())
    }

    /// Buffer `data` starting at `seq`.
    ///
    /// When a segment with the same starting number is already buffered, the longer
    /// of the two is kept.
    ///
    /// # Panics
    /// This function panics if the new segment would overlap a neighbour.
    pub fn insert(&mut self, seq: TcpSeqNumber, data: Bytes) {
        if data.is_empty() {
            return;
        }

        let at = self
            .segments
            .iter()
            .position(|(start, _)| !(*start < seq))
            .unwrap_or(self.segments.len());

        if let Some((start, existing)) = self.segments.get_mut(at) {
            if *start == seq {
                if data.len() > existing.len() {
                    self.size += data.len() - existing.len();
                    *existing = data;
                }
                self.check_order(at);
                return;
            }
        }

        self.size += data.len();
        self.segments.insert(at, (seq, data));
        self.check_order(at);
    }

    /// Remove and return the segment that continues the stream at `next`, if any.
    ///
    /// Segments that were overtaken by in-order data are trimmed at the front, or
    /// discarded entirely if nothing of them is new.
    pub fn pop_contiguous(&mut self, next: TcpSeqNumber) -> Option<Bytes> {
        loop {
            let (start, data) = self.segments.first()?;
            if *start > next {
                return None;
            }

            let (start, data) = self.segments.remove(0);
            self.size -= data.len();
            let overlap = (next - start) as usize;
            if overlap < data.len() {
                return Some(data.slice(overlap..));
            }
            net_trace!("reorder: dropping overtaken segment {}+{}", start, data.len());
        }
    }

    fn check_order(&self, at: usize) {
        let (start, data) = &self.segments[at];
        let end = *start + data.len();
        if let Some((next, _)) = self.segments.get(at + 1) {
            if end > *next {
                panic!("reorder buffer: segment {start}+{} overlaps {next}", data.len());
            }
        }
        if let Some(prev) = at.checked_sub(1).map(|i| &self.segments[i]) {
            if prev.0 + prev.1.len() > *start {
                panic!("reorder buffer: segment {} overlaps {start}", prev.0);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn seq(n: u32) -> TcpSeqNumber {
        TcpSeqNumber(n)
    }

    #[test]
    fn test_empty() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_after(seq(0)), None);
        assert_eq!(buffer.end_before(seq(100)), None);
        assert_eq!(buffer.pop_contiguous(seq(0)), None);
    }

    #[test]
    fn test_sorted_insert() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(30), Bytes::from_static(b"xyz"));
        buffer.insert(seq(10), Bytes::from_static(b"abc"));
        buffer.insert(seq(20), Bytes::from_static(b"def"));
        assert_eq!(format!("{buffer}"), "[ 10+3 20+3 30+3 ]");
        assert_eq!(buffer.size(), 9);
        assert_eq!(buffer.next_after(seq(10)), Some(seq(20)));
        assert_eq!(buffer.next_after(seq(30)), None);
        assert_eq!(buffer.end_before(seq(20)), Some(seq(13)));
        assert_eq!(buffer.end_before(seq(10)), None);
    }

    #[test]
    fn test_duplicate_key_keeps_longer() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(10), Bytes::from_static(b"ab"));
        buffer.insert(seq(10), Bytes::from_static(b"abcd"));
        assert_eq!(buffer.size(), 4);
        buffer.insert(seq(10), Bytes::from_static(b"a"));
        assert_eq!(buffer.size(), 4);
        assert_eq!(buffer.pop_contiguous(seq(10)), Some(Bytes::from_static(b"abcd")));
    }

    #[test]
    fn test_pop_contiguous_trims_overtaken() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(10), Bytes::from_static(b"abc"));
        buffer.insert(seq(15), Bytes::from_static(b"defgh"));
        assert_eq!(buffer.pop_contiguous(seq(17)), Some(Bytes::from_static(b"fgh")));
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_pop_contiguous_stops_at_gap() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(20), Bytes::from_static(b"abc"));
        assert_eq!(buffer.pop_contiguous(seq(10)), None);
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn test_wraparound_order() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(5), Bytes::from_static(b"b"));
        buffer.insert(seq(0xffff_fffe), Bytes::from_static(b"a"));
        assert_eq!(format!("{buffer}"), "[ 4294967294+1 5+1 ]");
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlap_panics() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(seq(10), Bytes::from_static(b"abcd"));
        buffer.insert(seq(12), Bytes::from_static(b"xy"));
    }
}
