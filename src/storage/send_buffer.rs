use alloc::collections::VecDeque;
use core::fmt;

use bytes::{Bytes, BytesMut};

use crate::wire::TcpSeqNumber;

/// Application bytes that are either unsent or sent but not yet acknowledged.
///
/// The buffer is an append-only run of immutable chunks. It does not know its own
/// position in sequence space; every positional query takes the sequence number
/// of its first byte (`first_seq`) from the caller, so the same buffer keeps
/// working when the owner rebases that number after the handshake.
#[derive(Default, Clone)]
pub struct SendBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SendBuffer")
            .field("chunks", &self.chunks.len())
            .field("size", &self.size)
            .finish()
    }
}

impl SendBuffer {
    /// Create an empty send buffer.
    pub fn new() -> SendBuffer {
        SendBuffer::default()
    }

    /// Append a copy of `data`.
    pub fn add(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(Bytes::copy_from_slice(data));
        self.size += data.len();
    }

    /// Total number of bytes held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Query whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of held bytes at or after `upto_seq`, given that the first held byte
    /// is `first_seq`.
    ///
    /// A position before `first_seq` counts every byte; a position at or beyond
    /// the end counts none.
    pub fn bytes_available_from(&self, first_seq: TcpSeqNumber, upto_seq: TcpSeqNumber) -> usize {
        let offset = upto_seq - first_seq;
        if offset <= 0 {
            return self.size;
        }
        self.size.saturating_sub(offset as usize)
    }

    /// Copy out up to `max_len` bytes starting at `from_seq`.
    ///
    /// The result may be shorter than `max_len` when the buffer ends first; it is
    /// empty when `from_seq` is exactly the end of the buffer.
    ///
    /// # Panics
    /// This function panics if `from_seq` lies before `first_seq` or past the end of
    /// the buffered bytes.
    pub fn extract(&self, max_len: usize, first_seq: TcpSeqNumber, from_seq: TcpSeqNumber) -> Bytes {
        let offset = from_seq - first_seq;
        if offset < 0 {
            panic!("send buffer: extract at {from_seq} before first byte {first_seq}");
        }
        let mut offset = offset as usize;
        if offset > self.size {
            panic!(
                "send buffer: extract at {from_seq} past end ({} bytes from {first_seq})",
                self.size
            );
        }

        let len = max_len.min(self.size - offset);
        if len == 0 {
            return Bytes::new();
        }

        let mut chunks = self.chunks.iter();
        let first = loop {
            match chunks.next() {
                Some(chunk) if offset >= chunk.len() => offset -= chunk.len(),
                Some(chunk) => break chunk,
                None => unreachable!(),
            }
        };

        // The common case: the whole range sits inside one chunk.
        if offset + len <= first.len() {
            return first.slice(offset..offset + len);
        }

        let mut out = BytesMut::with_capacity(len);
        out.extend_from_slice(&first[offset..]);
        for chunk in chunks {
            let want = len - out.len();
            if want == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..want.min(chunk.len())]);
        }
        debug_assert_eq!(out.len(), len);
        out.freeze()
    }

    /// Release every chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const FIRST: TcpSeqNumber = TcpSeqNumber(1);

    fn buffer(chunks: &[&[u8]]) -> SendBuffer {
        let mut buffer = SendBuffer::new();
        for chunk in chunks {
            buffer.add(chunk);
        }
        buffer
    }

    #[test]
    fn test_size() {
        let buffer = buffer(&[b"abc", b"", b"defg"]);
        assert_eq!(buffer.size(), 7);
        assert!(!buffer.is_empty());
        assert!(SendBuffer::new().is_empty());
    }

    #[test]
    fn test_bytes_available_from() {
        let buffer = buffer(&[b"abc", b"defg"]);
        assert_eq!(buffer.bytes_available_from(FIRST, FIRST), 7);
        assert_eq!(buffer.bytes_available_from(FIRST, FIRST + 3), 4);
        assert_eq!(buffer.bytes_available_from(FIRST, FIRST + 7), 0);
        assert_eq!(buffer.bytes_available_from(FIRST, FIRST + 100), 0);
        assert_eq!(buffer.bytes_available_from(FIRST, TcpSeqNumber(0)), 7);
    }

    #[test]
    fn test_bytes_available_across_wraparound() {
        let first = TcpSeqNumber(0xffff_fffe);
        let buffer = buffer(&[b"abcdef"]);
        assert_eq!(buffer.bytes_available_from(first, TcpSeqNumber(1)), 3);
    }

    #[test]
    fn test_extract_within_chunk() {
        let buffer = buffer(&[b"abcdef", b"ghi"]);
        assert_eq!(&buffer.extract(3, FIRST, FIRST + 1)[..], b"bcd");
    }

    #[test]
    fn test_extract_across_chunks() {
        let buffer = buffer(&[b"ab", b"cde", b"fgh"]);
        assert_eq!(&buffer.extract(5, FIRST, FIRST + 1)[..], b"bcdef");
        assert_eq!(&buffer.extract(100, FIRST, FIRST + 4)[..], b"efgh");
    }

    #[test]
    fn test_extract_at_end() {
        let buffer = buffer(&[b"abc"]);
        assert!(buffer.extract(10, FIRST, FIRST + 3).is_empty());
    }

    #[test]
    #[should_panic(expected = "before first byte")]
    fn test_extract_before_start() {
        let buffer = buffer(&[b"abc"]);
        buffer.extract(1, FIRST, TcpSeqNumber(0));
    }

    #[test]
    #[should_panic(expected = "past end")]
    fn test_extract_past_end() {
        let buffer = buffer(&[b"abc"]);
        buffer.extract(1, FIRST, FIRST + 4);
    }

    #[test]
    fn test_clear() {
        let mut buffer = buffer(&[b"abc", b"def"]);
        buffer.clear();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.bytes_available_from(FIRST, FIRST), 0);
    }

    proptest! {
        #[test]
        fn extracted_segments_reassemble_input(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..16),
            mss in 1usize..100,
        ) {
            let mut buffer = SendBuffer::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                buffer.add(chunk);
                expected.extend_from_slice(chunk);
            }

            let first = TcpSeqNumber(0xffff_ff00);
            let mut seq = first;
            let mut out = Vec::new();
            while buffer.bytes_available_from(first, seq) > 0 {
                let segment = buffer.extract(mss, first, seq);
                prop_assert!(!segment.is_empty() && segment.len() <= mss);
                seq += segment.len();
                out.extend_from_slice(&segment);
            }
            prop_assert_eq!(out, expected);
        }
    }
}
