//! Demand-driven byte accumulation.
//!
//! A producer feeds arbitrarily sized byte slices into a [`ByteReader`]
//! while a consumer registers what it needs next: either an exact number of
//! bytes or everything through the next occurrence of a delimiter. Once the
//! buffered bytes cover the registered demand, [`ByteReader::poll`] detaches
//! and returns exactly the satisfied slice as a contiguous view.
//!
//! The reader holds at most one demand at a time; registering a new one
//! replaces the old. A demand that is already satisfiable from buffered
//! bytes is answered by the next `poll` without further feeding, which is
//! how a caller consumes several protocol elements out of a single feed.

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// What the consumer is currently waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Demand {
    Idle,
    /// The next `n` bytes.
    Exact(usize),
    /// Everything through the earliest next occurrence of the delimiter.
    Until(Vec<u8>),
}

/// Accumulates producer bytes until the registered demand is satisfied.
pub struct ByteReader {
    buf: BytesMut,
    demand: Demand,
    /// Prefix of `buf` already scanned for the current `Until` demand.
    scanned: usize,
}

impl ByteReader {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), demand: Demand::Idle, scanned: 0 }
    }

    /// Registers a demand for exactly `n` more bytes, replacing any
    /// previous demand.
    pub fn require_bytes(&mut self, n: usize) {
        self.demand = Demand::Exact(n);
        self.scanned = 0;
    }

    /// Registers a demand for the bytes up to and including the earliest
    /// next occurrence of `delim`, replacing any previous demand.
    pub fn require_until(&mut self, delim: &[u8]) {
        debug_assert!(!delim.is_empty());
        self.demand = Demand::Until(delim.to_vec());
        self.scanned = 0;
    }

    /// Appends producer bytes behind any not-yet-consumed ones.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Answers the registered demand if the buffered bytes cover it.
    ///
    /// The returned view is exactly the satisfied slice; for an `Until`
    /// demand it ends with the delimiter bytes. Returning the view consumes
    /// it: the reader keeps only the bytes past the slice, and the demand
    /// is cleared.
    pub fn poll(&mut self) -> Option<Bytes> {
        match std::mem::replace(&mut self.demand, Demand::Idle) {
            Demand::Idle => None,
            Demand::Exact(n) => {
                if self.buf.len() < n {
                    self.demand = Demand::Exact(n);
                    return None;
                }
                let view = self.buf.split_to(n).freeze();
                trace!(len = view.len(), "byte demand satisfied");
                Some(view)
            }
            Demand::Until(delim) => {
                // Resume where the previous scan stopped, backing up far
                // enough to catch a delimiter split across feeds.
                let start = self.scanned.saturating_sub(delim.len() - 1);
                match find(&self.buf[start..], &delim) {
                    Some(at) => {
                        let end = start + at + delim.len();
                        self.scanned = 0;
                        let view = self.buf.split_to(end).freeze();
                        trace!(len = view.len(), "delimiter demand satisfied");
                        Some(view)
                    }
                    None => {
                        self.scanned = self.buf.len();
                        self.demand = Demand::Until(delim);
                        None
                    }
                }
            }
        }
    }

    /// True while a demand is registered and unanswered.
    pub fn pending(&self) -> bool {
        !matches!(self.demand, Demand::Idle)
    }

    /// Bytes buffered past the last satisfied view.
    pub fn unread(&self) -> usize {
        self.buf.len()
    }

    /// Drops buffered bytes and any registered demand.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.demand = Demand::Idle;
        self.scanned = 0;
    }
}

impl Default for ByteReader {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_demand_deferred_until_fed() {
        let mut reader = ByteReader::new();
        reader.require_bytes(5);
        assert_eq!(reader.poll(), None);

        reader.feed(b"hel");
        assert_eq!(reader.poll(), None);
        assert!(reader.pending());

        reader.feed(b"lo, world");
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"hello")));
        assert!(!reader.pending());
        assert_eq!(reader.unread(), 7);
    }

    #[test]
    fn exact_demand_satisfied_from_buffered_bytes() {
        let mut reader = ByteReader::new();
        reader.feed(b"abcdef");
        reader.require_bytes(4);
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"abcd")));
        assert_eq!(reader.unread(), 2);
    }

    #[test]
    fn until_matches_earliest_occurrence() {
        let mut reader = ByteReader::new();
        reader.feed(b"a\r\nb\r\nc");
        reader.require_until(b"\r\n");
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"a\r\n")));

        reader.require_until(b"\r\n");
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"b\r\n")));

        reader.require_until(b"\r\n");
        assert_eq!(reader.poll(), None);
    }

    #[test]
    fn delimiter_split_across_feeds_is_retested() {
        let mut reader = ByteReader::new();
        reader.require_until(b"\r\n\r\n");

        reader.feed(b"GET / HTTP/1.1\r\n\r");
        assert_eq!(reader.poll(), None);

        reader.feed(b"\nrest");
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")));
        assert_eq!(reader.unread(), 4);
    }

    #[test]
    fn delimiter_fed_byte_by_byte() {
        let mut reader = ByteReader::new();
        reader.require_until(b"\r\n");
        for &b in b"abc\r\n" {
            assert_eq!(reader.poll(), None);
            reader.feed(&[b]);
        }
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"abc\r\n")));
    }

    #[test]
    fn new_demand_replaces_old() {
        let mut reader = ByteReader::new();
        reader.feed(b"ab\r\ncd");
        reader.require_bytes(100);
        assert_eq!(reader.poll(), None);

        reader.require_until(b"\r\n");
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"ab\r\n")));
    }

    #[test]
    fn clear_drops_bytes_and_demand() {
        let mut reader = ByteReader::new();
        reader.feed(b"abcdef");
        reader.require_bytes(3);
        reader.clear();

        assert_eq!(reader.unread(), 0);
        assert!(!reader.pending());
        assert_eq!(reader.poll(), None);

        reader.feed(b"xyz");
        reader.require_bytes(3);
        assert_eq!(reader.poll(), Some(Bytes::from_static(b"xyz")));
    }
}
