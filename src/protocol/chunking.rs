//! Chunk layout for a message
//!
//! A plan is a list of byte ranges into the payload. It starts with a
//! uniform chunk size and can be resplit from any index with a smaller size
//! when the radio rejects a frame as too long; ranges before that index keep
//! their boundaries so chunks the receiver already holds stay valid.

use alloc::vec::Vec;
use core::ops::Range;

/// Ordered chunk boundaries for one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    ranges: Vec<Range<usize>>,
    chunk_size: usize,
}

impl ChunkPlan {
    /// Split `len` bytes into chunks of at most `chunk_size` bytes
    ///
    /// An empty payload still produces one (empty) chunk.
    pub fn new(len: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut plan = Self {
            ranges: Vec::new(),
            chunk_size,
        };
        plan.append_from(0, len);
        plan
    }

    fn append_from(&mut self, start: usize, len: usize) {
        if start >= len {
            if self.ranges.is_empty() {
                self.ranges.push(0..0);
            }
            return;
        }
        let mut offset = start;
        while offset < len {
            let end = (offset + self.chunk_size).min(len);
            self.ranges.push(offset..end);
            offset = end;
        }
    }

    /// Replace chunk `idx` and everything after it with chunks of `chunk_size`
    pub fn resplit_from(&mut self, idx: usize, chunk_size: usize) {
        let Some(start) = self.ranges.get(idx).map(|r| r.start) else {
            return;
        };
        let len = self.ranges.last().map_or(0, |r| r.end);
        self.ranges.truncate(idx);
        self.chunk_size = chunk_size.max(1);
        self.append_from(start, len);
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Size used for chunks from the last (re)split onwards
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes of chunk `idx` within `payload`
    pub fn chunk<'a>(&self, payload: &'a [u8], idx: usize) -> &'a [u8] {
        match self.ranges.get(idx) {
            Some(range) => &payload[range.clone()],
            None => &[],
        }
    }
}
