//! Event-boundary aggregation for the raw-byte SSE path.
//!
//! Bytes are grouped into segments ending at a blank line (`\n\n`, `\r\r` or
//! `\r\n\r\n`) before line decoding, so the line decoder mostly sees whole
//! events.

use bytes::{Bytes, BytesMut};

/// Event boundaries, longest first so `\r\n\r\n` wins at a shared offset.
const BOUNDARIES: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

/// Longest boundary minus one: how far a boundary can reach back into bytes
/// that were already scanned.
const BOUNDARY_OVERLAP: usize = 3;

/// Groups raw bytes into segments ending at event boundaries.
///
/// The buffer is only scanned from where the previous scan stopped, so a
/// single very large event costs linear time however it is fragmented.
///
/// # Example
/// ```
/// use tokenflow::chunks::ChunkAggregator;
///
/// let mut aggregator = ChunkAggregator::new();
/// assert!(aggregator.push("data: 1\n").is_empty());
/// let segments = aggregator.push("\ndata: 2");
/// assert_eq!(&segments[0][..], b"data: 1\n\n");
/// assert_eq!(aggregator.finish().as_deref(), Some(&b"data: 2"[..]));
/// ```
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    buffer: BytesMut,
    /// Offset up to which no boundary can start.
    scanned: usize,
}

impl ChunkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every complete segment it closes,
    /// each including its boundary bytes.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk.as_ref());

        let mut segments = Vec::new();
        while let Some(end) = self.find_boundary() {
            segments.push(self.buffer.split_to(end).freeze());
            self.scanned = 0;
        }
        segments
    }

    /// Take any residual bytes at end of input.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }

    /// Find the end offset of the earliest boundary in the buffer.
    fn find_boundary(&mut self) -> Option<usize> {
        let buffer = &self.buffer[..];
        for start in self.scanned..buffer.len() {
            let tail = &buffer[start..];
            if let Some(boundary) = BOUNDARIES.iter().find(|b| tail.starts_with(b)) {
                return Some(start + boundary.len());
            }
        }
        self.scanned = buffer.len().saturating_sub(BOUNDARY_OVERLAP);
        None
    }
}
