use bytes::Bytes;
use std::time::Instant;

/// One encoded JPEG frame from the stream pipeline
///
/// Frame data is immutable and cheap to clone, so every consumer gets its
/// own view without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,

    /// Strictly increasing for the lifetime of the frame buffer
    pub sequence: u64,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
