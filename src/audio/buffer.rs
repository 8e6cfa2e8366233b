//! PCM transport buffers
//!
//! [`TransportBuffer`] accumulates captured bytes until one chunk is full,
//! [`PcmChunk`] carries that chunk from the capture loop to the sink, and
//! [`ChunkRing`] is the lock-free single-producer single-consumer queue that
//! feeds the playback device callback.

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One slice of captured audio
///
/// The payload is immutable; its length is the valid length of the chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    data: Bytes,
    /// Position of this chunk in the capture sequence
    sequence: u64,
    /// Capture offset since the source started
    captured_at: Duration,
}

impl PcmChunk {
    pub fn new(data: impl Into<Bytes>, sequence: u64, captured_at: Duration) -> Self {
        Self {
            data: data.into(),
            sequence,
            captured_at,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Valid length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Duration {
        self.captured_at
    }
}

/// Fixed-capacity byte buffer that is filled from arbitrarily sized device
/// callbacks and drained one whole chunk at a time
pub struct TransportBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl TransportBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Copy as much of `src` as fits; returns the number of bytes consumed
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.buf.extend_from_slice(&src[..n]);
        n
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Freeze the current contents into a chunk and start over
    pub fn take_chunk(&mut self, sequence: u64, captured_at: Duration) -> PcmChunk {
        let data = self.buf.split().freeze();
        self.buf.reserve(self.capacity);
        PcmChunk::new(data, sequence, captured_at)
    }
}

/// Lock-free queue of chunks between `AudioSink::write` and the playback
/// device callback
pub struct ChunkRing {
    queue: ArrayQueue<PcmChunk>,
    underrun_count: AtomicUsize,
}

impl ChunkRing {
    /// Create a new ring with room for `capacity` chunks
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a chunk, handing it back if the ring is full
    pub fn push(&self, chunk: PcmChunk) -> Result<(), PcmChunk> {
        self.queue.push(chunk)
    }

    /// Pop a chunk, counting an underrun if the ring is empty
    pub fn pop(&self) -> Option<PcmChunk> {
        let chunk = self.queue.pop();
        if chunk.is_none() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        chunk
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Pops that found the ring empty
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a chunk ring
pub type SharedChunkRing = Arc<ChunkRing>;

pub fn create_shared_ring(capacity: usize) -> SharedChunkRing {
    Arc::new(ChunkRing::new(capacity))
}
