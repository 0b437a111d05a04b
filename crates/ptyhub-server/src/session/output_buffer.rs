//! Bounded chunk log of captured process output.
//!
//! Keeps the most recent `capacity` chunks so that a chatty or runaway agent
//! cannot grow server memory without bound. When full, the oldest chunk is
//! dropped; the draining thread never blocks on a slow reader.

use ptyhub_core::OutputChunk;
use std::collections::VecDeque;

/// A fixed-capacity FIFO of output chunks.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    capacity: usize,
    /// Chunks discarded because the buffer was full.
    dropped: u64,
}

impl OutputBuffer {
    /// Create a new buffer holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a chunk, evicting the oldest ones while over capacity.
    pub fn push(&mut self, chunk: OutputChunk) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }

        self.chunks.push_back(chunk);
        while self.chunks.len() > self.capacity {
            self.chunks.pop_front();
            self.dropped += 1;
        }
    }

    /// Copy all buffered chunks in chronological order.
    pub fn snapshot(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Move all buffered chunks out, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<OutputChunk> {
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Total chunks ever discarded for lack of space.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
