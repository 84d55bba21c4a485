//! Progress across sequential chunks

use std::sync::atomic::{AtomicUsize, Ordering};

use ts_core::{ProgressRecord, ProgressSink};

/// Maps per-chunk progress onto one running position
///
/// Each chunk's search restarts its step count at 1; the wrapped sink sees
/// a position that only moves forward across the whole input.
pub struct ChunkedProgress<'a> {
    inner: &'a dyn ProgressSink,
    chunks: usize,
    chunk: AtomicUsize,
    base: AtomicUsize,
    last: AtomicUsize,
}

impl<'a> ChunkedProgress<'a> {
    pub fn new(inner: &'a dyn ProgressSink, chunks: usize) -> Self {
        Self {
            inner,
            chunks: chunks.max(1),
            chunk: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
        }
    }

    /// Fold the finished chunk's steps into the base position
    pub fn next_chunk(&self) {
        let last = self.last.swap(0, Ordering::SeqCst);
        self.base.fetch_add(last, Ordering::SeqCst);
        self.chunk.fetch_add(1, Ordering::SeqCst);
    }

    /// Steps completed over all chunks so far
    pub fn position(&self) -> usize {
        self.base.load(Ordering::SeqCst) + self.last.load(Ordering::SeqCst)
    }

    /// 0-based index of the chunk being decoded
    pub fn chunk(&self) -> usize {
        self.chunk.load(Ordering::SeqCst)
    }
}

impl ProgressSink for ChunkedProgress<'_> {
    fn report(&self, record: ProgressRecord) {
        self.last.store(record.step, Ordering::SeqCst);
        let chunk = self.chunk();
        let base = self.base.load(Ordering::SeqCst);
        let step = base + record.step;
        // Later chunks are estimated at this chunk's budget
        let remaining = self.chunks.saturating_sub(chunk + 1);
        let total = (base + record.total_steps * (remaining + 1)).max(step);

        self.inner.report(ProgressRecord {
            step,
            total_steps: total,
            message: Some(format!("chunk {}/{}", chunk + 1, self.chunks)),
            ..record
        });
    }

    fn wants_sample(&self) -> bool {
        self.inner.wants_sample()
    }
}
