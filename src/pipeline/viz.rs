//! viz.rs
//! Live visualization buffer: stride-downsampled chunks held for the
//! browser UI to poll. The UI is allowed to lose data, so the queue
//! evicts the oldest chunks when full. Enqueue and drain share one
//! lock so a `GET /data` response is always a consistent snapshot,
//! never a torn multi-chunk read.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Maximum downsampled chunks held for the UI.
pub const VIZ_QUEUE_CAPACITY: usize = 50_000;
/// Every STRIDE-th channel tuple is kept for display.
pub const VIZ_STRIDE: usize = 25;
/// Chunks evicted in one go when the queue is full.
const EVICT_ON_FULL: usize = 10;

pub struct VizBuffer {
    chunks: Mutex<VecDeque<Vec<f32>>>,
    capacity: usize,
    stride: usize,
    channels: usize,
}

impl VizBuffer {
    pub fn new(channels: usize) -> Self {
        Self::with_capacity(channels, VIZ_QUEUE_CAPACITY, VIZ_STRIDE)
    }

    pub fn with_capacity(channels: usize, capacity: usize, stride: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            capacity,
            stride,
            channels,
        }
    }

    /// Downsamples a block and appends it, evicting the oldest chunks
    /// if the queue is full.
    pub fn push(&self, block: &[f32]) {
        let chunk = downsample(block, self.channels, self.stride);
        if chunk.is_empty() {
            return;
        }
        let mut q = self.chunks.lock();
        if q.len() >= self.capacity {
            for _ in 0..EVICT_ON_FULL {
                if q.pop_front().is_none() {
                    break;
                }
            }
        }
        q.push_back(chunk);
    }

    /// Atomically drains all queued chunks into one contiguous float
    /// array, preserving order.
    pub fn drain(&self) -> Vec<f32> {
        let mut q = self.chunks.lock();
        let total: usize = q.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in q.drain(..) {
            out.extend(chunk);
        }
        out
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }
}

/// Keeps whole K-tuples at tuple indices 0, S, 2S, … so the output
/// preserves channel interleaving.
pub fn downsample(block: &[f32], channels: usize, stride: usize) -> Vec<f32> {
    if channels == 0 || stride == 0 {
        return Vec::new();
    }
    let tuples = block.len() / channels;
    let mut out = Vec::with_capacity((tuples / stride + 1) * channels);
    let mut t = 0;
    while t < tuples {
        let at = t * channels;
        out.extend_from_slice(&block[at..at + channels]);
        t += stride;
    }
    out
}
