// Ingest-to-sink pipeline: fan-out dispatcher, downsampling
// visualization buffer, rolling CSV writer and SQL staging uploader.

pub mod csv_writer;
pub mod dispatcher;
pub mod sql_uploader;
pub mod timebase;
pub mod viz;

use std::sync::Arc;

use parking_lot::Mutex;

/// Interleaved float samples; length is always a multiple of the
/// active channel count.
pub type SampleBlock = Vec<f32>;

/// Capacity of the CSV and SQL sink queues. Fullness is the
/// backpressure signal: blocks are dropped with a warning.
pub const SINK_QUEUE_CAPACITY: usize = 50_000;

/// Narrow one-way coupling from the CSV writer to the SQL uploader:
/// each freshly created CSV basename is published here and becomes
/// the next SQL target table. The uploader never reaches back.
#[derive(Clone, Default)]
pub struct TableNameCell {
    inner: Arc<Mutex<Option<String>>>,
}

impl TableNameCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, name: &str) {
        *self.inner.lock() = Some(name.to_string());
    }

    pub fn latest(&self) -> Option<String> {
        self.inner.lock().clone()
    }
}
