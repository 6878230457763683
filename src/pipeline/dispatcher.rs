//! dispatcher.rs
//! Single ingest worker: drains the device adapter and fans every
//! block out to the three sinks. The visualization buffer is fed
//! synchronously; the CSV and SQL queues get their own copies via a
//! non-blocking send, dropped with a warning when a queue is full
//! (queue fullness is the backpressure signal).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Sender;
use log::{debug, warn};

use crate::device::DeviceAdapter;
use crate::pipeline::viz::VizBuffer;
use crate::pipeline::SampleBlock;

const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct IngestDispatcher {
    pub device: Arc<DeviceAdapter>,
    pub viz: Arc<VizBuffer>,
    pub csv_tx: Option<Sender<SampleBlock>>,
    pub sql_tx: Option<Sender<SampleBlock>>,
    pub collecting: Arc<AtomicBool>,
    /// Total samples ingested, pre-downsample (UI counter).
    pub total_samples: Arc<AtomicU64>,
}

impl IngestDispatcher {
    pub fn run(self) {
        debug!("[Dispatcher] started");
        while self.collecting.load(Ordering::Acquire) {
            self.pump();
            thread::sleep(IDLE_SLEEP);
        }
        // One last pass so blocks the device read just before the stop
        // still reach the sinks; the sink queues drain themselves.
        self.pump();
        debug!("[Dispatcher] exited");
    }

    fn pump(&self) {
        while let Some(block) = self.device.get_block() {
            self.total_samples
                .fetch_add(block.len() as u64, Ordering::Relaxed);
            self.viz.push(&block);

            if let Some(tx) = &self.csv_tx {
                // Writers may outlive this view of the block, so each
                // queue gets its own copy.
                if tx.try_send(block.clone()).is_err() {
                    warn!(
                        "[Dispatcher] csv queue full, dropping {} samples",
                        block.len()
                    );
                }
            }
            if let Some(tx) = &self.sql_tx {
                let len = block.len();
                if tx.try_send(block).is_err() {
                    warn!("[Dispatcher] sql queue full, dropping {len} samples");
                }
            }
        }
    }
}
