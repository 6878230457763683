//! adapter.rs
//! Owns the device session and the polling read loop. Blocks read
//! from the device land in an internal bounded queue (drop-oldest on
//! full, the visualization-friendly policy); `get_block` hands them
//! to the dispatcher without blocking.
//!
//! Two read modes, selected by `target_count`:
//! - Continuous (0): read everything available, rounded down to a
//!   multiple of the channel count.
//! - N-Sample (>0): wait until the device buffer holds the target,
//!   read it, then stop the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::DeviceSettings;
use crate::device::transport::{
    ScanParams, ScanTransport, TransportFactory, STATUS_ERROR, STATUS_OVERFLOW, STATUS_STOPPED,
};
use crate::error::DeviceError;

/// Bounded block queue between the read loop and the dispatcher.
const INTERNAL_QUEUE_DEPTH: usize = 1000;
/// Transient read failures tolerated before the loop gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Sleep between retries after a transient failure.
const RETRY_SLEEP: Duration = Duration::from_millis(100);
/// Sleep between polls that found nothing to read.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct DeviceAdapter {
    channel_count: usize,
    active_channels: Vec<usize>,
    sample_rate: u32,
    target_count: u32,
    queue: Arc<ArrayQueue<Vec<f32>>>,
    reading: Arc<AtomicBool>,
    fault: Arc<AtomicBool>,
    transport: Mutex<Option<Box<dyn ScanTransport>>>,
    read_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceAdapter {
    /// Opens the device session, configures the scan and verifies the
    /// parameters by reading them back (mismatches are warnings, as on
    /// the reference firmware).
    pub fn init(
        settings: &DeviceSettings,
        factory: &TransportFactory,
    ) -> Result<Self, DeviceError> {
        let channel_count = settings.channel_count();
        let active_channels = settings.active_channels();

        let mut transport = factory(settings)?;
        let params = ScanParams {
            channel_count: channel_count as i16,
            gain: settings.gain,
            trigger_mode: settings.trigger_mode,
            sample_rate: settings.sample_rate as i32,
            target_count: settings.target_count,
            data_trans_method: settings.data_trans_method,
            auto_run: settings.auto_run,
        };
        transport.set_scan_params(params)?;

        match transport.scan_params() {
            Ok(actual) if actual == params => debug!("[Device] scan parameters verified"),
            Ok(actual) => warn!(
                "[Device] scan parameter mismatch: set {:?}, device reports {:?}",
                params, actual
            ),
            Err(e) => warn!("[Device] could not verify scan parameters: {e}"),
        }

        info!(
            "[Device] session ready: ip={} port={} rate={}Hz channels={:?} (mask=0x{:x})",
            settings.device_ip,
            settings.device_port,
            settings.sample_rate,
            active_channels,
            settings.channel_mask()
        );

        Ok(Self {
            channel_count,
            active_channels,
            sample_rate: settings.sample_rate,
            target_count: settings.target_count,
            queue: Arc::new(ArrayQueue::new(INTERNAL_QUEUE_DEPTH)),
            reading: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(Some(transport)),
            read_handle: Mutex::new(None),
        })
    }

    /// Starts the scan and spawns the read loop. `collecting` is the
    /// run's shared flag; the loop clears it on a fatal device error
    /// so the rest of the pipeline drains and exits.
    pub fn start(&self, collecting: Arc<AtomicBool>) -> Result<(), DeviceError> {
        let mut slot = self.transport.lock();
        let mut transport = slot.take().ok_or(DeviceError::NotInitialized)?;

        if let Err(e) = transport.start_scan() {
            *slot = Some(transport);
            return Err(e);
        }
        drop(slot);

        self.reading.store(true, Ordering::Release);
        let ctx = ReadLoop {
            transport,
            queue: self.queue.clone(),
            reading: self.reading.clone(),
            fault: self.fault.clone(),
            collecting,
            channel_count: self.channel_count,
            target_count: self.target_count,
        };
        let handle = thread::Builder::new()
            .name("device-read".into())
            .spawn(move || ctx.run())
            .map_err(|_| DeviceError::ScanStart { code: 0 })?;
        *self.read_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops the read loop, joins it and clears the internal queue.
    /// Idempotent; also safe to call after the loop stopped itself.
    pub fn stop(&self) {
        self.reading.store(false, Ordering::Release);
        if let Some(handle) = self.read_handle.lock().take() {
            let _ = handle.join();
        }
        while self.queue.pop().is_some() {}
        debug!("[Device] stopped");
    }

    /// Next available block, or `None` if nothing is queued.
    pub fn get_block(&self) -> Option<Vec<f32>> {
        self.queue.pop()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.load(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn active_channels(&self) -> &[usize] {
        &self.active_channels
    }
}

struct ReadLoop {
    transport: Box<dyn ScanTransport>,
    queue: Arc<ArrayQueue<Vec<f32>>>,
    reading: Arc<AtomicBool>,
    fault: Arc<AtomicBool>,
    collecting: Arc<AtomicBool>,
    channel_count: usize,
    target_count: u32,
}

impl ReadLoop {
    fn run(mut self) {
        let mut consecutive_errors = 0u32;
        let mut total_read: u64 = 0;
        let mut last_decile: u32 = 0;
        let mut fatal = false;

        if self.target_count > 0 {
            debug!("[Device] N-sample mode: target={} samples", self.target_count);
        } else {
            debug!("[Device] continuous mode");
        }

        while self.reading.load(Ordering::Acquire) {
            let (status, count) = match self.transport.buffer_status() {
                Ok(v) => v,
                Err(e) => {
                    consecutive_errors += 1;
                    error!("[Device] {e} ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("[Device] {MAX_CONSECUTIVE_ERRORS} consecutive failures, giving up");
                        fatal = true;
                        break;
                    }
                    thread::sleep(RETRY_SLEEP);
                    continue;
                }
            };

            if status & STATUS_OVERFLOW != 0 {
                error!(
                    "[Device] AI buffer overflow (vendor code 0x{:x}), terminating run",
                    self.transport.last_error()
                );
                fatal = true;
                break;
            }
            if status & STATUS_STOPPED != 0 {
                error!("[Device] scan stopped on the device side");
                break;
            }
            if status & STATUS_ERROR != 0 {
                error!("[Device] device reported error status 0x{status:x}");
                break;
            }

            let should_read = if self.target_count > 0 {
                count >= self.target_count
            } else {
                count > 0
            };
            if !should_read {
                if self.target_count > 0 && count > 0 {
                    let decile = count * 10 / self.target_count;
                    if decile > last_decile {
                        last_decile = decile;
                        debug!(
                            "[Device] waiting for data: {count}/{} ({}%)",
                            self.target_count,
                            decile * 10
                        );
                    }
                }
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            let want = if self.target_count > 0 {
                count.min(self.target_count)
            } else {
                count
            };
            // Round down to a whole number of channel tuples so every
            // downstream row is well-formed.
            let want = want - want % self.channel_count as u32;
            if want == 0 {
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            match self.transport.read_buffer(want) {
                Ok(mut block) if !block.is_empty() => {
                    block.truncate(block.len() - block.len() % self.channel_count);
                    if block.is_empty() {
                        continue;
                    }
                    total_read += block.len() as u64;
                    consecutive_errors = 0;
                    if self.queue.force_push(block).is_some() {
                        warn!("[Device] internal queue full, dropped oldest block");
                    }
                    if self.target_count > 0 && total_read >= self.target_count as u64 {
                        debug!(
                            "[Device] read {total_read} samples, target {} reached",
                            self.target_count
                        );
                        self.reading.store(false, Ordering::Release);
                        break;
                    }
                }
                Ok(_) => warn!("[Device] buffer reported data but read returned none"),
                Err(e) => {
                    consecutive_errors += 1;
                    error!("[Device] {e} ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!("[Device] {MAX_CONSECUTIVE_ERRORS} consecutive failures, giving up");
                        fatal = true;
                        break;
                    }
                    thread::sleep(RETRY_SLEEP);
                }
            }
        }

        if let Err(e) = self.transport.stop_scan() {
            debug!("[Device] stop_scan during teardown: {e}");
        }
        if fatal {
            self.fault.store(true, Ordering::Release);
            self.collecting.store(false, Ordering::Release);
        }
        debug!("[Device] read loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::{ScriptedTransport, Step};
    use std::time::Instant;

    fn settings(channels: [bool; 4], target_count: u32) -> DeviceSettings {
        DeviceSettings {
            device_ip: "127.0.0.1".into(),
            device_port: 502,
            sample_rate: 1000,
            enable_ai: channels,
            gain: 0,
            trigger_mode: 0,
            target_count,
            data_trans_method: 0,
            auto_run: 0,
        }
    }

    fn factory_for(steps: Vec<Step>) -> (TransportFactory, Arc<AtomicBool>) {
        let (transport, stopped) = ScriptedTransport::new(steps);
        let slot = Mutex::new(Some(transport));
        let factory: TransportFactory = Arc::new(move |_| {
            Ok(Box::new(slot.lock().take().expect("transport consumed twice"))
                as Box<dyn ScanTransport>)
        });
        (factory, stopped)
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn reads_are_truncated_to_channel_multiple() {
        let (factory, _) = factory_for(vec![Step::Block(vec![0.1; 7])]);
        let adapter = DeviceAdapter::init(&settings([true, true, false, false], 0), &factory)
            .expect("init");
        let collecting = Arc::new(AtomicBool::new(true));
        adapter.start(collecting).expect("start");

        assert!(wait_for(|| adapter.queue.len() > 0, Duration::from_secs(1)));
        adapter.reading.store(false, Ordering::Release);
        let block = adapter.queue.pop().expect("block");
        // 7 available, K=2: only 6 are read.
        assert_eq!(block.len(), 6);
        adapter.stop();
    }

    #[test]
    fn overflow_is_fatal_and_clears_collecting() {
        let (factory, stopped) = factory_for(vec![
            Step::Block(vec![0.5; 4]),
            Step::Status(STATUS_OVERFLOW),
        ]);
        let adapter = DeviceAdapter::init(&settings([true, true, false, false], 0), &factory)
            .expect("init");
        let collecting = Arc::new(AtomicBool::new(true));
        adapter.start(collecting.clone()).expect("start");

        assert!(wait_for(
            || !collecting.load(Ordering::Acquire),
            Duration::from_secs(2)
        ));
        assert!(adapter.is_faulted());
        // The block read before the overflow is still delivered.
        assert!(wait_for(|| adapter.get_block().is_some(), Duration::from_millis(100)));
        assert!(stopped.load(Ordering::Acquire));
        adapter.stop();
    }

    #[test]
    fn five_consecutive_errors_terminate_the_loop() {
        let (factory, _) = factory_for(vec![
            Step::StatusErr,
            Step::StatusErr,
            Step::StatusErr,
            Step::StatusErr,
            Step::StatusErr,
        ]);
        let adapter =
            DeviceAdapter::init(&settings([true, false, false, false], 0), &factory).expect("init");
        let collecting = Arc::new(AtomicBool::new(true));
        adapter.start(collecting.clone()).expect("start");

        assert!(wait_for(
            || !collecting.load(Ordering::Acquire),
            Duration::from_secs(3)
        ));
        assert!(adapter.is_faulted());
        adapter.stop();
    }

    #[test]
    fn n_sample_mode_stops_after_target() {
        // Target 6: a 4-sample backlog is below threshold, an 8-sample
        // backlog satisfies it; only min(8, 6) = 6 samples are read.
        let (factory, _) = factory_for(vec![
            Step::Block(vec![1.0; 4]),
            Step::Block(vec![2.0; 8]),
        ]);
        let adapter = DeviceAdapter::init(&settings([true, true, false, false], 6), &factory)
            .expect("init");
        let collecting = Arc::new(AtomicBool::new(true));
        adapter.start(collecting.clone()).expect("start");

        assert!(wait_for(
            || !adapter.reading.load(Ordering::Acquire),
            Duration::from_secs(2)
        ));
        let block = adapter.get_block().expect("block");
        assert_eq!(block.len(), 6);
        assert!(adapter.get_block().is_none());
        // Reaching the target is not a fault and does not end the run.
        assert!(!adapter.is_faulted());
        assert!(collecting.load(Ordering::Acquire));
        adapter.stop();
    }
}
