//! Scripted transport for unit tests: plays back a fixed sequence of
//! buffer polls so adapter and pipeline behavior can be exercised
//! without a device or wall-clock pacing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::transport::{ScanParams, ScanTransport};
use crate::error::DeviceError;

/// One `buffer_status` poll outcome.
pub enum Step {
    /// Report the block's length as available; the following
    /// `read_buffer` serves (a prefix of) the block.
    Block(Vec<f32>),
    /// Report a raw status word with zero available samples.
    Status(u16),
    /// Nothing available.
    Empty,
    /// The status query itself fails.
    StatusErr,
}

pub struct ScriptedTransport {
    script: VecDeque<Step>,
    pending: Option<Vec<f32>>,
    params: Option<ScanParams>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> (Self, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Self {
                script: steps.into(),
                pending: None,
                params: None,
                stopped: stopped.clone(),
            },
            stopped,
        )
    }
}

impl ScanTransport for ScriptedTransport {
    fn set_scan_params(&mut self, params: ScanParams) -> Result<(), DeviceError> {
        self.params = Some(params);
        Ok(())
    }

    fn scan_params(&mut self) -> Result<ScanParams, DeviceError> {
        self.params.ok_or(DeviceError::NotInitialized)
    }

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn buffer_status(&mut self) -> Result<(u16, u32), DeviceError> {
        match self.script.pop_front() {
            Some(Step::Block(block)) => {
                let count = block.len() as u32;
                self.pending = Some(block);
                Ok((0, count))
            }
            Some(Step::Status(word)) => Ok((word, 0)),
            Some(Step::Empty) | None => Ok((0, 0)),
            Some(Step::StatusErr) => Err(DeviceError::BufferStatus { code: 0xdead }),
        }
    }

    fn read_buffer(&mut self, count: u32) -> Result<Vec<f32>, DeviceError> {
        let mut block = self.pending.take().unwrap_or_default();
        block.truncate(count as usize);
        Ok(block)
    }

    fn last_error(&self) -> u32 {
        0
    }
}
