//! sim.rs
//! Synthetic waveform transport: stands in for the vendor HSDAQ
//! library when no physical PET-7H24M is attached. Produces per-channel
//! sine waves with additive noise, paced by the wall clock at the
//! configured sample rate, through the same `ScanTransport` seam the
//! real device would use.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Instant;

use rand::random_range;

use crate::device::transport::{ScanParams, ScanTransport, TransportFactory, STATUS_OVERFLOW};
use crate::error::DeviceError;

/// Simulated on-device buffer depth in samples; backing up further
/// than this reports the overflow status bit, like the hardware.
const SIM_BUFFER_DEPTH: u64 = 4_000_000;

pub struct SimTransport {
    params: Option<ScanParams>,
    started: Option<Instant>,
    /// Samples handed out since the scan started.
    consumed: u64,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            params: None,
            started: None,
            consumed: 0,
        }
    }

    /// Transport factory for the session controller.
    pub fn factory() -> TransportFactory {
        Arc::new(|_settings| Ok(Box::new(SimTransport::new()) as Box<dyn ScanTransport>))
    }

    fn produced(&self) -> u64 {
        match (&self.started, &self.params) {
            (Some(t0), Some(p)) => {
                let per_sec = p.sample_rate as f64 * p.channel_count as f64;
                (t0.elapsed().as_secs_f64() * per_sec) as u64
            }
            _ => 0,
        }
    }

    fn sample_at(&self, index: u64, params: &ScanParams) -> f32 {
        let k = params.channel_count as u64;
        let tuple = index / k;
        let channel = (index % k) as u32;
        let t = tuple as f64 / params.sample_rate as f64;
        // One tone per channel, amplitudes staggered so the UI traces
        // are distinguishable.
        let freq = 50.0 * (channel + 1) as f64;
        let amp = 1.0 + channel as f64 * 0.5;
        (amp * (TAU * freq * t).sin() + random_range(-0.05..0.05)) as f32
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanTransport for SimTransport {
    fn set_scan_params(&mut self, params: ScanParams) -> Result<(), DeviceError> {
        self.params = Some(params);
        Ok(())
    }

    fn scan_params(&mut self) -> Result<ScanParams, DeviceError> {
        self.params.ok_or(DeviceError::NotInitialized)
    }

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        if self.params.is_none() {
            return Err(DeviceError::ScanStart { code: 0 });
        }
        self.started = Some(Instant::now());
        self.consumed = 0;
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.started = None;
        Ok(())
    }

    fn buffer_status(&mut self) -> Result<(u16, u32), DeviceError> {
        if self.started.is_none() {
            return Ok((0, 0));
        }
        let backlog = self.produced().saturating_sub(self.consumed);
        if backlog > SIM_BUFFER_DEPTH {
            return Ok((STATUS_OVERFLOW, backlog.min(u32::MAX as u64) as u32));
        }
        Ok((0, backlog.min(u32::MAX as u64) as u32))
    }

    fn read_buffer(&mut self, count: u32) -> Result<Vec<f32>, DeviceError> {
        let params = self.params.ok_or(DeviceError::NotInitialized)?;
        let available = self.produced().saturating_sub(self.consumed);
        let take = (count as u64).min(available);
        let mut out = Vec::with_capacity(take as usize);
        for i in 0..take {
            out.push(self.sample_at(self.consumed + i, &params));
        }
        self.consumed += take;
        Ok(out)
    }

    fn last_error(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: i16, rate: i32) -> ScanParams {
        ScanParams {
            channel_count: k,
            gain: 0,
            trigger_mode: 0,
            sample_rate: rate,
            target_count: 0,
            data_trans_method: 0,
            auto_run: 0,
        }
    }

    #[test]
    fn produces_data_after_start() {
        let mut sim = SimTransport::new();
        sim.set_scan_params(params(2, 100_000)).unwrap();
        sim.start_scan().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let (status, count) = sim.buffer_status().unwrap();
        assert_eq!(status, 0);
        assert!(count > 0);

        let block = sim.read_buffer(count).unwrap();
        assert_eq!(block.len(), count as usize);

        // Consuming everything leaves a near-empty buffer.
        let (_, rest) = sim.buffer_status().unwrap();
        assert!(rest < count);
    }

    #[test]
    fn idle_before_start() {
        let mut sim = SimTransport::new();
        sim.set_scan_params(params(1, 1000)).unwrap();
        assert_eq!(sim.buffer_status().unwrap(), (0, 0));
    }
}
