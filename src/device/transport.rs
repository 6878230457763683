//! transport.rs
//! Abstract capability of the vendor HSDAQ transport: open a session
//! by IP, set/verify scan parameters, start/stop the scan, poll the
//! buffer status word and sample count, read the float buffer, and
//! expose the last vendor error code. The vendor library itself is an
//! external collaborator; everything in this crate talks to this
//! trait.

use std::sync::Arc;

use crate::config::DeviceSettings;
use crate::error::DeviceError;

/// Status word bit: AI buffer overflow. Fatal for the run.
pub const STATUS_OVERFLOW: u16 = 0x02;
/// Status word bit: scan stopped on the device side.
pub const STATUS_STOPPED: u16 = 0x04;
/// Status word bit: any other device-reported error.
pub const STATUS_ERROR: u16 = 0x08;

/// Scan parameter block, mirroring the vendor's set/get call layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub channel_count: i16,
    pub gain: i16,
    pub trigger_mode: i16,
    pub sample_rate: i32,
    pub target_count: u32,
    pub data_trans_method: i16,
    pub auto_run: i16,
}

pub trait ScanTransport: Send {
    fn set_scan_params(&mut self, params: ScanParams) -> Result<(), DeviceError>;

    /// Read the scan parameters back from the device, for verification
    /// after `set_scan_params`.
    fn scan_params(&mut self) -> Result<ScanParams, DeviceError>;

    fn start_scan(&mut self) -> Result<(), DeviceError>;

    fn stop_scan(&mut self) -> Result<(), DeviceError>;

    /// Returns `(status_word, available_sample_count)`.
    fn buffer_status(&mut self) -> Result<(u16, u32), DeviceError>;

    /// Read up to `count` interleaved float samples from the device
    /// buffer. May return fewer than requested.
    fn read_buffer(&mut self, count: u32) -> Result<Vec<f32>, DeviceError>;

    /// Last vendor error code, for log diagnostics.
    fn last_error(&self) -> u32;
}

/// Opens a transport session for the configured device. Injected into
/// the session controller so tests and the synthetic transport can
/// stand in for the vendor library.
pub type TransportFactory =
    Arc<dyn Fn(&DeviceSettings) -> Result<Box<dyn ScanTransport>, DeviceError> + Send + Sync>;
