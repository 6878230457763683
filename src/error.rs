//! error.rs
//! Error taxonomy for the acquisition pipeline, one enum per component
//! boundary. Workers never panic the process: everything a worker can
//! hit is converted into one of these and logged or surfaced as JSON.

use thiserror::Error;

/// Start-time configuration problems. The run is never entered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("at least one analog input channel must be enabled")]
    NoActiveChannels,

    #[error("record label must not be empty")]
    EmptyLabel,

    #[error("at least one of the csv/sql sinks must be enabled")]
    NoSinkEnabled,

    #[error("invalid sample rate {0}")]
    BadSampleRate(i64),
}

/// Failures talking to the device over the vendor transport. Raw
/// vendor error codes are carried verbatim for diagnostics.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open device session to {ip}: vendor code 0x{code:x}")]
    SessionOpen { ip: String, code: u32 },

    #[error("failed to set scan parameters: vendor code 0x{code:x}")]
    ScanParam { code: u32 },

    #[error("failed to start scan: vendor code 0x{code:x}")]
    ScanStart { code: u32 },

    #[error("failed to stop scan: vendor code 0x{code:x}")]
    ScanStop { code: u32 },

    #[error("buffer status query failed: vendor code 0x{code:x}")]
    BufferStatus { code: u32 },

    #[error("buffer read failed: vendor code 0x{code:x}")]
    BufferRead { code: u32 },

    #[error("device buffer overflow: vendor code 0x{code:x}")]
    Overflow { code: u32 },

    #[error("device session not initialized")]
    NotInitialized,
}

/// File-level failures inside the CSV and SQL staging writers.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Failures of a bulk upload from a staging file to the database.
/// Never fatal: the staging file is kept and retried later.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("database error: {0}")]
    Sql(#[from] mysql::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("refusing to use table name {0:?}")]
    BadTableName(String),
}

/// Everything `start()` can reject with.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a recording session is already active")]
    Busy,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device init failed: {0}")]
    Device(#[from] DeviceError),

    #[error("sink init failed: {0}")]
    Sink(#[from] SinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("no recording session is active")]
    NotRunning,
}
