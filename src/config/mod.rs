//! Run configuration: three INI files under `API/` plus the per-run
//! start request, assembled into one immutable `RunConfig`.
//!
//! Every key has a fallback so a missing file or key never aborts a
//! start; only semantic validation does (no channels, no sinks, empty
//! label). Derived values (channel mask, K, rotation targets) are
//! computed once here and treated as constants for the whole run.

use std::path::Path;

use config::{Config, File, FileFormat};

use crate::error::ConfigError;

/// Device connection and scan parameters, `[PET7H24M]` section of
/// `PET-7H24M.ini`. Defaults mirror the factory settings of the
/// device.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub device_ip: String,
    pub device_port: u16,
    pub sample_rate: u32,
    /// Per-channel enable bits for AI0..AI3.
    pub enable_ai: [bool; 4],
    pub gain: i16,
    pub trigger_mode: i16,
    /// 0 = continuous scan; >0 = stop after this many samples.
    pub target_count: u32,
    pub data_trans_method: i16,
    pub auto_run: i16,
}

impl DeviceSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()?;

        let int = |key: &str, fallback: i64| cfg.get_int(key).unwrap_or(fallback);

        let sample_rate = int("pet7h24m.sample_rate", 20_000);
        if sample_rate <= 0 {
            return Err(ConfigError::BadSampleRate(sample_rate));
        }

        Ok(Self {
            device_ip: cfg
                .get_string("pet7h24m.device_ip")
                .unwrap_or_else(|_| "192.168.255.1".to_string()),
            device_port: int("pet7h24m.device_port", 502) as u16,
            sample_rate: sample_rate as u32,
            enable_ai: [
                int("pet7h24m.enable_ai0", 1) != 0,
                int("pet7h24m.enable_ai1", 1) != 0,
                int("pet7h24m.enable_ai2", 1) != 0,
                int("pet7h24m.enable_ai3", 1) != 0,
            ],
            gain: int("pet7h24m.gain", 0) as i16,
            trigger_mode: int("pet7h24m.trigger_mode", 0) as i16,
            target_count: int("pet7h24m.target_count", 0) as u32,
            data_trans_method: int("pet7h24m.data_trans_method", 0) as i16,
            auto_run: int("pet7h24m.auto_run", 0) as i16,
        })
    }

    /// Bitmask of enabled channels: AI0=1, AI1=2, AI2=4, AI3=8.
    pub fn channel_mask(&self) -> u8 {
        self.enable_ai
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    /// Indices of enabled channels in ascending order.
    pub fn active_channels(&self) -> Vec<usize> {
        self.enable_ai
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.enable_ai.iter().filter(|on| **on).count()
    }
}

/// CSV rotation period, `[DumpUnit]` section of `csv.ini`.
#[derive(Debug, Clone)]
pub struct CsvSettings {
    pub rotate_secs: u64,
}

impl CsvSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()?;
        Ok(Self {
            rotate_secs: cfg.get_int("dumpunit.second").unwrap_or(60).max(1) as u64,
        })
    }
}

/// SQL endpoint and upload period, `sql.ini` (`[SQLServer]` plus its
/// own `[DumpUnit]` section).
#[derive(Debug, Clone)]
pub struct SqlSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub upload_secs: u64,
}

impl SqlSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()?;

        let string = |key: &str, fallback: &str| {
            cfg.get_string(key).unwrap_or_else(|_| fallback.to_string())
        };

        Ok(Self {
            enabled: cfg.get_int("sqlserver.enabled").unwrap_or(0) != 0,
            host: string("sqlserver.host", "127.0.0.1"),
            port: cfg.get_int("sqlserver.port").unwrap_or(3306) as u16,
            user: string("sqlserver.user", "root"),
            password: string("sqlserver.password", ""),
            database: string("sqlserver.database", "vibration"),
            upload_secs: cfg.get_int("dumpunit.second").unwrap_or(60).max(1) as u64,
        })
    }
}

/// Immutable configuration of one run, assembled at `start()` from the
/// three INI files and the start request.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub device: DeviceSettings,
    pub label: String,
    pub csv_enabled: bool,
    pub sql_enabled: bool,
    pub sql: SqlSettings,
    pub rotate_secs: u64,
    pub upload_secs: u64,
}

impl RunConfig {
    pub fn assemble(
        device: DeviceSettings,
        csv: CsvSettings,
        sql: SqlSettings,
        label: &str,
        csv_enabled: bool,
        sql_enabled: bool,
    ) -> Result<Self, ConfigError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ConfigError::EmptyLabel);
        }
        if !csv_enabled && !sql_enabled {
            return Err(ConfigError::NoSinkEnabled);
        }
        if device.channel_count() == 0 {
            return Err(ConfigError::NoActiveChannels);
        }

        Ok(Self {
            rotate_secs: csv.rotate_secs,
            upload_secs: sql.upload_secs,
            device,
            label: label.to_string(),
            csv_enabled,
            sql_enabled,
            sql,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.device.channel_count()
    }

    /// Samples (interleaved floats) per CSV file: T_csv · R · K.
    pub fn target_size_csv(&self) -> u64 {
        self.rotate_secs * self.device.sample_rate as u64 * self.channel_count() as u64
    }

    /// Samples per SQL staging batch: T_sql · R · K.
    pub fn target_size_sql(&self) -> u64 {
        self.upload_secs * self.device.sample_rate as u64 * self.channel_count() as u64
    }
}
