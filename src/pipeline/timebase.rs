//! timebase.rs
//! Row timestamps are derived from the global row counter and the
//! sample rate, never from the wall clock: row i of a run is stamped
//! `start + i/R`, exact to the microsecond, which keeps rotated files
//! timestamp-continuous and drift-free.

use chrono::{Duration, NaiveDateTime};

/// Timestamp of the `row_index`-th row (0-based across all rotated
/// files) for a run started at `start` sampling at `sample_rate` Hz.
pub fn row_timestamp(start: NaiveDateTime, row_index: u64, sample_rate: u32) -> NaiveDateTime {
    let nanos = row_index as i128 * 1_000_000_000 / sample_rate as i128;
    start + Duration::nanoseconds(nanos as i64)
}

/// CSV archive format: `YYYY-MM-DD HH:MM:SS.ffffff`.
pub fn csv_timestamp(start: NaiveDateTime, row_index: u64, sample_rate: u32) -> String {
    row_timestamp(start, row_index, sample_rate)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

/// Staging file format: ISO-8601 with microseconds.
pub fn staging_timestamp(start: NaiveDateTime, row_index: u64, sample_rate: u32) -> String {
    row_timestamp(start, row_index, sample_rate)
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Compact stamp used in file and directory names.
pub fn file_stamp(t: NaiveDateTime) -> String {
    t.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn row_zero_is_the_start_time() {
        assert_eq!(row_timestamp(start(), 0, 1000), start());
    }

    #[test]
    fn timestamp_law_is_exact() {
        // Row 2000 at 1 kHz is exactly +2 s; consecutive rows differ
        // by exactly one sample period.
        assert_eq!(
            csv_timestamp(start(), 2000, 1000),
            "2024-03-01 10:30:02.000000"
        );
        assert_eq!(
            csv_timestamp(start(), 2001, 1000),
            "2024-03-01 10:30:02.001000"
        );
        assert_eq!(
            csv_timestamp(start(), 4500, 1000),
            "2024-03-01 10:30:04.500000"
        );
    }

    #[test]
    fn sub_microsecond_rates_truncate() {
        // 12.8 kHz: one period is 78.125 µs.
        assert_eq!(
            csv_timestamp(start(), 1, 12_800),
            "2024-03-01 10:30:00.000078"
        );
        assert_eq!(
            csv_timestamp(start(), 128, 12_800),
            "2024-03-01 10:30:00.010000"
        );
    }

    #[test]
    fn staging_format_is_iso8601() {
        assert_eq!(
            staging_timestamp(start(), 500, 1000),
            "2024-03-01T10:30:00.500000"
        );
    }

    #[test]
    fn no_drift_over_long_runs() {
        // One hour at 20 kHz lands exactly on the hour boundary.
        let one_hour = 3_600u64 * 20_000;
        assert_eq!(
            csv_timestamp(start(), one_hour, 20_000),
            "2024-03-01 11:30:00.000000"
        );
    }
}
