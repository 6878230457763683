//! csv_writer.rs
//! Rolling CSV archive. Rows carry exact per-sample timestamps derived
//! from one global row counter, so files stay timestamp-continuous
//! across rotations: the first row of file n+1 is exactly one sample
//! period after the last row of file n.
//!
//! Rotation happens on a data-size threshold (`target_size` samples),
//! with blocks split at K-aligned boundaries. Buffering: 128 KiB
//! userspace buffer, flush to the OS at most once per second, fsync
//! only on close and rotation.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use csv::{Writer, WriterBuilder};
use log::{debug, error, info};

use crate::error::SinkError;
use crate::pipeline::timebase;
use crate::pipeline::{SampleBlock, TableNameCell};

const WRITE_BUFFER_BYTES: usize = 128 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Sink workers wake at least this often to check the run flag.
pub const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CsvSink {
    channels: usize,
    sample_rate: u32,
    label: String,
    output_dir: PathBuf,
    /// Samples (interleaved floats) per file before rotation.
    target_size: u64,
    /// Samples written into the current file.
    current_size: u64,
    /// Rows written across all files of the run; drives timestamps.
    row_count: u64,
    start_time: NaiveDateTime,
    file_counter: u32,
    writer: Option<Writer<File>>,
    current_basename: String,
    table_names: TableNameCell,
    last_flush: Instant,
}

impl CsvSink {
    pub fn new(
        channels: usize,
        sample_rate: u32,
        label: &str,
        output_dir: PathBuf,
        target_size: u64,
        start_time: NaiveDateTime,
        table_names: TableNameCell,
    ) -> Result<Self, SinkError> {
        std::fs::create_dir_all(&output_dir)?;
        let mut sink = Self {
            channels,
            sample_rate,
            label: label.to_string(),
            output_dir,
            target_size,
            current_size: 0,
            row_count: 0,
            start_time,
            file_counter: 1,
            writer: None,
            current_basename: String::new(),
            table_names,
            last_flush: Instant::now(),
        };
        sink.create_file()?;
        Ok(sink)
    }

    fn create_file(&mut self) -> Result<(), SinkError> {
        let stamp = timebase::file_stamp(Local::now().naive_local());
        let basename = format!("{stamp}_{}_{:03}", self.label, self.file_counter);
        let path = self.output_dir.join(format!("{basename}.csv"));

        let file = File::create(&path)?;
        let mut writer = WriterBuilder::new()
            .buffer_capacity(WRITE_BUFFER_BYTES)
            .from_writer(file);

        let mut header = Vec::with_capacity(self.channels + 1);
        header.push("Timestamp".to_string());
        for i in 1..=self.channels {
            header.push(format!("Channel_{i}"));
        }
        writer.write_record(&header)?;
        // Flush so the file shows up on disk right away despite the
        // large write buffer.
        writer.flush()?;

        self.writer = Some(writer);
        self.current_basename = basename;
        self.table_names.publish(&self.current_basename);
        info!("[CsvWriter] new file {}.csv", self.current_basename);
        Ok(())
    }

    /// Appends a block, splitting it at K-aligned rotation boundaries.
    pub fn append(&mut self, block: &[f32]) -> Result<(), SinkError> {
        let mut rest = block;
        while !rest.is_empty() {
            let mut space = self.target_size.saturating_sub(self.current_size) as usize;
            space -= space % self.channels;
            if space == 0 {
                self.rotate()?;
                continue;
            }
            if rest.len() < space {
                self.write_samples(rest)?;
                rest = &[];
            } else {
                let (head, tail) = rest.split_at(space);
                self.write_samples(head)?;
                self.rotate()?;
                rest = tail;
            }
        }

        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            if let Some(writer) = self.writer.as_mut() {
                writer.flush()?;
            }
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn write_samples(&mut self, samples: &[f32]) -> Result<(), SinkError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let mut record = Vec::with_capacity(self.channels + 1);
        for tuple in samples.chunks(self.channels) {
            record.clear();
            record.push(timebase::csv_timestamp(
                self.start_time,
                self.row_count,
                self.sample_rate,
            ));
            for ch in 0..self.channels {
                // A trailing short tuple is padded with zeros.
                record.push(format!("{:?}", tuple.get(ch).copied().unwrap_or(0.0)));
            }
            writer.write_record(&record)?;
            self.row_count += 1;
            self.current_size += self.channels as u64;
        }
        Ok(())
    }

    /// Close + fsync the current file, open the next one.
    fn rotate(&mut self) -> Result<(), SinkError> {
        self.close_current()?;
        self.file_counter += 1;
        self.current_size = 0;
        self.create_file()
    }

    fn close_current(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| SinkError::Io(e.into_error()))?;
            file.sync_all()?;
            debug!(
                "[CsvWriter] closed {}.csv ({} samples)",
                self.current_basename, self.current_size
            );
        }
        Ok(())
    }

    /// Final flush + fsync + close.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.close_current()?;
        info!(
            "[CsvWriter] done: {} rows across {} file(s)",
            self.row_count, self.file_counter
        );
        Ok(())
    }

    pub fn current_basename(&self) -> &str {
        &self.current_basename
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn file_counter(&self) -> u32 {
        self.file_counter
    }
}

/// CSV worker: consumes the sink queue until the run has stopped and
/// the queue is drained, then hands the sink back for finalize.
pub fn run_writer(
    mut sink: CsvSink,
    rx: Receiver<SampleBlock>,
    collecting: Arc<AtomicBool>,
) -> CsvSink {
    debug!("[CsvWriter] worker started");
    loop {
        match rx.recv_timeout(QUEUE_POLL_TIMEOUT) {
            Ok(block) => {
                // File-level failures are logged and the run goes on.
                if let Err(e) = sink.append(&block) {
                    error!("[CsvWriter] write failed: {e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !collecting.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }
    }
    debug!("[CsvWriter] worker drained");
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use std::path::Path;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn sink(dir: &Path, channels: usize, rate: u32, target: u64) -> CsvSink {
        CsvSink::new(
            channels,
            rate,
            "test",
            dir.to_path_buf(),
            target,
            start(),
            TableNameCell::new(),
        )
        .expect("sink")
    }

    fn sorted_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    fn rows_of(path: &Path) -> Vec<Vec<String>> {
        let mut rdr = csv::Reader::from_path(path).unwrap();
        rdr.records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn steady_run_rotates_with_continuous_timestamps() {
        // K=2, R=1000, T_csv=2 s: 4000 samples (2000 rows) per file.
        let dir = tempfile::tempdir().unwrap();
        let mut s = sink(dir.path(), 2, 1000, 4000);

        let block: Vec<f32> = (0..9000).map(|i| i as f32).collect();
        s.append(&block).unwrap();

        assert_eq!(s.row_count(), 4500);
        assert_eq!(s.current_size(), 1000);
        assert_eq!(s.file_counter(), 3);
        s.close().unwrap();

        let files = sorted_files(dir.path());
        assert_eq!(files.len(), 3);

        let first = rows_of(&files[0]);
        let second = rows_of(&files[1]);
        let third = rows_of(&files[2]);
        assert_eq!(first.len(), 2000);
        assert_eq!(second.len(), 2000);
        assert_eq!(third.len(), 500);

        // Row 0 is the run start; the first row of file 2 is exactly
        // +2 s; the last row of file 3 is +4.499 s.
        assert_eq!(first[0][0], "2024-03-01 10:00:00.000000");
        assert_eq!(second[0][0], "2024-03-01 10:00:02.000000");
        assert_eq!(third[499][0], "2024-03-01 10:00:04.499000");

        // Rotation continuity: consecutive files differ by exactly
        // one sample period at the boundary.
        assert_eq!(first[1999][0], "2024-03-01 10:00:01.999000");
        assert_eq!(second[1999][0], "2024-03-01 10:00:03.999000");
        assert_eq!(third[0][0], "2024-03-01 10:00:04.000000");
    }

    #[test]
    fn rows_have_header_and_k_plus_one_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = sink(dir.path(), 3, 100, 300);
        s.append(&[1.5, 2.5, 3.5, 4.5, 5.5, 6.5]).unwrap();
        s.close().unwrap();

        let files = sorted_files(dir.path());
        let mut rdr = csv::Reader::from_path(&files[0]).unwrap();
        assert_eq!(
            rdr.headers().unwrap().iter().collect::<Vec<_>>(),
            vec!["Timestamp", "Channel_1", "Channel_2", "Channel_3"]
        );
        let rows = rows_of(&files[0]);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.len() == 4));
        assert_eq!(rows[0][1], "1.5");
        assert_eq!(rows[1][3], "6.5");
    }

    #[test]
    fn short_tuple_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = sink(dir.path(), 2, 100, 1000);
        s.append(&[7.0, 8.0, 9.0]).unwrap();
        s.close().unwrap();

        let files = sorted_files(dir.path());
        let rows = rows_of(&files[0]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], "9.0");
        assert_eq!(rows[1][2], "0.0");
    }

    #[test]
    fn exact_fit_rotates_into_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = sink(dir.path(), 2, 100, 200);
        s.append(&vec![0.25; 200]).unwrap();

        assert_eq!(s.current_size(), 0);
        assert_eq!(s.file_counter(), 2);
        s.close().unwrap();

        let files = sorted_files(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(rows_of(&files[0]).len(), 100);
        assert_eq!(rows_of(&files[1]).len(), 0);
    }

    #[test]
    fn file_names_follow_stamp_label_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = sink(dir.path(), 1, 100, 50);
        s.append(&vec![1.0; 120]).unwrap();
        s.close().unwrap();

        for (i, path) in sorted_files(dir.path()).iter().enumerate() {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            // YYYYMMDDhhmmss_test_nnn.csv
            assert_eq!(name.len(), "00000000000000_test_000.csv".len());
            assert!(name.ends_with(&format!("_test_{:03}.csv", i + 1)), "{name}");
        }
    }

    #[test]
    fn rotation_publishes_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let names = TableNameCell::new();
        let mut s = CsvSink::new(
            2,
            100,
            "probe",
            dir.path().to_path_buf(),
            100,
            start(),
            names.clone(),
        )
        .unwrap();
        let first = names.latest().expect("first file published");
        assert!(first.ends_with("_probe_001"));

        s.append(&vec![0.0; 150]).unwrap();
        let second = names.latest().expect("rotated file published");
        assert!(second.ends_with("_probe_002"));
        s.close().unwrap();
    }

    #[test]
    fn worker_drains_queue_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(dir.path(), 2, 1000, 100_000);

        let (tx, rx) = crossbeam::channel::bounded::<SampleBlock>(64);
        let collecting = Arc::new(AtomicBool::new(true));
        let handle = {
            let collecting = collecting.clone();
            std::thread::spawn(move || run_writer(s, rx, collecting))
        };

        for _ in 0..10 {
            tx.send(vec![1.0; 500]).unwrap();
        }
        collecting.store(false, Ordering::Release);

        let s = handle.join().expect("worker");
        assert_eq!(s.row_count(), 10 * 250);
        s.close().unwrap();
    }
}
