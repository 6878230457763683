//! sql_uploader.rs
//! SQL sink: instead of streaming row-by-row inserts, samples are
//! appended to a staging CSV on disk; once the staging file holds
//! `target_size` samples the whole file is bulk-loaded into the
//! target table in one operation, deleted, and a fresh staging file
//! is started. Samples past the threshold carry over into the new
//! file and become its starting size.
//!
//! A failed upload is never fatal: the staging file is kept, the sink
//! keeps appending to it, and the upload is retried at the next
//! threshold event and again during the shutdown drain.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use csv::{Writer, WriterBuilder};
use log::{debug, error, info, warn};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};

use crate::config::SqlSettings;
use crate::error::{SinkError, UploadError};
use crate::pipeline::csv_writer::QUEUE_POLL_TIMEOUT;
use crate::pipeline::timebase;
use crate::pipeline::{SampleBlock, TableNameCell};

const WRITE_BUFFER_BYTES: usize = 128 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Rows per INSERT statement during a bulk load.
const INSERT_CHUNK_ROWS: usize = 5000;

pub const STAGING_DIR_NAME: &str = ".sql_temp";

/// The one capability the pipeline needs from the database layer:
/// bulk-load a staging CSV into a (created-if-missing) table.
pub trait BulkLoader: Send {
    /// Uploads all data rows of `staging` into `table`, creating the
    /// table if it does not exist. Returns the row count.
    fn upload(&mut self, staging: &Path, table: &str, channels: usize)
        -> Result<u64, UploadError>;
}

/// Builds a loader for the run's SQL settings.
pub type LoaderFactory = Arc<dyn Fn(&SqlSettings) -> Box<dyn BulkLoader> + Send + Sync>;

/// MySQL-backed loader: `CREATE TABLE IF NOT EXISTS` followed by
/// multi-row INSERT statements assembled from the staging file.
pub struct MysqlLoader {
    settings: SqlSettings,
}

impl MysqlLoader {
    pub fn new(settings: SqlSettings) -> Self {
        Self { settings }
    }

    pub fn factory() -> LoaderFactory {
        Arc::new(|settings| Box::new(MysqlLoader::new(settings.clone())) as Box<dyn BulkLoader>)
    }
}

impl BulkLoader for MysqlLoader {
    fn upload(
        &mut self,
        staging: &Path,
        table: &str,
        channels: usize,
    ) -> Result<u64, UploadError> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(UploadError::BadTableName(table.to_string()));
        }

        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(self.settings.host.clone()))
            .tcp_port(self.settings.port)
            .user(Some(self.settings.user.clone()))
            .pass(Some(self.settings.password.clone()))
            .db_name(Some(self.settings.database.clone()));
        let mut conn = Conn::new(opts)?;

        let mut columns = String::from("`Timestamp` VARCHAR(32) NOT NULL");
        for i in 1..=channels {
            columns.push_str(&format!(", `Channel_{i}` DOUBLE NOT NULL"));
        }
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS `{table}` ({columns})"
        ))?;

        let mut insert_cols = String::from("`Timestamp`");
        for i in 1..=channels {
            insert_cols.push_str(&format!(", `Channel_{i}`"));
        }

        let mut reader = csv::Reader::from_path(staging)?;
        let mut tuples = Vec::new();
        for record in reader.records() {
            let record = record?;
            let ts = record.get(0).unwrap_or("").replace('\'', "''");
            let mut row = format!("('{ts}'");
            for ch in 1..=channels {
                let value: f64 = record
                    .get(ch)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                row.push_str(&format!(",{value:?}"));
            }
            row.push(')');
            tuples.push(row);
        }

        for chunk in tuples.chunks(INSERT_CHUNK_ROWS) {
            conn.query_drop(format!(
                "INSERT INTO `{table}` ({insert_cols}) VALUES {}",
                chunk.join(",")
            ))?;
        }
        Ok(tuples.len() as u64)
    }
}

/// State of the staging side of the SQL sink.
pub struct SqlSink {
    channels: usize,
    sample_rate: u32,
    label: String,
    staging_dir: PathBuf,
    /// Samples per staging batch before an upload is triggered.
    target_size: u64,
    /// Samples written toward the current batch.
    current_size: u64,
    /// Rows written since subsystem init; drives staging timestamps.
    row_count: u64,
    start_time: NaiveDateTime,
    writer: Option<Writer<File>>,
    current_path: PathBuf,
    loader: Box<dyn BulkLoader>,
    table_names: TableNameCell,
    /// Completed uploads; also numbers synthesized table names.
    upload_seq: u32,
    last_flush: Instant,
}

impl SqlSink {
    pub fn new(
        channels: usize,
        sample_rate: u32,
        label: &str,
        run_dir: &Path,
        target_size: u64,
        table_names: TableNameCell,
        loader: Box<dyn BulkLoader>,
    ) -> Result<Self, SinkError> {
        let staging_dir = run_dir.join(STAGING_DIR_NAME);
        fs::create_dir_all(&staging_dir)?;
        let mut sink = Self {
            channels,
            sample_rate,
            label: label.to_string(),
            staging_dir,
            target_size,
            current_size: 0,
            row_count: 0,
            start_time: Local::now().naive_local(),
            writer: None,
            current_path: PathBuf::new(),
            loader,
            table_names,
            upload_seq: 0,
            last_flush: Instant::now(),
        };
        sink.create_staging_file()?;
        Ok(sink)
    }

    fn create_staging_file(&mut self) -> Result<(), SinkError> {
        self.current_path = self
            .staging_dir
            .join(format!("staging_{:03}.csv", self.upload_seq + 1));
        let file = File::create(&self.current_path)?;
        let mut writer = WriterBuilder::new()
            .buffer_capacity(WRITE_BUFFER_BYTES)
            .from_writer(file);

        let mut header = Vec::with_capacity(self.channels + 1);
        header.push("Timestamp".to_string());
        for i in 1..=self.channels {
            header.push(format!("Channel_{i}"));
        }
        writer.write_record(&header)?;
        writer.flush()?;
        self.writer = Some(writer);
        debug!("[SqlUploader] staging file {:?}", self.current_path);
        Ok(())
    }

    /// Appends a block; every time the batch reaches the threshold the
    /// staging file is uploaded and rotated, with excess samples
    /// carried into the new file.
    pub fn append(&mut self, block: &[f32]) -> Result<(), SinkError> {
        let mut rest = block;
        while !rest.is_empty() {
            let mut space = self.target_size.saturating_sub(self.current_size) as usize;
            space -= space % self.channels;
            let take = if space == 0 || space >= rest.len() {
                rest.len()
            } else {
                space
            };
            let (head, tail) = rest.split_at(take);
            self.write_samples(head)?;
            rest = tail;

            if self.current_size >= self.target_size {
                self.upload_and_rotate()?;
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
            record.push(timebase::staging_timestamp(
                self.start_time,
                self.row_count,
                self.sample_rate,
            ));
            for ch in 0..self.channels {
                record.push(format!("{:?}", tuple.get(ch).copied().unwrap_or(0.0)));
            }
            writer.write_record(&record)?;
            self.row_count += 1;
            self.current_size += self.channels as u64;
        }
        Ok(())
    }

    /// Threshold event: flush the staging file and bulk-load it. On
    /// success the file is deleted and a fresh one started; on failure
    /// the file is kept and the sink stays staged against it.
    fn upload_and_rotate(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.take() {
            writer
                .into_inner()
                .map_err(|e| SinkError::Io(e.into_error()))?;
        }

        let table = self.next_table_name();
        match self
            .loader
            .upload(&self.current_path, &table, self.channels)
        {
            Ok(rows) => {
                info!("[SqlUploader] uploaded {rows} rows to `{table}`");
                if let Err(e) = fs::remove_file(&self.current_path) {
                    warn!(
                        "[SqlUploader] could not delete {:?}: {e}",
                        self.current_path
                    );
                }
                self.upload_seq += 1;
                self.current_size = 0;
                self.create_staging_file()?;
            }
            Err(e) => {
                error!(
                    "[SqlUploader] upload to `{table}` failed, keeping {:?}: {e}",
                    self.current_path
                );
                let file = OpenOptions::new().append(true).open(&self.current_path)?;
                self.writer = Some(
                    WriterBuilder::new()
                        .buffer_capacity(WRITE_BUFFER_BYTES)
                        .from_writer(file),
                );
            }
        }
        Ok(())
    }

    /// Target table for the next upload: the latest CSV basename, or a
    /// synthesized `<ts>_<label>_<nnn>` when the CSV sink is disabled.
    fn next_table_name(&self) -> String {
        self.table_names.latest().unwrap_or_else(|| {
            let stamp = timebase::file_stamp(Local::now().naive_local());
            format!("{stamp}_{}_{:03}", self.label, self.upload_seq + 1)
        })
    }

    /// Shutdown drain: uploads whatever staging files remain (the
    /// current one plus any orphans from earlier runs), deletes them
    /// on success, and removes the staging directory once empty.
    pub fn drain(mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.into_inner() {
                error!("[SqlUploader] final flush failed: {}", e.into_error());
            }
        }

        let entries = match fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("[SqlUploader] cannot scan {:?}: {e}", self.staging_dir);
                return;
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        files.sort();

        for path in files {
            match staged_row_count(&path) {
                Ok(0) => {
                    let _ = fs::remove_file(&path);
                }
                Ok(_) => {
                    let table = self.next_table_name();
                    match self.loader.upload(&path, &table, self.channels) {
                        Ok(rows) => {
                            info!("[SqlUploader] final upload: {rows} rows to `{table}`");
                            let _ = fs::remove_file(&path);
                            self.upload_seq += 1;
                        }
                        Err(e) => error!("[SqlUploader] final upload of {path:?} failed: {e}"),
                    }
                }
                Err(e) => error!("[SqlUploader] cannot read {path:?}: {e}"),
            }
        }

        if fs::remove_dir(&self.staging_dir).is_ok() {
            debug!("[SqlUploader] staging dir removed");
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }
}

fn staged_row_count(path: &Path) -> Result<u64, UploadError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = 0;
    for record in reader.records() {
        record?;
        rows += 1;
    }
    Ok(rows)
}

/// SQL worker: consumes the sink queue until the run has stopped and
/// the queue is drained, then hands the sink back for finalize.
pub fn run_uploader(
    mut sink: SqlSink,
    rx: Receiver<SampleBlock>,
    collecting: Arc<AtomicBool>,
) -> SqlSink {
    debug!("[SqlUploader] worker started");
    loop {
        match rx.recv_timeout(QUEUE_POLL_TIMEOUT) {
            Ok(block) => {
                if let Err(e) = sink.append(&block) {
                    error!("[SqlUploader] staging write failed: {e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !collecting.load(Ordering::Acquire) && rx.is_empty() {
            break;
        }
    }
    debug!("[SqlUploader] worker drained");
    sink
}
