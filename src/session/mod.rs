//! Session controller: owns the run lifecycle and the worker threads.
//!
//! One `RunContext` value holds everything alive for the active run
//! (device adapter, worker handles, sink queues); `start()` builds it,
//! `stop()` takes it out and hands it to a background finalize thread,
//! so the HTTP layer gets an immediate answer while the drain protocol
//! runs off-thread. Workers receive the shared `is_collecting` flag
//! and counters at start; nothing global survives the run.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam::channel::{bounded, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{CsvSettings, DeviceSettings, RunConfig, SqlSettings};
use crate::device::{DeviceAdapter, TransportFactory};
use crate::error::{StartError, StopError};
use crate::pipeline::csv_writer::{self, CsvSink};
use crate::pipeline::dispatcher::IngestDispatcher;
use crate::pipeline::sql_uploader::{self, LoaderFactory, SqlSink};
use crate::pipeline::viz::VizBuffer;
use crate::pipeline::{SampleBlock, TableNameCell, SINK_QUEUE_CAPACITY};

/// Bound on joining the ingest dispatcher during finalize.
const DISPATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on waiting for each sink queue to drain.
const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(50);
const DRAIN_POLL: Duration = Duration::from_millis(100);
/// Lets in-flight writes settle before the sinks are closed.
const SETTLE_SLEEP: Duration = Duration::from_millis(500);

/// The three editable configuration files under `API/`.
pub const CONFIG_FILES: [&str; 3] = ["PET-7H24M.ini", "csv.ini", "sql.ini"];

/// Shared run state the HTTP layer may read at any time. Readers
/// tolerate stale values; writers are the workers and the controller.
pub struct RunStatus {
    pub collecting: Arc<AtomicBool>,
    pub total_samples: Arc<AtomicU64>,
    pub sample_rate: AtomicU32,
    pub started_at: Mutex<Option<String>>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            collecting: Arc::new(AtomicBool::new(false)),
            total_samples: Arc::new(AtomicU64::new(0)),
            sample_rate: AtomicU32::new(0),
            started_at: Mutex::new(None),
        }
    }
}

/// `POST /start` body. Sink flags default to the INI configuration;
/// the `sql_*` fields override `sql.ini` for this run only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub csv_enabled: Option<bool>,
    #[serde(default)]
    pub sql_enabled: Option<bool>,
    #[serde(default)]
    pub sql_host: Option<String>,
    #[serde(default)]
    pub sql_port: Option<u16>,
    #[serde(default)]
    pub sql_user: Option<String>,
    #[serde(default)]
    pub sql_password: Option<String>,
    #[serde(default)]
    pub sql_database: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DataPayload {
    pub success: bool,
    pub data: Vec<f32>,
    pub counter: u64,
    pub sample_rate: u32,
    pub is_collecting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub is_collecting: bool,
    pub counter: u64,
}

/// Everything owned by one active run.
struct RunContext {
    device: Arc<DeviceAdapter>,
    dispatcher: JoinHandle<()>,
    csv_worker: Option<JoinHandle<CsvSink>>,
    sql_worker: Option<JoinHandle<SqlSink>>,
    csv_tx: Option<Sender<SampleBlock>>,
    sql_tx: Option<Sender<SampleBlock>>,
}

pub struct SessionController {
    root: PathBuf,
    transports: TransportFactory,
    loaders: LoaderFactory,
    status: Arc<RunStatus>,
    viz: Mutex<Option<Arc<VizBuffer>>>,
    active: Mutex<Option<RunContext>>,
    finalizer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(root: PathBuf, transports: TransportFactory, loaders: LoaderFactory) -> Self {
        Self {
            root,
            transports,
            loaders,
            status: Arc::new(RunStatus::default()),
            viz: Mutex::new(None),
            active: Mutex::new(None),
            finalizer: Mutex::new(None),
        }
    }

    /// Download/browse sandbox base for the HTTP layer.
    pub fn output_root(&self) -> PathBuf {
        self.root.join("output").join("PET-7H24M")
    }

    /// Starts a run: validates the request, loads the three config
    /// files, initializes the device and the enabled sinks, spawns the
    /// workers (dispatcher, CSV, SQL) and finally starts the scan.
    pub fn start(&self, req: &StartRequest) -> Result<(), StartError> {
        let mut active = self.active.lock();
        if active.is_some() || self.status.collecting.load(Ordering::Acquire) {
            return Err(StartError::Busy);
        }
        // A previous run may still be finalizing; its workers watch the
        // same collecting flag, so let the drain finish first.
        self.wait_finalize();

        let api_dir = self.root.join("API");
        let device_settings = DeviceSettings::load(&api_dir.join("PET-7H24M.ini"))?;
        let csv_settings = CsvSettings::load(&api_dir.join("csv.ini"))?;
        let mut sql_settings = SqlSettings::load(&api_dir.join("sql.ini"))?;

        if let Some(host) = &req.sql_host {
            sql_settings.host = host.clone();
        }
        if let Some(port) = req.sql_port {
            sql_settings.port = port;
        }
        if let Some(user) = &req.sql_user {
            sql_settings.user = user.clone();
        }
        if let Some(password) = &req.sql_password {
            sql_settings.password = password.clone();
        }
        if let Some(database) = &req.sql_database {
            sql_settings.database = database.clone();
        }

        let csv_enabled = req.csv_enabled.unwrap_or(true);
        let sql_enabled = req.sql_enabled.unwrap_or(sql_settings.enabled);
        let cfg = RunConfig::assemble(
            device_settings,
            csv_settings,
            sql_settings,
            &req.label,
            csv_enabled,
            sql_enabled,
        )?;

        let k = cfg.channel_count();
        let rate = cfg.device.sample_rate;
        let run_start = Local::now().naive_local();
        let run_dir = self.output_root().join(format!(
            "{}_{}",
            crate::pipeline::timebase::file_stamp(run_start),
            cfg.label
        ));
        fs::create_dir_all(&run_dir)?;

        let device = Arc::new(DeviceAdapter::init(&cfg.device, &self.transports)?);

        self.status.total_samples.store(0, Ordering::Relaxed);
        self.status.sample_rate.store(rate, Ordering::Relaxed);
        *self.status.started_at.lock() =
            Some(run_start.format("%Y-%m-%d %H:%M:%S").to_string());
        let viz = Arc::new(VizBuffer::new(k));
        *self.viz.lock() = Some(viz.clone());

        let table_names = TableNameCell::new();
        let csv_sink = if cfg.csv_enabled {
            Some(CsvSink::new(
                k,
                rate,
                &cfg.label,
                run_dir.clone(),
                cfg.target_size_csv(),
                run_start,
                table_names.clone(),
            )?)
        } else {
            None
        };
        let sql_sink = if cfg.sql_enabled {
            Some(SqlSink::new(
                k,
                rate,
                &cfg.label,
                &run_dir,
                cfg.target_size_sql(),
                table_names.clone(),
                (self.loaders)(&cfg.sql),
            )?)
        } else {
            None
        };

        let collecting = self.status.collecting.clone();
        collecting.store(true, Ordering::Release);

        let (csv_tx, csv_rx) = match &csv_sink {
            Some(_) => {
                let (tx, rx) = bounded(SINK_QUEUE_CAPACITY);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let (sql_tx, sql_rx) = match &sql_sink {
            Some(_) => {
                let (tx, rx) = bounded(SINK_QUEUE_CAPACITY);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let dispatcher = IngestDispatcher {
            device: device.clone(),
            viz,
            csv_tx: csv_tx.clone(),
            sql_tx: sql_tx.clone(),
            collecting: collecting.clone(),
            total_samples: self.status.total_samples.clone(),
        };
        let dispatcher_handle = thread::Builder::new()
            .name("ingest-dispatcher".into())
            .spawn(move || dispatcher.run())?;

        let csv_worker = match (csv_sink, csv_rx) {
            (Some(sink), Some(rx)) => {
                let flag = collecting.clone();
                Some(
                    thread::Builder::new()
                        .name("csv-writer".into())
                        .spawn(move || csv_writer::run_writer(sink, rx, flag))?,
                )
            }
            _ => None,
        };
        let sql_worker = match (sql_sink, sql_rx) {
            (Some(sink), Some(rx)) => {
                let flag = collecting.clone();
                Some(
                    thread::Builder::new()
                        .name("sql-writer".into())
                        .spawn(move || sql_uploader::run_uploader(sink, rx, flag))?,
                )
            }
            _ => None,
        };

        if let Err(e) = device.start(collecting.clone()) {
            collecting.store(false, Ordering::Release);
            let _ = dispatcher_handle.join();
            if let Some(handle) = csv_worker {
                if let Ok(sink) = handle.join() {
                    let _ = sink.close();
                }
            }
            if let Some(handle) = sql_worker {
                if let Ok(sink) = handle.join() {
                    sink.drain();
                }
            }
            *self.viz.lock() = None;
            return Err(e.into());
        }

        info!(
            "[Session] run '{}' started: K={k} rate={rate}Hz csv={} sql={}",
            cfg.label, cfg.csv_enabled, cfg.sql_enabled
        );
        *active = Some(RunContext {
            device,
            dispatcher: dispatcher_handle,
            csv_worker,
            sql_worker,
            csv_tx,
            sql_tx,
        });
        Ok(())
    }

    /// Stops the run and returns immediately; the drain protocol runs
    /// on a background finalize thread.
    pub fn stop(&self) -> Result<(), StopError> {
        let ctx = self.active.lock().take().ok_or(StopError::NotRunning)?;
        self.status.collecting.store(false, Ordering::Release);
        info!("[Session] stop requested, finalizing in background");

        match thread::Builder::new()
            .name("finalize".into())
            .spawn(move || finalize(ctx))
        {
            Ok(handle) => *self.finalizer.lock() = Some(handle),
            Err(e) => error!("[Session] could not spawn finalize thread: {e}"),
        }
        Ok(())
    }

    /// Blocks until the most recent finalize completed. Primarily for
    /// orderly process shutdown and tests.
    pub fn wait_finalize(&self) {
        if let Some(handle) = self.finalizer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Drains the visualization buffer and snapshots the counters.
    pub fn poll_data(&self) -> DataPayload {
        let data = self
            .viz
            .lock()
            .as_ref()
            .map(|viz| viz.drain())
            .unwrap_or_default();
        let is_collecting = self.status.collecting.load(Ordering::Acquire);
        DataPayload {
            success: true,
            data,
            counter: self.status.total_samples.load(Ordering::Relaxed),
            sample_rate: self.status.sample_rate.load(Ordering::Relaxed),
            is_collecting,
            start_time: if is_collecting {
                self.status.started_at.lock().clone()
            } else {
                None
            },
        }
    }

    pub fn status(&self) -> StatusPayload {
        StatusPayload {
            is_collecting: self.status.collecting.load(Ordering::Acquire),
            counter: self.status.total_samples.load(Ordering::Relaxed),
        }
    }

    pub fn read_config_file(&self, name: &str) -> Option<String> {
        if !CONFIG_FILES.contains(&name) {
            return None;
        }
        fs::read_to_string(self.root.join("API").join(name)).ok()
    }

    pub fn write_config_file(&self, name: &str, content: &str) -> std::io::Result<()> {
        if !CONFIG_FILES.contains(&name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown config file {name:?}"),
            ));
        }
        let api_dir = self.root.join("API");
        fs::create_dir_all(&api_dir)?;
        fs::write(api_dir.join(name), content)
    }
}

/// Drain protocol, executed off the HTTP thread. Every wait is
/// bounded, so a wedged worker cannot block shutdown indefinitely.
fn finalize(ctx: RunContext) {
    let RunContext {
        device,
        dispatcher,
        csv_worker,
        sql_worker,
        csv_tx,
        sql_tx,
    } = ctx;

    info!("[Session] finalize started");

    // Let the dispatcher finish its last fan-out pass before the
    // adapter tears down and clears its internal queue.
    let deadline = Instant::now() + DISPATCHER_JOIN_TIMEOUT;
    while !dispatcher.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL);
    }
    if dispatcher.is_finished() {
        let _ = dispatcher.join();
    } else {
        warn!("[Session] dispatcher still busy after {DISPATCHER_JOIN_TIMEOUT:?}");
    }
    device.stop();

    if let Some(tx) = &csv_tx {
        wait_queue_empty("csv", tx);
    }
    if let Some(tx) = &sql_tx {
        wait_queue_empty("sql", tx);
    }

    thread::sleep(SETTLE_SLEEP);

    let csv_sink = csv_worker.and_then(|handle| match handle.join() {
        Ok(sink) => Some(sink),
        Err(_) => {
            error!("[Session] csv worker panicked");
            None
        }
    });
    let sql_sink = sql_worker.and_then(|handle| match handle.join() {
        Ok(sink) => Some(sink),
        Err(_) => {
            error!("[Session] sql worker panicked");
            None
        }
    });

    if let Some(sink) = sql_sink {
        sink.drain();
    }
    if let Some(sink) = csv_sink {
        if let Err(e) = sink.close() {
            error!("[Session] csv close failed: {e}");
        }
    }

    info!("[Session] finalize complete");
}

fn wait_queue_empty(name: &str, tx: &Sender<SampleBlock>) {
    let deadline = Instant::now() + QUEUE_DRAIN_TIMEOUT;
    while !tx.is_empty() && Instant::now() < deadline {
        thread::sleep(DRAIN_POLL);
    }
    if !tx.is_empty() {
        warn!(
            "[Session] {name} queue still holds {} blocks after {QUEUE_DRAIN_TIMEOUT:?}",
            tx.len()
        );
    }
}
