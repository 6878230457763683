//! # PET-7H24M DAQ Entry Point
//!
//! Wires the session controller to the HTTP control surface and
//! serves until the process is terminated.
//!
//! ## Layout
//! - `API/`: the three INI configuration files (device, csv, sql).
//! - `output/PET-7H24M/<ts>_<label>/`: rotated CSV archives, plus a
//!   transient `.sql_temp/` staging directory per run.
//!
//! Without a physical device attached the synthetic waveform
//! transport stands in behind the same seam, so the whole pipeline
//! (ingest → queues → sinks → finalize) runs end to end.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use pet_daq::device::sim::SimTransport;
use pet_daq::pipeline::sql_uploader::MysqlLoader;
use pet_daq::session::SessionController;
use pet_daq::web::server;

#[derive(Parser)]
#[command(name = "pet_daq")]
#[command(version)]
#[command(about = "Continuous DAQ backend for PET-7H24M vibration sensors")]
struct Cli {
    /// HTTP listen port for the control surface
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Runtime root containing API/ and output/
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    info!("=== PET-7H24M DAQ START ===");
    let controller = Arc::new(SessionController::new(
        cli.root,
        SimTransport::factory(),
        MysqlLoader::factory(),
    ));

    server::serve(controller, cli.port)
}
