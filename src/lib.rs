//! Continuous data-acquisition backend for the ICP-DAS PET-7H24M
//! vibration sensor (up to four analog input channels, tens of kHz).
//!
//! Pipeline: device read loop → ingest dispatcher → three sinks
//! (live visualization buffer, rolling CSV archive, SQL staging
//! uploader), plus a small HTTP control surface for start/stop/
//! config/file download.
//!
//! ## Architecture
//! - **Workers:** plain OS threads with bounded crossbeam queues;
//!   cooperative shutdown via an `is_collecting` atomic flag.
//! - **Timestamps:** derived from the global row counter and the
//!   sample rate, never from the wall clock, so rotated files stay
//!   timestamp-continuous.
//! - **Shutdown:** stop returns immediately; a background finalize
//!   thread drains the queues, uploads leftover staging files and
//!   closes the sinks within a bounded time.

pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod web;
