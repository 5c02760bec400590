//! # DAQ Scan Simulator
//!
//! A stand-in for a real-time acquisition front end. A producer stage emits
//! fixed-size blocks into a shared-memory ring at a precise cadence, starting
//! at a commanded absolute time and stopping after a commanded duration, so
//! that a downstream consumer (the scan file writer) can be exercised under
//! realistic timing and handshake conditions without hardware.
//!
//! ## Crate Structure
//!
//! - **`clock`**: Wall-clock conversions to the day-numbered `Dmjd` scale used for start times.
//! - **`command`**: The `START`/`STOP`/`QUIT` command channel over a named FIFO.
//! - **`scan`**: The scan state machine (`off`/`committed`/`scanning`) and the
//!   absolute-deadline `BlockPacer`.
//! - **`ring`**: The memory-mapped block ring and its producer/consumer handshake clients.
//! - **`status`**: The shared key/value status table used for telemetry.
//! - **`storage`**: Per-scan CSV output files.
//! - **`pipeline`**: The `Stage` trait, the explicit `StageRegistry`, the pipeline host and
//!   the built-in producer, writer and monitor stages.
//! - **`config`**: Figment-based configuration (`SimConfig`).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `SimError` and the `ScanRejection` reasons.

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod ring;
pub mod scan;
pub mod status;
pub mod storage;

pub use config::SimConfig;
pub use error::{AppResult, SimError};
pub use pipeline::{Pipeline, RunningPipeline, StageRegistry};
