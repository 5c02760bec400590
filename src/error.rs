//! Custom error types for the simulator.
//!
//! This module defines the primary error type, `SimError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! shared-memory faults.
//!
//! ## Error Hierarchy
//!
//! `SimError` consolidates the error sources that can stop a stage or the process:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration sources.
//! - **`Configuration`**: Semantic errors in the configuration, such as a zero sample rate,
//!   that pass parsing but are logically incorrect. Caught by `SimConfig::validate`.
//! - **`Channel`**: The command channel could not be opened. Fatal at startup.
//! - **`Ring`**: The block ring primitive failed for a reason other than a timeout.
//!   Fatal to the owning stage thread.
//! - **`Storage`** / **`Csv`** / **`Serialization`**: Output file failures in consumer stages.
//! - **`Stage`**: Pipeline assembly and stage lifecycle failures.
//!
//! Two further enums live next to the code that produces them: `RingError` in
//! [`crate::ring`] and `StatusError` in [`crate::status`]. Invalid scan parameters are
//! reported through [`ScanRejection`], which is never fatal.

use crate::ring::RingError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SimError>;

/// Primary error type for the simulator.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open command channel {path:?}: {reason}")]
    Channel { path: PathBuf, reason: String },

    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),
}

impl From<figment::Error> for SimError {
    fn from(err: figment::Error) -> Self {
        SimError::Config(Box::new(err))
    }
}

impl SimError {
    /// Build a stage failure with the stage name attached.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        SimError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Reasons a `START` request is refused while the scan is `off`.
///
/// These are reported to the log and telemetry; the scan simply stays `off`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanRejection {
    #[error("SCANLEN has not been set")]
    MissingLength,

    #[error("SCANLEN must be positive, got {0}")]
    NonPositiveLength(i64),

    #[error("STRTDMJD has not been set")]
    MissingStartTime,

    #[error("STRTDMJD must be non-negative, got {0}")]
    NegativeStartTime(f64),

    #[error("a {duration_secs}s scan is too short to fill a single block")]
    NoBlocks { duration_secs: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_carries_name() {
        let err = SimError::stage("scan_writer", "disk full");
        assert_eq!(err.to_string(), "Stage 'scan_writer' failed: disk full");
    }

    #[test]
    fn ring_errors_convert() {
        let err: SimError = RingError::Timeout.into();
        assert!(matches!(err, SimError::Ring(RingError::Timeout)));
    }

    #[test]
    fn rejection_messages_name_the_key() {
        assert!(ScanRejection::MissingStartTime.to_string().contains("STRTDMJD"));
        assert!(ScanRejection::NonPositiveLength(-3)
            .to_string()
            .contains("SCANLEN"));
    }
}
