//! Process-wide key/value status table used for telemetry.
//!
//! Every stage publishes its loop phase under its own key and the scan producer
//! publishes scan parameters and progress. External parties (tests, the CLI,
//! an embedding application) write `SCANLEN` and `STRTDMJD` here before
//! issuing `START`.
//!
//! All access goes through a short-held [`parking_lot::Mutex`]. The guard
//! returned by [`StatusTable::lock`] releases the table on every exit path,
//! including early returns and `?` propagation. A read-modify-write must never
//! span more than one guard.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Scan status: `off`, `committed` or `scanning`.
pub const SCANSTAT: &str = "SCANSTAT";
/// Requested scan length in whole seconds.
pub const SCANLEN: &str = "SCANLEN";
/// Absolute scan start time as a DMJD.
pub const STRTDMJD: &str = "STRTDMJD";
/// Number of scans started by this process.
pub const SCANNUM: &str = "SCANNUM";
/// Blocks required by the scan in progress.
pub const BLKREQ: &str = "BLKREQ";
/// Blocks written so far in the scan in progress.
pub const BLKWRTN: &str = "BLKWRTN";
/// Deadlines missed in the scan in progress.
pub const OVERRUNS: &str = "OVERRUNS";

/// Longest key accepted by the table.
pub const MAX_KEY_LEN: usize = 8;

/// A typed status value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Free text.
    Str(String),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(v) => write!(f, "{v}"),
            StatusValue::Float(v) => write!(f, "{v}"),
            StatusValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for StatusValue {
    fn from(value: i64) -> Self {
        StatusValue::Int(value)
    }
}

impl From<f64> for StatusValue {
    fn from(value: f64) -> Self {
        StatusValue::Float(value)
    }
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        StatusValue::Str(value.to_string())
    }
}

impl From<String> for StatusValue {
    fn from(value: String) -> Self {
        StatusValue::Str(value)
    }
}

/// Errors raised by the status table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatusError {
    #[error("invalid status key '{0}': keys are 1-8 characters of A-Z, 0-9, '-' or '_'")]
    InvalidKey(String),

    #[error("status key '{key}' holds {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: String,
    },
}

/// Check a key against the 8-character FITS-style convention.
pub fn validate_key(key: &str) -> Result<(), StatusError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StatusError::InvalidKey(key.to_string()))
    }
}

/// Shared status table.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: Mutex<BTreeMap<String, StatusValue>>,
}

impl StatusTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the table for a short read/write scope.
    pub fn lock(&self) -> StatusGuard<'_> {
        StatusGuard {
            entries: self.entries.lock(),
        }
    }

    /// Best-effort publish of a single key.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn publish(&self, key: &str, value: impl Into<StatusValue>) {
        if let Err(err) = self.lock().put(key, value) {
            warn!(key, error = %err, "Failed to publish status");
        }
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, StatusValue> {
        self.lock().entries.clone()
    }

    /// Write the current snapshot as pretty JSON.
    pub fn write_snapshot(&self, path: &Path) -> Result<(), crate::error::SimError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Scoped access to the status table.
pub struct StatusGuard<'a> {
    entries: MutexGuard<'a, BTreeMap<String, StatusValue>>,
}

impl StatusGuard<'_> {
    /// Store a value.
    pub fn put(&mut self, key: &str, value: impl Into<StatusValue>) -> Result<(), StatusError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.entries.get(key)
    }

    /// Integer value for `key`; `Ok(None)` if unset.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>, StatusError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StatusValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(wrong_type(key, "an integer", other)),
        }
    }

    /// Float value for `key`; integers are widened.
    pub fn get_float(&self, key: &str) -> Result<Option<f64>, StatusError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StatusValue::Float(v)) => Ok(Some(*v)),
            Some(StatusValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(wrong_type(key, "a float", other)),
        }
    }

    /// String value for `key`.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, StatusError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(StatusValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<StatusValue> {
        self.entries.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &StatusValue) -> StatusError {
    StatusError::WrongType {
        key: key.to_string(),
        expected,
        found: format!("{found:?}"),
    }
}
