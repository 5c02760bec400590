//! Per-scan output files.
//!
//! One CSV file per scan. The file opens with the scan metadata as pretty JSON,
//! each line prefixed with `# `, followed by a header row and one row per block:
//!
//! ```text
//! # {
//! #   "SCANNUM": 1,
//! #   ...
//! # }
//! row,sequence_number,payload
//! 0,0,0 1 2 3 ... 39
//! ```

use crate::clock::Dmjd;
use crate::error::{AppResult, SimError};
use crate::ring::{Block, PAYLOAD_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column names, in order.
pub const COLUMNS: [&str; 3] = ["row", "sequence_number", "payload"];

/// Scan description written at the top of each file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    /// Scan number.
    #[serde(rename = "SCANNUM")]
    pub scan_number: u32,
    /// Requested duration in seconds.
    #[serde(rename = "SCANDUR")]
    pub duration_secs: i64,
    /// Commanded start time.
    #[serde(rename = "STRTDMJD")]
    pub start_time: Dmjd,
    /// Blocks the scan should contain.
    #[serde(rename = "BLKREQ")]
    pub blocks_required: u64,
    /// Nominal block interval.
    #[serde(rename = "INTERVAL_NS")]
    pub interval_ns: u64,
    /// Values per payload row.
    #[serde(rename = "PAYLOAD_LEN")]
    pub payload_len: usize,
    /// When the file was opened.
    pub created: DateTime<Utc>,
}

/// An open scan file.
pub struct ScanFile {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    rows: u64,
    metadata: ScanMetadata,
}

impl ScanFile {
    /// File name for a scan opened at `created`.
    pub fn file_name(scan_number: u32, created: DateTime<Utc>) -> String {
        format!(
            "scan_{:04}_{}.csv",
            scan_number,
            created.format("%Y%m%d_%H%M%S")
        )
    }

    /// Create the file under `dir` and write the metadata block and header row.
    pub fn create(dir: &Path, metadata: ScanMetadata) -> AppResult<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| {
                SimError::Storage(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        let path = dir.join(Self::file_name(metadata.scan_number, metadata.created));
        let file = File::create(&path)
            .map_err(|e| SimError::Storage(format!("Failed to create scan file: {e}")))?;
        let mut out = BufWriter::new(file);

        let json = serde_json::to_string_pretty(&metadata)?;
        for line in json.lines() {
            writeln!(out, "# {line}")?;
        }

        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(COLUMNS)?;

        info!(path = %path.display(), scan = metadata.scan_number, "Opened scan file");
        Ok(Self {
            path,
            writer,
            rows: 0,
            metadata,
        })
    }

    /// Append one block as a row.
    pub fn write_block(&mut self, block: &Block) -> AppResult<()> {
        let payload = block
            .payload
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.writer.write_record([
            self.rows.to_string(),
            block.header.sequence_number.to_string(),
            payload,
        ])?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Scan this file belongs to.
    pub fn metadata(&self) -> &ScanMetadata {
        &self.metadata
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close, returning the path.
    pub fn close(mut self) -> AppResult<PathBuf> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), rows = self.rows, "Closed scan file");
        Ok(self.path)
    }
}

/// A scan file read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    /// Metadata block.
    pub metadata: ScanMetadata,
    /// `(sequence_number, payload)` per row.
    pub rows: Vec<(u64, [i32; PAYLOAD_LEN])>,
}

/// Parse a file written by [`ScanFile`].
pub fn read_scan_file(path: &Path) -> AppResult<ScanRecord> {
    let text = std::fs::read_to_string(path)?;
    let mut json = String::new();
    let mut body_start = 0;
    for line in text.lines() {
        match line.strip_prefix("# ") {
            Some(rest) => {
                json.push_str(rest);
                json.push('\n');
                body_start += line.len() + 1;
            }
            None => break,
        }
    }
    let metadata: ScanMetadata = serde_json::from_str(&json)?;

    let mut reader = csv::Reader::from_reader(text[body_start..].as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let sequence = record
            .get(1)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| SimError::Storage(format!("bad sequence number in {record:?}")))?;
        let values = record
            .get(2)
            .unwrap_or_default()
            .split(' ')
            .map(str::parse::<i32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SimError::Storage(format!("bad payload value: {e}")))?;
        let payload: [i32; PAYLOAD_LEN] = values.try_into().map_err(|v: Vec<i32>| {
            SimError::Storage(format!("payload has {} values, expected {PAYLOAD_LEN}", v.len()))
        })?;
        rows.push((sequence, payload));
    }
    Ok(ScanRecord { metadata, rows })
}
