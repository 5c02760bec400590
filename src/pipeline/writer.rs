//! The scan writer stage: the consumer side of the scan.
//!
//! Mirrors the producer's state machine from what it can observe:
//! - a block from a scan that is already closed is released untouched
//! - the first block of a new scan opens a file
//! - every block of the open scan becomes one row
//! - the file closes when its row count reaches the scan's required block
//!   count (completion), when a block from a newer scan arrives, or when the
//!   ring goes idle while `SCANSTAT` is no longer `scanning` (the scan was
//!   stopped)
//!
//! A file's scan number, length, start time and required block count are taken
//! from the header of the scan's first block. By the time that block is read
//! the status table may already describe the next scan.

use super::{Stage, StageContext, StageRole};
use crate::clock::Dmjd;
use crate::config::SimConfig;
use crate::error::{AppResult, SimError};
use crate::ring::{Acquired, Block, ConsumerClient, PAYLOAD_LEN};
use crate::scan::ScanStatus;
use crate::status::{self, StatusTable};
use crate::storage::{ScanFile, ScanMetadata};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry name.
pub const NAME: &str = "scan_writer";

/// Loop phase key.
pub const STATUS_KEY: &str = "DISKSTAT";

/// Number of scan files closed so far.
pub const FILES_KEY: &str = "DISKFILE";

/// Writes each scan's blocks to its own file.
pub struct ScanWriter {
    output_dir: PathBuf,
    block_timeout: Duration,
    interval_ns: u64,
    open: Option<ScanFile>,
    last_closed: Option<u32>,
    files_closed: i64,
}

impl ScanWriter {
    /// A writer configured from `config.storage`.
    pub fn new(config: &SimConfig) -> Self {
        Self {
            output_dir: config.storage.output_dir.clone(),
            block_timeout: config.block_timeout(),
            interval_ns: config.schedule().interval_ns(),
            open: None,
            last_closed: None,
            files_closed: 0,
        }
    }

    fn consume(&mut self, block: &Block, table: &StatusTable) -> AppResult<()> {
        let scan = block.header.scan_number;
        if self.last_closed.is_some_and(|closed| scan <= closed) {
            debug!(
                scan,
                sequence = block.header.sequence_number,
                "Ignoring block from a closed scan"
            );
            return Ok(());
        }

        if self
            .open
            .as_ref()
            .is_some_and(|file| file.metadata().scan_number != scan)
        {
            self.close(table, "superseded by a newer scan")?;
        }
        if self.open.is_none() {
            let file = ScanFile::create(&self.output_dir, self.metadata_for(block))?;
            self.open = Some(file);
        }
        let Some(file) = self.open.as_mut() else {
            return Ok(());
        };

        file.write_block(block)?;
        if file.rows() >= file.metadata().blocks_required {
            self.close(table, "complete")?;
        }
        Ok(())
    }

    /// Close an open file whose scan is no longer running.
    fn on_idle(&mut self, table: &StatusTable) -> AppResult<()> {
        if self.open.is_none() {
            return Ok(());
        }
        let scanning = matches!(
            table.lock().get_str(status::SCANSTAT),
            Ok(Some(s)) if s == ScanStatus::Scanning.as_str()
        );
        if !scanning {
            self.close(table, "stopped")?;
        }
        Ok(())
    }

    fn metadata_for(&self, block: &Block) -> ScanMetadata {
        let header = &block.header;
        let blocks_required = if header.blocks_required > 0 {
            header.blocks_required
        } else {
            warn!(
                scan = header.scan_number,
                "Block carries no required count; file will close when the scan stops"
            );
            u64::MAX
        };
        ScanMetadata {
            scan_number: header.scan_number,
            duration_secs: i64::from(header.duration_secs),
            start_time: Dmjd(header.start_time),
            blocks_required,
            interval_ns: self.interval_ns,
            payload_len: PAYLOAD_LEN,
            created: Utc::now(),
        }
    }

    fn close(&mut self, table: &StatusTable, reason: &str) -> AppResult<()> {
        let Some(file) = self.open.take() else {
            return Ok(());
        };
        let scan = file.metadata().scan_number;
        let rows = file.rows();
        let expected = file.metadata().blocks_required;
        let path = file.close()?;
        self.last_closed = Some(scan);
        self.files_closed += 1;
        table.publish(FILES_KEY, self.files_closed);

        if rows >= expected {
            info!(scan, rows, path = %path.display(), "Scan file complete");
        } else {
            info!(scan, rows, expected, reason, path = %path.display(), "Scan file closed early");
        }
        Ok(())
    }
}

impl Stage for ScanWriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn status_key(&self) -> &'static str {
        STATUS_KEY
    }

    fn role(&self) -> StageRole {
        StageRole::Consumer
    }

    fn init(&mut self, ctx: &StageContext) -> AppResult<()> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            SimError::Storage(format!(
                "Failed to create output directory {}: {e}",
                self.output_dir.display()
            ))
        })?;
        ctx.status.publish(STATUS_KEY, "init");
        ctx.status.publish(FILES_KEY, 0_i64);
        info!(dir = %self.output_dir.display(), "Scan files will be written here");
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext) -> AppResult<()> {
        let mut client = ConsumerClient::new(
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.status),
            STATUS_KEY,
            self.block_timeout,
            ctx.shutdown.clone(),
        );

        loop {
            ctx.status.publish(STATUS_KEY, "waiting");

            let mut idle_error = None;
            let acquired = client.acquire_with(|| {
                if let Err(err) = self.on_idle(&ctx.status) {
                    idle_error.get_or_insert(err);
                }
            })?;
            if let Some(err) = idle_error {
                return Err(err);
            }

            let filled = match acquired {
                Acquired::Block(filled) => filled,
                Acquired::Cancelled => break,
            };
            ctx.status.publish(STATUS_KEY, "writing");
            let result = self.consume(filled.block(), &ctx.status);
            client.release(filled);
            result?;

            if ctx.shutdown.is_triggered() {
                break;
            }
        }

        self.close(&ctx.status, "shutdown")?;
        ctx.status.publish(STATUS_KEY, "stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::BlockHeader;
    use crate::storage::read_scan_file;

    fn block(scan: u32, seq: u64, required: u64) -> Block {
        Block {
            header: BlockHeader::new(seq, scan).with_scan(required, 1, 57_000.5),
            payload: [seq as i32; PAYLOAD_LEN],
        }
    }

    fn scanning(table: &StatusTable) {
        table.publish(status::SCANSTAT, "scanning");
    }

    fn writer(dir: &tempfile::TempDir) -> ScanWriter {
        let mut config = SimConfig::default();
        config.storage.output_dir = dir.path().to_path_buf();
        ScanWriter::new(&config)
    }

    fn files(dir: &tempfile::TempDir) -> Vec<PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn closes_after_required_rows() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        scanning(&table);

        for seq in 0..3 {
            w.consume(&block(1, seq, 3), &table).unwrap();
        }
        assert!(w.open.is_none());
        assert_eq!(w.last_closed, Some(1));

        let record = read_scan_file(&files(&dir)[0]).unwrap();
        assert_eq!(record.metadata.blocks_required, 3);
        assert_eq!(record.metadata.duration_secs, 1);
        assert_eq!(record.metadata.start_time, Dmjd(57_000.5));
        let sequences: Vec<u64> = record.rows.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn scan_bounds_come_from_blocks_not_the_status_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        // Scan 1 finished producing; scan 2 is already committed when its
        // blocks are read.
        table.publish(status::SCANNUM, 2_i64);
        table.publish(status::BLKREQ, 1_i64);
        table.publish(status::SCANSTAT, "committed");

        w.consume(&block(1, 0, 2), &table).unwrap();
        assert!(w.open.is_some(), "one block of two written");
        w.consume(&block(1, 1, 2), &table).unwrap();
        assert!(w.open.is_none());

        let record = read_scan_file(&files(&dir)[0]).unwrap();
        assert_eq!(record.metadata.scan_number, 1);
        assert_eq!(record.metadata.blocks_required, 2);
        assert_eq!(record.rows.len(), 2);
    }

    #[test]
    fn blocks_of_closed_scan_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        scanning(&table);
        w.consume(&block(1, 0, 1), &table).unwrap();
        w.consume(&block(1, 1, 1), &table).unwrap();
        assert!(w.open.is_none());
        assert_eq!(files(&dir).len(), 1);
    }

    #[test]
    fn idle_after_stop_closes_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        scanning(&table);
        w.consume(&block(1, 0, 100), &table).unwrap();

        w.on_idle(&table).unwrap();
        assert!(w.open.is_some(), "still scanning");

        table.publish(status::SCANSTAT, "off");
        w.on_idle(&table).unwrap();
        assert!(w.open.is_none());
        assert_eq!(table.lock().get_int(FILES_KEY), Ok(Some(1)));
    }

    #[test]
    fn unknown_required_count_waits_for_stop() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        scanning(&table);
        w.consume(&block(1, 0, 0), &table).unwrap();
        assert_eq!(
            w.open.as_ref().map(|f| f.metadata().blocks_required),
            Some(u64::MAX)
        );
    }

    #[test]
    fn newer_scan_supersedes_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = StatusTable::new();
        let mut w = writer(&dir);
        scanning(&table);
        w.consume(&block(1, 0, 100), &table).unwrap();
        w.consume(&block(2, 0, 100), &table).unwrap();

        assert_eq!(w.last_closed, Some(1));
        assert_eq!(
            w.open.as_ref().map(|f| f.metadata().scan_number),
            Some(2)
        );
        assert_eq!(files(&dir).len(), 2);
    }
}
