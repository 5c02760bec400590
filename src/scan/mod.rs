//! Scan state machine and pacing schedule.
//!
//! ```text
//!   off --START(valid)--> committed --(now >= STRTDMJD)--> scanning
//!    ^  <--START(invalid)   |                                  |
//!    +------- STOP ---------+------ STOP / blocks complete ----+
//! ```
//!
//! The machine is pure: it never sleeps, touches the ring or reads the clock on
//! its own. The producer stage feeds it commands and the current time, and
//! publishes its state through [`ScanStateMachine::publish`].

pub mod pacer;

pub use pacer::{BlockPacer, Deadline, ManualClock, MonotonicClock, PaceStats, PacingClock};

use crate::clock::Dmjd;
use crate::command::Command;
use crate::error::ScanRejection;
use crate::status::{self, StatusTable};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Lifecycle state of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStatus {
    /// Idle.
    #[default]
    Off,
    /// Parameters fixed, waiting for the start time.
    Committed,
    /// Producing blocks.
    Scanning,
}

impl ScanStatus {
    /// Telemetry spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Off => "off",
            ScanStatus::Committed => "committed",
            ScanStatus::Scanning => "scanning",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ScanStatus::Off),
            "committed" => Ok(ScanStatus::Committed),
            "scanning" => Ok(ScanStatus::Scanning),
            other => Err(format!("unknown scan status '{other}'")),
        }
    }
}

/// Fixed emission cadence derived from the acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingSchedule {
    sample_rate_hz: f64,
    integration_size: u32,
}

impl PacingSchedule {
    /// Schedule for `integration_size` samples per block at `sample_rate_hz`.
    pub fn new(sample_rate_hz: f64, integration_size: u32) -> Self {
        Self {
            sample_rate_hz,
            integration_size,
        }
    }

    /// Sample rate in Hz.
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Samples per block.
    pub fn integration_size(&self) -> u32 {
        self.integration_size
    }

    /// Nominal time between blocks.
    pub fn interval_ns(&self) -> u64 {
        (f64::from(self.integration_size) / self.sample_rate_hz * 1e9).round() as u64
    }

    /// `floor(sample_rate * duration / integration_size)`; zero for non-positive durations.
    pub fn blocks_required(&self, duration_secs: i64) -> u64 {
        if duration_secs <= 0 {
            return 0;
        }
        (self.sample_rate_hz * duration_secs as f64 / f64::from(self.integration_size)).floor()
            as u64
    }
}

/// Scan parameters as set by an external party before `START`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanRequest {
    /// `SCANLEN`, whole seconds.
    pub length_secs: Option<i64>,
    /// `STRTDMJD`.
    pub start_time: Option<f64>,
}

impl ScanRequest {
    /// Read `SCANLEN` and `STRTDMJD` from the status table.
    ///
    /// A value of the wrong type is logged and treated as unset.
    pub fn read(table: &StatusTable) -> Self {
        let st = table.lock();
        let length_secs = st.get_int(status::SCANLEN).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring malformed scan length");
            None
        });
        let start_time = st.get_float(status::STRTDMJD).unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring malformed start time");
            None
        });
        Self {
            length_secs,
            start_time,
        }
    }
}

/// Identity of the next block to produce, with the parameters of its scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockTicket {
    /// Sequence number to stamp into the header.
    pub sequence_number: u64,
    /// Scan the block belongs to.
    pub scan_number: u32,
    /// Blocks the scan produces in total.
    pub blocks_required: u64,
    /// Commanded scan length in seconds.
    pub duration_secs: i64,
    /// Commanded start time.
    pub start_time: Dmjd,
}

/// Result of feeding a command or a clock tick to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing changed.
    None,
    /// `off -> committed`.
    Committed {
        scan_number: u32,
        start_time: Dmjd,
        duration_secs: i64,
        blocks_required: u64,
    },
    /// `START` refused; still `off` with counters zeroed.
    Rejected(ScanRejection),
    /// Command had no effect in the current state.
    Ignored { command: Command, status: ScanStatus },
    /// `committed -> scanning`.
    Started { scan_number: u32 },
    /// `STOP` returned the scan to `off`.
    Stopped {
        scan_number: u32,
        previous: ScanStatus,
        blocks_written: u64,
    },
    /// All required blocks written; back to `off`.
    Completed {
        scan_number: u32,
        blocks_written: u64,
        duration_secs: i64,
    },
    /// Shutdown requested.
    Quit,
}

/// The scan lifecycle.
#[derive(Debug, Clone)]
pub struct ScanStateMachine {
    schedule: PacingSchedule,
    sequence_step: u64,
    status: ScanStatus,
    scan_number: u32,
    start_time: Option<Dmjd>,
    duration_secs: i64,
    blocks_required: u64,
    blocks_written: u64,
    sequence_number: u64,
}

impl ScanStateMachine {
    /// A machine in `off` with no scans started.
    pub fn new(schedule: PacingSchedule, sequence_step: u64) -> Self {
        Self {
            schedule,
            sequence_step: sequence_step.max(1),
            status: ScanStatus::Off,
            scan_number: 0,
            start_time: None,
            duration_secs: 0,
            blocks_required: 0,
            blocks_written: 0,
            sequence_number: 0,
        }
    }

    /// Current status.
    pub fn status(&self) -> ScanStatus {
        self.status
    }

    /// Scans committed so far; also the number of the current scan.
    pub fn scan_number(&self) -> u32 {
        self.scan_number
    }

    /// Start time fixed at commit.
    pub fn start_time(&self) -> Option<Dmjd> {
        self.start_time
    }

    /// Requested duration of the current scan.
    pub fn duration_secs(&self) -> i64 {
        self.duration_secs
    }

    /// Blocks the current scan must produce.
    pub fn blocks_required(&self) -> u64 {
        self.blocks_required
    }

    /// Blocks produced so far in the current scan.
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Sequence number the next block will carry.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The schedule the machine derives block counts from.
    pub fn schedule(&self) -> &PacingSchedule {
        &self.schedule
    }

    /// Whether a scanning scan has produced every required block.
    pub fn is_complete(&self) -> bool {
        self.status == ScanStatus::Scanning && self.blocks_written >= self.blocks_required
    }

    /// Apply a command. `request` is only consulted for `START` while `off`.
    pub fn handle_command(&mut self, command: Command, request: &ScanRequest) -> Transition {
        match (command, self.status) {
            (Command::Quit, _) => Transition::Quit,
            (Command::Start, ScanStatus::Off) => self.commit(request),
            (Command::Start, status) | (Command::Stop, status @ ScanStatus::Off) => {
                Transition::Ignored { command, status }
            }
            (Command::Stop, previous) => {
                let blocks_written = self.blocks_written;
                self.reset();
                Transition::Stopped {
                    scan_number: self.scan_number,
                    previous,
                    blocks_written,
                }
            }
        }
    }

    /// Apply the passage of time.
    pub fn tick(&mut self, now: Dmjd) -> Transition {
        match self.status {
            ScanStatus::Committed => match self.start_time {
                Some(start) if now >= start => {
                    self.status = ScanStatus::Scanning;
                    Transition::Started {
                        scan_number: self.scan_number,
                    }
                }
                _ => Transition::None,
            },
            ScanStatus::Scanning if self.blocks_written >= self.blocks_required => {
                let blocks_written = self.blocks_written;
                let duration_secs = self.duration_secs;
                self.reset();
                Transition::Completed {
                    scan_number: self.scan_number,
                    blocks_written,
                    duration_secs,
                }
            }
            _ => Transition::None,
        }
    }

    /// The block to produce next, if the scan still needs one.
    pub fn next_block(&self) -> Option<BlockTicket> {
        if self.status == ScanStatus::Scanning && self.blocks_written < self.blocks_required {
            Some(BlockTicket {
                sequence_number: self.sequence_number,
                scan_number: self.scan_number,
                blocks_required: self.blocks_required,
                duration_secs: self.duration_secs,
                start_time: self.start_time.unwrap_or(Dmjd(0.0)),
            })
        } else {
            None
        }
    }

    /// Account for a block handed to the consumer.
    pub fn record_block(&mut self) {
        if self.status == ScanStatus::Scanning {
            self.blocks_written += 1;
            self.sequence_number += self.sequence_step;
        }
    }

    /// Write status, scan number and block counters to the status table.
    pub fn publish(&self, table: &StatusTable) {
        let mut st = table.lock();
        let results = [
            st.put(status::SCANSTAT, self.status.as_str()),
            st.put(status::SCANNUM, i64::from(self.scan_number)),
            st.put(status::BLKREQ, self.blocks_required as i64),
            st.put(status::BLKWRTN, self.blocks_written as i64),
        ];
        for err in results.into_iter().filter_map(Result::err) {
            warn!(error = %err, "Failed to publish scan state");
        }
    }

    fn commit(&mut self, request: &ScanRequest) -> Transition {
        match self.validate(request) {
            Ok((duration_secs, start_time, blocks_required)) => {
                self.reset();
                self.scan_number += 1;
                self.status = ScanStatus::Committed;
                self.duration_secs = duration_secs;
                self.start_time = Some(start_time);
                self.blocks_required = blocks_required;
                Transition::Committed {
                    scan_number: self.scan_number,
                    start_time,
                    duration_secs,
                    blocks_required,
                }
            }
            Err(rejection) => {
                self.reset();
                Transition::Rejected(rejection)
            }
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(i64, Dmjd, u64), ScanRejection> {
        let duration = request.length_secs.ok_or(ScanRejection::MissingLength)?;
        if duration <= 0 {
            return Err(ScanRejection::NonPositiveLength(duration));
        }
        let start = request.start_time.ok_or(ScanRejection::MissingStartTime)?;
        if start < 0.0 || start.is_nan() {
            return Err(ScanRejection::NegativeStartTime(start));
        }
        let blocks_required = self.schedule.blocks_required(duration);
        if blocks_required == 0 {
            return Err(ScanRejection::NoBlocks {
                duration_secs: duration,
            });
        }
        Ok((duration, Dmjd(start), blocks_required))
    }

    fn reset(&mut self) {
        self.status = ScanStatus::Off;
        self.start_time = None;
        self.duration_secs = 0;
        self.blocks_required = 0;
        self.blocks_written = 0;
        self.sequence_number = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAST: f64 = 40_000.0;

    fn machine() -> ScanStateMachine {
        ScanStateMachine::new(PacingSchedule::new(1000.0, 4), 1)
    }

    fn request(length: i64, start: f64) -> ScanRequest {
        ScanRequest {
            length_secs: Some(length),
            start_time: Some(start),
        }
    }

    fn scanning(length: i64) -> ScanStateMachine {
        let mut m = machine();
        m.handle_command(Command::Start, &request(length, PAST));
        assert_eq!(m.tick(Dmjd(PAST)), Transition::Started { scan_number: 1 });
        m
    }

    #[test]
    fn schedule_matches_reference_scenario() {
        let s = PacingSchedule::new(1000.0, 4);
        assert_eq!(s.interval_ns(), 4_000_000);
        assert_eq!(s.blocks_required(5), 1250);
    }

    #[test]
    fn blocks_required_floors() {
        let s = PacingSchedule::new(1000.0, 3);
        assert_eq!(s.blocks_required(1), 333);
        assert_eq!(s.blocks_required(0), 0);
        assert_eq!(s.blocks_required(-2), 0);
    }

    #[test]
    fn valid_start_commits() {
        let mut m = machine();
        let t = m.handle_command(Command::Start, &request(5, 57_000.25));
        assert_eq!(
            t,
            Transition::Committed {
                scan_number: 1,
                start_time: Dmjd(57_000.25),
                duration_secs: 5,
                blocks_required: 1250,
            }
        );
        assert_eq!(m.status(), ScanStatus::Committed);
    }

    #[test]
    fn committed_waits_for_start_time() {
        let mut m = machine();
        m.handle_command(Command::Start, &request(5, 57_000.5));
        assert_eq!(m.tick(Dmjd(57_000.4)), Transition::None);
        assert_eq!(m.status(), ScanStatus::Committed);
        assert!(m.next_block().is_none());
        assert_eq!(m.tick(Dmjd(57_000.5)), Transition::Started { scan_number: 1 });
        assert_eq!(m.status(), ScanStatus::Scanning);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let cases = [
            (ScanRequest::default(), ScanRejection::MissingLength),
            (
                ScanRequest {
                    length_secs: Some(0),
                    start_time: Some(PAST),
                },
                ScanRejection::NonPositiveLength(0),
            ),
            (
                ScanRequest {
                    length_secs: Some(5),
                    start_time: None,
                },
                ScanRejection::MissingStartTime,
            ),
            (request(5, -1.0), ScanRejection::NegativeStartTime(-1.0)),
        ];
        for (req, expected) in cases {
            let mut m = machine();
            assert_eq!(
                m.handle_command(Command::Start, &req),
                Transition::Rejected(expected)
            );
            assert_eq!(m.status(), ScanStatus::Off);
            assert_eq!(m.scan_number(), 0);
        }
    }

    #[test]
    fn scan_too_short_for_one_block_is_rejected() {
        let mut m = ScanStateMachine::new(PacingSchedule::new(1.0, 4), 1);
        assert_eq!(
            m.handle_command(Command::Start, &request(3, PAST)),
            Transition::Rejected(ScanRejection::NoBlocks { duration_secs: 3 })
        );
    }

    #[test]
    fn redundant_start_is_a_no_op() {
        let mut m = machine();
        m.handle_command(Command::Start, &request(5, 57_000.5));
        let t = m.handle_command(Command::Start, &request(9, PAST));
        assert_eq!(
            t,
            Transition::Ignored {
                command: Command::Start,
                status: ScanStatus::Committed
            }
        );
        assert_eq!(m.start_time(), Some(Dmjd(57_000.5)));
        assert_eq!(m.blocks_required(), 1250);

        let mut m = scanning(5);
        m.record_block();
        m.handle_command(Command::Start, &request(1, PAST));
        assert_eq!(m.status(), ScanStatus::Scanning);
        assert_eq!(m.blocks_written(), 1);
        assert_eq!(m.blocks_required(), 1250);
    }

    #[test]
    fn stop_from_any_active_state_resets() {
        let mut m = scanning(5);
        for _ in 0..400 {
            m.record_block();
        }
        let t = m.handle_command(Command::Stop, &ScanRequest::default());
        assert_eq!(
            t,
            Transition::Stopped {
                scan_number: 1,
                previous: ScanStatus::Scanning,
                blocks_written: 400
            }
        );
        assert_eq!(m.status(), ScanStatus::Off);
        assert_eq!(m.blocks_written(), 0);
        assert_eq!(m.sequence_number(), 0);

        let mut m = machine();
        m.handle_command(Command::Start, &request(5, 99_999.0));
        m.handle_command(Command::Stop, &ScanRequest::default());
        assert_eq!(m.status(), ScanStatus::Off);
    }

    #[test]
    fn stop_while_off_is_ignored() {
        let mut m = machine();
        assert_eq!(
            m.handle_command(Command::Stop, &ScanRequest::default()),
            Transition::Ignored {
                command: Command::Stop,
                status: ScanStatus::Off
            }
        );
    }

    #[test]
    fn completes_after_required_blocks() {
        let mut m = ScanStateMachine::new(PacingSchedule::new(10.0, 5), 1);
        m.handle_command(Command::Start, &request(1, PAST));
        m.tick(Dmjd(PAST));
        assert_eq!(m.blocks_required(), 2);

        let mut sequence = Vec::new();
        while let Some(ticket) = m.next_block() {
            sequence.push(ticket.sequence_number);
            m.record_block();
        }
        assert_eq!(sequence, vec![0, 1]);
        assert!(m.is_complete());
        assert_eq!(
            m.tick(Dmjd(PAST)),
            Transition::Completed {
                scan_number: 1,
                blocks_written: 2,
                duration_secs: 1
            }
        );
        assert_eq!(m.status(), ScanStatus::Off);
    }

    #[test]
    fn stop_wins_over_completion_in_same_iteration() {
        let mut m = ScanStateMachine::new(PacingSchedule::new(10.0, 5), 1);
        m.handle_command(Command::Start, &request(1, PAST));
        m.tick(Dmjd(PAST));
        m.record_block();
        m.record_block();
        assert!(m.is_complete());

        // Commands are applied before the tick.
        assert!(matches!(
            m.handle_command(Command::Stop, &ScanRequest::default()),
            Transition::Stopped { .. }
        ));
        assert_eq!(m.tick(Dmjd(PAST)), Transition::None);
    }

    #[test]
    fn sequence_advances_by_step_and_restarts_per_scan() {
        let mut m = ScanStateMachine::new(PacingSchedule::new(1000.0, 4), 8);
        m.handle_command(Command::Start, &request(1, PAST));
        m.tick(Dmjd(PAST));
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(m.next_block().map(|t| t.sequence_number));
            m.record_block();
        }
        assert_eq!(seen, vec![Some(0), Some(8), Some(16)]);

        m.handle_command(Command::Stop, &ScanRequest::default());
        m.handle_command(Command::Start, &request(1, PAST));
        m.tick(Dmjd(PAST));
        assert_eq!(
            m.next_block(),
            Some(BlockTicket {
                sequence_number: 0,
                scan_number: 2,
                blocks_required: 250,
                duration_secs: 1,
                start_time: Dmjd(PAST),
            })
        );
    }

    #[test]
    fn rejection_clears_stale_counters() {
        let mut m = scanning(5);
        m.record_block();
        m.handle_command(Command::Stop, &ScanRequest::default());
        m.handle_command(Command::Start, &ScanRequest::default());
        assert_eq!(m.blocks_written(), 0);
        assert_eq!(m.sequence_number(), 0);
        assert_eq!(m.blocks_required(), 0);
    }

    #[test]
    fn publish_writes_status_keys() {
        let table = StatusTable::new();
        let m = scanning(5);
        m.publish(&table);
        let st = table.lock();
        assert_eq!(st.get_str(status::SCANSTAT), Ok(Some("scanning")));
        assert_eq!(st.get_int(status::SCANNUM), Ok(Some(1)));
        assert_eq!(st.get_int(status::BLKREQ), Ok(Some(1250)));
        assert_eq!(st.get_int(status::BLKWRTN), Ok(Some(0)));
    }

    #[test]
    fn request_reads_status_table() {
        let table = StatusTable::new();
        table.publish(status::SCANLEN, 5_i64);
        table.publish(status::STRTDMJD, 57_154.629_861);
        assert_eq!(ScanRequest::read(&table), request(5, 57_154.629_861));

        table.publish(status::SCANLEN, "five");
        assert_eq!(ScanRequest::read(&table).length_secs, None);
    }

    #[test]
    fn status_parses_from_telemetry() {
        assert_eq!("scanning".parse::<ScanStatus>(), Ok(ScanStatus::Scanning));
        assert!("paused".parse::<ScanStatus>().is_err());
    }
}
