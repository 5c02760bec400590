//! The scan producer stage.
//!
//! One loop iteration:
//! 1. wait for a command (bounded; zero while scanning) and apply it
//! 2. apply the clock: `committed -> scanning`, or completion
//! 3. while scanning, acquire the next free block, stamp and fill it, publish
//!    it, then sleep until the next absolute deadline
//! 4. check for shutdown
//!
//! Status key `FGPUSTAT` carries the loop phase: `waiting` while idle,
//! `blocked` while the consumer holds every slot, `writing` while a block is
//! being filled and `sending` while pacing after a publish.

use super::{Stage, StageContext, StageRole};
use crate::clock::{self, Dmjd};
use crate::command::{ChannelOptions, CommandChannel, CommandSource};
use crate::config::{PayloadPattern, SimConfig};
use crate::error::{AppResult, SimError};
use crate::ring::{Acquired, BlockHeader, ProducerClient, PAYLOAD_LEN};
use crate::scan::{
    BlockPacer, BlockTicket, MonotonicClock, PacingClock, PacingSchedule, ScanRequest,
    ScanStateMachine, ScanStatus, Transition,
};
use crate::status::{self, StatusError, StatusTable};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry name.
pub const NAME: &str = "scan_producer";

/// Loop phase key.
pub const STATUS_KEY: &str = "FGPUSTAT";

/// Value of the ramp pattern at `index` of block `sequence`.
pub fn ramp_value(sequence: u64, index: usize) -> i32 {
    sequence
        .wrapping_mul(PAYLOAD_LEN as u64)
        .wrapping_add(index as u64) as i32
}

/// Header stamped into the block for `ticket`.
pub fn header_for(ticket: &BlockTicket) -> BlockHeader {
    BlockHeader::new(ticket.sequence_number, ticket.scan_number).with_scan(
        ticket.blocks_required,
        u32::try_from(ticket.duration_secs).unwrap_or(u32::MAX),
        ticket.start_time.value(),
    )
}

/// Fills block payloads.
pub struct PayloadGenerator {
    pattern: PayloadPattern,
    rng: StdRng,
}

impl PayloadGenerator {
    /// Generator for `pattern`; `seed` makes noise reproducible.
    pub fn new(pattern: PayloadPattern, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { pattern, rng }
    }

    /// Write the payload for block `sequence`.
    pub fn fill(&mut self, sequence: u64, payload: &mut [i32; PAYLOAD_LEN]) {
        match self.pattern {
            PayloadPattern::Ramp => {
                for (index, value) in payload.iter_mut().enumerate() {
                    *value = ramp_value(sequence, index);
                }
            }
            PayloadPattern::Noise => self.rng.fill(&mut payload[..]),
        }
    }
}

/// Drives the scan state machine and feeds the ring.
pub struct ScanProducer<C: PacingClock = MonotonicClock> {
    schedule: PacingSchedule,
    sequence_step: u64,
    block_timeout: Duration,
    poll_timeout: Duration,
    min_poll_interval: Duration,
    default_length_secs: Option<i64>,
    fifo_path: PathBuf,
    channel_options: ChannelOptions,
    generator: PayloadGenerator,
    clock: Option<C>,
    commands: Option<Box<dyn CommandSource>>,
}

impl ScanProducer<MonotonicClock> {
    /// A producer paced by the system monotonic clock.
    pub fn new(config: &SimConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }
}

impl<C: PacingClock + 'static> ScanProducer<C> {
    /// A producer paced by `clock`.
    pub fn with_clock(config: &SimConfig, clock: C) -> Self {
        Self {
            schedule: config.schedule(),
            sequence_step: config.pacing.sequence_step,
            block_timeout: config.block_timeout(),
            poll_timeout: config.poll_timeout(),
            min_poll_interval: config.min_poll_interval(),
            default_length_secs: config.scan.default_length_secs,
            fifo_path: config.control_fifo_path(),
            channel_options: config.channel_options(),
            generator: PayloadGenerator::new(config.pacing.payload, config.pacing.noise_seed),
            clock: Some(clock),
            commands: None,
        }
    }

    /// Read commands from `source` instead of opening the control FIFO.
    #[must_use]
    pub fn with_command_source(mut self, source: impl CommandSource + 'static) -> Self {
        self.commands = Some(Box::new(source));
        self
    }

    fn seed_status(&self, table: &StatusTable) -> Result<(), StatusError> {
        let mut st = table.lock();
        st.put(status::SCANSTAT, ScanStatus::Off.as_str())?;
        st.put(STATUS_KEY, "init")?;
        if let Some(secs) = self.default_length_secs {
            if !st.contains(status::SCANLEN) {
                st.put(status::SCANLEN, secs)?;
            }
        }
        Ok(())
    }

    /// How long to wait for a command in the current state.
    fn command_timeout(&self, scan: &ScanStateMachine) -> Duration {
        match scan.status() {
            ScanStatus::Scanning => Duration::ZERO,
            ScanStatus::Off => self.poll_timeout,
            ScanStatus::Committed => {
                let until_start = scan
                    .start_time()
                    .and_then(Dmjd::to_datetime)
                    .and_then(|start| (start - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                until_start
                    .min(self.poll_timeout)
                    .max(self.min_poll_interval)
            }
        }
    }

    fn report(
        &self,
        transition: &Transition,
        scan: &ScanStateMachine,
        pacer: &BlockPacer<C>,
        table: &StatusTable,
    ) {
        match transition {
            Transition::None | Transition::Quit => return,
            Transition::Committed {
                scan_number,
                start_time,
                duration_secs,
                blocks_required,
            } => {
                info!(
                    scan = scan_number,
                    start = %start_time,
                    duration_secs,
                    blocks_required,
                    interval_ns = self.schedule.interval_ns(),
                    "Scan committed"
                );
                table.publish(status::OVERRUNS, 0_i64);
            }
            Transition::Rejected(reason) => {
                warn!(%reason, status = %scan.status(), "START rejected");
            }
            Transition::Ignored { command, status } => {
                info!(%command, %status, "Command has no effect in this state");
            }
            Transition::Started { scan_number } => {
                info!(scan = scan_number, "Scan started");
            }
            Transition::Stopped {
                scan_number,
                previous,
                blocks_written,
            } => {
                info!(scan = scan_number, %previous, blocks_written, "Scan stopped");
            }
            Transition::Completed {
                scan_number,
                blocks_written,
                duration_secs,
            } => {
                let elapsed_ns = pacer.elapsed_ns();
                let stats = pacer.stats();
                let mean_deviation_ns = if *blocks_written > 0 {
                    elapsed_ns as f64 / *blocks_written as f64 - pacer.interval_ns() as f64
                } else {
                    0.0
                };
                info!(
                    scan = scan_number,
                    blocks_written,
                    requested_secs = duration_secs,
                    actual_secs = elapsed_ns as f64 / 1e9,
                    mean_deviation_ns,
                    overruns = stats.overruns,
                    max_overrun_ns = stats.max_overrun_ns,
                    "Scan complete"
                );
            }
        }
        scan.publish(table);
    }
}

impl<C: PacingClock + 'static> Stage for ScanProducer<C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn status_key(&self) -> &'static str {
        STATUS_KEY
    }

    fn role(&self) -> StageRole {
        StageRole::Producer
    }

    fn init(&mut self, ctx: &StageContext) -> AppResult<()> {
        if self.commands.is_none() {
            let channel = CommandChannel::open(&self.fifo_path, self.channel_options)?;
            self.commands = Some(Box::new(channel));
        }

        self.seed_status(&ctx.status)
            .map_err(|e| SimError::stage(NAME, e.to_string()))
    }

    fn run(&mut self, ctx: &StageContext) -> AppResult<()> {
        let mut commands = self
            .commands
            .take()
            .ok_or_else(|| SimError::stage(NAME, "run called before init"))?;
        let pacing_clock = self
            .clock
            .take()
            .ok_or_else(|| SimError::stage(NAME, "stage already ran"))?;

        let mut scan = ScanStateMachine::new(self.schedule, self.sequence_step);
        let mut pacer = BlockPacer::new(pacing_clock, self.schedule.interval_ns());
        let mut client = ProducerClient::new(
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.status),
            STATUS_KEY,
            self.block_timeout,
            ctx.shutdown.clone(),
        );
        scan.publish(&ctx.status);

        loop {
            if let Some(command) = commands.poll(self.command_timeout(&scan)) {
                debug!(%command, status = %scan.status(), "Command received");
                let request = ScanRequest::read(&ctx.status);
                let transition = scan.handle_command(command, &request);
                if transition == Transition::Quit {
                    info!("QUIT received");
                    ctx.shutdown.trigger();
                    break;
                }
                self.report(&transition, &scan, &pacer, &ctx.status);
            }

            let transition = scan.tick(clock::now());
            if matches!(transition, Transition::Started { .. }) {
                pacer.start();
            }
            self.report(&transition, &scan, &pacer, &ctx.status);

            match scan.next_block() {
                Some(ticket) => {
                    let mut free = match client.acquire()? {
                        Acquired::Block(free) => free,
                        Acquired::Cancelled => break,
                    };
                    ctx.status.publish(STATUS_KEY, "writing");
                    let block = free.block_mut();
                    block.header = header_for(&ticket);
                    self.generator
                        .fill(ticket.sequence_number, &mut block.payload);
                    client.publish(free);
                    scan.record_block();

                    ctx.status.publish(STATUS_KEY, "sending");
                    ctx.status
                        .publish(status::BLKWRTN, scan.blocks_written() as i64);
                    if pacer.pace().is_some() {
                        ctx.status
                            .publish(status::OVERRUNS, pacer.stats().overruns as i64);
                    }
                }
                None => ctx.status.publish(STATUS_KEY, "waiting"),
            }

            if ctx.shutdown.is_triggered() {
                break;
            }
        }

        ctx.status.publish(STATUS_KEY, "stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandChannel};
    use crate::pipeline::ShutdownSignal;
    use crate::ring::{BlockRing, ConsumerClient};
    use crate::scan::ManualClock;
    use tracing_test::traced_test;

    #[test]
    fn ramp_matches_block_layout() {
        assert_eq!(ramp_value(0, 0), 0);
        assert_eq!(ramp_value(0, 39), 39);
        assert_eq!(ramp_value(2, 5), 85);
        // Wraps rather than panicking.
        let _ = ramp_value(u64::MAX, 39);
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let mut a = PayloadGenerator::new(PayloadPattern::Noise, Some(42));
        let mut b = PayloadGenerator::new(PayloadPattern::Noise, Some(42));
        let (mut pa, mut pb) = ([0; PAYLOAD_LEN], [0; PAYLOAD_LEN]);
        a.fill(0, &mut pa);
        b.fill(0, &mut pb);
        assert_eq!(pa, pb);
        assert_ne!(pa, [0; PAYLOAD_LEN]);
    }

    fn context(dir: &tempfile::TempDir, config: &SimConfig) -> StageContext {
        StageContext {
            config: Arc::new(config.clone()),
            status: Arc::new(StatusTable::new()),
            ring: Arc::new(BlockRing::create(&dir.path().join("ring"), 2).unwrap()),
            shutdown: ShutdownSignal::new(),
        }
    }

    #[test]
    fn init_seeds_status_without_clobbering_scan_length() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimConfig::default();
        let ctx = context(&dir, &config);
        ctx.status.publish(status::SCANLEN, 12_i64);

        let (_tx, channel) = CommandChannel::detached();
        let mut producer =
            ScanProducer::with_clock(&config, ManualClock::new()).with_command_source(channel);
        producer.init(&ctx).unwrap();

        let st = ctx.status.lock();
        assert_eq!(st.get_str(status::SCANSTAT), Ok(Some("off")));
        assert_eq!(st.get_int(status::SCANLEN), Ok(Some(12)));
    }

    #[test]
    fn committed_poll_waits_no_longer_than_start() {
        let mut config = SimConfig::default();
        config.command.poll_timeout_ms = 1000;
        config.command.min_poll_interval_ms = 10;
        let producer = ScanProducer::with_clock(&config, ManualClock::new());

        let mut scan = ScanStateMachine::new(config.schedule(), 1);
        assert_eq!(producer.command_timeout(&scan), Duration::from_secs(1));

        // Start time already passed: clamp to the minimum poll interval.
        scan.handle_command(
            Command::Start,
            &ScanRequest {
                length_secs: Some(1),
                start_time: Some(40_000.0),
            },
        );
        assert_eq!(producer.command_timeout(&scan), Duration::from_millis(10));

        scan.tick(Dmjd(40_000.0));
        assert_eq!(producer.command_timeout(&scan), Duration::ZERO);
    }

    #[test]
    fn quit_stops_the_loop_and_signals_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimConfig::default();
        let ctx = context(&dir, &config);
        let (tx, channel) = CommandChannel::detached();
        let mut producer =
            ScanProducer::with_clock(&config, ManualClock::new()).with_command_source(channel);
        producer.init(&ctx).unwrap();
        assert!(tx.send(Command::Quit));
        producer.run(&ctx).unwrap();
        assert!(ctx.shutdown.is_triggered());
        assert_eq!(ctx.status.lock().get_str(STATUS_KEY), Ok(Some("stopped")));
    }

    #[traced_test]
    #[test]
    fn completed_scan_reports_timing_summary() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimConfig::default();
        let ctx = context(&dir, &config);
        ctx.status.publish(status::SCANLEN, 5_i64);
        ctx.status.publish(status::STRTDMJD, 40_000.0);

        let (tx, channel) = CommandChannel::detached();
        let mut producer =
            ScanProducer::with_clock(&config, ManualClock::new()).with_command_source(channel);
        producer.init(&ctx).unwrap();

        let drain = {
            let ctx = ctx.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                let mut client = ConsumerClient::new(
                    Arc::clone(&ctx.ring),
                    Arc::clone(&ctx.status),
                    "TESTSTAT",
                    Duration::from_millis(20),
                    ctx.shutdown.clone(),
                );
                let mut headers = Vec::new();
                let mut quit_sent = false;
                loop {
                    let acquired = client
                        .acquire_with(|| {
                            let off =
                                ctx.status.lock().get_str(status::SCANSTAT) == Ok(Some("off"));
                            if headers.len() == 1250 && off && !quit_sent {
                                quit_sent = tx.send(Command::Quit);
                            }
                        })
                        .unwrap();
                    let Acquired::Block(filled) = acquired else {
                        break;
                    };
                    headers.push(filled.block().header);
                    client.release(filled);
                }
                headers
            })
        };

        assert!(tx.send(Command::Start));
        producer.run(&ctx).unwrap();
        let headers = drain.join().unwrap();

        assert_eq!(headers.len(), 1250);
        assert!(headers
            .iter()
            .all(|h| h.scan_number == 1 && h.blocks_required == 1250 && h.duration_secs == 5));
        assert!(logs_contain("Scan complete"));
        assert!(logs_contain("requested_secs=5"));
        assert!(logs_contain("blocks_written=1250"));
        assert!(logs_contain("actual_secs=5"));
        assert!(logs_contain("mean_deviation_ns="));
        assert!(logs_contain("overruns=0"));
        assert!(logs_contain("max_overrun_ns=0"));
    }
}
