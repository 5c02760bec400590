//! Absolute-deadline block pacing.
//!
//! The pacer never sleeps for a relative duration. It keeps a running deadline
//! that starts at the instant the scan begins and advances by exactly one
//! interval per block, then sleeps until that absolute instant. Time spent in
//! the loop body therefore does not accumulate as drift. A body that runs past
//! its deadline is reported as an overrun; the next deadline still advances by
//! one interval, so no block is skipped to catch up.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::warn;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point on the pacing clock, split like a `timespec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    /// Whole seconds.
    pub secs: i64,
    /// Nanoseconds within the second, `0..1_000_000_000`.
    pub nanos: i64,
}

impl Deadline {
    /// Build from a raw pair, normalising the nanosecond field.
    pub fn new(secs: i64, nanos: i64) -> Self {
        Self {
            secs: secs + nanos.div_euclid(NANOS_PER_SEC),
            nanos: nanos.rem_euclid(NANOS_PER_SEC),
        }
    }

    /// Advance by `interval_ns`, carrying into the seconds field.
    pub fn advance(&mut self, interval_ns: u64) {
        let interval = interval_ns as i64;
        self.secs += interval / NANOS_PER_SEC;
        self.nanos += interval % NANOS_PER_SEC;
        if self.nanos >= NANOS_PER_SEC {
            self.nanos -= NANOS_PER_SEC;
            self.secs += 1;
        }
    }

    /// Signed nanoseconds from `earlier` to `self`.
    pub fn nanos_since(&self, earlier: &Deadline) -> i128 {
        i128::from(self.secs - earlier.secs) * i128::from(NANOS_PER_SEC)
            + i128::from(self.nanos - earlier.nanos)
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.secs, self.nanos).cmp(&(other.secs, other.nanos))
    }
}

/// Monotonic time source with an absolute sleep.
pub trait PacingClock: Send {
    /// Current reading.
    fn now(&self) -> Deadline;

    /// Block until the clock reads at least `deadline`.
    fn sleep_until(&mut self, deadline: Deadline);
}

/// The system monotonic clock.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    #[cfg(not(target_os = "linux"))]
    origin: std::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Create a clock.
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "linux"))]
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(target_os = "linux")]
impl PacingClock for MonotonicClock {
    #[allow(unsafe_code)]
    fn now(&self) -> Deadline {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        Deadline::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    #[allow(unsafe_code)]
    fn sleep_until(&mut self, deadline: Deadline) {
        let ts = libc::timespec {
            tv_sec: deadline.secs as libc::time_t,
            tv_nsec: deadline.nanos as libc::c_long,
        };
        loop {
            // SAFETY: `ts` is a valid timespec; the remainder pointer may be
            // null for TIMER_ABSTIME sleeps.
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            if rc != libc::EINTR {
                break;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl PacingClock for MonotonicClock {
    fn now(&self) -> Deadline {
        let elapsed = self.origin.elapsed();
        Deadline::new(elapsed.as_secs() as i64, i64::from(elapsed.subsec_nanos()))
    }

    fn sleep_until(&mut self, deadline: Deadline) {
        let remaining = deadline.nanos_since(&self.now());
        if remaining > 0 {
            std::thread::sleep(std::time::Duration::from_nanos(remaining as u64));
        }
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Deadline,
    sleeps: Vec<Deadline>,
}

/// A synthetic clock that only moves when told to, or when slept on.
///
/// Clones share the same time line, so a test can keep one handle and give
/// another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// A clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward, as if work took `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.state.lock().now.advance(nanos);
    }

    /// Every deadline passed to `sleep_until`, in order.
    pub fn sleeps(&self) -> Vec<Deadline> {
        self.state.lock().sleeps.clone()
    }
}

impl PacingClock for ManualClock {
    fn now(&self) -> Deadline {
        self.state.lock().now
    }

    fn sleep_until(&mut self, deadline: Deadline) {
        let mut state = self.state.lock();
        state.sleeps.push(deadline);
        if deadline > state.now {
            state.now = deadline;
        }
    }
}

/// Timing statistics for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaceStats {
    /// Blocks paced.
    pub blocks: u64,
    /// Deadlines already passed when the loop reached them.
    pub overruns: u64,
    /// Largest overrun seen.
    pub max_overrun_ns: u64,
    /// Sum of all overruns.
    pub total_overrun_ns: u64,
}

/// Drives a loop at a fixed cadence against absolute deadlines.
pub struct BlockPacer<C: PacingClock> {
    clock: C,
    interval_ns: u64,
    origin: Option<Deadline>,
    next_deadline: Option<Deadline>,
    stats: PaceStats,
}

impl<C: PacingClock> BlockPacer<C> {
    /// Pacer emitting one block every `interval_ns`.
    pub fn new(clock: C, interval_ns: u64) -> Self {
        Self {
            clock,
            interval_ns,
            origin: None,
            next_deadline: None,
            stats: PaceStats::default(),
        }
    }

    /// Nominal interval.
    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    /// Capture the scan start instant and clear statistics.
    pub fn start(&mut self) {
        let now = self.clock.now();
        self.origin = Some(now);
        self.next_deadline = Some(now);
        self.stats = PaceStats::default();
    }

    /// Advance the deadline by one interval and sleep until it.
    ///
    /// Returns the overrun in nanoseconds when the deadline had already passed.
    pub fn pace(&mut self) -> Option<u64> {
        if self.next_deadline.is_none() {
            self.start();
        }
        let mut deadline = self.next_deadline.unwrap_or_default();
        deadline.advance(self.interval_ns);
        self.next_deadline = Some(deadline);
        self.stats.blocks += 1;

        let now = self.clock.now();
        let overrun = if now > deadline {
            let overrun_ns = now.nanos_since(&deadline) as u64;
            self.stats.overruns += 1;
            self.stats.total_overrun_ns += overrun_ns;
            self.stats.max_overrun_ns = self.stats.max_overrun_ns.max(overrun_ns);
            warn!(
                overrun_ns,
                block = self.stats.blocks,
                interval_ns = self.interval_ns,
                "Missed block deadline"
            );
            Some(overrun_ns)
        } else {
            None
        };

        self.clock.sleep_until(deadline);
        overrun
    }

    /// The deadline the last `pace` slept until.
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.next_deadline
    }

    /// Nanoseconds from `start` to now.
    pub fn elapsed_ns(&self) -> u64 {
        self.origin
            .map(|origin| self.clock.now().nanos_since(&origin).max(0) as u64)
            .unwrap_or(0)
    }

    /// Statistics since `start`.
    pub fn stats(&self) -> PaceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn advance_carries_into_seconds() {
        let mut d = Deadline::new(10, 999_000_000);
        d.advance(4_000_000);
        assert_eq!(d, Deadline::new(11, 3_000_000));

        let mut d = Deadline::new(0, 500);
        d.advance(2_500_000_000);
        assert_eq!(d, Deadline::new(2, 500_000_500));
    }

    #[test]
    fn new_normalises_nanos() {
        assert_eq!(Deadline::new(1, 1_500_000_000), Deadline { secs: 2, nanos: 500_000_000 });
        assert_eq!(Deadline::new(1, -1), Deadline { secs: 0, nanos: 999_999_999 });
    }

    #[test]
    fn first_deadline_is_one_interval_after_start() {
        let clock = ManualClock::new();
        clock.advance(7_000_000_000);
        let mut pacer = BlockPacer::new(clock.clone(), 4_000_000);
        pacer.start();
        assert_eq!(pacer.pace(), None);
        assert_eq!(clock.sleeps(), vec![Deadline::new(7, 4_000_000)]);
    }

    #[test]
    fn deadlines_stay_evenly_spaced_under_varying_work() {
        let clock = ManualClock::new();
        let mut pacer = BlockPacer::new(clock.clone(), 4_000_000);
        pacer.start();
        for work_ns in [100_000, 3_900_000, 0, 2_000_000, 1_234_567, 3_999_999] {
            clock.advance(work_ns);
            assert_eq!(pacer.pace(), None);
        }
        let sleeps = clock.sleeps();
        for (i, pair) in sleeps.windows(2).enumerate() {
            assert_eq!(pair[1].nanos_since(&pair[0]), 4_000_000, "gap {i}");
        }
        assert_eq!(sleeps[0].nanos_since(&Deadline::default()), 4_000_000);
        assert_eq!(pacer.stats().overruns, 0);
    }

    #[traced_test]
    #[test]
    fn overrun_is_reported_without_catching_up() {
        let clock = ManualClock::new();
        let mut pacer = BlockPacer::new(clock.clone(), 4_000_000);
        pacer.start();

        clock.advance(5_000_000);
        assert_eq!(pacer.pace(), Some(1_000_000));
        // The next deadline is still one interval later, not skipped ahead.
        clock.advance(1_000_000);
        assert_eq!(pacer.pace(), None);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps[0], Deadline::new(0, 4_000_000));
        assert_eq!(sleeps[1], Deadline::new(0, 8_000_000));

        let stats = pacer.stats();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.max_overrun_ns, 1_000_000);
        assert!(logs_contain("Missed block deadline"));
        assert!(logs_contain("overrun_ns=1000000"));
    }

    #[test]
    fn start_resets_statistics() {
        let clock = ManualClock::new();
        let mut pacer = BlockPacer::new(clock.clone(), 1_000);
        pacer.start();
        clock.advance(10_000);
        pacer.pace();
        assert_eq!(pacer.stats().overruns, 1);
        pacer.start();
        assert_eq!(pacer.stats(), PaceStats::default());
    }

    #[test]
    fn elapsed_tracks_scan_time() {
        let clock = ManualClock::new();
        let mut pacer = BlockPacer::new(clock.clone(), 2_000_000);
        assert_eq!(pacer.elapsed_ns(), 0);
        pacer.start();
        for _ in 0..5 {
            pacer.pace();
        }
        assert_eq!(pacer.elapsed_ns(), 10_000_000);
    }

    #[test]
    fn monotonic_clock_sleeps_to_absolute_deadline() {
        let mut clock = MonotonicClock::new();
        let mut target = clock.now();
        target.advance(2_000_000);
        clock.sleep_until(target);
        assert!(clock.now() >= target);
    }
}
