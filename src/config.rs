//! Configuration loading using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`SimConfig::default()`)
//! 2. `config/default.toml`, or a file given on the command line
//! 3. Environment variables prefixed with `DAQ_SCAN_SIM_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use daq_scan_sim::config::SimConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // DAQ_SCAN_SIM_PACING__SAMPLE_RATE_HZ=2000 overrides the file value.
//! let config = SimConfig::load()?;
//! config.validate()?;
//! println!("interval: {} ns", config.schedule().interval_ns());
//! # Ok(())
//! # }
//! ```

use crate::command::{control_fifo_path, ChannelOptions};
use crate::error::{AppResult, SimError};
use crate::scan::PacingSchedule;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_SCAN_SIM_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Process-level settings.
    pub application: ApplicationConfig,
    /// Block cadence and contents.
    pub pacing: PacingConfig,
    /// Shared block ring.
    pub ring: RingConfig,
    /// Command channel.
    pub command: CommandConfig,
    /// Scan defaults.
    pub scan: ScanConfig,
    /// Scan output files.
    pub storage: StorageConfig,
    /// Status snapshots.
    pub telemetry: TelemetryConfig,
    /// Stages to run.
    pub pipeline: PipelineConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format (pretty, compact, json).
    pub log_format: String,
    /// Instance number, used to keep per-instance paths apart.
    pub instance: u32,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-scan-sim".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            instance: 0,
        }
    }
}

/// How payloads are filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadPattern {
    /// `payload[i] = sequence * PAYLOAD_LEN + i`.
    #[default]
    Ramp,
    /// Pseudo-random values.
    Noise,
}

/// Pacing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Simulated sample rate in Hz.
    pub sample_rate_hz: f64,
    /// Samples integrated into each block.
    pub integration_size: u32,
    /// Sequence number increment per block.
    pub sequence_step: u64,
    /// Payload contents.
    pub payload: PayloadPattern,
    /// Seed for the noise pattern; random when unset.
    pub noise_seed: Option<u64>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1000.0,
            integration_size: 4,
            sequence_step: 1,
            payload: PayloadPattern::Ramp,
            noise_seed: None,
        }
    }
}

/// Block ring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Number of block slots.
    pub num_blocks: usize,
    /// How long a single wait for a block may take before reporting `blocked`.
    pub block_timeout_ms: u64,
    /// Backing file; derived from the command directory when unset.
    pub path: Option<PathBuf>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            num_blocks: 2,
            block_timeout_ms: 100,
            path: None,
        }
    }
}

/// Command channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Directory holding the control FIFO.
    pub fifo_dir: PathBuf,
    /// User name in the FIFO name; `$USER` when unset.
    pub user: Option<String>,
    /// Longest wait for a command while idle.
    pub poll_timeout_ms: u64,
    /// Shortest wait for a command while committed.
    pub min_poll_interval_ms: u64,
    /// Also accept commands on standard input.
    pub console: bool,
    /// Create the FIFO if it does not exist.
    pub create_fifo: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            fifo_dir: PathBuf::from("/tmp"),
            user: None,
            poll_timeout_ms: 1000,
            min_poll_interval_ms: 10,
            console: false,
            create_fifo: true,
        }
    }
}

/// Scan defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// `SCANLEN` seeded at startup if nobody has set one.
    pub default_length_secs: Option<i64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            default_length_secs: Some(5),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for scan files.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Status snapshot configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// JSON file receiving periodic status snapshots.
    pub snapshot_path: Option<PathBuf>,
    /// Snapshot period.
    pub snapshot_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_ms: 1000,
        }
    }
}

/// Pipeline composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage names, looked up in the stage registry.
    pub stages: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: vec!["scan_producer".to_string(), "scan_writer".to_string()],
        }
    }
}

impl SimConfig {
    /// Load from `config/default.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file leaves the built-in defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The layered provider, exposed for callers that merge further sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SimConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check semantic constraints serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        if !(self.pacing.sample_rate_hz.is_finite() && self.pacing.sample_rate_hz > 0.0) {
            return Err(invalid(format!(
                "sample_rate_hz must be positive, got {}",
                self.pacing.sample_rate_hz
            )));
        }
        if self.pacing.integration_size == 0 {
            return Err(invalid("integration_size must be positive".into()));
        }
        if self.pacing.sequence_step == 0 {
            return Err(invalid("sequence_step must be positive".into()));
        }
        if self.schedule().interval_ns() == 0 {
            return Err(invalid("block interval rounds to zero nanoseconds".into()));
        }

        if self.ring.num_blocks < 2 {
            return Err(invalid(format!(
                "ring.num_blocks must be at least 2, got {}",
                self.ring.num_blocks
            )));
        }
        if self.ring.block_timeout_ms == 0 {
            return Err(invalid("ring.block_timeout_ms must be positive".into()));
        }

        if self.command.poll_timeout_ms == 0 || self.command.min_poll_interval_ms == 0 {
            return Err(invalid("command poll intervals must be positive".into()));
        }
        if self.command.min_poll_interval_ms > self.command.poll_timeout_ms {
            return Err(invalid(format!(
                "min_poll_interval_ms ({}) exceeds poll_timeout_ms ({})",
                self.command.min_poll_interval_ms, self.command.poll_timeout_ms
            )));
        }

        if self.telemetry.snapshot_interval_ms == 0 {
            return Err(invalid("telemetry.snapshot_interval_ms must be positive".into()));
        }
        if self.pipeline.stages.is_empty() {
            return Err(invalid("pipeline.stages must name at least one stage".into()));
        }

        Ok(())
    }

    /// Pacing schedule for these settings.
    pub fn schedule(&self) -> PacingSchedule {
        PacingSchedule::new(self.pacing.sample_rate_hz, self.pacing.integration_size)
    }

    /// User component of per-instance paths.
    pub fn user(&self) -> String {
        self.command
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "daq".to_string())
    }

    /// Path of this instance's control FIFO.
    pub fn control_fifo_path(&self) -> PathBuf {
        control_fifo_path(
            &self.command.fifo_dir,
            &self.user(),
            self.application.instance,
        )
    }

    /// Path of this instance's ring backing file.
    pub fn ring_path(&self) -> PathBuf {
        self.ring.path.clone().unwrap_or_else(|| {
            self.command.fifo_dir.join(format!(
                "{}_scan_ring_{}",
                self.user(),
                self.application.instance
            ))
        })
    }

    /// Command channel options.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            create: self.command.create_fifo,
            console: self.command.console,
        }
    }

    /// Wait per ring acquire attempt.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.ring.block_timeout_ms)
    }

    /// Command wait while idle.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.command.poll_timeout_ms)
    }

    /// Lower bound on command waits.
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command.min_poll_interval_ms)
    }
}

fn invalid(message: String) -> SimError {
    SimError::Configuration(message)
}
