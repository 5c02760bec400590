//! CLI entry point for the scan simulator.
//!
//! ```bash
//! # Run the simulator, seeding a 5 s scan starting 3 s from now, and start it.
//! daq-scan-sim run --scan-length 5 --start-in 3 --start
//!
//! # From another terminal
//! daq-scan-sim send stop
//! daq-scan-sim send quit
//!
//! # DMJD for a calendar time
//! daq-scan-sim dmjd --start-time 15:05:12:15:07:00
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_scan_sim::clock::{self, Dmjd};
use daq_scan_sim::command::{self, Command};
use daq_scan_sim::config::{SimConfig, DEFAULT_CONFIG_PATH};
use daq_scan_sim::pipeline::ShutdownSignal;
use daq_scan_sim::status::{self, StatusTable, StatusValue};
use daq_scan_sim::{logging, Pipeline, StageRegistry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-scan-sim")]
#[command(about = "Scan-synchronized real-time block producer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulator until QUIT or Ctrl-C
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Seed SCANLEN (seconds)
        #[arg(long)]
        scan_length: Option<i64>,

        #[command(flatten)]
        when: StartTime,

        /// Issue START once the pipeline is up
        #[arg(long)]
        start: bool,
    },

    /// Send one command to a running simulator
    Send {
        /// START, STOP or QUIT (any case)
        command: Command,

        /// Configuration file (locates the control FIFO)
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Print the DMJD for now or for a given time
    Dmjd {
        #[command(flatten)]
        when: StartTime,
    },

    /// Print a status snapshot file
    Status {
        /// Snapshot written by `telemetry.snapshot_path`
        snapshot: PathBuf,
    },
}

#[derive(Args)]
struct StartTime {
    /// Seconds from now
    #[arg(long, conflicts_with = "start_time", allow_negative_numbers = true)]
    start_in: Option<i64>,

    /// Absolute UTC time as yy:mm:dd:HH:MM:SS
    #[arg(long)]
    start_time: Option<String>,
}

impl StartTime {
    fn resolve(&self) -> Result<Option<Dmjd>> {
        if let Some(secs) = self.start_in {
            return Ok(Some(clock::now().offset_secs(secs)));
        }
        self.start_time
            .as_deref()
            .map(|text| {
                Dmjd::from_calendar(text)
                    .with_context(|| format!("'{text}' is not a yy:mm:dd:HH:MM:SS time"))
            })
            .transpose()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            scan_length,
            when,
            start,
        } => run(&config, scan_length, when.resolve()?, start).await,
        Commands::Send { command, config } => {
            let config = load_config(&config)?;
            let path = config.control_fifo_path();
            command::send_command(&path, command)
                .with_context(|| format!("sending {command} to {}", path.display()))?;
            println!("{command} -> {}", path.display());
            Ok(())
        }
        Commands::Dmjd { when } => {
            println!("{}", when.resolve()?.unwrap_or_else(clock::now));
            Ok(())
        }
        Commands::Status { snapshot } => print_snapshot(&snapshot),
    }
}

fn load_config(path: &Path) -> Result<SimConfig> {
    let config = SimConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(
    config_path: &Path,
    scan_length: Option<i64>,
    start_time: Option<Dmjd>,
    start_now: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    logging::init_from_config(&config)?;
    info!(
        name = %config.application.name,
        instance = config.application.instance,
        stages = ?config.pipeline.stages,
        "Starting simulator"
    );

    let pipeline = Pipeline::from_config(config.clone(), &StageRegistry::new())
        .context("assembling pipeline")?;
    let table = pipeline.status();
    if let Some(secs) = scan_length {
        table.publish(status::SCANLEN, secs);
    }
    if let Some(start) = start_time {
        info!(%start, "Seeding scan start time");
        table.publish(status::STRTDMJD, start.value());
    }

    let running = pipeline.start().context("starting pipeline")?;
    let shutdown = running.shutdown_signal();

    if let Some(path) = config.telemetry.snapshot_path.clone() {
        let period = Duration::from_millis(config.telemetry.snapshot_interval_ms);
        tokio::spawn(write_snapshots(Arc::clone(&table), path, period, shutdown.clone()));
    }

    if start_now {
        command::send_command(&config.control_fifo_path(), Command::Start)
            .context("issuing initial START")?;
    }

    let mut join = tokio::task::spawn_blocking(move || running.join());
    let joined = tokio::select! {
        joined = &mut join => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            shutdown.trigger();
            join.await
        }
    };
    joined.context("pipeline join task failed")??;

    if let Some(path) = &config.telemetry.snapshot_path {
        table.write_snapshot(path)?;
    }
    info!("Simulator stopped");
    Ok(())
}

async fn write_snapshots(
    table: Arc<StatusTable>,
    path: PathBuf,
    period: Duration,
    shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(period);
    while !shutdown.is_triggered() {
        ticker.tick().await;
        if let Err(err) = table.write_snapshot(&path) {
            warn!(path = %path.display(), error = %err, "Failed to write status snapshot");
        }
    }
}

fn print_snapshot(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let entries: BTreeMap<String, StatusValue> =
        serde_json::from_str(&text).context("parsing status snapshot")?;
    for (key, value) in entries {
        println!("{key:<8} = {value}");
    }
    Ok(())
}
