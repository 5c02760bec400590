//! Stage hosting: registry, lifecycle and shutdown.
//!
//! A pipeline is one producer stage and one consumer stage sharing a block
//! ring and a status table. Stages are built by name from a [`StageRegistry`]
//! whose factories are registered by explicit calls, initialised in order on
//! the calling thread, then each run on its own named OS thread.
//!
//! A stage that returns an error takes the whole pipeline down: the host
//! triggers the shared [`ShutdownSignal`], the other stages notice it at their
//! next cancellation point, and [`RunningPipeline::join`] reports the first
//! failure.

pub mod monitor;
pub mod producer;
pub mod writer;

pub use monitor::BlockMonitor;
pub use producer::{PayloadGenerator, ScanProducer};
pub use writer::ScanWriter;

use crate::config::SimConfig;
use crate::error::{AppResult, SimError};
use crate::ring::BlockRing;
use crate::status::StatusTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Cooperative cancellation flag shared by every stage.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Which side of the ring a stage drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    /// Fills blocks.
    Producer,
    /// Drains blocks.
    Consumer,
}

/// Shared resources handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    /// Validated configuration.
    pub config: Arc<SimConfig>,
    /// Process-wide status table.
    pub status: Arc<StatusTable>,
    /// The block ring.
    pub ring: Arc<BlockRing>,
    /// Pipeline-wide cancellation.
    pub shutdown: ShutdownSignal,
}

/// A pipeline stage.
pub trait Stage: Send {
    /// Registry name, also used as the thread name.
    fn name(&self) -> &'static str;

    /// Status key this stage publishes its loop phase under.
    fn status_key(&self) -> &'static str;

    /// Ring side.
    fn role(&self) -> StageRole;

    /// One-time setup on the host thread. An error aborts pipeline start.
    fn init(&mut self, ctx: &StageContext) -> AppResult<()>;

    /// The stage loop. Returns when shutdown is requested or on a fatal error.
    fn run(&mut self, ctx: &StageContext) -> AppResult<()>;
}

type StageFactory = Box<dyn Fn(&SimConfig) -> AppResult<Box<dyn Stage>> + Send + Sync>;

/// Named stage factories.
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    /// A registry holding the built-in stages.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(producer::NAME, |config| {
            Ok(Box::new(ScanProducer::new(config)))
        });
        registry.register(writer::NAME, |config| Ok(Box::new(ScanWriter::new(config))));
        registry.register(monitor::NAME, |config| Ok(Box::new(BlockMonitor::new(config))));
        registry
    }

    /// A registry with no stages.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add or replace the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&SimConfig) -> AppResult<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Build the stage registered as `name`.
    pub fn create(&self, name: &str, config: &SimConfig) -> AppResult<Box<dyn Stage>> {
        self.factories
            .get(name)
            .ok_or_else(|| SimError::UnknownStage(name.to_string()))
            .and_then(|factory| factory(config))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// An assembled, not yet running pipeline.
pub struct Pipeline {
    ctx: StageContext,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Build the stages named in `config.pipeline.stages`.
    pub fn from_config(config: SimConfig, registry: &StageRegistry) -> AppResult<Self> {
        let stages = config
            .pipeline
            .stages
            .iter()
            .map(|name| registry.create(name, &config))
            .collect::<AppResult<Vec<_>>>()?;
        Self::with_stages(config, stages)
    }

    /// Assemble from already-built stages.
    ///
    /// Creates the ring at `config.ring_path()` and a fresh status table.
    pub fn with_stages(config: SimConfig, stages: Vec<Box<dyn Stage>>) -> AppResult<Self> {
        config.validate()?;
        check_roles(&stages)?;

        let ring_path = config.ring_path();
        let ring = BlockRing::create(&ring_path, config.ring.num_blocks)?;
        info!(
            path = %ring_path.display(),
            blocks = config.ring.num_blocks,
            "Block ring created"
        );

        Ok(Self {
            ctx: StageContext {
                config: Arc::new(config),
                status: Arc::new(StatusTable::new()),
                ring: Arc::new(ring),
                shutdown: ShutdownSignal::new(),
            },
            stages,
        })
    }

    /// The status table the stages will share.
    pub fn status(&self) -> Arc<StatusTable> {
        Arc::clone(&self.ctx.status)
    }

    /// The pipeline's shutdown signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    /// Initialise every stage, then start each on its own thread.
    pub fn start(self) -> AppResult<RunningPipeline> {
        let Pipeline { ctx, mut stages } = self;

        for stage in &mut stages {
            stage.init(&ctx).map_err(|err| {
                error!(stage = stage.name(), error = %err, "Stage initialisation failed");
                err
            })?;
        }

        let mut running = RunningPipeline {
            handles: Vec::with_capacity(stages.len()),
            ctx: ctx.clone(),
        };
        for mut stage in stages {
            let name = stage.name();
            let stage_ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    info!(key = stage.status_key(), "Stage running");
                    let result = stage.run(&stage_ctx);
                    match &result {
                        Ok(()) => info!("Stage stopped"),
                        Err(err) => {
                            error!(error = %err, "Stage failed; shutting down pipeline");
                            stage_ctx.shutdown.trigger();
                        }
                    }
                    result
                });
            match spawned {
                Ok(handle) => running.handles.push((name, handle)),
                Err(err) => {
                    running.shutdown();
                    // Reap what did start before reporting.
                    let _ = running.join();
                    return Err(SimError::stage(name, format!("failed to spawn thread: {err}")));
                }
            }
        }
        Ok(running)
    }
}

fn check_roles(stages: &[Box<dyn Stage>]) -> AppResult<()> {
    let count = |role| stages.iter().filter(|s| s.role() == role).count();
    let producers = count(StageRole::Producer);
    let consumers = count(StageRole::Consumer);
    if producers != 1 || consumers != 1 {
        return Err(SimError::stage(
            "pipeline",
            format!(
                "a ring needs exactly one producer and one consumer, got {producers} and {consumers}"
            ),
        ));
    }
    Ok(())
}

/// Handle to started stage threads.
pub struct RunningPipeline {
    handles: Vec<(&'static str, JoinHandle<AppResult<()>>)>,
    ctx: StageContext,
}

impl RunningPipeline {
    /// The shared status table.
    pub fn status(&self) -> Arc<StatusTable> {
        Arc::clone(&self.ctx.status)
    }

    /// The shared shutdown signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    /// Ask every stage to stop.
    pub fn shutdown(&self) {
        self.ctx.shutdown.trigger();
    }

    /// Whether every stage thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Wait for every stage and return the first failure.
    pub fn join(self) -> AppResult<()> {
        let mut first_error = None;
        for (name, handle) in self.handles {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(SimError::stage(name, "thread panicked")));
            if let Err(err) = result {
                self.ctx.shutdown.trigger();
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Idle {
        role: StageRole,
        fail_init: bool,
    }

    impl Stage for Idle {
        fn name(&self) -> &'static str {
            "idle"
        }
        fn status_key(&self) -> &'static str {
            "IDLESTAT"
        }
        fn role(&self) -> StageRole {
            self.role
        }
        fn init(&mut self, _ctx: &StageContext) -> AppResult<()> {
            if self.fail_init {
                Err(SimError::stage("idle", "no hardware"))
            } else {
                Ok(())
            }
        }
        fn run(&mut self, ctx: &StageContext) -> AppResult<()> {
            if self.role == StageRole::Consumer {
                return Err(SimError::stage("idle", "disk on fire"));
            }
            while !ctx.shutdown.is_triggered() {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            Ok(())
        }
    }

    fn idle(role: StageRole) -> Box<dyn Stage> {
        Box::new(Idle {
            role,
            fail_init: false,
        })
    }

    fn config(dir: &tempfile::TempDir) -> SimConfig {
        let mut config = SimConfig::default();
        config.ring.path = Some(dir.path().join("ring"));
        config.command.fifo_dir = dir.path().to_path_buf();
        config.storage.output_dir = dir.path().join("out");
        config
    }

    #[test]
    fn registry_knows_builtin_stages() {
        let registry = StageRegistry::new();
        assert_eq!(
            registry.names(),
            vec!["block_monitor", "scan_producer", "scan_writer"]
        );
        let stage = registry
            .create("scan_writer", &SimConfig::default())
            .unwrap();
        assert_eq!(stage.role(), StageRole::Consumer);
        assert_eq!(stage.status_key(), "DISKSTAT");
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let registry = StageRegistry::empty();
        assert!(matches!(
            registry.create("fits_writer", &SimConfig::default()),
            Err(SimError::UnknownStage(name)) if name == "fits_writer"
        ));
    }

    #[test]
    fn registered_factories_replace_builtins() {
        let mut registry = StageRegistry::new();
        registry.register("scan_writer", |_| Ok(idle(StageRole::Consumer)));
        let stage = registry
            .create("scan_writer", &SimConfig::default())
            .unwrap();
        assert_eq!(stage.name(), "idle");
    }

    #[test]
    fn pipeline_requires_one_producer_and_one_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let result = Pipeline::with_stages(
            config(&dir),
            vec![idle(StageRole::Producer), idle(StageRole::Producer)],
        );
        assert!(matches!(result, Err(SimError::Stage { .. })));
    }

    #[test]
    fn init_failure_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::with_stages(
            config(&dir),
            vec![
                Box::new(Idle {
                    role: StageRole::Producer,
                    fail_init: true,
                }),
                idle(StageRole::Consumer),
            ],
        )
        .unwrap();
        assert!(pipeline.start().is_err());
    }

    #[test]
    fn failing_stage_shuts_down_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::with_stages(
            config(&dir),
            vec![idle(StageRole::Producer), idle(StageRole::Consumer)],
        )
        .unwrap();
        let shutdown = pipeline.shutdown_signal();
        let running = pipeline.start().unwrap();
        let err = running.join().unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn ring_is_created_at_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let ring_path: PathBuf = config.ring_path();
        let _pipeline = Pipeline::with_stages(
            config,
            vec![idle(StageRole::Producer), idle(StageRole::Consumer)],
        )
        .unwrap();
        assert!(BlockRing::open(&ring_path).is_ok());
    }
}
