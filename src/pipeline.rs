use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::cleanup::CleanupRegistry;
use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::lockfile::LockManager;
use crate::manifest::{RunManifest, RunStatus, kb_to_gb};
use crate::monitor::{ActiveProcess, CommandResult, ProcessMonitor};
use crate::observability::{MetricsCollector, MetricsSnapshot, log_snapshot};
use crate::runner::{CommandJournal, CommandRunner, Step, StepResult};
use crate::signals::{Signal, SignalListener};

/// State shared between the manager and its signal listener.
pub struct RunContext {
    manifest: Mutex<RunManifest>,
    active: ActiveProcess,
    kill_grace: Duration,
    exit_on_signal: bool,
}

impl RunContext {
    fn manifest(&self) -> MutexGuard<'_, RunManifest> {
        self.manifest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> RunStatus {
        self.manifest().status()
    }

    /// Interruption path: stop the running tree, flush the final status and,
    /// unless embedded, exit the process.
    pub fn handle_signal(&self, signal: Signal) {
        let status = if signal.is_pause() {
            RunStatus::Paused
        } else {
            RunStatus::Failed
        };
        self.active.cancel(signal.name(), self.kill_grace);
        {
            let mut manifest = self.manifest();
            if !manifest.status().is_final()
                && let Err(err) = manifest.finalize(status)
            {
                error!(error = %err, "Failed to flush manifest after signal");
            }
        }
        warn!(
            signal = signal.name(),
            status = status.as_str(),
            "Pipeline interrupted; locks left in place for recovery"
        );
        if self.exit_on_signal {
            std::process::exit(signal.exit_code());
        }
    }
}

impl CommandJournal for RunContext {
    fn command_started(&self, label: &str, command: &str) {
        if let Err(err) = self.manifest().append_command(label, command) {
            warn!(error = %err, "Failed to log command");
        }
    }

    fn command_finished(&self, label: &str, result: &CommandResult) {
        if let Err(err) = self.manifest().append_profile(label, result) {
            warn!(error = %err, "Failed to write profile entry");
        }
    }
}

/// Facade owning one pipeline run.
pub struct PipelineManager {
    context: Arc<RunContext>,
    runner: CommandRunner,
    metrics: MetricsCollector,
    cleanup: CleanupRegistry,
    config: RunConfig,
    output_dir: PathBuf,
    started: Instant,
    stopped: bool,
    _signals: Option<SignalListener>,
}

impl PipelineManager {
    pub fn new(
        name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        config: RunConfig,
    ) -> Result<Self> {
        let name = name.into();
        let output_dir = output_dir.into();
        let manifest = RunManifest::open(&output_dir, &name)?;

        let active = ActiveProcess::new();
        let context = Arc::new(RunContext {
            manifest: Mutex::new(manifest),
            active: active.clone(),
            kill_grace: config.kill_grace(),
            exit_on_signal: config.exit_on_signal,
        });

        let checkpoints = CheckpointStore::new(&output_dir, &name);
        if config.new_start {
            let cleared = checkpoints.clear_all()?;
            info!(cleared, "New start requested; cleared checkpoints");
        }
        let locks = LockManager::new(&output_dir, &name, config.recover);
        let runner = CommandRunner::new(
            ProcessMonitor::new(&config, active),
            checkpoints,
            locks,
            config.new_start,
        )
        .with_journal(context.clone());

        let signals = if config.handle_signals {
            let ctx = Arc::clone(&context);
            Some(SignalListener::install(move |signal| ctx.handle_signal(signal))?)
        } else {
            None
        };

        info!(
            name = name.as_str(),
            output_dir = %output_dir.display(),
            "Pipeline started"
        );

        Ok(Self {
            context,
            runner,
            metrics: MetricsCollector::new(),
            cleanup: CleanupRegistry::new(),
            config,
            output_dir,
            started: Instant::now(),
            stopped: false,
            _signals: signals,
        })
    }

    pub fn name(&self) -> String {
        self.context.manifest().name().to_string()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn status(&self) -> RunStatus {
        self.context.status()
    }

    pub fn context(&self) -> Arc<RunContext> {
        Arc::clone(&self.context)
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        self.runner.checkpoints()
    }

    pub fn locks(&self) -> &LockManager {
        self.runner.locks()
    }

    /// Run one step; a fatal error marks the run failed before returning.
    pub fn run(&mut self, step: &Step) -> Result<StepResult> {
        let result = match self.runner.run(step) {
            Ok(result) => result,
            Err(err) => {
                self.fail_pipeline(&err);
                return Err(err);
            }
        };
        self.metrics.record_step(&result);
        let phase = format!("{} ({})", result.label, result.outcome.as_str());
        if let Err(err) = self.context.manifest().record_phase(&phase) {
            warn!(error = %err, "Failed to record phase");
        }

        if self.config.stop_after.as_deref() == Some(result.label.as_str()) {
            let label = result.label.clone();
            self.halt()?;
            return Err(PipelineError::Halted(label));
        }
        Ok(result)
    }

    /// Shorthand for a single-command step producing `target`.
    pub fn run_command(
        &mut self,
        command: &str,
        target: Option<&Path>,
        shell: Option<bool>,
    ) -> Result<StepResult> {
        let mut step = Step::new(command);
        step.shell = shell;
        if let Some(target) = target {
            step = step.target(target);
        }
        self.run(&step)
    }

    /// Run a command for its trimmed standard output. Always executes.
    pub fn check_and_capture(&mut self, command: &str, shell: Option<bool>) -> Result<String> {
        match self.runner.capture(command, shell) {
            Ok(output) => Ok(output),
            Err(err) => {
                self.fail_pipeline(&err);
                Err(err)
            }
        }
    }

    pub fn report_result(&self, key: &str, value: impl Display) -> Result<()> {
        let value = value.to_string();
        info!(key, value = value.as_str(), "Result");
        self.context.manifest().report_result(key, &value)
    }

    pub fn get_stat(&self, key: &str) -> Option<String> {
        self.context.manifest().get_stat(key).map(str::to_string)
    }

    /// Register a glob of intermediate files to remove on successful stop.
    pub fn clean_add(&mut self, pattern: impl Into<String>) -> Result<()> {
        self.cleanup.add(pattern)
    }

    /// Same handling as a received signal; used when embedding.
    pub fn handle_signal(&self, signal: Signal) {
        self.context.handle_signal(signal);
    }

    /// Stop early with status `paused`; completed steps stay checkpointed.
    pub fn halt(&mut self) -> Result<()> {
        self.finish(RunStatus::Paused)?;
        info!("Pipeline paused");
        Ok(())
    }

    pub fn fail_pipeline(&mut self, err: &PipelineError) {
        let status = match err {
            PipelineError::Halted(_) => return,
            PipelineError::Interrupted { signal } if signal == Signal::Pause.name() => {
                RunStatus::Paused
            }
            _ => RunStatus::Failed,
        };
        self.metrics.record_failure();
        error!(error = %err, "Pipeline failed");
        if let Err(flush) = self.finish(status) {
            error!(error = %flush, "Failed to flush manifest");
        }
    }

    /// Report timing, run cleanup and mark the run completed.
    pub fn stop_pipeline(&mut self) -> Result<MetricsSnapshot> {
        let status = self.status();
        if status.is_final() {
            warn!(status = status.as_str(), "Pipeline already finalized");
            self.stopped = true;
            return Ok(self.metrics.snapshot());
        }
        let elapsed = self.started.elapsed();
        self.metrics.record_total_duration(elapsed);
        let snapshot = self.metrics.snapshot();

        self.report_result("Time", format_elapsed(elapsed))?;
        self.report_result(
            "Peak_memory_GB",
            format!("{:.4}", kb_to_gb(snapshot.peak_memory_kb)),
        )?;
        self.report_result("Success", chrono::Utc::now().to_rfc3339())?;

        if !self.cleanup.is_empty() {
            if self.config.dirty {
                let script = self
                    .output_dir
                    .join(format!("{}_cleanup.sh", self.name()));
                self.cleanup.write_script(&script)?;
                info!(script = %script.display(), "Dirty mode: cleanup deferred to script");
            } else {
                let removed = self.cleanup.remove_matches();
                info!(removed, "Removed intermediate files");
            }
        }

        self.finish(RunStatus::Completed)?;
        log_snapshot(&snapshot);
        info!(elapsed_s = elapsed.as_secs_f64(), "Pipeline completed");
        Ok(snapshot)
    }

    /// Finalize once; a status set by a signal or failure is never overwritten.
    fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.stopped = true;
        let mut manifest = self.context.manifest();
        if manifest.status().is_final() {
            return Ok(());
        }
        manifest.finalize(status)
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        let mut manifest = self.context.manifest();
        if !manifest.status().is_final() {
            warn!("Pipeline dropped without stop_pipeline; marking failed");
            if let Err(err) = manifest.finalize(RunStatus::Failed) {
                error!(error = %err, "Failed to flush manifest");
            }
        }
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
