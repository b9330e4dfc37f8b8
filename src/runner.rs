use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{PipelineError, Result};
use crate::lockfile::{LockAcquisition, LockManager};
use crate::monitor::{CommandResult, CommandSpec, ProcessMonitor};

/// One pipeline stage: a group of commands and the files they produce.
#[derive(Debug, Clone, Default)]
pub struct Step {
    pub label: Option<String>,
    pub commands: Vec<String>,
    pub targets: Vec<PathBuf>,
    /// `None` picks the shell only when the command needs one.
    pub shell: Option<bool>,
    pub nofail: bool,
    /// Skip target-less steps whose checkpoint exists.
    pub checkpoint: bool,
}

impl Step {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            commands: vec![command.into()],
            ..Self::default()
        }
    }

    pub fn group<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn target(mut self, path: impl Into<PathBuf>) -> Self {
        self.targets.push(path.into());
        self
    }

    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn nofail(mut self) -> Self {
        self.nofail = true;
        self
    }

    pub fn checkpointed(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Explicit label, else the first target's path relative to `base`,
    /// else a digest of the commands.
    pub fn resolved_label(&self, base: &Path) -> String {
        if let Some(label) = self.label.as_ref().filter(|l| !l.trim().is_empty()) {
            return label.clone();
        }
        if let Some(target) = self.targets.first() {
            let relative = target.strip_prefix(base).unwrap_or(target);
            let name = relative.to_string_lossy();
            if !name.is_empty() {
                return name.into_owned();
            }
        }
        let mut hasher = Sha256::new();
        for command in &self.commands {
            hasher.update(command.as_bytes());
            hasher.update([0u8]);
        }
        let digest = format!("{:x}", hasher.finalize());
        format!("cmd-{}", &digest[..12])
    }

    fn is_guarded(&self) -> bool {
        !self.targets.is_empty() || self.checkpoint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Executed,
    Skipped,
    /// Executed after clearing a lock left by an interrupted attempt.
    Recovered,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Executed => "executed",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub label: String,
    pub outcome: StepOutcome,
    pub exit_code: i32,
    pub elapsed: Duration,
    pub peak_memory_kb: u64,
    pub commands: Vec<CommandResult>,
}

impl StepResult {
    fn skipped(label: String) -> Self {
        Self {
            label,
            outcome: StepOutcome::Skipped,
            exit_code: 0,
            elapsed: Duration::ZERO,
            peak_memory_kb: 0,
            commands: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.outcome == StepOutcome::Skipped
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What the file system says about a step before it runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepState {
    pub has_targets: bool,
    pub all_targets_exist: bool,
    pub lock_present: bool,
    pub checkpoint_mode: bool,
    pub checkpoint_done: bool,
    pub new_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Skip,
    RecoverAndRun,
    Run,
}

pub fn decide(state: &StepState) -> StepDecision {
    if state.lock_present {
        return StepDecision::RecoverAndRun;
    }
    if state.new_start {
        return StepDecision::Run;
    }
    let complete = if state.has_targets {
        state.all_targets_exist
    } else {
        state.checkpoint_mode && state.checkpoint_done
    };
    if complete {
        StepDecision::Skip
    } else {
        StepDecision::Run
    }
}

/// Receives every command the runner executes.
pub trait CommandJournal: Send + Sync {
    fn command_started(&self, label: &str, command: &str);
    fn command_finished(&self, label: &str, result: &CommandResult);
}

pub struct CommandRunner {
    monitor: ProcessMonitor,
    checkpoints: CheckpointStore,
    locks: LockManager,
    new_start: bool,
    journal: Option<Arc<dyn CommandJournal>>,
}

impl CommandRunner {
    pub fn new(
        monitor: ProcessMonitor,
        checkpoints: CheckpointStore,
        locks: LockManager,
        new_start: bool,
    ) -> Self {
        Self {
            monitor,
            checkpoints,
            locks,
            new_start,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn CommandJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn observe(&self, step: &Step, label: &str) -> StepState {
        StepState {
            has_targets: !step.targets.is_empty(),
            all_targets_exist: step.targets.iter().all(|t| t.exists()),
            lock_present: step.is_guarded() && self.locks.is_locked(label),
            checkpoint_mode: step.checkpoint,
            checkpoint_done: self.checkpoints.is_done(label),
            new_start: self.new_start,
        }
    }

    #[instrument(skip(self, step), fields(label = tracing::field::Empty))]
    pub fn run(&self, step: &Step) -> Result<StepResult> {
        self.check_cancelled()?;
        let label = step.resolved_label(self.checkpoints.directory());
        tracing::Span::current().record("label", label.as_str());
        if step.commands.is_empty() {
            return Err(PipelineError::Parse {
                command: String::new(),
                reason: format!("step '{label}' has no commands"),
            });
        }

        let mut outcome = StepOutcome::Executed;
        match decide(&self.observe(step, &label)) {
            StepDecision::Skip => {
                info!(label = label.as_str(), "Target exists, skipping step");
                return Ok(StepResult::skipped(label));
            }
            StepDecision::RecoverAndRun => outcome = StepOutcome::Recovered,
            StepDecision::Run => {}
        }

        if step.is_guarded() {
            if let LockAcquisition::RecoveredStale(previous) =
                self.locks.acquire(&label, &step.commands)?
            {
                warn!(
                    label = label.as_str(),
                    previous_pid = previous.as_ref().map(|l| l.pid),
                    "Recovered stale lock from an interrupted run; rerunning step"
                );
                outcome = StepOutcome::Recovered;
            }
            self.checkpoints.clear(&label)?;
            for target in &step.targets {
                discard_target(target)?;
            }
        }

        info!(label = label.as_str(), commands = step.commands.len(), "Running step");
        let started = Instant::now();
        let deadline = self.monitor.timeout().map(|limit| started + limit);
        let mut results: Vec<CommandResult> = Vec::with_capacity(step.commands.len());
        for (index, command) in step.commands.iter().enumerate() {
            let spec = CommandSpec::new(command.clone(), step.shell).until(deadline);
            if let Some(journal) = &self.journal {
                journal.command_started(&label, command);
            }
            let result = self.monitor.execute(&spec)?;
            if let Some(journal) = &self.journal {
                journal.command_finished(&label, &result);
            }
            self.check_cancelled()?;

            let failed = !result.success();
            let (code, timed_out) = (result.exit_code, result.timed_out);
            results.push(result);
            if !failed {
                continue;
            }
            if step.nofail {
                warn!(label = label.as_str(), index, code, "Command failed; continuing (nofail)");
                if step.is_guarded() {
                    for target in &step.targets {
                        discard_target(target)?;
                    }
                    self.locks.release(&label)?;
                }
                return Ok(build_result(label, outcome, code.max(1), started, results));
            }
            if timed_out {
                return Err(PipelineError::Timeout {
                    label,
                    command: command.clone(),
                    limit: self.monitor.timeout().unwrap_or_default(),
                });
            }
            return Err(PipelineError::StepExecution {
                label,
                index,
                command: command.clone(),
                code,
            });
        }

        if step.is_guarded() {
            if let Some(missing) = step.targets.iter().find(|t| !t.exists()) {
                return Err(PipelineError::MissingTarget {
                    label,
                    path: missing.clone(),
                });
            }
            self.locks.release(&label)?;
            self.checkpoints.mark_done(&label)?;
        }

        let result = build_result(label, outcome, 0, started, results);
        info!(
            label = result.label.as_str(),
            elapsed_s = result.elapsed.as_secs_f64(),
            peak_memory_kb = result.peak_memory_kb,
            "Step completed"
        );
        Ok(result)
    }

    /// Run a command for its standard output; never locked or checkpointed.
    pub fn capture(&self, command: &str, shell: Option<bool>) -> Result<String> {
        self.check_cancelled()?;
        let label = "capture";
        if let Some(journal) = &self.journal {
            journal.command_started(label, command);
        }
        let result = self
            .monitor
            .execute(&CommandSpec::new(command, shell).capturing())?;
        if let Some(journal) = &self.journal {
            journal.command_finished(label, &result);
        }
        self.check_cancelled()?;
        if !result.success() {
            return Err(PipelineError::StepExecution {
                label: label.to_string(),
                index: 0,
                command: command.to_string(),
                code: result.exit_code,
            });
        }
        let stdout = result.stdout.unwrap_or_default();
        Ok(stdout.trim_end_matches(['\n', '\r']).to_string())
    }

    fn check_cancelled(&self) -> Result<()> {
        match self.monitor.active().cancellation() {
            Some(signal) => Err(PipelineError::Interrupted { signal }),
            None => Ok(()),
        }
    }
}

fn build_result(
    label: String,
    outcome: StepOutcome,
    exit_code: i32,
    started: Instant,
    commands: Vec<CommandResult>,
) -> StepResult {
    StepResult {
        label,
        outcome,
        exit_code,
        elapsed: started.elapsed(),
        peak_memory_kb: commands.iter().map(|c| c.peak_memory_kb).max().unwrap_or(0),
        commands,
    }
}

fn discard_target(path: &Path) -> Result<()> {
    let removed = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    removed.map_err(|err| {
        PipelineError::io(format!("Failed to discard partial target {}", path.display()), err)
    })?;
    warn!(path = %path.display(), "Discarded partial target");
    Ok(())
}
