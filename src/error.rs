use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while executing pipeline steps.
///
/// Every variant except `Halted` is fatal to the run: the manager finalizes
/// the manifest as `failed` before handing the error back to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command {index} of step '{label}' exited with code {code}: {command}")]
    StepExecution {
        label: String,
        index: usize,
        command: String,
        code: i32,
    },

    #[error("Step '{label}' exceeded its time limit of {limit:?}: {command}")]
    Timeout {
        label: String,
        command: String,
        limit: Duration,
    },

    #[error("Pipeline interrupted by {signal}")]
    Interrupted { signal: String },

    #[error("Step '{label}' is locked by a running process (pid {pid}): {}", path.display())]
    LockHeld {
        label: String,
        pid: u32,
        path: PathBuf,
    },

    #[error("Step '{label}' finished but its target is missing: {}", path.display())]
    MissingTarget { label: String, path: PathBuf },

    #[error("Cannot parse command `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid run name '{name}': {reason}")]
    InvalidRunName { name: String, reason: String },

    #[error("Pipeline halted after step '{0}'")]
    Halted(String),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code a CLI should use when the run ends with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StepExecution { code, .. } if *code > 0 && *code < 256 => *code,
            Self::Interrupted { signal } => crate::signals::exit_code_for(signal),
            Self::Timeout { .. } => 124,
            Self::Halted(_) => 0,
            _ => 1,
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
