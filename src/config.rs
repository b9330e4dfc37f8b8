use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const SHELL_ENV: &str = "PIPERUN_SHELL";

/// Tunables for one pipeline run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Interval between resident-memory samples of a running command.
    pub sample_interval_ms: u64,
    /// Time a process tree gets between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Maximum wall time of a whole step, shared by all of its commands.
    /// Unlimited when unset.
    pub step_timeout_secs: Option<u64>,
    /// Rerun every step even when its targets already exist.
    pub new_start: bool,
    /// Take over locks that are still held by a live process.
    pub recover: bool,
    /// Keep intermediate files; write a cleanup script instead of deleting.
    pub dirty: bool,
    pub shell_program: String,
    pub handle_signals: bool,
    pub exit_on_signal: bool,
    /// Halt with status `paused` once this step has completed.
    pub stop_after: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 200,
            kill_grace_ms: 5_000,
            step_timeout_secs: None,
            new_start: false,
            recover: false,
            dirty: false,
            shell_program: default_shell(),
            handle_signals: true,
            exit_on_signal: true,
            stop_after: None,
        }
    }
}

impl RunConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(10))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    /// Configuration for embedding in tests or other programs: no signal
    /// handlers, short grace period, fast sampling.
    pub fn embedded() -> Self {
        Self {
            sample_interval_ms: 50,
            kill_grace_ms: 500,
            handle_signals: false,
            exit_on_signal: false,
            ..Self::default()
        }
    }
}

fn default_shell() -> String {
    std::env::var(SHELL_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_keep_defaults() {
        let config: RunConfig = serde_yaml::from_str("step_timeout_secs: 30\nrecover: true\n").unwrap();
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(30)));
        assert!(config.recover);
        assert_eq!(config.sample_interval_ms, 200);
        assert!(config.handle_signals);
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let parsed: Result<RunConfig, _> = serde_yaml::from_str("sample_every: 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn sample_interval_has_a_floor() {
        let config = RunConfig {
            sample_interval_ms: 0,
            ..RunConfig::default()
        };
        assert_eq!(config.sample_interval(), Duration::from_millis(10));
    }
}
