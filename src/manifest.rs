use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{remove_if_exists, write_atomic};
use crate::error::{PipelineError, Result};
use crate::monitor::CommandResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Durable status and statistics of one pipeline run.
///
/// Backed by an append-only `<name>_stats.tsv` and a single
/// `<name>_<status>.flag` marker in the output directory.
#[derive(Debug)]
pub struct RunManifest {
    name: String,
    output_dir: PathBuf,
    status: RunStatus,
    results: BTreeMap<String, String>,
    phase: Option<String>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

impl RunManifest {
    /// Open (or resume) the manifest and mark the run as running.
    pub fn open(output_dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let output_dir = output_dir.into();
        let name = name.into();
        validate_run_name(&name)?;
        fs::create_dir_all(&output_dir).map_err(|err| {
            PipelineError::io(
                format!("Failed to create output directory: {}", output_dir.display()),
                err,
            )
        })?;

        let mut manifest = Self {
            results: BTreeMap::new(),
            status: RunStatus::Running,
            phase: None,
            started_at: Utc::now(),
            stopped_at: None,
            name,
            output_dir,
        };
        manifest.results = manifest.load_stats()?;
        manifest.set_status(RunStatus::Running)?;
        Ok(manifest)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    pub fn results(&self) -> &BTreeMap<String, String> {
        &self.results
    }

    pub fn stats_path(&self) -> PathBuf {
        self.file(&format!("{}_stats.tsv", self.name))
    }

    pub fn profile_path(&self) -> PathBuf {
        self.file(&format!("{}_profile.tsv", self.name))
    }

    pub fn commands_path(&self) -> PathBuf {
        self.file(&format!("{}_commands.sh", self.name))
    }

    pub fn flag_path(&self, status: RunStatus) -> PathBuf {
        flag_path(&self.output_dir, &self.name, status)
    }

    fn file(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    /// Latest value reported for `key`, in this run or an earlier one.
    pub fn get_stat(&self, key: &str) -> Option<&str> {
        self.results.get(key).map(String::as_str)
    }

    pub fn report_result(&mut self, key: &str, value: &str) -> Result<()> {
        let key = single_line(key);
        let value = single_line(value);
        append_line(&self.stats_path(), &format!("{key}\t{value}\t{}", self.name))?;
        debug!(key = key.as_str(), value = value.as_str(), "Result reported");
        self.results.insert(key, value);
        Ok(())
    }

    /// Record the step the run is at; rewrites the current status flag.
    pub fn record_phase(&mut self, phase: &str) -> Result<()> {
        self.phase = Some(single_line(phase));
        self.set_status(self.status)
    }

    pub fn set_status(&mut self, status: RunStatus) -> Result<()> {
        write_atomic(
            &self.flag_path(status),
            format!(
                "{}\t{}\n",
                Utc::now().to_rfc3339(),
                self.phase.as_deref().unwrap_or_default()
            )
            .as_bytes(),
        )?;
        for other in RunStatus::ALL.iter().filter(|s| **s != status) {
            remove_if_exists(&self.flag_path(*other))?;
        }
        self.status = status;
        Ok(())
    }

    pub fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.stopped_at = Some(Utc::now());
        self.set_status(status)
    }

    pub fn append_command(&self, label: &str, command: &str) -> Result<()> {
        append_line(&self.commands_path(), &format!("# {label}\n{command}"))
    }

    pub fn append_profile(&self, label: &str, result: &CommandResult) -> Result<()> {
        let path = self.profile_path();
        if !path.exists() {
            append_line(
                &path,
                "# label\texit_code\telapsed_s\tpeak_memory_gb\tfinished_at\tcommand",
            )?;
        }
        append_line(
            &path,
            &format!(
                "{}\t{}\t{:.3}\t{:.4}\t{}\t{}",
                single_line(label),
                result.exit_code,
                result.elapsed.as_secs_f64(),
                kb_to_gb(result.peak_memory_kb),
                Utc::now().to_rfc3339(),
                single_line(&result.command)
            ),
        )
    }

    fn load_stats(&self) -> Result<BTreeMap<String, String>> {
        let path = self.stats_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(PipelineError::io(
                    format!("Failed to read stats file: {}", path.display()),
                    err,
                ));
            }
        };
        Ok(parse_stats(&content))
    }
}

/// Run names prefix every file of the run, so they are restricted to
/// `[A-Za-z0-9._-]` and may not start with a dot.
pub fn validate_run_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| PipelineError::InvalidRunName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("name starts with a dot"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(invalid(&format!("character {bad:?} is not allowed")));
    }
    Ok(())
}

/// Status recorded for run `name` in `output_dir`, if any flag exists.
pub fn read_status(output_dir: &Path, name: &str) -> Option<RunStatus> {
    RunStatus::ALL
        .into_iter()
        .find(|status| flag_path(output_dir, name, *status).is_file())
}

/// Last phase written into the current status flag.
pub fn read_phase(output_dir: &Path, name: &str) -> Option<String> {
    let status = read_status(output_dir, name)?;
    let content = fs::read_to_string(flag_path(output_dir, name, status)).ok()?;
    content
        .trim_end()
        .split_once('\t')
        .map(|(_, phase)| phase.to_string())
        .filter(|phase| !phase.is_empty())
}

fn flag_path(output_dir: &Path, name: &str, status: RunStatus) -> PathBuf {
    output_dir.join(format!("{}_{}.flag", name, status.as_str()))
}

pub fn parse_stats(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or_default().to_string();
            Some((key, value))
        })
        .collect()
}

pub fn kb_to_gb(kb: u64) -> f64 {
    kb as f64 / (1024.0 * 1024.0)
}

fn single_line(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let append = || -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        file.sync_data()
    };
    append().map_err(|err| PipelineError::io(format!("Failed to append to {}", path.display()), err))
}
