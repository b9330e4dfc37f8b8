use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::checkpoint::{remove_if_exists, write_atomic};
use crate::error::{PipelineError, Result};

/// Contents of a `lock.<label>` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepLock {
    pub run: String,
    pub label: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// How `acquire` obtained the lock.
#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    Fresh,
    /// A lock left behind by an interrupted attempt was cleared first.
    /// `None` when its contents could not be read.
    RecoveredStale(Option<StepLock>),
}

/// Advisory per-step lock files inside the output directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    directory: PathBuf,
    run_name: String,
    recover: bool,
}

impl LockManager {
    pub fn new(directory: impl Into<PathBuf>, run_name: impl Into<String>, recover: bool) -> Self {
        Self {
            directory: directory.into(),
            run_name: run_name.into(),
            recover,
        }
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.directory.join(format!("lock.{}", label_file_name(label)))
    }

    pub fn is_locked(&self, label: &str) -> bool {
        self.path_for(label).exists()
    }

    /// Parsed lock contents; `Ok(None)` when no lock or unreadable contents.
    pub fn read(&self, label: &str) -> Result<Option<StepLock>> {
        let path = self.path_for(label);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_yaml::from_str(&content).ok()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PipelineError::io(
                format!("Failed to read lock {}", path.display()),
                err,
            )),
        }
    }

    pub fn acquire(&self, label: &str, commands: &[String]) -> Result<LockAcquisition> {
        let path = self.path_for(label);
        let mut acquisition = LockAcquisition::Fresh;

        if path.exists() {
            let previous = self.read(label)?;
            if let Some(lock) = &previous
                && lock.pid != std::process::id()
                && pid_alive(lock.pid)
            {
                if !self.recover {
                    return Err(PipelineError::LockHeld {
                        label: label.to_string(),
                        pid: lock.pid,
                        path,
                    });
                }
                warn!(label, pid = lock.pid, "Overriding lock held by a live process");
            }
            remove_if_exists(&path)?;
            acquisition = LockAcquisition::RecoveredStale(previous);
        }

        let lock = StepLock {
            run: self.run_name.clone(),
            label: label.to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
            commands: commands.to_vec(),
        };
        let body = serde_yaml::to_string(&lock).map_err(|err| {
            PipelineError::io(
                format!("Failed to serialize lock {}", path.display()),
                std::io::Error::other(err),
            )
        })?;
        write_atomic(&path, body.as_bytes())?;
        debug!(label, path = %path.display(), "Lock acquired");
        Ok(acquisition)
    }

    pub fn release(&self, label: &str) -> Result<()> {
        remove_if_exists(&self.path_for(label))?;
        debug!(label, "Lock released");
        Ok(())
    }

    /// Labels of every lock present in the directory, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PipelineError::io(
                    format!("Failed to list {}", self.directory.display()),
                    err,
                ));
            }
        };
        let mut labels = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = file_name.strip_prefix("lock.") else {
                continue;
            };
            let label = fs::read_to_string(entry.path())
                .ok()
                .and_then(|content| serde_yaml::from_str::<StepLock>(&content).ok())
                .map(|lock| lock.label)
                .unwrap_or_else(|| suffix.to_string());
            labels.push(label);
        }
        labels.sort();
        Ok(labels)
    }
}

/// File-system safe form of a step label.
///
/// Labels that need rewriting get a short digest suffix so that distinct
/// labels never share a file.
pub fn label_file_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == label && !label.is_empty() {
        return sanitized;
    }
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", sanitized, &digest[..8])
}

pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_foreign_lock(manager: &LockManager, label: &str, pid: u32) {
        let lock = StepLock {
            run: "old".into(),
            label: label.into(),
            pid,
            started_at: Utc::now(),
            commands: vec!["sleep 100".into()],
        };
        fs::write(manager.path_for(label), serde_yaml::to_string(&lock).unwrap()).unwrap();
    }

    #[test]
    fn acquire_then_release() {
        let temp = tempdir().unwrap();
        let manager = LockManager::new(temp.path(), "basic", false);
        let acquired = manager.acquire("sort", &["sort a > b".into()]).unwrap();
        assert_eq!(acquired, LockAcquisition::Fresh);
        assert!(manager.is_locked("sort"));

        let lock = manager.read("sort").unwrap().unwrap();
        assert_eq!(lock.pid, std::process::id());
        assert_eq!(lock.commands, vec!["sort a > b".to_string()]);

        assert_eq!(manager.list().unwrap(), vec!["sort".to_string()]);

        manager.release("sort").unwrap();
        assert!(!manager.is_locked("sort"));
        assert!(manager.list().unwrap().is_empty());
    }

    #[test]
    fn stale_lock_from_dead_process_is_recovered() {
        let temp = tempdir().unwrap();
        let manager = LockManager::new(temp.path(), "basic", false);
        write_foreign_lock(&manager, "align", dead_pid());

        match manager.acquire("align", &[]).unwrap() {
            LockAcquisition::RecoveredStale(Some(previous)) => assert_eq!(previous.run, "old"),
            other => panic!("unexpected acquisition: {other:?}"),
        }
        assert_eq!(manager.read("align").unwrap().unwrap().pid, std::process::id());
    }

    #[test]
    fn garbage_lock_is_treated_as_stale() {
        let temp = tempdir().unwrap();
        let manager = LockManager::new(temp.path(), "basic", false);
        fs::write(manager.path_for("x"), "not: [valid").unwrap();
        assert_eq!(
            manager.acquire("x", &[]).unwrap(),
            LockAcquisition::RecoveredStale(None)
        );
    }

    #[test]
    fn live_foreign_lock_fails_loudly_unless_recovering() {
        let temp = tempdir().unwrap();
        let mut holder = Command::new("sleep").arg("30").spawn().unwrap();

        let strict = LockManager::new(temp.path(), "basic", false);
        write_foreign_lock(&strict, "index", holder.id());
        let err = strict.acquire("index", &[]).unwrap_err();
        assert!(matches!(err, PipelineError::LockHeld { pid, .. } if pid == holder.id()));

        let recovering = LockManager::new(temp.path(), "basic", true);
        assert!(matches!(
            recovering.acquire("index", &[]).unwrap(),
            LockAcquisition::RecoveredStale(Some(_))
        ));

        holder.kill().unwrap();
        holder.wait().unwrap();
    }

    #[test]
    fn label_names_are_safe_and_distinct() {
        assert_eq!(label_file_name("trimmed.fastq"), "trimmed.fastq");
        let a = label_file_name("a/b");
        let b = label_file_name("a b");
        assert!(a.starts_with("a_b-"));
        assert_ne!(a, b);
        assert!(!label_file_name("").is_empty());
    }
}
