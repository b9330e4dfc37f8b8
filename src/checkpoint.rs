use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::lockfile::label_file_name;

const CHECKPOINT_EXT: &str = "checkpoint";

/// Contents of a checkpoint file.
///
/// File names alone are ambiguous (`a` + `b_x` and `a_b` + `x` share one), so
/// ownership is decided by the recorded run and label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMarker {
    pub run: String,
    pub label: String,
    pub completed_at: DateTime<Utc>,
}

/// Durable completion markers, one file per step label.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
    run_name: String,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>, run_name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            run_name: run_name.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        self.directory.join(format!(
            "{}_{}.{}",
            self.run_name,
            label_file_name(label),
            CHECKPOINT_EXT
        ))
    }

    pub fn is_done(&self, label: &str) -> bool {
        read_marker(&self.path_for(label))
            .is_some_and(|marker| marker.run == self.run_name && marker.label == label)
    }

    /// Idempotent; the marker is fsynced before this returns.
    pub fn mark_done(&self, label: &str) -> Result<()> {
        let path = self.path_for(label);
        let marker = CheckpointMarker {
            run: self.run_name.clone(),
            label: label.to_string(),
            completed_at: Utc::now(),
        };
        let body = serde_yaml::to_string(&marker).map_err(|err| {
            PipelineError::io(
                format!("Failed to serialize checkpoint {}", path.display()),
                std::io::Error::other(err),
            )
        })?;
        write_atomic(&path, body.as_bytes())?;
        debug!(label, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    /// Removes this run's checkpoint for `label`; a marker owned by another
    /// run or label under the same file name is left alone.
    pub fn clear(&self, label: &str) -> Result<()> {
        let path = self.path_for(label);
        match read_marker(&path) {
            Some(marker) if marker.run != self.run_name || marker.label != label => Ok(()),
            _ => remove_if_exists(&path),
        }
    }

    /// Labels checkpointed by this run, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut labels: Vec<String> = self
            .owned_markers()?
            .into_iter()
            .map(|(_, marker)| marker.label)
            .collect();
        labels.sort();
        Ok(labels)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let owned = self.owned_markers()?;
        for (path, _) in &owned {
            remove_if_exists(path)?;
        }
        Ok(owned.len())
    }

    fn owned_markers(&self) -> Result<Vec<(PathBuf, CheckpointMarker)>> {
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
        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(CHECKPOINT_EXT))
            .filter_map(|path| read_marker(&path).map(|marker| (path, marker)))
            .filter(|(_, marker)| marker.run == self.run_name)
            .collect())
    }
}

fn read_marker(path: &Path) -> Option<CheckpointMarker> {
    let content = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&content).ok()
}

/// Write `contents` to a sibling temp file, fsync it, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    };
    write().map_err(|err| {
        let _ = fs::remove_file(&tmp);
        PipelineError::io(format!("Failed to write {}", path.display()), err)
    })
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PipelineError::io(
            format!("Failed to remove {}", path.display()),
            err,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mark_done_is_idempotent_and_survives_reopen() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path(), "basic");
        assert!(!store.is_done("align"));

        store.mark_done("align").unwrap();
        store.mark_done("align").unwrap();
        assert!(store.is_done("align"));

        let reopened = CheckpointStore::new(temp.path(), "basic");
        assert!(reopened.is_done("align"));
        assert_eq!(reopened.list().unwrap(), vec!["align".to_string()]);
    }

    #[test]
    fn clear_missing_checkpoint_is_a_no_op() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path(), "basic");
        store.clear("never-ran").unwrap();

        store.mark_done("sort").unwrap();
        store.clear("sort").unwrap();
        assert!(!store.is_done("sort"));
    }

    #[test]
    fn run_name_prefixes_do_not_leak_between_runs() {
        let temp = tempdir().unwrap();
        let short = CheckpointStore::new(temp.path(), "a");
        let long = CheckpointStore::new(temp.path(), "a_b");
        long.mark_done("x").unwrap();

        assert!(short.list().unwrap().is_empty());
        assert!(!short.is_done("b_x"));
        assert_eq!(short.clear_all().unwrap(), 0);
        short.clear("b_x").unwrap();
        assert!(long.is_done("x"));
        assert_eq!(long.list().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn list_reports_labels_not_file_names() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path(), "basic");
        store.mark_done("a/out.txt").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a/out.txt".to_string()]);
    }

    #[test]
    fn unreadable_marker_is_not_done() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::new(temp.path(), "basic");
        fs::write(store.path_for("sort"), "garbage").unwrap();
        assert!(!store.is_done("sort"));
        store.clear("sort").unwrap();
        assert!(!store.path_for("sort").exists());
    }

    #[test]
    fn runs_do_not_see_each_others_checkpoints() {
        let temp = tempdir().unwrap();
        let first = CheckpointStore::new(temp.path(), "first");
        let second = CheckpointStore::new(temp.path(), "second");
        first.mark_done("a").unwrap();
        first.mark_done("b").unwrap();
        second.mark_done("c").unwrap();

        assert_eq!(first.clear_all().unwrap(), 2);
        assert!(first.list().unwrap().is_empty());
        assert!(second.is_done("c"));
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("value.txt");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "two");
        let entries = fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
