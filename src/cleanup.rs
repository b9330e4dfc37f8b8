use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use glob::glob;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Intermediate files to remove once the run completes.
#[derive(Debug, Default, Clone)]
pub struct CleanupRegistry {
    patterns: Vec<String>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        glob::Pattern::new(&pattern).map_err(|err| PipelineError::Parse {
            command: pattern.clone(),
            reason: format!("invalid cleanup pattern: {err}"),
        })?;
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        Ok(())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for pattern in &self.patterns {
            let Ok(entries) = glob(pattern) else {
                continue;
            };
            found.extend(entries.flatten());
        }
        found
    }

    /// Delete matching files, then any matching directories left empty.
    pub fn remove_matches(&self) -> usize {
        let mut removed = 0;
        let matches = self.matches();
        for path in matches.iter().filter(|p| !p.is_dir()) {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "Cleanup failed"),
            }
        }
        for path in matches.iter().filter(|p| p.is_dir()) {
            if fs::remove_dir(path).is_ok() {
                removed += 1;
            } else {
                debug!(path = %path.display(), "Directory not empty, kept");
            }
        }
        removed
    }

    /// Append `rm` commands for every pattern to `script`.
    pub fn write_script(&self, script: &Path) -> Result<()> {
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(script)?;
            for pattern in &self.patterns {
                writeln!(file, "rm -rf {}", quote_pattern(pattern))?;
            }
            file.sync_data()
        };
        write().map_err(|err| {
            PipelineError::io(format!("Failed to write cleanup script {}", script.display()), err)
        })
    }
}

/// Quote everything except glob metacharacters so the script still expands them.
fn quote_pattern(pattern: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    let flush = |literal: &mut String, out: &mut String| {
        if !literal.is_empty() {
            out.push('\'');
            out.push_str(&literal.replace('\'', "'\\''"));
            out.push('\'');
            literal.clear();
        }
    };
    for ch in pattern.chars() {
        if matches!(ch, '*' | '?') {
            flush(&mut literal, &mut out);
            out.push(ch);
        } else {
            literal.push(ch);
        }
    }
    flush(&mut literal, &mut out);
    out
}
