use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::pipeline::PipelineManager;
use crate::runner::Step;

/// A pipeline described in YAML: run identity, settings and ordered steps.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub version: u32,
    pub name: String,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub settings: RunConfig,
    pub steps: Vec<StepSpec>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;
        Ok(recipe)
    }

    /// Issue every step through `manager`, in order.
    pub fn execute(&self, manager: &mut PipelineManager) -> crate::Result<()> {
        for spec in &self.steps {
            for pattern in &spec.cleanup {
                manager.clean_add(pattern.clone())?;
            }
            match &spec.capture_as {
                Some(key) => {
                    let command = spec.command.first().unwrap_or_default();
                    let value = manager.check_and_capture(command, spec.shell)?;
                    manager.report_result(key, value)?;
                }
                None => {
                    manager.run(&spec.to_step())?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        match self {
            OneOrMany::One(value) => Some(value.as_str()),
            OneOrMany::Many(values) => values.first().map(String::as_str),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub command: OneOrMany,
    #[serde(default)]
    pub target: OneOrMany,
    #[serde(default)]
    pub shell: Option<bool>,
    #[serde(default)]
    pub nofail: bool,
    #[serde(default)]
    pub checkpoint: bool,
    /// Capture stdout and report it under this key instead of running a step.
    #[serde(default)]
    pub capture_as: Option<String>,
    #[serde(default)]
    pub cleanup: Vec<String>,
}

impl StepSpec {
    pub fn to_step(&self) -> Step {
        Step {
            label: self.label.clone(),
            commands: self.command.to_vec(),
            targets: self.target.to_vec().into_iter().map(PathBuf::from).collect(),
            shell: self.shell,
            nofail: self.nofail,
            checkpoint: self.checkpoint,
        }
    }
}
