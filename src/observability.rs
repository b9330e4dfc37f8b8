use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::manifest::kb_to_gb;
use crate::runner::{StepOutcome, StepResult};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub executed: u64,
    pub skipped: u64,
    pub recovered: u64,
    pub failed: u64,
    pub peak_memory_kb: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub executions: u64,
    pub skips: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    pub peak_memory_kb: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn record_step(&self, result: &StepResult) {
        if let Ok(mut guard) = self.inner.lock() {
            let duration_ms = result.elapsed.as_secs_f64() * 1_000.0;
            match result.outcome {
                StepOutcome::Skipped => guard.skipped += 1,
                StepOutcome::Recovered => {
                    guard.executed += 1;
                    guard.recovered += 1;
                }
                StepOutcome::Executed => guard.executed += 1,
            }
            if !result.success() {
                guard.failed += 1;
            }
            guard.peak_memory_kb = guard.peak_memory_kb.max(result.peak_memory_kb);

            let metrics = guard.steps.entry(result.label.clone()).or_default();
            metrics.calls += 1;
            if result.is_skipped() {
                metrics.skips += 1;
            } else {
                metrics.executions += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
            metrics.peak_memory_kb = metrics.peak_memory_kb.max(result.peak_memory_kb);
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.failed += 1;
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        executed = snapshot.executed,
        skipped = snapshot.skipped,
        recovered = snapshot.recovered,
        failed = snapshot.failed,
        peak_memory_gb = kb_to_gb(snapshot.peak_memory_kb),
        "Pipeline metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            executions = metrics.executions,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            peak_memory_kb = metrics.peak_memory_kb,
            "Step metrics"
        );
    }
}

pub fn write_snapshot_json(snapshot: &MetricsSnapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metrics directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, snapshot)
        .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
    Ok(())
}
