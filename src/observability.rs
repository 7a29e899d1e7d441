use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub tasks: BTreeMap<String, TaskMetrics>,
    pub files_written: u64,
    pub files_unchanged: u64,
    pub faults: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct TaskMetrics {
    pub runs: u64,
    pub failures: u64,
    pub last_duration_ms: f64,
}

/// Shared, cloneable metrics sink. Clones record into the same snapshot,
/// so one collector can be handed to every pipeline of a registry.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn record_task(&self, task: &str, duration: Duration, succeeded: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.tasks.entry(task.to_string()).or_default();
            metrics.runs += 1;
            if !succeeded {
                metrics.failures += 1;
            }
            metrics.last_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_written(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.files_written += 1;
        }
    }

    pub fn record_unchanged(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.files_unchanged += 1;
        }
    }

    pub fn record_fault(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.faults += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

/// Records the elapsed time when the timer goes out of scope.
impl Drop for StageTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        files_written = snapshot.files_written,
        files_unchanged = snapshot.files_unchanged,
        faults = snapshot.faults,
        "Build metrics summary"
    );
    for (task, metrics) in &snapshot.tasks {
        info!(
            task = task.as_str(),
            runs = metrics.runs,
            failures = metrics.failures,
            last_ms = metrics.last_duration_ms,
            "Task metrics"
        );
    }
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}
