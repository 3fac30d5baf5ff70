//! Failure aggregation.
//!
//! [`FailureContainer`] collects every failure report of a run. Records are
//! appended and never changed. Each arrival is persisted, classified against
//! the tolerable set, and passed to the registered listeners.

use sim_types::{FailureRecord, FailureType};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Observer for failure arrivals.
pub trait FailureListener: Send + Sync {
    /// Called once per failure, after it has been recorded.
    fn on_failure(&self, failure: &FailureRecord, is_critical: bool);
}

/// Append-only collector of the failures of one run.
pub struct FailureContainer {
    suite_id: String,
    output_dir: Option<PathBuf>,
    tolerable: BTreeSet<FailureType>,
    failures: Mutex<Vec<FailureRecord>>,
    listeners: Mutex<Vec<Arc<dyn FailureListener>>>,
    has_critical: AtomicBool,
}

impl std::fmt::Debug for FailureContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureContainer")
            .field("suite_id", &self.suite_id)
            .field("tolerable", &self.tolerable)
            .field("failure_count", &self.failure_count())
            .field("has_critical", &self.has_critical_failure())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FailureContainer {
    /// Create a container. With an output directory, failures are written
    /// to `failures-<suite>.txt` and `failures-<suite>.json` as they arrive.
    pub fn new(
        suite_id: impl Into<String>,
        output_dir: Option<PathBuf>,
        tolerable: BTreeSet<FailureType>,
    ) -> Self {
        Self {
            suite_id: suite_id.into(),
            output_dir,
            tolerable,
            failures: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            has_critical: AtomicBool::new(false),
        }
    }

    /// Subscribe to future failures.
    pub fn add_listener(&self, listener: Arc<dyn FailureListener>) {
        lock(&self.listeners).push(listener);
    }

    /// True if a failure of this type forces an abort.
    pub fn is_critical(&self, failure_type: FailureType) -> bool {
        !failure_type.is_informational() && !self.tolerable.contains(&failure_type)
    }

    /// Record a failure.
    pub fn add(&self, failure: FailureRecord) {
        let is_critical = self.is_critical(failure.failure_type);
        {
            // Numbering, persisting and appending happen under one lock so
            // concurrent reports get distinct numbers and whole lines.
            let mut failures = lock(&self.failures);
            if failure.failure_type.is_informational() {
                tracing::info!(
                    "Worker {} reported {}: {}",
                    failure.worker_id,
                    failure.failure_type,
                    failure.message
                );
            } else {
                let number = failures
                    .iter()
                    .filter(|f| !f.failure_type.is_informational())
                    .count()
                    + 1;
                tracing::error!(
                    "Failure #{} {}: {} (worker={}, test={})",
                    number,
                    failure.failure_type,
                    failure.message,
                    failure.worker_id,
                    failure.test_id.as_deref().unwrap_or("unknown")
                );
            }
            self.persist(&failure);
            failures.push(failure.clone());
        }
        if is_critical {
            self.has_critical.store(true, Ordering::SeqCst);
        }

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_failure(&failure, is_critical);
        }
    }

    /// Number of recorded failures, informational ones excluded.
    pub fn failure_count(&self) -> usize {
        lock(&self.failures)
            .iter()
            .filter(|f| !f.failure_type.is_informational())
            .count()
    }

    /// True once any critical failure was recorded.
    pub fn has_critical_failure(&self) -> bool {
        self.has_critical.load(Ordering::SeqCst)
    }

    /// Snapshot of all records in arrival order.
    pub fn failures(&self) -> Vec<FailureRecord> {
        lock(&self.failures).clone()
    }

    /// Count of failures per type.
    pub fn summary(&self) -> BTreeMap<FailureType, usize> {
        let mut summary = BTreeMap::new();
        for failure in lock(&self.failures).iter() {
            *summary.entry(failure.failure_type).or_insert(0) += 1;
        }
        summary
    }

    /// Log the end-of-run summary.
    pub fn log_failure_info(&self) {
        let count = self.failure_count();
        if count == 0 {
            tracing::info!("No failures have been detected!");
            return;
        }

        let summary = self
            .summary()
            .into_iter()
            .filter(|(failure_type, _)| !failure_type.is_informational())
            .map(|(failure_type, n)| format!("{failure_type}={n}"))
            .collect::<Vec<_>>()
            .join(", ");
        if self.has_critical_failure() {
            tracing::error!("{} failures have been detected ({})", count, summary);
        } else {
            tracing::warn!("{} tolerable failures have been detected ({})", count, summary);
        }
        if let Some(path) = self.text_file() {
            tracing::info!("Failure details written to {}", path.display());
        }
    }

    /// Path of the human-readable failure log, if persisting.
    pub fn text_file(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("failures-{}.txt", self.suite_id)))
    }

    /// Path of the structured failure log, if persisting.
    pub fn json_file(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("failures-{}.json", self.suite_id)))
    }

    fn persist(&self, failure: &FailureRecord) {
        if failure.failure_type.is_informational() {
            return;
        }
        if let Some(path) = self.text_file() {
            if let Err(e) = append_line(&path, &failure.to_string()) {
                tracing::warn!("Could not write {}: {}", path.display(), e);
            }
        }
        if let Some(path) = self.json_file() {
            let line = match serde_json::to_string(failure) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Could not encode failure as JSON: {}", e);
                    return;
                }
            };
            if let Err(e) = append_line(&path, &line) {
                tracing::warn!("Could not write {}: {}", path.display(), e);
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
