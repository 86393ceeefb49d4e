//! Failure aggregation across a batch of cases.
//!
//! One [`FailureSink`] is shared by every case worker; appends go through a
//! mutex, entries are immutable once recorded. At the end of a run the
//! whole list is flushed to a single JSON summary artifact, grouped by case
//! prefix.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

/// One recorded failure. `case` is the suite-qualified case prefix, `node`
/// the instance identity (or the case itself for case-level failures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub case: String,
    pub node: String,
    pub reason: String,
}

/// Append-only failure list, safe for concurrent case workers.
#[derive(Debug, Default)]
pub struct FailureSink {
    entries: Mutex<Vec<FailureEntry>>,
}

impl FailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, case: &str, node: &str, reason: impl Into<String>) {
        let entry = FailureEntry {
            case: case.to_string(),
            node: node.to_string(),
            reason: reason.into(),
        };
        tracing::error!(case = %entry.case, node = %entry.node, reason = %entry.reason, "failure recorded");
        self.lock().push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Entries recorded for one case prefix, in insertion order.
    pub fn case_failures(&self, case: &str) -> Vec<FailureEntry> {
        self.lock()
            .iter()
            .filter(|e| e.case == case)
            .cloned()
            .collect()
    }

    /// All entries grouped by case prefix; insertion order within a group.
    pub fn snapshot(&self) -> Vec<FailureEntry> {
        let mut entries = self.lock().clone();
        entries.sort_by(|a, b| a.case.cmp(&b.case));
        entries
    }

    /// Flush the grouped entries to one JSON artifact.
    pub fn write_summary(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &self.snapshot())
            .map_err(|e| io::Error::other(format!("serializing failure summary: {e}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FailureEntry>> {
        // A worker that panicked while appending cannot leave the list in a
        // torn state, so recover rather than propagate the poison.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
