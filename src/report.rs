//! Run outcome reporting.
//!
//! A [`RunReport`] is produced by every run that gets past lock acquisition
//! (and by runs that find the lock held). It serializes to JSON for
//! `nsync sync --json` and renders a short human summary otherwise.

use chrono::{DateTime, Utc};
use serde::Serialize;

use notes_sync_core::{ActionKind, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every action succeeded.
    Completed,
    /// The run finished but some documents failed to scan or apply.
    CompletedWithFailures,
    /// Another run held the lock; nothing was touched.
    SkippedAlreadyRunning,
}

/// A source document that could not be fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub identifier: String,
    pub path: String,
    pub error: String,
}

/// A planned action that did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionFailure {
    pub identifier: String,
    pub action: ActionKind,
    /// Machine-readable error tag, see [`SyncError::kind`].
    pub kind: String,
    pub error: String,
}

impl ActionFailure {
    pub fn new(identifier: &str, action: ActionKind, err: &SyncError) -> Self {
        Self {
            identifier: identifier.to_string(),
            action,
            kind: err.kind().to_string(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub uploaded: Vec<String>,
    pub replaced: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: usize,
    /// Resource names of extra copies of an identifier that were removed.
    pub duplicates_removed: Vec<String>,
    /// Resource names of documents the index failed to process that were removed.
    pub failed_removed: Vec<String>,
    pub scan_failures: Vec<ScanFailure>,
    pub failures: Vec<ActionFailure>,
}

impl RunReport {
    pub(crate) fn started(started_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Completed,
            started_at,
            finished_at: started_at,
            uploaded: Vec::new(),
            replaced: Vec::new(),
            deleted: Vec::new(),
            skipped: 0,
            duplicates_removed: Vec::new(),
            failed_removed: Vec::new(),
            scan_failures: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub(crate) fn skipped_already_running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::SkippedAlreadyRunning,
            finished_at: Utc::now(),
            ..Self::started(started_at)
        }
    }

    /// Set the final status and finish time.
    pub(crate) fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.status = if self.has_failures() {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty() || !self.scan_failures.is_empty()
    }

    /// Number of successful index mutations.
    pub fn mutations(&self) -> usize {
        self.uploaded.len()
            + self.replaced.len()
            + self.deleted.len()
            + self.duplicates_removed.len()
            + self.failed_removed.len()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        match self.status {
            RunStatus::SkippedAlreadyRunning => {
                "another sync is already running; nothing done".to_string()
            }
            _ => {
                let mut line = format!(
                    "uploaded {}, replaced {}, deleted {}, unchanged {}",
                    self.uploaded.len(),
                    self.replaced.len(),
                    self.deleted.len(),
                    self.skipped
                );
                let cleaned = self.duplicates_removed.len() + self.failed_removed.len();
                if cleaned > 0 {
                    line.push_str(&format!(", cleaned up {}", cleaned));
                }
                let failed = self.failures.len() + self.scan_failures.len();
                if failed > 0 {
                    line.push_str(&format!(", {} failed", failed));
                }
                let secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
                line.push_str(&format!(" ({:.1}s)", secs));
                line
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_status() {
        let mut report = RunReport::started(Utc::now());
        report.uploaded.push("a.md".into());
        report.finish();
        assert_eq!(report.status, RunStatus::Completed);

        report.failures.push(ActionFailure::new(
            "b.md",
            ActionKind::Upload,
            &SyncError::Indexing {
                identifier: "b.md".into(),
                message: "rejected".into(),
            },
        ));
        report.finish();
        assert_eq!(report.status, RunStatus::CompletedWithFailures);
        assert!(report.summary().contains("1 failed"));
    }

    #[test]
    fn test_json_shape() {
        let report = RunReport::skipped_already_running(Utc::now());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "skipped_already_running");
        assert_eq!(json["skipped"], 0);
        assert!(json["failures"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_failure_records_kind() {
        let failure = ActionFailure::new(
            "a.md",
            ActionKind::Replace,
            &SyncError::Delete {
                resource_name: "documents/1".into(),
                source: anyhow::anyhow!("503"),
            },
        );
        assert_eq!(failure.kind, "delete");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["action"], "replace");
    }
}
