//! Error taxonomy for a reconciliation run.
//!
//! Per-document variants ([`Fingerprint`](SyncError::Fingerprint),
//! [`Upload`](SyncError::Upload), [`Indexing`](SyncError::Indexing),
//! [`IndexingTimeout`](SyncError::IndexingTimeout),
//! [`Delete`](SyncError::Delete), [`Scan`](SyncError::Scan)) are recorded in
//! the run report and never abort a run. Store-wide variants
//! ([`Lock`](SyncError::Lock), [`SourceUnavailable`](SyncError::SourceUnavailable),
//! [`IndexUnavailable`](SyncError::IndexUnavailable),
//! [`RunTimeout`](SyncError::RunTimeout)) abort the run and surface wrapped
//! in [`Aborted`](SyncError::Aborted).

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Lifecycle phase of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    LockAcquired,
    Scanning,
    Planning,
    Applying,
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::LockAcquired => "lock_acquired",
            RunPhase::Scanning => "scanning",
            RunPhase::Planning => "planning",
            RunPhase::Applying => "applying",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fingerprint {path}: {source:#}")]
    Fingerprint {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to scan {path}: {message}")]
    Scan { path: String, message: String },

    #[error("index store rejected upload of {identifier}: {source:#}")]
    Upload {
        identifier: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("indexing of {identifier} failed: {message}")]
    Indexing { identifier: String, message: String },

    #[error("indexing of {identifier} did not finish within {waited:?}")]
    IndexingTimeout { identifier: String, waited: Duration },

    #[error("failed to delete {resource_name}: {source:#}")]
    Delete {
        resource_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("run lock store unavailable: {0:#}")]
    Lock(#[source] anyhow::Error),

    #[error("cannot list source store: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),

    #[error("cannot list index store: {0:#}")]
    IndexUnavailable(#[source] anyhow::Error),

    #[error("run exceeded its time budget of {0:?}")]
    RunTimeout(Duration),

    #[error("run aborted during {phase}: {source}")]
    Aborted {
        phase: RunPhase,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Whether this error invalidates the whole run rather than one document.
    pub fn is_store_wide(&self) -> bool {
        matches!(
            self,
            SyncError::Lock(_)
                | SyncError::SourceUnavailable(_)
                | SyncError::IndexUnavailable(_)
                | SyncError::RunTimeout(_)
                | SyncError::Aborted { .. }
        )
    }

    /// Short machine-readable tag used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Fingerprint { .. } => "fingerprint",
            SyncError::Scan { .. } => "scan",
            SyncError::Upload { .. } => "upload",
            SyncError::Indexing { .. } => "indexing",
            SyncError::IndexingTimeout { .. } => "indexing_timeout",
            SyncError::Delete { .. } => "delete",
            SyncError::Lock(_) => "lock",
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::IndexUnavailable(_) => "index_unavailable",
            SyncError::RunTimeout(_) => "run_timeout",
            SyncError::Aborted { .. } => "aborted",
        }
    }
}
