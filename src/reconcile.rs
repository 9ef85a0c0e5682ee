//! Run coordinator: one reconciliation pass from lock to report.
//!
//! ```text
//! Idle ─▶ LockAcquired ─▶ Scanning ─▶ Planning ─▶ Applying ─▶ Done
//!   │          │              │           │           │
//!   └──────────┴──────────────┴───────────┴───────────┴─▶ Aborted
//! ```
//!
//! A run that finds the lock marker present returns
//! [`RunStatus::SkippedAlreadyRunning`](crate::report::RunStatus) without
//! touching either store. Otherwise the marker is created, and removed
//! again whatever happens next, including aborts and run timeouts.
//! The check and the create are separate calls, so two runs starting in
//! the same instant can both proceed; the duplicate cleanup in
//! [`scan_index`] lets a later run converge anyway.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};

use notes_sync_core::models::Inventory;
use notes_sync_core::{plan, ActionKind, PlanSummary, ReconciliationAction, RunPhase, SyncError};

use crate::context::SyncContext;
use crate::mutate::{Applied, IndexMutator};
use crate::report::{ActionFailure, RunReport, ScanFailure};
use crate::scan::{scan_index, scan_source, IndexScan, SourceScan};

/// Why an index document is removed outside the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cleanup {
    Duplicate,
    FailedIndexing,
}

enum Task {
    Action(ReconciliationAction),
    Cleanup {
        reason: Cleanup,
        identifier: String,
        resource_name: String,
    },
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPreview {
    pub summary: PlanSummary,
    pub actions: Vec<ReconciliationAction>,
    pub duplicates: Vec<String>,
    pub failed_documents: Vec<String>,
    pub scan_failures: Vec<ScanFailure>,
}

fn aborted(phase: RunPhase, err: SyncError) -> SyncError {
    match err {
        SyncError::Aborted { .. } => err,
        other => SyncError::Aborted {
            phase,
            source: Box::new(other),
        },
    }
}

/// Compute the plan for two scans.
///
/// Notes the source could not read are dropped from the index side too:
/// their state is unknown, so they are neither deleted nor re-uploaded.
/// A failure identifier ending in `/` covers a whole directory.
fn plan_scans(source: &SourceScan, index: &IndexScan) -> Vec<ReconciliationAction> {
    let unreadable: BTreeSet<&str> = source
        .failures
        .iter()
        .map(|f| f.identifier.as_str())
        .collect();
    let unknown = |id: &str| {
        unreadable.contains(id)
            || unreadable
                .iter()
                .any(|dir| dir.ends_with('/') && id.starts_with(dir))
    };
    let index_entries: Inventory = index
        .entries
        .iter()
        .filter(|(id, _)| !unknown(id.as_str()))
        .map(|(id, entry)| (id.clone(), entry.clone()))
        .collect();
    plan(&source.entries, &index_entries)
}

async fn scan_both(ctx: &SyncContext) -> Result<(SourceScan, IndexScan), SyncError> {
    futures::try_join!(scan_source(ctx), scan_index(ctx))
}

/// Scan and plan without taking the lock or mutating anything.
pub async fn preview(ctx: &SyncContext) -> Result<SyncPreview, SyncError> {
    let (source, index) = scan_both(ctx)
        .await
        .map_err(|e| aborted(RunPhase::Scanning, e))?;
    let actions = plan_scans(&source, &index);

    Ok(SyncPreview {
        summary: PlanSummary::of(&actions),
        actions,
        duplicates: index.duplicates.into_iter().map(|e| e.location).collect(),
        failed_documents: index.failed.into_iter().map(|e| e.location).collect(),
        scan_failures: source.failures,
    })
}

/// Remove the run lock marker, e.g. after a crashed run.
pub async fn unlock(ctx: &SyncContext) -> Result<bool, SyncError> {
    let marker = &ctx.settings.lock_marker;
    let held = ctx.lock.exists(marker).await.map_err(SyncError::Lock)?;
    if held {
        ctx.lock.remove(marker).await.map_err(SyncError::Lock)?;
    }
    Ok(held)
}

/// Run one reconciliation pass.
pub async fn run(ctx: &SyncContext) -> Result<RunReport, SyncError> {
    let started_at = Utc::now();
    let marker = ctx.settings.lock_marker.as_str();

    let held = ctx
        .lock
        .exists(marker)
        .await
        .map_err(|e| aborted(RunPhase::Idle, SyncError::Lock(e)))?;
    if held {
        info!(marker, "run lock is held, skipping");
        return Ok(RunReport::skipped_already_running(started_at));
    }
    ctx.lock
        .create(marker)
        .await
        .map_err(|e| aborted(RunPhase::Idle, SyncError::Lock(e)))?;

    let mut phase = RunPhase::LockAcquired;
    info!(phase = %phase, marker, "run started");

    let body = execute(ctx, &mut phase, started_at);
    let result = match ctx.settings.run_timeout {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, body).await;
            // the timed-out body has been dropped, so its phase is readable
            outcome.unwrap_or_else(|_| Err(aborted(phase, SyncError::RunTimeout(limit))))
        }
        None => body.await,
    };

    let release = match tokio::time::timeout(
        ctx.settings.lock_release_timeout,
        ctx.lock.remove(marker),
    )
    .await
    {
        Ok(release) => release,
        Err(_) => Err(anyhow::anyhow!(
            "timed out after {:?}",
            ctx.settings.lock_release_timeout
        )),
    };

    match (result, release) {
        (Ok(report), Ok(())) => {
            info!(phase = %RunPhase::Done, "{}", report.summary());
            Ok(report)
        }
        (Ok(_), Err(e)) => {
            error!(marker, error = ?e, "failed to release run lock");
            Err(SyncError::Lock(e.context("failed to release run lock")))
        }
        (Err(err), release) => {
            if let Err(e) = release {
                error!(marker, error = ?e, "failed to release run lock");
            }
            error!(phase = %RunPhase::Aborted, error = %err, "run aborted");
            Err(err)
        }
    }
}

fn enter(phase: &mut RunPhase, next: RunPhase) {
    *phase = next;
    info!(phase = %next, "entering phase");
}

async fn execute(
    ctx: &SyncContext,
    phase: &mut RunPhase,
    started_at: DateTime<Utc>,
) -> Result<RunReport, SyncError> {
    enter(phase, RunPhase::Scanning);
    let (source, index) = scan_both(ctx)
        .await
        .map_err(|e| aborted(RunPhase::Scanning, e))?;

    enter(phase, RunPhase::Planning);
    let actions = plan_scans(&source, &index);
    let summary = PlanSummary::of(&actions);
    info!(
        upload = summary.upload,
        replace = summary.replace,
        delete = summary.delete,
        skip = summary.skip,
        duplicates = index.duplicates.len(),
        failed_documents = index.failed.len(),
        "planned"
    );

    let mut report = RunReport::started(started_at);
    report.scan_failures = source.failures;
    report.skipped = summary.skip;

    let cleanups = index
        .duplicates
        .into_iter()
        .map(|e| (Cleanup::Duplicate, e))
        .chain(index.failed.into_iter().map(|e| (Cleanup::FailedIndexing, e)))
        .map(|(reason, e)| Task::Cleanup {
            reason,
            identifier: e.identifier,
            resource_name: e.location,
        });
    let tasks: Vec<Task> = actions
        .into_iter()
        .filter(ReconciliationAction::is_mutation)
        .map(Task::Action)
        .chain(cleanups)
        .collect();

    enter(phase, RunPhase::Applying);
    let mutator = IndexMutator::new(ctx);
    let mutator = &mutator;
    let mut outcomes = stream::iter(tasks)
        .map(|task| async move {
            match task {
                Task::Action(action) => {
                    let outcome = mutator.apply(action).await;
                    (Task::Action(outcome.action), outcome.result)
                }
                Task::Cleanup {
                    reason,
                    identifier,
                    resource_name,
                } => {
                    let result = mutator.delete(&resource_name).await.map(Applied::Deleted);
                    (
                        Task::Cleanup {
                            reason,
                            identifier,
                            resource_name,
                        },
                        result,
                    )
                }
            }
        })
        .buffer_unordered(ctx.settings.concurrency.max(1));

    while let Some((task, result)) = outcomes.next().await {
        match (task, result) {
            (Task::Action(action), Ok(applied)) => {
                let identifier = action.identifier().to_string();
                match applied {
                    Applied::Uploaded(_) => report.uploaded.push(identifier),
                    Applied::Replaced(_) => report.replaced.push(identifier),
                    Applied::Deleted(_) => report.deleted.push(identifier),
                    Applied::Skipped => report.skipped += 1,
                }
            }
            (Task::Action(action), Err(e)) => {
                report
                    .failures
                    .push(ActionFailure::new(action.identifier(), action.kind(), &e));
            }
            (Task::Cleanup { reason, resource_name, .. }, Ok(_)) => match reason {
                Cleanup::Duplicate => report.duplicates_removed.push(resource_name),
                Cleanup::FailedIndexing => report.failed_removed.push(resource_name),
            },
            (Task::Cleanup { identifier, .. }, Err(e)) => {
                warn!(identifier = %identifier, error = %e, "cleanup failed");
                report
                    .failures
                    .push(ActionFailure::new(&identifier, ActionKind::Delete, &e));
            }
        }
    }

    report.uploaded.sort();
    report.replaced.sort();
    report.deleted.sort();
    report.duplicates_removed.sort();
    report.failed_removed.sort();
    report
        .failures
        .sort_by(|a, b| a.identifier.cmp(&b.identifier).then(a.action.cmp(&b.action)));

    report.finish();
    enter(phase, RunPhase::Done);
    Ok(report)
}
