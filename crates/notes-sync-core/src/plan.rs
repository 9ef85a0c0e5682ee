//! Reconciliation planner.
//!
//! Diffs the source inventory against the index inventory and emits one
//! action per identifier in their union:
//!
//! | Source | Index | Hashes | Action |
//! |--------|-------|--------|--------|
//! | present | absent | any | [`Upload`](ReconciliationAction::Upload) |
//! | absent | present | any | [`Delete`](ReconciliationAction::Delete) |
//! | present | present | equal | [`Skip`](ReconciliationAction::Skip) |
//! | present | present | differ | [`Replace`](ReconciliationAction::Replace) |
//!
//! `Replace` is a single action so the mutator can order the delete before
//! the upload and drop the upload when the delete fails. The output is
//! sorted by identifier, so the same inputs always yield the same plan.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::Inventory;

/// One step of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconciliationAction {
    Upload {
        identifier: String,
        location: String,
        content_hash: String,
    },
    Replace {
        identifier: String,
        old_resource: String,
        location: String,
        content_hash: String,
    },
    Delete {
        identifier: String,
        resource_name: String,
    },
    Skip {
        identifier: String,
    },
}

/// Discriminant of a [`ReconciliationAction`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Upload,
    Replace,
    Delete,
    Skip,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Upload => "upload",
            ActionKind::Replace => "replace",
            ActionKind::Delete => "delete",
            ActionKind::Skip => "skip",
        }
    }
}

impl ReconciliationAction {
    pub fn identifier(&self) -> &str {
        match self {
            ReconciliationAction::Upload { identifier, .. }
            | ReconciliationAction::Replace { identifier, .. }
            | ReconciliationAction::Delete { identifier, .. }
            | ReconciliationAction::Skip { identifier } => identifier,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ReconciliationAction::Upload { .. } => ActionKind::Upload,
            ReconciliationAction::Replace { .. } => ActionKind::Replace,
            ReconciliationAction::Delete { .. } => ActionKind::Delete,
            ReconciliationAction::Skip { .. } => ActionKind::Skip,
        }
    }

    /// Whether executing this action touches the index store.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ReconciliationAction::Skip { .. })
    }
}

/// Compute the actions that bring `index` in line with `source`.
pub fn plan(source: &Inventory, index: &Inventory) -> Vec<ReconciliationAction> {
    let identifiers: BTreeSet<&String> = source.keys().chain(index.keys()).collect();

    identifiers
        .into_iter()
        .filter_map(|id| match (source.get(id), index.get(id)) {
            (Some(src), None) => Some(ReconciliationAction::Upload {
                identifier: id.clone(),
                location: src.location.clone(),
                content_hash: src.content_hash.clone(),
            }),
            (None, Some(idx)) => Some(ReconciliationAction::Delete {
                identifier: id.clone(),
                resource_name: idx.location.clone(),
            }),
            (Some(src), Some(idx)) if src.content_hash == idx.content_hash => {
                Some(ReconciliationAction::Skip {
                    identifier: id.clone(),
                })
            }
            (Some(src), Some(idx)) => Some(ReconciliationAction::Replace {
                identifier: id.clone(),
                old_resource: idx.location.clone(),
                location: src.location.clone(),
                content_hash: src.content_hash.clone(),
            }),
            (None, None) => None,
        })
        .collect()
}

/// Per-kind action counts for a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub upload: usize,
    pub replace: usize,
    pub delete: usize,
    pub skip: usize,
}

impl PlanSummary {
    pub fn of(actions: &[ReconciliationAction]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action.kind() {
                ActionKind::Upload => summary.upload += 1,
                ActionKind::Replace => summary.replace += 1,
                ActionKind::Delete => summary.delete += 1,
                ActionKind::Skip => summary.skip += 1,
            }
        }
        summary
    }

    pub fn mutations(&self) -> usize {
        self.upload + self.replace + self.delete
    }
}
