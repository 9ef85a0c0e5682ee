//! Inventory scanning for both sides of a reconciliation.
//!
//! [`scan_source`] lists the source under the configured root, filters to
//! notes, and fingerprints them with bounded concurrency. [`scan_index`]
//! lists the index and keeps documents that carry the identifier and
//! content-hash metadata. Per-document problems are collected; only a
//! failure to list either store is fatal.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use notes_sync_core::fingerprint::fingerprint_listed;
use notes_sync_core::models::{
    relative_identifier, IndexingStatus, Inventory, InventoryEntry, ListingFailure,
};
use notes_sync_core::SyncError;

use crate::context::{SyncContext, SyncSettings};
use crate::report::ScanFailure;

/// Result of scanning the source store.
#[derive(Debug, Default)]
pub struct SourceScan {
    pub entries: Inventory,
    /// Notes that could not be enumerated or fingerprinted. An identifier
    /// ending in `/` stands for every note below that directory.
    pub failures: Vec<ScanFailure>,
}

/// Result of scanning the index store.
#[derive(Debug, Default)]
pub struct IndexScan {
    pub entries: Inventory,
    /// Extra documents carrying an identifier already in `entries`.
    pub duplicates: Vec<InventoryEntry>,
    /// Documents the index gave up on; they never become searchable.
    pub failed: Vec<InventoryEntry>,
}

/// Map a listed path to a document identifier, or `None` if the object is
/// not a note this run should manage.
pub fn note_identifier(settings: &SyncSettings, path: &str) -> Option<String> {
    if path.ends_with('/') {
        return None;
    }
    let identifier = relative_identifier(&settings.root, path)?;
    let suffix = format!(".{}", settings.extension);
    if !identifier.ends_with(&suffix) || identifier.len() == suffix.len() {
        return None;
    }
    if settings.exclude.is_match(&identifier) {
        return None;
    }
    Some(identifier)
}

/// Map a listing failure to the scan failure it stands for, or `None` when
/// it cannot hide a managed note.
pub fn listing_failure(settings: &SyncSettings, failure: ListingFailure) -> Option<ScanFailure> {
    let identifier = if failure.subtree {
        format!("{}/", relative_identifier(&settings.root, &failure.path)?)
    } else {
        note_identifier(settings, &failure.path)?
    };
    Some(ScanFailure {
        identifier,
        path: failure.path,
        error: failure.error,
    })
}

pub async fn scan_source(ctx: &SyncContext) -> Result<SourceScan, SyncError> {
    let settings = &ctx.settings;
    let listing = ctx
        .source
        .list(&settings.root)
        .await
        .map_err(SyncError::SourceUnavailable)?;
    let listed = listing.objects.len();

    let mut scan = SourceScan::default();
    for failure in listing.failures {
        match listing_failure(settings, failure) {
            Some(failure) => {
                warn!(
                    identifier = %failure.identifier,
                    error = %failure.error,
                    "could not enumerate source entry"
                );
                scan.failures.push(failure);
            }
            None => debug!("ignoring unreadable entry outside the managed notes"),
        }
    }

    let candidates: Vec<(String, _)> = listing
        .objects
        .into_iter()
        .filter_map(|obj| note_identifier(settings, &obj.path).map(|id| (id, obj)))
        .collect();

    debug!(
        backend = ctx.source.kind(),
        root = %settings.root,
        listed,
        notes = candidates.len(),
        "listed source"
    );

    let results: Vec<_> = stream::iter(candidates)
        .map(|(identifier, object)| {
            let source = ctx.source.clone();
            async move {
                let result = fingerprint_listed(source.as_ref(), &object).await;
                (identifier, object.path, result)
            }
        })
        .buffer_unordered(settings.concurrency.max(1))
        .collect()
        .await;

    for (identifier, path, result) in results {
        match result {
            Ok(Some(content_hash)) => {
                scan.entries.insert(
                    identifier.clone(),
                    InventoryEntry {
                        display_name: identifier.clone(),
                        identifier,
                        content_hash,
                        location: path,
                    },
                );
            }
            Ok(None) => {
                debug!(identifier = %identifier, "note vanished during scan");
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "failed to fingerprint note");
                scan.failures.push(ScanFailure {
                    identifier,
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
    scan.failures.sort_by(|a, b| a.identifier.cmp(&b.identifier));

    info!(
        notes = scan.entries.len(),
        failures = scan.failures.len(),
        "scanned source"
    );
    Ok(scan)
}

pub async fn scan_index(ctx: &SyncContext) -> Result<IndexScan, SyncError> {
    let mut documents = ctx
        .index
        .list_documents()
        .await
        .map_err(SyncError::IndexUnavailable)?;
    documents.sort_by(|a, b| a.resource_name.cmp(&b.resource_name));
    let listed = documents.len();

    let mut scan = IndexScan::default();
    let mut unmanaged = 0usize;
    let mut by_identifier: BTreeMap<String, InventoryEntry> = BTreeMap::new();

    for doc in documents {
        let Some(entry) = doc.to_inventory_entry() else {
            unmanaged += 1;
            continue;
        };
        if doc.status == IndexingStatus::Failed {
            scan.failed.push(entry);
            continue;
        }
        if by_identifier.contains_key(&entry.identifier) {
            // Lowest resource name wins; sorted above.
            scan.duplicates.push(entry);
        } else {
            by_identifier.insert(entry.identifier.clone(), entry);
        }
    }
    scan.entries = by_identifier;

    if unmanaged > 0 {
        debug!(unmanaged, "ignoring index documents without sync metadata");
    }
    if !scan.duplicates.is_empty() {
        warn!(
            duplicates = scan.duplicates.len(),
            "index holds several copies of some notes"
        );
    }
    info!(
        backend = ctx.index.kind(),
        listed,
        documents = scan.entries.len(),
        "scanned index"
    );
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::build_globset;

    fn settings(root: &str) -> SyncSettings {
        let mut settings = SyncSettings::new(root);
        settings.exclude = build_globset(&["**/*.ignore.md".to_string()]).unwrap();
        settings
    }

    #[test]
    fn test_note_identifier_filters() {
        let s = settings("session-notes/");
        assert_eq!(
            note_identifier(&s, "session-notes/arc/s1.md").as_deref(),
            Some("arc/s1.md")
        );
        assert_eq!(note_identifier(&s, "session-notes/arc/"), None);
        assert_eq!(note_identifier(&s, "session-notes/map.png"), None);
        assert_eq!(note_identifier(&s, "session-notes/draft.ignore.md"), None);
        assert_eq!(note_identifier(&s, "session-notes/arc/x.ignore.md"), None);
        assert_eq!(note_identifier(&s, "other/s1.md"), None);
        assert_eq!(note_identifier(&s, "session-notes/.md"), None);
    }

    #[test]
    fn test_note_identifier_empty_root() {
        let s = settings("");
        assert_eq!(note_identifier(&s, "a.md").as_deref(), Some("a.md"));
        assert_eq!(note_identifier(&s, "notes-sync.STARTING"), None);
    }

    fn failure(path: &str, subtree: bool) -> ListingFailure {
        ListingFailure {
            path: path.to_string(),
            subtree,
            error: "permission denied".to_string(),
        }
    }

    #[test]
    fn test_listing_failure_mapping() {
        let s = settings("notes/");

        let note = listing_failure(&s, failure("notes/arc/s1.md", false)).unwrap();
        assert_eq!(note.identifier, "arc/s1.md");
        assert_eq!(note.path, "notes/arc/s1.md");

        let dir = listing_failure(&s, failure("notes/arc-2", true)).unwrap();
        assert_eq!(dir.identifier, "arc-2/");

        assert!(listing_failure(&s, failure("notes/map.png", false)).is_none());
        assert!(listing_failure(&s, failure("notes/x.ignore.md", false)).is_none());
        assert!(listing_failure(&s, failure("other/arc", true)).is_none());
    }
}
