//! Data models shared by the scanner, planner, and index backends.
//!
//! Inventories are keyed by document identifier: a relative path with `/`
//! separators and the scan root stripped, e.g. `campaign-2/session-14.md`.
//! Both the source inventory and the index inventory use the same
//! [`InventoryEntry`] shape so the planner can diff them directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata key carrying the document identifier on an indexed document.
pub const METADATA_IDENTIFIER: &str = "identifier";
/// Metadata key carrying the hex content hash on an indexed document.
pub const METADATA_CONTENT_HASH: &str = "content_hash";
/// Informational metadata key recording where the content was read from.
pub const METADATA_SOURCE_LOCATION: &str = "source_location";

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// One document found in either the source or the index.
///
/// `location` is the source path/key for source entries and the index
/// resource name for index entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub identifier: String,
    pub content_hash: String,
    pub location: String,
    pub display_name: String,
}

/// Identifier → entry mapping produced by a scan.
///
/// A `BTreeMap` so iteration is already sorted by identifier.
pub type Inventory = BTreeMap<String, InventoryEntry>;

/// An object reported by a [`SourceStore`](crate::store::SourceStore) listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObject {
    /// Full path or key, including the scan root.
    pub path: String,
    pub size: u64,
    pub last_modified: Timestamp,
    /// Entity tag reported by the listing itself, when the backend has one.
    pub etag: Option<String>,
}

/// An entry the source saw but could not enumerate.
///
/// The notes behind it are in an unknown state, so the engine must neither
/// upload nor delete them this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingFailure {
    /// Full path of the failing entry, including the scan root.
    pub path: String,
    /// The entry is a directory, so everything below `path` is unknown.
    pub subtree: bool,
    pub error: String,
}

/// Result of listing a source root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceListing {
    pub objects: Vec<SourceObject>,
    pub failures: Vec<ListingFailure>,
}

impl From<Vec<SourceObject>> for SourceListing {
    fn from(objects: Vec<SourceObject>) -> Self {
        Self {
            objects,
            failures: Vec::new(),
        }
    }
}

/// Cheap metadata for a source object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Entity tag as returned by the store (quotes may still be present).
    pub etag: Option<String>,
    pub size: Option<u64>,
}

/// Indexing state of a document inside the index store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Pending,
    Active,
    Failed,
}

impl IndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::Pending => "pending",
            IndexingStatus::Active => "active",
            IndexingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => IndexingStatus::Active,
            "failed" => IndexingStatus::Failed,
            _ => IndexingStatus::Pending,
        }
    }
}

/// The index store's view of a document.
///
/// Owned by the index store; the engine only ever holds a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedDocument {
    /// Opaque handle assigned by the index store.
    pub resource_name: String,
    pub display_name: String,
    pub metadata: BTreeMap<String, String>,
    pub status: IndexingStatus,
}

impl IndexedDocument {
    pub fn identifier(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_IDENTIFIER)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.metadata
            .get(METADATA_CONTENT_HASH)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Convert to an inventory entry, or `None` when the document does not
    /// carry both required metadata fields.
    pub fn to_inventory_entry(&self) -> Option<InventoryEntry> {
        Some(InventoryEntry {
            identifier: self.identifier()?.to_string(),
            content_hash: self.content_hash()?.to_string(),
            location: self.resource_name.clone(),
            display_name: self.display_name.clone(),
        })
    }
}

/// Build the metadata map attached to every uploaded document.
pub fn document_metadata(
    identifier: &str,
    content_hash: &str,
    source_location: &str,
) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(METADATA_IDENTIFIER.to_string(), identifier.to_string());
    metadata.insert(METADATA_CONTENT_HASH.to_string(), content_hash.to_string());
    metadata.insert(METADATA_SOURCE_LOCATION.to_string(), source_location.to_string());
    metadata
}

/// Derive a document identifier from a listed path by stripping `root`.
///
/// Backslashes are normalized to `/` and leading separators removed.
/// Returns `None` when `path` is not under `root` or names the root itself.
pub fn relative_identifier(root: &str, path: &str) -> Option<String> {
    let root = root.replace('\\', "/");
    let path = path.replace('\\', "/");
    let root = root.trim_start_matches("./").trim_end_matches('/');
    let path = path.trim_start_matches("./");

    let rest = if root.is_empty() {
        path
    } else {
        let rest = path.strip_prefix(root)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            // "notes-old/a.md" is not under "notes"
            return None;
        }
        rest
    };

    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Final path segment, used as a human-readable display name.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// A chunk of an indexed document's text, stored by the local index.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_identifier_strips_prefix() {
        assert_eq!(
            relative_identifier("session-notes/", "session-notes/a.md").as_deref(),
            Some("a.md")
        );
        assert_eq!(
            relative_identifier("session-notes", "session-notes/arc/b.md").as_deref(),
            Some("arc/b.md")
        );
    }

    #[test]
    fn test_relative_identifier_rejects_sibling_prefix() {
        assert_eq!(relative_identifier("notes", "notes-old/a.md"), None);
        assert_eq!(relative_identifier("notes", "notes/"), None);
    }

    #[test]
    fn test_relative_identifier_empty_root_and_windows_paths() {
        assert_eq!(relative_identifier("", "a.md").as_deref(), Some("a.md"));
        assert_eq!(
            relative_identifier("C:\\notes", "C:\\notes\\arc\\c.md").as_deref(),
            Some("arc/c.md")
        );
    }

    #[test]
    fn test_entry_requires_both_metadata_fields() {
        let mut doc = IndexedDocument {
            resource_name: "r1".into(),
            display_name: "a.md".into(),
            metadata: BTreeMap::new(),
            status: IndexingStatus::Active,
        };
        assert!(doc.to_inventory_entry().is_none());

        doc.metadata.insert(METADATA_IDENTIFIER.into(), "a.md".into());
        assert!(doc.to_inventory_entry().is_none());

        doc.metadata.insert(METADATA_CONTENT_HASH.into(), "h1".into());
        let entry = doc.to_inventory_entry().unwrap();
        assert_eq!(entry.identifier, "a.md");
        assert_eq!(entry.location, "r1");
    }
}
