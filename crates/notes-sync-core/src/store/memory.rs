//! In-memory store implementations for tests.
//!
//! Each store keeps its state behind `std::sync` locks and exposes a few
//! fault-injection switches so failure paths of the engine can be driven
//! deterministically: unreadable source objects, rejected uploads, failing
//! deletes, indexing that never finishes, and an unreachable lock store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;

use crate::fingerprint::{digest_bytes, HASH_CHUNK_SIZE};
use crate::models::{
    IndexedDocument, IndexingStatus, ListingFailure, ObjectMetadata, SourceListing, SourceObject,
};

use super::{
    ByteStream, DeleteOutcome, IndexStore, LockStore, OperationHandle, OperationStatus,
    SourceStore, UploadBody, UploadRequest,
};

// ============ Source ============

/// How [`InMemorySourceStore`] reports entity tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtagMode {
    /// The ETag is the MD5 of the content, like an S3 single-part upload.
    SinglePart,
    /// The ETag carries a `-2` multipart suffix.
    Multipart,
    /// No ETag, like a local filesystem.
    Absent,
}

pub struct InMemorySourceStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    etag_mode: EtagMode,
    failing: RwLock<HashSet<String>>,
    unlistable: RwLock<BTreeMap<String, bool>>,
    list_fails: AtomicBool,
    listing_etags: AtomicBool,
    opens: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl InMemorySourceStore {
    pub fn new(etag_mode: EtagMode) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            etag_mode,
            failing: RwLock::new(HashSet::new()),
            unlistable: RwLock::new(BTreeMap::new()),
            list_fails: AtomicBool::new(false),
            listing_etags: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, path: &str, body: &[u8]) {
        self.objects
            .write()
            .unwrap()
            .insert(path.to_string(), body.to_vec());
    }

    pub fn remove(&self, path: &str) {
        self.objects.write().unwrap().remove(path);
    }

    /// Make metadata and reads for `path` fail with a backend error.
    pub fn fail_reads_for(&self, path: &str) {
        self.failing.write().unwrap().insert(path.to_string());
    }

    pub fn set_list_fails(&self, fails: bool) {
        self.list_fails.store(fails, Ordering::SeqCst);
    }

    /// Report `path` as a listing failure instead of listing it. With
    /// `subtree`, every object below `path/` is hidden as well, like an
    /// unreadable directory.
    pub fn fail_listing_of(&self, path: &str, subtree: bool) {
        self.unlistable
            .write()
            .unwrap()
            .insert(path.to_string(), subtree);
    }

    /// Include entity tags in listings, as S3 `ListObjectsV2` does.
    pub fn set_listing_etags(&self, enabled: bool) {
        self.listing_etags.store(enabled, Ordering::SeqCst);
    }

    /// Number of times content was opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of metadata lookups.
    pub fn metadata_count(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn etag_of(&self, body: &[u8]) -> Option<String> {
        match self.etag_mode {
            EtagMode::SinglePart => Some(format!("\"{}\"", digest_bytes(body))),
            EtagMode::Multipart => Some(format!("\"{}-2\"", digest_bytes(body))),
            EtagMode::Absent => None,
        }
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(path) {
            bail!("simulated read failure for {}", path);
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn list(&self, root: &str) -> Result<SourceListing> {
        if self.list_fails.load(Ordering::SeqCst) {
            bail!("simulated listing failure");
        }
        let unlistable = self.unlistable.read().unwrap();
        let hidden = |path: &str| {
            unlistable.iter().any(|(bad, subtree)| {
                path == bad.as_str()
                    || (*subtree
                        && path
                            .strip_prefix(bad.as_str())
                            .is_some_and(|rest| rest.starts_with('/')))
            })
        };
        let with_etags = self.listing_etags.load(Ordering::SeqCst);

        let objects = self.objects.read().unwrap();
        let listed = objects
            .iter()
            .filter(|(path, _)| path.starts_with(root) && !hidden(path.as_str()))
            .map(|(path, body)| SourceObject {
                path: path.clone(),
                size: body.len() as u64,
                last_modified: 0,
                etag: if with_etags { self.etag_of(body) } else { None },
            })
            .collect();
        let failures = unlistable
            .iter()
            .filter(|(bad, _)| bad.starts_with(root))
            .map(|(bad, subtree)| ListingFailure {
                path: bad.clone(),
                subtree: *subtree,
                error: "simulated enumeration failure".to_string(),
            })
            .collect();

        Ok(SourceListing {
            objects: listed,
            failures,
        })
    }

    async fn open(&self, path: &str) -> Result<Option<ByteStream>> {
        self.check(path)?;
        let body = match self.objects.read().unwrap().get(path) {
            Some(body) => body.clone(),
            None => return Ok(None),
        };
        self.opens.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Result<Bytes>> = body
            .chunks(HASH_CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Some(Box::pin(stream::iter(chunks))))
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        let objects = self.objects.read().unwrap();
        let Some(body) = objects.get(path) else {
            return Ok(None);
        };
        Ok(Some(ObjectMetadata {
            etag: self.etag_of(body),
            size: Some(body.len() as u64),
        }))
    }
}

// ============ Index ============

struct StoredDocument {
    doc: IndexedDocument,
    body: Vec<u8>,
}

struct PendingOperation {
    document_name: String,
    polls_left: usize,
}

/// Counters of mutating calls received by [`InMemoryIndexStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCallCounts {
    pub uploads: usize,
    pub deletes: usize,
    pub polls: usize,
}

pub struct InMemoryIndexStore {
    docs: RwLock<BTreeMap<String, StoredDocument>>,
    operations: Mutex<HashMap<String, PendingOperation>>,
    next_id: AtomicUsize,
    polls_before_done: AtomicUsize,
    requires_file: bool,
    reject_uploads: RwLock<HashSet<String>>,
    fail_indexing: RwLock<HashSet<String>>,
    stall_indexing: RwLock<HashSet<String>>,
    fail_deletes: RwLock<HashSet<String>>,
    list_fails: AtomicBool,
    counts: Mutex<IndexCallCounts>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            operations: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            polls_before_done: AtomicUsize::new(1),
            requires_file: false,
            reject_uploads: RwLock::new(HashSet::new()),
            fail_indexing: RwLock::new(HashSet::new()),
            stall_indexing: RwLock::new(HashSet::new()),
            fail_deletes: RwLock::new(HashSet::new()),
            list_fails: AtomicBool::new(false),
            counts: Mutex::new(IndexCallCounts::default()),
        }
    }

    /// A store that insists on receiving uploads as local files.
    pub fn requiring_local_file() -> Self {
        Self {
            requires_file: true,
            ..Self::new()
        }
    }

    /// Number of `Pending` polls each upload reports before completing.
    pub fn set_polls_before_done(&self, polls: usize) {
        self.polls_before_done.store(polls, Ordering::SeqCst);
    }

    /// Seed a document directly, bypassing the upload protocol.
    pub fn insert(&self, doc: IndexedDocument, body: &[u8]) {
        self.docs.write().unwrap().insert(
            doc.resource_name.clone(),
            StoredDocument {
                doc,
                body: body.to_vec(),
            },
        );
    }

    pub fn reject_upload_of(&self, display_name: &str) {
        self.reject_uploads
            .write()
            .unwrap()
            .insert(display_name.to_string());
    }

    pub fn fail_indexing_of(&self, display_name: &str) {
        self.fail_indexing
            .write()
            .unwrap()
            .insert(display_name.to_string());
    }

    pub fn stall_indexing_of(&self, display_name: &str) {
        self.stall_indexing
            .write()
            .unwrap()
            .insert(display_name.to_string());
    }

    pub fn fail_delete_of(&self, resource_name: &str) {
        self.fail_deletes
            .write()
            .unwrap()
            .insert(resource_name.to_string());
    }

    pub fn set_list_fails(&self, fails: bool) {
        self.list_fails.store(fails, Ordering::SeqCst);
    }

    pub fn documents(&self) -> Vec<IndexedDocument> {
        self.docs
            .read()
            .unwrap()
            .values()
            .map(|s| s.doc.clone())
            .collect()
    }

    pub fn body_of(&self, resource_name: &str) -> Option<Vec<u8>> {
        self.docs
            .read()
            .unwrap()
            .get(resource_name)
            .map(|s| s.body.clone())
    }

    pub fn call_counts(&self) -> IndexCallCounts {
        *self.counts.lock().unwrap()
    }
}

impl Default for InMemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    fn kind(&self) -> &str {
        "memory"
    }

    fn requires_local_file(&self) -> bool {
        self.requires_file
    }

    async fn list_documents(&self) -> Result<Vec<IndexedDocument>> {
        if self.list_fails.load(Ordering::SeqCst) {
            bail!("simulated index listing failure");
        }
        Ok(self.documents())
    }

    async fn upload(&self, request: UploadRequest<'_>) -> Result<OperationHandle> {
        self.counts.lock().unwrap().uploads += 1;

        if self.reject_uploads.read().unwrap().contains(request.display_name) {
            bail!("simulated rejection of {}", request.display_name);
        }

        let body = match request.body {
            UploadBody::Bytes(_) if self.requires_file => bail!("expected a local file upload"),
            UploadBody::Bytes(bytes) => bytes.to_vec(),
            UploadBody::File(path) => std::fs::read(path)?,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let resource_name = format!("documents/doc-{}", id);
        let operation_name = format!("operations/op-{}", id);

        self.docs.write().unwrap().insert(
            resource_name.clone(),
            StoredDocument {
                doc: IndexedDocument {
                    resource_name: resource_name.clone(),
                    display_name: request.display_name.to_string(),
                    metadata: request.metadata.clone(),
                    status: IndexingStatus::Pending,
                },
                body,
            },
        );
        self.operations.lock().unwrap().insert(
            operation_name.clone(),
            PendingOperation {
                document_name: resource_name,
                polls_left: self.polls_before_done.load(Ordering::SeqCst),
            },
        );

        Ok(OperationHandle {
            name: operation_name,
        })
    }

    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus> {
        self.counts.lock().unwrap().polls += 1;

        let mut operations = self.operations.lock().unwrap();
        let op = operations
            .get_mut(&operation.name)
            .ok_or_else(|| anyhow!("unknown operation {}", operation.name))?;

        let mut docs = self.docs.write().unwrap();
        let stored = docs
            .get_mut(&op.document_name)
            .ok_or_else(|| anyhow!("document for {} vanished", operation.name))?;
        let display_name = stored.doc.display_name.clone();

        if self.stall_indexing.read().unwrap().contains(&display_name) {
            return Ok(OperationStatus::Pending);
        }
        if op.polls_left > 0 {
            op.polls_left -= 1;
            return Ok(OperationStatus::Pending);
        }
        if self.fail_indexing.read().unwrap().contains(&display_name) {
            stored.doc.status = IndexingStatus::Failed;
            return Ok(OperationStatus::Failed(format!(
                "simulated indexing failure for {}",
                display_name
            )));
        }
        stored.doc.status = IndexingStatus::Active;
        Ok(OperationStatus::Done(stored.doc.clone()))
    }

    async fn delete(&self, resource_name: &str) -> Result<DeleteOutcome> {
        self.counts.lock().unwrap().deletes += 1;

        if self.fail_deletes.read().unwrap().contains(resource_name) {
            bail!("simulated delete failure for {}", resource_name);
        }
        match self.docs.write().unwrap().remove(resource_name) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}

// ============ Lock ============

pub struct InMemoryLockStore {
    markers: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    remove_fails: AtomicBool,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            markers: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            remove_fails: AtomicBool::new(false),
        }
    }

    pub fn is_held(&self, marker: &str) -> bool {
        self.markers.lock().unwrap().contains(marker)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only `remove` fail, leaving the marker in place.
    pub fn set_remove_fails(&self, fails: bool) {
        self.remove_fails.store(fails, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("simulated lock store outage");
        }
        Ok(())
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn exists(&self, marker: &str) -> Result<bool> {
        self.check()?;
        Ok(self.is_held(marker))
    }

    async fn create(&self, marker: &str) -> Result<()> {
        self.check()?;
        self.markers.lock().unwrap().insert(marker.to_string());
        Ok(())
    }

    async fn remove(&self, marker: &str) -> Result<()> {
        self.check()?;
        if self.remove_fails.load(Ordering::SeqCst) {
            bail!("simulated failure removing {}", marker);
        }
        self.markers.lock().unwrap().remove(marker);
        Ok(())
    }
}
