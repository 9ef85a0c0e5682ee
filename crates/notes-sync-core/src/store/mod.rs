//! Store abstractions consumed by the reconciliation engine.
//!
//! Three narrow traits separate the engine from its backends:
//!
//! | Trait | Role | Backends |
//! |-------|------|----------|
//! | [`SourceStore`] | Authoritative document set | S3, local directory, in-memory |
//! | [`IndexStore`] | Searchable copy to converge | file-search service, SQLite, in-memory |
//! | [`LockStore`] | Advisory run lock | S3 object, local file, in-memory |
//!
//! All operations are async (via `async-trait`) and return `anyhow`
//! results; the engine maps failures onto [`SyncError`](crate::error::SyncError)
//! at its own boundary. Implementations must be `Send + Sync`.

pub mod memory;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::models::{IndexedDocument, ObjectMetadata, SourceListing};

/// Streamed object content, yielded in backend-sized chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Authoritative document source.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Backend name for logs (e.g. `"s3"`, `"filesystem"`).
    fn kind(&self) -> &str;

    /// List every object under `root`. Paths in the result include `root`.
    ///
    /// Entries below the root that cannot be enumerated are reported in
    /// [`SourceListing::failures`]; only an unreachable root is an error.
    async fn list(&self, root: &str) -> Result<SourceListing>;

    /// Open the object's content as a stream; `None` when it does not exist.
    async fn open(&self, path: &str) -> Result<Option<ByteStream>>;

    /// Metadata-only lookup; `None` when the object does not exist.
    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>>;
}

/// Handle to a long-running indexing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
}

/// State of an indexing operation as reported by [`IndexStore::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Done(IndexedDocument),
    Failed(String),
}

/// Result of a delete; a missing document is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Document content handed to [`IndexStore::upload`].
#[derive(Debug)]
pub enum UploadBody<'a> {
    Bytes(Bytes),
    /// A scratch file owned by the caller for the duration of the call.
    File(&'a Path),
}

/// A document submission.
#[derive(Debug)]
pub struct UploadRequest<'a> {
    pub display_name: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
    pub body: UploadBody<'a>,
}

/// The searchable index being reconciled.
#[async_trait]
pub trait IndexStore: Send + Sync {
    fn kind(&self) -> &str;

    /// Whether uploads must be handed over as a local file.
    fn requires_local_file(&self) -> bool {
        false
    }

    /// Every document currently in the store, indexed or not.
    async fn list_documents(&self) -> Result<Vec<IndexedDocument>>;

    /// Submit a document; indexing completes asynchronously.
    async fn upload(&self, request: UploadRequest<'_>) -> Result<OperationHandle>;

    /// Check on an upload submitted earlier.
    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus>;

    /// Remove a document by resource name.
    async fn delete(&self, resource_name: &str) -> Result<DeleteOutcome>;
}

/// Advisory run lock storage.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn exists(&self, marker: &str) -> Result<bool>;
    async fn create(&self, marker: &str) -> Result<()>;
    async fn remove(&self, marker: &str) -> Result<()>;
}
