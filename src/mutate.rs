//! Applies reconciliation actions to the index store.
//!
//! Uploads follow the index's asynchronous protocol: submit, then poll the
//! returned operation until it reports done or failed, or the configured
//! deadline passes. Deletes treat an already-missing document as success.
//! A replace deletes the old document first and does not upload when that
//! delete fails, so a note is never indexed twice.
//!
//! Backends that need a file on disk get the content spooled into a
//! [`tempfile::NamedTempFile`], which is removed when the upload call
//! returns regardless of outcome.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use notes_sync_core::models::{document_metadata, IndexedDocument};
use notes_sync_core::store::{
    ByteStream, DeleteOutcome, OperationHandle, OperationStatus, UploadBody, UploadRequest,
};
use notes_sync_core::{ReconciliationAction, SyncError};

use crate::context::SyncContext;

/// What a successfully applied action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Uploaded(IndexedDocument),
    Replaced(IndexedDocument),
    Deleted(DeleteOutcome),
    Skipped,
}

/// The result of applying one action.
#[derive(Debug)]
pub struct ActionOutcome {
    pub action: ReconciliationAction,
    pub result: Result<Applied, SyncError>,
}

/// Executes actions against the index store of a [`SyncContext`].
pub struct IndexMutator<'a> {
    ctx: &'a SyncContext,
}

impl<'a> IndexMutator<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Apply a single action. Never panics on store failures; errors are
    /// returned in the outcome.
    pub async fn apply(&self, action: ReconciliationAction) -> ActionOutcome {
        let result = match &action {
            ReconciliationAction::Upload {
                identifier,
                location,
                content_hash,
            } => self
                .upload(identifier, location, content_hash)
                .await
                .map(Applied::Uploaded),
            ReconciliationAction::Replace {
                identifier,
                old_resource,
                location,
                content_hash,
            } => self
                .replace(identifier, old_resource, location, content_hash)
                .await
                .map(Applied::Replaced),
            ReconciliationAction::Delete {
                identifier,
                resource_name,
            } => {
                let outcome = self.delete(resource_name).await;
                if outcome.is_ok() {
                    info!(
                        identifier = %identifier,
                        resource = %resource_name,
                        "deleted from index"
                    );
                }
                outcome.map(Applied::Deleted)
            }
            ReconciliationAction::Skip { .. } => Ok(Applied::Skipped),
        };

        if let Err(ref e) = result {
            warn!(
                identifier = action.identifier(),
                action = action.kind().as_str(),
                error = %e,
                "action failed"
            );
        }
        ActionOutcome { action, result }
    }

    /// Upload the note at `location` and wait until the index has it.
    pub async fn upload(
        &self,
        identifier: &str,
        location: &str,
        content_hash: &str,
    ) -> Result<IndexedDocument, SyncError> {
        let upload_error = |source: anyhow::Error| SyncError::Upload {
            identifier: identifier.to_string(),
            source,
        };

        let stream = self
            .ctx
            .source
            .open(location)
            .await
            .map_err(|e| upload_error(e.context("failed to open source")))?
            .ok_or_else(|| {
                upload_error(anyhow::anyhow!("{} vanished from the source", location))
            })?;

        let metadata = document_metadata(identifier, content_hash, location);

        let operation = if self.ctx.index.requires_local_file() {
            let scratch = self.spool(stream).await.map_err(upload_error)?;
            self.submit(identifier, &metadata, UploadBody::File(scratch.path())).await?
            // scratch dropped here, removing the file
        } else {
            let body = collect(stream).await.map_err(upload_error)?;
            self.submit(identifier, &metadata, UploadBody::Bytes(body)).await?
        };

        let doc = self.wait_for_indexing(identifier, &operation).await?;
        info!(identifier = %identifier, resource = %doc.resource_name, "uploaded to index");
        Ok(doc)
    }

    /// Delete the old document, then upload the new content.
    pub async fn replace(
        &self,
        identifier: &str,
        old_resource: &str,
        location: &str,
        content_hash: &str,
    ) -> Result<IndexedDocument, SyncError> {
        self.delete(old_resource).await?;
        debug!(identifier = %identifier, resource = %old_resource, "removed outdated copy");
        self.upload(identifier, location, content_hash).await
    }

    /// Remove a document; one that is already gone counts as removed.
    pub async fn delete(&self, resource_name: &str) -> Result<DeleteOutcome, SyncError> {
        let outcome = self
            .ctx
            .index
            .delete(resource_name)
            .await
            .map_err(|source| SyncError::Delete {
                resource_name: resource_name.to_string(),
                source,
            })?;
        if outcome == DeleteOutcome::NotFound {
            debug!(resource = %resource_name, "document was already gone");
        }
        Ok(outcome)
    }

    async fn submit(
        &self,
        identifier: &str,
        metadata: &std::collections::BTreeMap<String, String>,
        body: UploadBody<'_>,
    ) -> Result<OperationHandle, SyncError> {
        self.ctx
            .index
            .upload(UploadRequest {
                display_name: identifier,
                metadata,
                body,
            })
            .await
            .map_err(|source| SyncError::Upload {
                identifier: identifier.to_string(),
                source,
            })
    }

    /// Copy the stream into a scratch file that lives until dropped.
    async fn spool(&self, mut stream: ByteStream) -> anyhow::Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("nsync-").suffix(".md");
        let scratch = match &self.ctx.settings.scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let mut file = tokio::fs::File::from_std(scratch.reopen()?);
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(scratch)
    }

    /// Poll `operation` until it settles or the deadline passes.
    ///
    /// Transport errors while polling are retried until the deadline.
    async fn wait_for_indexing(
        &self,
        identifier: &str,
        operation: &OperationHandle,
    ) -> Result<IndexedDocument, SyncError> {
        let policy = self.ctx.settings.poll;
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut interval = policy.interval;

        loop {
            match self.ctx.index.poll(operation).await {
                Ok(OperationStatus::Done(doc)) => return Ok(doc),
                Ok(OperationStatus::Failed(message)) => {
                    return Err(SyncError::Indexing {
                        identifier: identifier.to_string(),
                        message,
                    })
                }
                Ok(OperationStatus::Pending) => {
                    debug!(
                        identifier = %identifier,
                        operation = %operation.name,
                        "indexing pending"
                    );
                }
                Err(e) => {
                    warn!(
                        identifier = %identifier,
                        operation = %operation.name,
                        error = %e,
                        "polling failed, will retry"
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::IndexingTimeout {
                    identifier: identifier.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = policy.next_interval(interval);
        }
    }
}

async fn collect(mut stream: ByteStream) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
