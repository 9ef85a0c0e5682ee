//! SQLite-backed [`IndexStore`] for running without a hosted index.
//!
//! Each uploaded note becomes a row in `index_documents`, split into
//! overlapping chunks in `index_chunks` and mirrored into the
//! `index_chunks_fts` FTS5 table that [`crate::search`] queries. Indexing
//! is synchronous: the upload transaction commits before the operation
//! handle is returned, so the first poll already reports `Done`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use notes_sync_core::chunk::{chunk_text, ChunkingParams};
use notes_sync_core::models::{IndexedDocument, IndexingStatus};
use notes_sync_core::store::{
    DeleteOutcome, IndexStore, OperationHandle, OperationStatus, UploadBody, UploadRequest,
};

use crate::db;
use crate::migrate;

const DOCUMENT_PREFIX: &str = "documents/";
const OPERATION_PREFIX: &str = "operations/";

/// SQLite implementation of the [`IndexStore`] trait.
pub struct SqliteIndexStore {
    pool: SqlitePool,
    chunking: ChunkingParams,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool, chunking: ChunkingParams) -> Self {
        Self { pool, chunking }
    }

    /// Connect to the database at `path` and make sure the schema exists.
    pub async fn open(path: &Path, chunking: ChunkingParams) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool, chunking))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_document(&self, name: &str) -> Result<Option<IndexedDocument>> {
        let row = sqlx::query(
            "SELECT name, display_name, metadata_json, status FROM index_documents WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_document(&r)).transpose()
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<IndexedDocument> {
    let name: String = row.get("name");
    let metadata_json: String = row.get("metadata_json");
    let status: String = row.get("status");
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .with_context(|| format!("Corrupt metadata on {}", name))?;

    Ok(IndexedDocument {
        resource_name: name,
        display_name: row.get("display_name"),
        metadata,
        status: IndexingStatus::parse(&status),
    })
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    fn kind(&self) -> &str {
        "sqlite"
    }

    async fn list_documents(&self) -> Result<Vec<IndexedDocument>> {
        let rows = sqlx::query(
            "SELECT name, display_name, metadata_json, status FROM index_documents ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn upload(&self, request: UploadRequest<'_>) -> Result<OperationHandle> {
        let raw = match request.body {
            UploadBody::Bytes(bytes) => bytes.to_vec(),
            UploadBody::File(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read upload file {}", path.display()))?,
        };
        let body = String::from_utf8_lossy(&raw).into_owned();

        let id = uuid::Uuid::new_v4().to_string();
        let name = format!("{}{}", DOCUMENT_PREFIX, id);
        let metadata_json = serde_json::to_string(request.metadata)?;
        let chunks = chunk_text(&name, &body, self.chunking);
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO index_documents (name, display_name, metadata_json, status, body, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&name)
        .bind(request.display_name)
        .bind(&metadata_json)
        .bind(IndexingStatus::Active.as_str())
        .bind(&body)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO index_chunks (id, document_name, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_name)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO index_chunks_fts (chunk_id, document_name, text) VALUES (?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_name)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            resource = %name,
            display_name = request.display_name,
            chunks = chunks.len(),
            "stored document in local index"
        );

        Ok(OperationHandle {
            name: format!("{}{}", OPERATION_PREFIX, id),
        })
    }

    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus> {
        let id = operation
            .name
            .strip_prefix(OPERATION_PREFIX)
            .with_context(|| format!("Not a local index operation: {}", operation.name))?;
        let name = format!("{}{}", DOCUMENT_PREFIX, id);

        match self.fetch_document(&name).await? {
            Some(doc) => Ok(OperationStatus::Done(doc)),
            None => Ok(OperationStatus::Failed(format!(
                "document {} is no longer in the index",
                name
            ))),
        }
    }

    async fn delete(&self, resource_name: &str) -> Result<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM index_chunks_fts WHERE document_name = ?")
            .bind(resource_name)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM index_chunks WHERE document_name = ?")
            .bind(resource_name)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM index_documents WHERE name = ?")
            .bind(resource_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        if removed == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }
}
