//! Hosted file-search store backend.
//!
//! Speaks the `v1beta` REST surface of the Gemini File Search API with
//! `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list | `GET v1beta/{store}/documents?pageSize=..&pageToken=..` |
//! | upload | resumable `POST upload/v1beta/{store}:uploadToFileSearchStore` |
//! | poll | `GET v1beta/{operation}` then `GET v1beta/{document}` |
//! | delete | `DELETE v1beta/{document}?force=true` |
//!
//! Uploads are streamed from a local scratch file, so the store reports
//! [`requires_local_file`](IndexStore::requires_local_file).
//!
//! # Configuration
//!
//! ```toml
//! [index]
//! kind = "file_search"
//! store_name = "fileSearchStores/session-notes-abc123"
//! ```
//!
//! The API key is read from `GEMINI_API_KEY` (or `api_key_env`).

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use notes_sync_core::models::{IndexedDocument, IndexingStatus};
use notes_sync_core::store::{
    DeleteOutcome, IndexStore, OperationHandle, OperationStatus, UploadBody, UploadRequest,
};

use crate::config::FileSearchIndexConfig;

const UPLOAD_MIME_TYPE: &str = "text/markdown";

/// Client for one file-search store.
pub struct FileSearchIndexStore {
    store_name: String,
    api_base: String,
    api_key: String,
    page_size: u32,
    http: reqwest::Client,
}

// ============ Wire types ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct CustomMetadata {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResource {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    custom_metadata: Vec<CustomMetadata>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<DocumentResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadMetadata<'a> {
    display_name: &'a str,
    custom_metadata: Vec<CustomMetadata>,
    mime_type: &'a str,
}

impl From<DocumentResource> for IndexedDocument {
    fn from(doc: DocumentResource) -> Self {
        let metadata: BTreeMap<String, String> = doc
            .custom_metadata
            .into_iter()
            .filter_map(|m| m.string_value.map(|v| (m.key, v)))
            .collect();
        let status = match doc.state.as_deref() {
            Some("STATE_ACTIVE") => IndexingStatus::Active,
            Some("STATE_FAILED") => IndexingStatus::Failed,
            _ => IndexingStatus::Pending,
        };
        IndexedDocument {
            display_name: doc.display_name.unwrap_or_else(|| doc.name.clone()),
            resource_name: doc.name,
            metadata,
            status,
        }
    }
}

/// Interpret a fetched operation.
///
/// `Ok(None)` while still running; `Ok(Some(name))` with the resulting
/// document; `Err(message)` when the service reports a failure.
fn operation_outcome(op: &Operation) -> std::result::Result<Option<String>, String> {
    if !op.done {
        return Ok(None);
    }
    if let Some(ref err) = op.error {
        return Err(format!("{} (code {})", err.message, err.code));
    }
    op.response
        .as_ref()
        .and_then(|r| r.get("documentName"))
        .and_then(|v| v.as_str())
        .map(|name| Some(name.to_string()))
        .ok_or_else(|| format!("operation {} finished without a document name", op.name))
}

impl FileSearchIndexStore {
    pub fn new(config: &FileSearchIndexConfig, http: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        Ok(Self {
            store_name: config.store_name.trim_matches('/').to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            page_size: config.page_size,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1beta/{}", self.api_base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let resp = self
            .http
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "File search API error (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("Unexpected response from {}", url))
    }

    /// Open a resumable upload session and return its upload URL.
    async fn start_upload(
        &self,
        request: &UploadRequest<'_>,
        content_length: u64,
    ) -> Result<String> {
        let metadata = UploadMetadata {
            display_name: request.display_name,
            custom_metadata: request
                .metadata
                .iter()
                .map(|(k, v)| CustomMetadata {
                    key: k.clone(),
                    string_value: Some(v.clone()),
                })
                .collect(),
            mime_type: UPLOAD_MIME_TYPE,
        };

        let url = format!(
            "{}/upload/v1beta/{}:uploadToFileSearchStore",
            self.api_base, self.store_name
        );
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", content_length.to_string())
            .header("X-Goog-Upload-Header-Content-Type", UPLOAD_MIME_TYPE)
            .json(&metadata)
            .send()
            .await
            .with_context(|| format!("Failed to start upload of {}", request.display_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Upload of {} rejected (HTTP {}): {}",
                request.display_name,
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        resp.headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .context("Upload session response is missing x-goog-upload-url")
    }
}

#[async_trait]
impl IndexStore for FileSearchIndexStore {
    fn kind(&self) -> &str {
        "file_search"
    }

    fn requires_local_file(&self) -> bool {
        true
    }

    async fn list_documents(&self) -> Result<Vec<IndexedDocument>> {
        let url = self.url(&format!("{}/documents", self.store_name));
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", self.page_size.to_string())];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: ListDocumentsResponse = self.get_json(&url, &query).await?;
            documents.extend(page.documents.into_iter().map(IndexedDocument::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }

    async fn upload(&self, request: UploadRequest<'_>) -> Result<OperationHandle> {
        let (body, length) = match request.body {
            UploadBody::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let length = file.metadata().await?.len();
                (reqwest::Body::from(file), length)
            }
            UploadBody::Bytes(ref bytes) => {
                (reqwest::Body::from(bytes.clone()), bytes.len() as u64)
            }
        };

        let upload_url = self.start_upload(&request, length).await?;

        let resp = self
            .http
            .post(&upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .header(reqwest::header::CONTENT_LENGTH, length.to_string())
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to send content of {}", request.display_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Upload of {} failed (HTTP {}): {}",
                request.display_name,
                status,
                text.chars().take(500).collect::<String>()
            );
        }

        let operation: Operation = resp
            .json()
            .await
            .context("Upload response is not an operation")?;

        tracing::debug!(
            display_name = request.display_name,
            operation = %operation.name,
            "submitted document to file search store"
        );

        Ok(OperationHandle {
            name: operation.name,
        })
    }

    async fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus> {
        let op: Operation = self.get_json(&self.url(&operation.name), &[]).await?;

        match operation_outcome(&op) {
            Ok(None) => Ok(OperationStatus::Pending),
            Err(message) => Ok(OperationStatus::Failed(message)),
            Ok(Some(document_name)) => {
                let doc: DocumentResource = self.get_json(&self.url(&document_name), &[]).await?;
                let doc = IndexedDocument::from(doc);
                match doc.status {
                    IndexingStatus::Failed => Ok(OperationStatus::Failed(format!(
                        "document {} is in a failed state",
                        doc.resource_name
                    ))),
                    _ => Ok(OperationStatus::Done(doc)),
                }
            }
        }
    }

    async fn delete(&self, resource_name: &str) -> Result<DeleteOutcome> {
        let url = self.url(resource_name);
        let resp = self
            .http
            .delete(&url)
            .header("x-goog-api-key", &self.api_key)
            .query(&[("force", "true")])
            .send()
            .await
            .with_context(|| format!("Failed to delete {}", resource_name))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
            s if s.is_success() => Ok(DeleteOutcome::Deleted),
            s => {
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "Delete of {} failed (HTTP {}): {}",
                    resource_name,
                    s,
                    body.chars().take(500).collect::<String>()
                )
            }
        }
    }
}
