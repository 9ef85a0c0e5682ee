//! Amazon S3 source and lock backends.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using only pure-Rust dependencies (`hmac`, `sha2`). Supports pagination
//! of `ListObjectsV2`, streaming `GetObject`, metadata-only `HeadObject`
//! (used for the ETag fast path of fingerprinting), and `PutObject` /
//! `DeleteObject` for the run lock sentinel.
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! kind = "s3"
//! bucket = "dnd-notes"
//! prefix = "session-notes/"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style addressing
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder, StatusCode};
use sha2::{Digest, Sha256};

use notes_sync_core::models::{ObjectMetadata, SourceListing, SourceObject};
use notes_sync_core::store::{ByteStream, LockStore, SourceStore};

use crate::config::S3SourceConfig;

type HmacSha256 = Hmac<Sha256>;

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Client ============

/// Metadata for a single S3 object, parsed from a `ListObjectsV2` response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct S3Object {
    key: String,
    last_modified: i64,
    etag: Option<String>,
    size: u64,
}

impl From<S3Object> for SourceObject {
    fn from(obj: S3Object) -> Self {
        SourceObject {
            path: obj.key,
            size: obj.size,
            last_modified: obj.last_modified,
            etag: obj.etag,
        }
    }
}

/// Minimal signed S3 client scoped to one bucket.
pub struct S3Client {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    http: reqwest::Client,
}

impl S3Client {
    pub fn new(config: &S3SourceConfig, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            http,
        })
    }

    /// Hostname and scheme. A custom endpoint uses path-style addressing;
    /// AWS uses `<bucket>.s3.<region>.amazonaws.com`.
    fn host_and_scheme(&self) -> (String, &'static str) {
        match &self.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (host, scheme)
            }
            None => (
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                "https",
            ),
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint_url {
            Some(_) => format!("/{}/{}", uri_encode(&self.bucket), encoded_key),
            None => format!("/{}", encoded_key),
        }
    }

    /// Build a SigV4-signed request for `key` (empty for bucket-level calls).
    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        payload: &[u8],
    ) -> RequestBuilder {
        let (host, scheme) = self.host_and_scheme();
        let canonical_uri = self.canonical_uri(key);

        let mut encoded_query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        encoded_query.sort();
        let canonical_querystring = encoded_query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_querystring.is_empty() {
            format!("{}://{}{}", scheme, host, canonical_uri)
        } else {
            format!("{}://{}{}?{}", scheme, host, canonical_uri, canonical_querystring)
        };

        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }

    /// List all objects under `prefix`, following continuation tokens.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type", "2".to_string()),
                ("max-keys", "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix", prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token", token.clone()));
            }

            let resp = self
                .signed(Method::GET, "", &query, b"")
                .send()
                .await
                .with_context(|| {
                    format!("Failed to list S3 objects in s3://{}/{}", self.bucket, prefix)
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                (true, None) => bail!("S3 listing truncated without a continuation token"),
                (false, _) => break,
            }
        }

        Ok(objects)
    }

    async fn get_object(&self, key: &str) -> Result<Option<ByteStream>> {
        let resp = self
            .signed(Method::GET, key, &[], b"")
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.bucket, key))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }

        let stream = resp.bytes_stream().map_err(anyhow::Error::from);
        Ok(Some(Box::pin(stream)))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let resp = self
            .signed(Method::HEAD, key, &[], b"")
            .send()
            .await
            .with_context(|| format!("Failed to head s3://{}/{}", self.bucket, key))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("S3 HeadObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Ok(Some(ObjectMetadata { etag, size }))
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let resp = self
            .signed(Method::PUT, key, &[], &body)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.bucket, key))?;

        if !resp.status().is_success() {
            bail!("S3 PutObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self
            .signed(Method::DELETE, key, &[], b"")
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.bucket, key))?;

        // S3 answers 204 whether or not the key existed.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }
}

// ============ Store implementations ============

/// Notes stored under a prefix of an S3 bucket.
pub struct S3SourceStore {
    client: Arc<S3Client>,
}

impl S3SourceStore {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceStore for S3SourceStore {
    fn kind(&self) -> &str {
        "s3"
    }

    async fn list(&self, root: &str) -> Result<SourceListing> {
        let objects = self.client.list_objects(root).await?;
        let objects: Vec<SourceObject> = objects.into_iter().map(SourceObject::from).collect();
        Ok(objects.into())
    }

    async fn open(&self, path: &str) -> Result<Option<ByteStream>> {
        self.client.get_object(path).await
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.client.head_object(path).await
    }
}

/// Run lock kept as a sentinel object in the bucket.
pub struct S3LockStore {
    client: Arc<S3Client>,
}

impl S3LockStore {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LockStore for S3LockStore {
    async fn exists(&self, marker: &str) -> Result<bool> {
        Ok(self.client.head_object(marker).await?.is_some())
    }

    async fn create(&self, marker: &str) -> Result<()> {
        let body = format!("started_at={}\npid={}\n", Utc::now().to_rfc3339(), std::process::id());
        self.client.put_object(marker, body.into_bytes()).await
    }

    async fn remove(&self, marker: &str) -> Result<()> {
        self.client.delete_object(marker).await
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` as-is.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ XML Parsing ============

/// Parse a `ListObjectsV2` response into objects, the truncation flag, and
/// the next continuation token. Folder placeholders (keys ending in `/`)
/// are dropped.
fn parse_list_objects_response(xml: &str) -> (Vec<S3Object>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }

        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let etag = extract_xml_value(block, "ETag")
            .map(|tag| tag.trim_matches('"').to_string())
            .filter(|tag| !tag.is_empty());
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        objects.push(S3Object {
            key,
            last_modified,
            etag,
            size,
        });
    }

    (objects, is_truncated, next_token)
}

/// Text content of the first `<tag>`, with XML entities decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..start + end]))
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use notes_sync_core::fingerprint::single_part_etag;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>notes</Name>
  <Prefix>session-notes/</Prefix>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr</NextContinuationToken>
  <Contents>
    <Key>session-notes/</Key>
    <Size>0</Size>
  </Contents>
  <Contents>
    <Key>session-notes/arc-1/session-01.md</Key>
    <LastModified>2024-11-02T18:04:11.000Z</LastModified>
    <ETag>&quot;9e107d9d372bb6826bd81d3542a419d6&quot;</ETag>
    <Size>1843</Size>
  </Contents>
  <Contents>
    <Key>session-notes/Q&amp;A.md</Key>
    <LastModified>2024-11-03T10:00:00.000Z</LastModified>
    <ETag>"d41d8cd98f00b204e9800998ecf8427e-2"</ETag>
    <Size>10485760</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn test_parse_listing() {
        let (objects, truncated, token) = parse_list_objects_response(LISTING);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("1ueGcxLPRx1Tr"));
        assert_eq!(objects.len(), 2, "folder placeholder must be skipped");

        assert_eq!(objects[0].key, "session-notes/arc-1/session-01.md");
        assert_eq!(
            objects[0].etag.as_deref(),
            Some("9e107d9d372bb6826bd81d3542a419d6")
        );
        assert_eq!(objects[0].size, 1843);
        assert_eq!(objects[0].last_modified, 1730570651);

        assert_eq!(objects[1].key, "session-notes/Q&A.md");
        assert_eq!(
            objects[1].etag.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e-2")
        );

        let listed = SourceObject::from(objects[0].clone());
        assert_eq!(listed.path, "session-notes/arc-1/session-01.md");
        assert_eq!(
            listed.etag.as_deref().and_then(single_part_etag).as_deref(),
            Some("9e107d9d372bb6826bd81d3542a419d6")
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("session 01.md"), "session%2001.md");
        assert_eq!(uri_encode("a~b_c-d.e"), "a~b_c-d.e");
        assert_eq!(uri_encode("Q&A"), "Q%26A");
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        // Example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }
}
