//! Content fingerprinting for change detection.
//!
//! The fingerprint is the lowercase hex MD5 of the document bytes. MD5 is
//! chosen because it is what S3 reports as the ETag of a single-part
//! upload, which lets the common case skip the download entirely:
//!
//! 1. Use the ETag from the listing when it already is a single-part MD5.
//!    Otherwise ask the source for metadata; none means the object is gone.
//! 2. If the ETag is a plain 32-hex-digit MD5 (no `-N` multipart suffix),
//!    use it as-is.
//! 3. Otherwise stream the content through MD5 chunk by chunk.
//!
//! The fingerprint only detects change; it is not a security boundary.

use futures::StreamExt;
use md5::{Digest, Md5};

use crate::error::SyncError;
use crate::models::SourceObject;
use crate::store::SourceStore;

/// Read granularity used when hashing in-memory buffers.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Return the ETag as a content hash when it is a single-part MD5.
///
/// Multipart ETags look like `"<md5-of-md5s>-<parts>"` and do not equal
/// the MD5 of the content, so they are rejected.
pub fn single_part_etag(etag: &str) -> Option<String> {
    let tag = etag.trim().trim_start_matches("W/").trim_matches('"');
    if tag.contains('-') || tag.len() != 32 {
        return None;
    }
    if !tag.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(tag.to_ascii_lowercase())
}

/// Hex MD5 of a byte slice, fed in [`HASH_CHUNK_SIZE`] pieces.
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    for chunk in data.chunks(HASH_CHUNK_SIZE) {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}

/// Compute the fingerprint of `path` in `source`.
///
/// Returns `Ok(None)` when the object does not exist, and
/// [`SyncError::Fingerprint`] for any other storage failure.
pub async fn fingerprint(
    source: &dyn SourceStore,
    path: &str,
) -> Result<Option<String>, SyncError> {
    let metadata = source
        .metadata(path)
        .await
        .map_err(|e| fingerprint_error(path, e))?;

    let Some(metadata) = metadata else {
        return Ok(None);
    };

    if let Some(hash) = metadata.etag.as_deref().and_then(single_part_etag) {
        return Ok(Some(hash));
    }

    let stream = source
        .open(path)
        .await
        .map_err(|e| fingerprint_error(path, e))?;
    let Some(mut stream) = stream else {
        return Ok(None);
    };

    let mut hasher = Md5::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| fingerprint_error(path, e))?;
        hasher.update(&chunk);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Fingerprint a listed object, skipping the metadata lookup when the
/// listing already carried a usable ETag.
pub async fn fingerprint_listed(
    source: &dyn SourceStore,
    object: &SourceObject,
) -> Result<Option<String>, SyncError> {
    if let Some(hash) = object.etag.as_deref().and_then(single_part_etag) {
        return Ok(Some(hash));
    }
    fingerprint(source, &object.path).await
}

fn fingerprint_error(path: &str, source: anyhow::Error) -> SyncError {
    SyncError::Fingerprint {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{EtagMode, InMemorySourceStore};

    #[test]
    fn test_single_part_etag_accepts_plain_md5() {
        let md5 = "9e107d9d372bb6826bd81d3542a419d6";
        assert_eq!(single_part_etag(md5).as_deref(), Some(md5));
        assert_eq!(
            single_part_etag("\"9E107D9D372BB6826BD81D3542A419D6\"").as_deref(),
            Some(md5)
        );
    }

    #[test]
    fn test_single_part_etag_rejects_multipart_and_garbage() {
        assert_eq!(single_part_etag("\"9e107d9d372bb6826bd81d3542a419d6-3\""), None);
        assert_eq!(single_part_etag("abc"), None);
        assert_eq!(single_part_etag("zz107d9d372bb6826bd81d3542a419d6"), None);
    }

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(
            digest_bytes(b"The quick brown fox jumps over the lazy dog"),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[tokio::test]
    async fn test_etag_and_stream_agree_for_single_part() {
        let body = "# Session 3\n\nThe party reached the keep.".repeat(5000);

        let tagged = InMemorySourceStore::new(EtagMode::SinglePart);
        tagged.put("notes/s3.md", body.as_bytes());
        let untagged = InMemorySourceStore::new(EtagMode::Absent);
        untagged.put("notes/s3.md", body.as_bytes());

        let from_etag = fingerprint(&tagged, "notes/s3.md").await.unwrap().unwrap();
        let from_stream = fingerprint(&untagged, "notes/s3.md").await.unwrap().unwrap();

        assert_eq!(from_etag, from_stream);
        assert_eq!(from_etag, digest_bytes(body.as_bytes()));
        assert_eq!(tagged.open_count(), 0, "single-part etag must not download");
        assert_eq!(untagged.open_count(), 1);
    }

    #[tokio::test]
    async fn test_multipart_etag_falls_back_to_stream() {
        let store = InMemorySourceStore::new(EtagMode::Multipart);
        store.put("a.md", b"hello");

        let hash = fingerprint(&store, "a.md").await.unwrap().unwrap();
        assert_eq!(hash, digest_bytes(b"hello"));
        assert_eq!(store.open_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_none() {
        let store = InMemorySourceStore::new(EtagMode::SinglePart);
        assert_eq!(fingerprint(&store, "nope.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_failure_is_fingerprint_error() {
        let store = InMemorySourceStore::new(EtagMode::Absent);
        store.put("bad.md", b"x");
        store.fail_reads_for("bad.md");

        let err = fingerprint(&store, "bad.md").await.unwrap_err();
        assert!(matches!(err, SyncError::Fingerprint { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_listing_etag_skips_metadata_lookup() {
        let store = InMemorySourceStore::new(EtagMode::SinglePart);
        store.set_listing_etags(true);
        store.put("notes/a.md", b"hello");

        let listing = store.list("notes/").await.unwrap();
        let hash = fingerprint_listed(&store, &listing.objects[0])
            .await
            .unwrap();
        assert_eq!(hash.as_deref(), Some(digest_bytes(b"hello").as_str()));
        assert_eq!(store.metadata_count(), 0);
        assert_eq!(store.open_count(), 0);
    }

    #[tokio::test]
    async fn test_multipart_listing_etag_falls_back() {
        let store = InMemorySourceStore::new(EtagMode::Multipart);
        store.set_listing_etags(true);
        store.put("notes/a.md", b"hello");

        let listing = store.list("notes/").await.unwrap();
        let hash = fingerprint_listed(&store, &listing.objects[0])
            .await
            .unwrap();
        assert_eq!(hash, Some(digest_bytes(b"hello")));
        assert_eq!(store.metadata_count(), 1);
        assert_eq!(store.open_count(), 1);
    }
}
