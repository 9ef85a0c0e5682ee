//! Local directory source and lock backends.
//!
//! Walks a directory tree with `walkdir` and reads files with tokio. Local
//! files carry no entity tag, so fingerprinting always digests content.
//! Entries that cannot be read during the walk (dangling symlinks,
//! unreadable subdirectories) are reported as listing failures; only a
//! missing or unreadable root fails the listing.
//! The run lock is a sentinel file resolved relative to a base directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::warn;
use walkdir::WalkDir;

use notes_sync_core::models::{ListingFailure, ObjectMetadata, SourceListing, SourceObject};
use notes_sync_core::store::{ByteStream, LockStore, SourceStore};

/// Notes stored in a local directory tree.
pub struct FsSourceStore {
    follow_symlinks: bool,
}

impl FsSourceStore {
    pub fn new(follow_symlinks: bool) -> Self {
        Self { follow_symlinks }
    }
}

/// A directory that is not itself a symlink. A failing symlink hides at
/// most its own target, which may be a single note.
fn is_real_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Render a filesystem path with `/` separators.
fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[async_trait]
impl SourceStore for FsSourceStore {
    fn kind(&self) -> &str {
        "filesystem"
    }

    async fn list(&self, root: &str) -> Result<SourceListing> {
        let root = PathBuf::from(root);
        if !root.is_dir() {
            bail!("Source root does not exist: {}", root.display());
        }

        let follow = self.follow_symlinks;
        // walkdir is blocking
        tokio::task::spawn_blocking(move || -> Result<SourceListing> {
            let mut objects = Vec::new();
            let mut failures = Vec::new();
            for entry in WalkDir::new(&root).follow_links(follow) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.depth() == 0 => {
                        return Err(err)
                            .with_context(|| format!("Failed to walk {}", root.display()));
                    }
                    Err(err) => {
                        let Some(path) = err.path().map(Path::to_path_buf) else {
                            return Err(err)
                                .with_context(|| format!("Failed to walk {}", root.display()));
                        };
                        warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                        failures.push(ListingFailure {
                            path: path_string(&path),
                            subtree: is_real_dir(&path),
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(
                            path = %entry.path().display(),
                            error = %err,
                            "skipping unreadable entry"
                        );
                        failures.push(ListingFailure {
                            path: path_string(entry.path()),
                            subtree: false,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                let last_modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);

                objects.push(SourceObject {
                    path: path_string(entry.path()),
                    size: metadata.len(),
                    last_modified,
                    etag: None,
                });
            }

            // Sort for deterministic ordering
            objects.sort_by(|a, b| a.path.cmp(&b.path));
            failures.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(SourceListing { objects, failures })
        })
        .await?
    }

    async fn open(&self, path: &str) -> Result<Option<ByteStream>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path)),
        };
        let stream = futures::stream::once(async move { Ok(Bytes::from(data)) });
        Ok(Some(stream.boxed()))
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMetadata {
                etag: None,
                size: Some(meta.len()),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path)),
        }
    }
}

/// Run lock kept as a sentinel file under `base`.
pub struct FsLockStore {
    base: PathBuf,
}

impl FsLockStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn marker_path(&self, marker: &str) -> PathBuf {
        self.base.join(marker)
    }
}

#[async_trait]
impl LockStore for FsLockStore {
    async fn exists(&self, marker: &str) -> Result<bool> {
        let path = self.marker_path(marker);
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to check lock file {}", path.display()))
    }

    async fn create(&self, marker: &str) -> Result<()> {
        let path = self.marker_path(marker);
        let body = format!(
            "started_at={}\npid={}\n",
            chrono::Utc::now().to_rfc3339(),
            std::process::id()
        );
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to create lock file {}", path.display()))
    }

    async fn remove(&self, marker: &str) -> Result<()> {
        let path = self.marker_path(marker);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove lock file {}", path.display()))
            }
        }
    }
}
