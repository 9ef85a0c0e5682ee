//! Explicit run context: the three stores plus tuning knobs.
//!
//! Everything a reconciliation run touches hangs off a [`SyncContext`], so
//! there are no process-wide clients. Tests build one directly from
//! in-memory stores; the CLI builds one from [`Config`] via
//! [`SyncContext::from_config`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::GlobSet;

use notes_sync_core::chunk::ChunkingParams;
use notes_sync_core::store::{IndexStore, LockStore, SourceStore};

use crate::config::{build_globset, Config, IndexConfig, SourceConfig};
use crate::file_search::FileSearchIndexStore;
use crate::source_fs::{FsLockStore, FsSourceStore};
use crate::source_s3::{S3Client, S3LockStore, S3SourceStore};
use crate::sqlite_index::SqliteIndexStore;

/// How long and how often to poll an indexing operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    /// Multiplier applied to the interval after each pending poll.
    pub backoff: f64,
    pub timeout: Duration,
}

impl PollPolicy {
    /// The interval to wait after `current`, never above `max_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(500),
            backoff: 1.0,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Run settings derived from configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Prefix or directory under which notes are listed.
    pub root: String,
    /// Extension (without dot) a note must carry.
    pub extension: String,
    pub exclude: GlobSet,
    pub lock_marker: String,
    pub concurrency: usize,
    pub poll: PollPolicy,
    pub run_timeout: Option<Duration>,
    /// Upper bound on releasing the lock after the run timed out.
    pub lock_release_timeout: Duration,
    pub scratch_dir: Option<PathBuf>,
}

impl SyncSettings {
    /// Defaults for a given root: `.md` notes, no excludes.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: "md".to_string(),
            exclude: GlobSet::empty(),
            lock_marker: "notes-sync.STARTING".to_string(),
            concurrency: 8,
            poll: PollPolicy::default(),
            run_timeout: None,
            lock_release_timeout: Duration::from_secs(30),
            scratch_dir: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let sync = &config.sync;
        Ok(Self {
            root: config.source.root(),
            extension: config.source.extension().to_string(),
            exclude: build_globset(config.source.exclude_globs())?,
            lock_marker: config.lock.marker.clone(),
            concurrency: sync.concurrency,
            poll: PollPolicy {
                interval: sync.poll_interval(),
                max_interval: sync.poll_max_interval(),
                backoff: sync.poll_backoff,
                timeout: sync.indexing_timeout(),
            },
            run_timeout: sync.run_timeout(),
            lock_release_timeout: sync.request_timeout(),
            scratch_dir: sync.scratch_dir.clone(),
        })
    }
}

/// Handles to the stores a run reconciles, plus its settings.
#[derive(Clone)]
pub struct SyncContext {
    pub source: Arc<dyn SourceStore>,
    pub index: Arc<dyn IndexStore>,
    pub lock: Arc<dyn LockStore>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn new(
        source: Arc<dyn SourceStore>,
        index: Arc<dyn IndexStore>,
        lock: Arc<dyn LockStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            index,
            lock,
            settings,
        }
    }

    /// Build the configured backends.
    ///
    /// One `reqwest::Client` carrying the per-request timeout is shared by
    /// every HTTP backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let settings = SyncSettings::from_config(config)?;
        let http = reqwest::Client::builder()
            .timeout(config.sync.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let (source, lock): (Arc<dyn SourceStore>, Arc<dyn LockStore>) = match &config.source {
            SourceConfig::S3(s3) => {
                let client = Arc::new(S3Client::new(s3, http.clone())?);
                (
                    Arc::new(S3SourceStore::new(client.clone())),
                    Arc::new(S3LockStore::new(client)),
                )
            }
            SourceConfig::Filesystem(fs) => (
                Arc::new(FsSourceStore::new(fs.follow_symlinks)),
                Arc::new(FsLockStore::new(fs.root.clone())),
            ),
        };

        let index: Arc<dyn IndexStore> = match &config.index {
            IndexConfig::FileSearch(fs) => Arc::new(FileSearchIndexStore::new(fs, http)?),
            IndexConfig::Sqlite(sqlite) => {
                let chunking = ChunkingParams {
                    max_tokens: sqlite.max_tokens,
                    overlap_tokens: sqlite.overlap_tokens,
                };
                Arc::new(SqliteIndexStore::open(&sqlite.path, chunking).await?)
            }
        };

        Ok(Self::new(source, index, lock, settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(350),
            backoff: 2.0,
            timeout: Duration::from_secs(1),
        };
        let second = policy.next_interval(policy.interval);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(policy.next_interval(second), Duration::from_millis(350));
    }

    #[test]
    fn test_huge_backoff_saturates_at_max_interval() {
        let policy = PollPolicy {
            interval: Duration::from_secs(3600),
            max_interval: Duration::from_secs(10),
            backoff: 1e300,
            timeout: Duration::from_secs(60),
        };
        assert_eq!(policy.next_interval(policy.interval), Duration::from_secs(10));

        let policy = PollPolicy {
            backoff: f64::INFINITY,
            ..policy
        };
        assert_eq!(policy.next_interval(policy.interval), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_interval_by_default() {
        let policy = PollPolicy::default();
        assert_eq!(policy.next_interval(policy.interval), policy.interval);
    }
}
