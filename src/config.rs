//! TOML configuration.
//!
//! ```toml
//! [source]
//! kind = "s3"                       # or "filesystem"
//! bucket = "dnd-notes"
//! prefix = "session-notes/"
//! region = "us-east-1"
//! extension = "md"
//! exclude_globs = ["**/*.ignore.md"]
//!
//! [index]
//! kind = "file_search"              # or "sqlite"
//! store_name = "fileSearchStores/session-notes"
//!
//! [lock]
//! marker = "notes-sync.STARTING"
//!
//! [sync]
//! concurrency = 8
//! poll_interval_ms = 500
//! indexing_timeout_secs = 300
//! run_timeout_secs = 840
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Where the authoritative notes live.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    S3(S3SourceConfig),
    Filesystem(FilesystemSourceConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_extension() -> String {
    "md".to_string()
}
fn default_exclude_globs() -> Vec<String> {
    vec!["**/*.ignore.md".to_string()]
}

/// The index being kept in sync.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexConfig {
    FileSearch(FileSearchIndexConfig),
    Sqlite(SqliteIndexConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileSearchIndexConfig {
    /// Full store resource name, e.g. `fileSearchStores/my-notes-abc123`.
    pub store_name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteIndexConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

fn default_max_tokens() -> usize {
    300
}
fn default_overlap_tokens() -> usize {
    75
}

/// Advisory run lock. Stored next to the source: an object in the S3
/// bucket, or a file relative to the filesystem root.
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_marker")]
    pub marker: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
        }
    }
}

fn default_marker() -> String {
    "notes-sync.STARTING".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_max_interval_ms: u64,
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff: f64,
    #[serde(default = "default_indexing_timeout_secs")]
    pub indexing_timeout_secs: u64,
    /// Budget for a whole run; `0` disables the limit.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Where upload scratch files go; defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_interval_ms: default_poll_interval_ms(),
            poll_backoff: default_poll_backoff(),
            indexing_timeout_secs: default_indexing_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            scratch_dir: None,
        }
    }
}

fn default_concurrency() -> usize {
    8
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_poll_backoff() -> f64 {
    1.0
}
fn default_indexing_timeout_secs() -> u64 {
    300
}
fn default_run_timeout_secs() -> u64 {
    840
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    pub fn indexing_timeout(&self) -> Duration {
        Duration::from_secs(self.indexing_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SourceConfig {
    /// Scan root as the source store understands it.
    pub fn root(&self) -> String {
        match self {
            SourceConfig::S3(s3) => s3.prefix.clone(),
            SourceConfig::Filesystem(fs) => fs.root.to_string_lossy().to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        match self {
            SourceConfig::S3(s3) => &s3.extension,
            SourceConfig::Filesystem(fs) => &fs.extension,
        }
    }

    pub fn exclude_globs(&self) -> &[String] {
        match self {
            SourceConfig::S3(s3) => &s3.exclude_globs,
            SourceConfig::Filesystem(fs) => &fs.exclude_globs,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let ext = config.source.extension();
    if ext.is_empty() || ext.starts_with('.') {
        bail!("source.extension must be non-empty and given without a leading dot");
    }
    build_globset(config.source.exclude_globs()).context("source.exclude_globs is invalid")?;

    if let SourceConfig::S3(s3) = &config.source {
        if s3.bucket.is_empty() {
            bail!("source.bucket must be set");
        }
    }

    match &config.index {
        IndexConfig::FileSearch(fs) => {
            if !fs.store_name.starts_with("fileSearchStores/") {
                bail!(
                    "index.store_name must be a full resource name (fileSearchStores/...), got '{}'",
                    fs.store_name
                );
            }
            if fs.page_size == 0 {
                bail!("index.page_size must be > 0");
            }
        }
        IndexConfig::Sqlite(sqlite) => {
            if sqlite.max_tokens == 0 {
                bail!("index.max_tokens must be > 0");
            }
            if sqlite.overlap_tokens >= sqlite.max_tokens {
                bail!("index.overlap_tokens must be smaller than index.max_tokens");
            }
        }
    }

    if config.lock.marker.is_empty() {
        bail!("lock.marker must be non-empty");
    }

    let sync = &config.sync;
    if sync.concurrency == 0 {
        bail!("sync.concurrency must be > 0");
    }
    if sync.poll_interval_ms == 0 {
        bail!("sync.poll_interval_ms must be > 0");
    }
    if sync.poll_max_interval_ms < sync.poll_interval_ms {
        bail!("sync.poll_max_interval_ms must be >= sync.poll_interval_ms");
    }
    if !(sync.poll_backoff >= 1.0) || !sync.poll_backoff.is_finite() {
        bail!("sync.poll_backoff must be a finite number >= 1.0");
    }
    if sync.indexing_timeout_secs == 0 {
        bail!("sync.indexing_timeout_secs must be > 0");
    }
    if sync.request_timeout_secs == 0 {
        bail!("sync.request_timeout_secs must be > 0");
    }

    Ok(())
}

/// Build a [`GlobSet`] from a list of glob pattern strings.
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_s3_config_gets_defaults() {
        let config = parse(
            r#"
            [source]
            kind = "s3"
            bucket = "notes"
            prefix = "session-notes/"

            [index]
            kind = "file_search"
            store_name = "fileSearchStores/notes-123"
            "#,
        )
        .unwrap();

        assert_eq!(config.source.root(), "session-notes/");
        assert_eq!(config.source.extension(), "md");
        assert_eq!(config.lock.marker, "notes-sync.STARTING");
        assert_eq!(config.sync.concurrency, 8);
        assert_eq!(config.sync.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.sync.run_timeout(), Some(Duration::from_secs(840)));
        match config.index {
            IndexConfig::FileSearch(fs) => {
                assert_eq!(fs.api_key_env, "GEMINI_API_KEY");
                assert_eq!(fs.page_size, 20);
            }
            other => panic!("unexpected index config: {:?}", other),
        }
    }

    #[test]
    fn test_filesystem_and_sqlite() {
        let config = parse(
            r#"
            [source]
            kind = "filesystem"
            root = "./session-notes"

            [index]
            kind = "sqlite"
            path = "./data/notes.sqlite"

            [sync]
            run_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert!(matches!(config.source, SourceConfig::Filesystem(_)));
        assert_eq!(config.sync.run_timeout(), None);
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = |extra: &str| {
            format!(
                r#"
                [source]
                kind = "filesystem"
                root = "notes"
                {}

                [index]
                kind = "sqlite"
                path = "x.sqlite"

                [sync]
                poll_interval_ms = 500
                poll_max_interval_ms = 100
                "#,
                extra
            )
        };
        let err = parse(&base("")).unwrap_err();
        assert!(err.to_string().contains("poll_max_interval_ms"), "{}", err);

        let err = parse(&base("extension = \".md\"")).unwrap_err();
        assert!(err.to_string().contains("extension"), "{}", err);
    }

    #[test]
    fn test_rejects_infinite_backoff() {
        let err = parse(
            r#"
            [source]
            kind = "filesystem"
            root = "notes"

            [index]
            kind = "sqlite"
            path = "x.sqlite"

            [sync]
            poll_backoff = inf
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("poll_backoff"), "{}", err);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/nsync.example.toml")).unwrap();
        assert!(matches!(config.source, SourceConfig::S3(_)));
        assert_eq!(config.sync.poll_backoff, 1.5);
    }

    #[test]
    fn test_rejects_short_store_name() {
        let err = parse(
            r#"
            [source]
            kind = "filesystem"
            root = "notes"

            [index]
            kind = "file_search"
            store_name = "notes-123"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fileSearchStores/"), "{}", err);
    }
}
