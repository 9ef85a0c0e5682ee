//! # notes-sync CLI (`nsync`)
//!
//! The `nsync` binary reconciles a notes store into a search index.
//!
//! ## Usage
//!
//! ```bash
//! nsync --config ./config/nsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nsync init` | Create the local SQLite index schema |
//! | `nsync sync` | Run one reconciliation pass |
//! | `nsync plan` | Show the actions a sync would take |
//! | `nsync unlock` | Remove a run lock left behind by a killed run |
//! | `nsync search "<query>"` | Keyword search over the local index |
//!
//! ## Exit status
//!
//! `0` when the run completed (or was skipped because another run holds
//! the lock), `1` when it aborted, `2` when it completed with per-note
//! failures.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use notes_sync::config::{self, IndexConfig};
use notes_sync::sqlite_index::SqliteIndexStore;
use notes_sync::{reconcile, search, RunStatus, SyncContext};
use notes_sync_core::chunk::ChunkingParams;

/// notes-sync: keep a search index in step with a store of Markdown notes.
#[derive(Parser)]
#[command(
    name = "nsync",
    about = "Reconcile a Markdown notes store into a searchable document index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nsync.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local index database.
    ///
    /// Only meaningful for `kind = "sqlite"` indexes; idempotent.
    Init,

    /// Run one reconciliation pass.
    ///
    /// Takes the run lock, scans source and index, then uploads, replaces,
    /// and deletes documents until the index matches the source.
    Sync {
        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Scan both stores and print the plan without changing anything.
    Plan {
        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove the run lock marker.
    ///
    /// Use only when no sync is running, e.g. after the process was killed.
    Unlock,

    /// Search the local index.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => match &cfg.index {
            IndexConfig::Sqlite(sqlite) => {
                let chunking = ChunkingParams {
                    max_tokens: sqlite.max_tokens,
                    overlap_tokens: sqlite.overlap_tokens,
                };
                SqliteIndexStore::open(&sqlite.path, chunking).await?;
                println!("Index initialized at {}.", sqlite.path.display());
            }
            IndexConfig::FileSearch(fs) => {
                println!(
                    "Nothing to initialize: {} is managed by the file search service.",
                    fs.store_name
                );
            }
        },

        Commands::Sync { json } => {
            let ctx = SyncContext::from_config(&cfg).await?;
            let report = match reconcile::run(&ctx).await {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return Ok(ExitCode::from(1));
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
                for failure in &report.scan_failures {
                    println!("  scan failed: {} ({})", failure.identifier, failure.error);
                }
                for failure in &report.failures {
                    println!(
                        "  {} failed: {} ({})",
                        failure.action.as_str(),
                        failure.identifier,
                        failure.error
                    );
                }
            }

            if report.status == RunStatus::CompletedWithFailures {
                return Ok(ExitCode::from(2));
            }
        }

        Commands::Plan { json } => {
            let ctx = SyncContext::from_config(&cfg).await?;
            let preview = reconcile::preview(&ctx).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                let s = &preview.summary;
                println!(
                    "upload {}, replace {}, delete {}, unchanged {}",
                    s.upload, s.replace, s.delete, s.skip
                );
                for action in preview.actions.iter().filter(|a| a.is_mutation()) {
                    println!("  {:<8} {}", action.kind().as_str(), action.identifier());
                }
                for name in &preview.duplicates {
                    println!("  {:<8} {} (duplicate)", "delete", name);
                }
                for name in &preview.failed_documents {
                    println!("  {:<8} {} (failed indexing)", "delete", name);
                }
                for failure in &preview.scan_failures {
                    println!("  scan failed: {} ({})", failure.identifier, failure.error);
                }
            }
        }

        Commands::Unlock => {
            let ctx = SyncContext::from_config(&cfg).await?;
            if reconcile::unlock(&ctx).await? {
                println!("Removed run lock {}.", ctx.settings.lock_marker);
            } else {
                println!("No run lock present.");
            }
        }

        Commands::Search { query, limit } => {
            let IndexConfig::Sqlite(sqlite) = &cfg.index else {
                bail!("search is only available for the local sqlite index");
            };
            let chunking = ChunkingParams {
                max_tokens: sqlite.max_tokens,
                overlap_tokens: sqlite.overlap_tokens,
            };
            let store = SqliteIndexStore::open(&sqlite.path, chunking)
                .await
                .context("Failed to open local index")?;
            let hits = search::search(store.pool(), &query, limit).await?;

            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {}",
                    i + 1,
                    hit.score,
                    hit.identifier.as_deref().unwrap_or(&hit.display_name)
                );
                println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
                println!("    resource: {}", hit.resource_name);
                println!();
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
