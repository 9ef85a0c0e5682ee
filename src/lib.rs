//! # notes-sync
//!
//! Keeps a searchable document index in step with a store of Markdown
//! session notes.
//!
//! Each run compares the notes in the source (an S3 prefix or a local
//! directory) against the documents in the index (a hosted file-search
//! store or a local SQLite FTS index) and converges the index: new notes
//! are uploaded, changed notes replaced, removed notes deleted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌─────────┐   ┌──────────────┐
//! │   Source    │──▶│  Scan    │──▶│  Plan   │──▶│   Mutate     │──▶ Index
//! │  S3 / FS    │   │ +finger- │   │ (pure)  │   │ upload/poll/ │
//! └─────────────┘   │  print   │   └─────────┘   │ delete       │
//!        Index ────▶│          │                 └──────────────┘
//!                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nsync init                # create the local index (sqlite only)
//! nsync plan                # show what a sync would do
//! nsync sync                # reconcile
//! nsync search "vexarion"   # query the local index
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Run context and settings |
//! | [`scan`] | Source and index inventories |
//! | [`mutate`] | Upload, replace, delete against the index |
//! | [`reconcile`] | Lock, phases, and reporting of a run |
//! | [`report`] | Run report types |
//! | [`source_s3`] | Amazon S3 source and lock |
//! | [`source_fs`] | Local directory source and lock |
//! | [`file_search`] | Hosted file-search index |
//! | [`sqlite_index`] | Local SQLite index |
//! | [`search`] | Keyword search over the local index |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod context;
pub mod db;
pub mod file_search;
pub mod migrate;
pub mod mutate;
pub mod reconcile;
pub mod report;
pub mod scan;
pub mod search;
pub mod source_fs;
pub mod source_s3;
pub mod sqlite_index;

pub use context::{PollPolicy, SyncContext, SyncSettings};
pub use reconcile::{preview, run, unlock, SyncPreview};
pub use report::{RunReport, RunStatus};
