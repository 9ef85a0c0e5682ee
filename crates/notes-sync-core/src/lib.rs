//! # notes-sync core
//!
//! Backend-agnostic pieces of the notes reconciliation engine: inventory
//! models, the pure reconciliation planner, content fingerprinting, the
//! store traits that backends implement, and in-memory stores for tests.
//!
//! This crate has no tokio, sqlx, or HTTP dependencies. The engine that
//! drives these pieces against real backends lives in the `notes-sync`
//! crate.

pub mod chunk;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod plan;
pub mod store;

pub use error::{RunPhase, SyncError};
pub use plan::{plan, ActionKind, PlanSummary, ReconciliationAction};
