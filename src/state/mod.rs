//! Persistent migration state.
//!
//! - Append-only JSONL logs: one manifest line per completed asset, one
//!   dead-letter line per abandoned task or failed asset
//! - SQLite run-state database: run history, resume checkpoints, and a
//!   queryable copy of manifests and dead letters for `status`

pub mod db;
pub mod error;
pub mod jsonl;
pub mod ledger;
pub mod schema;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use ledger::Ledger;
pub use types::{DeadLetterKind, DeadLetterRecord, ManifestRecord, RunStats};
