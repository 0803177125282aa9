//! Records written to the manifest log, the dead-letter log and the state
//! database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed asset: the line a downstream consumer reads to learn that
/// every selected rendition is in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub asset_id: String,
    pub bucket: String,
    pub manifest_url: String,
    /// Destination keys, highest bitrate first.
    pub renditions: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterKind {
    /// A single transfer that exhausted its retries or failed permanently.
    Task,
    /// An asset whose manifest will never be emitted.
    Asset,
}

impl DeadLetterKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Asset => "asset",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "asset" => Some(Self::Asset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub kind: DeadLetterKind,
    pub asset_id: String,
    /// Origin path of the failed transfer (task records only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Dead-lettered renditions (asset records only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    pub attempts: u32,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn task(asset_id: &str, source: &str, attempts: u32, error: &str) -> Self {
        Self {
            kind: DeadLetterKind::Task,
            asset_id: asset_id.to_string(),
            source: Some(source.to_string()),
            paths: Vec::new(),
            attempts,
            error: error.to_string(),
            recorded_at: Utc::now(),
        }
    }

    pub fn asset(asset_id: &str, error: &str, paths: Vec<String>) -> Self {
        Self {
            kind: DeadLetterKind::Asset,
            asset_id: asset_id.to_string(),
            source: None,
            paths,
            attempts: 0,
            error: error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Statistics for a single migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub transferred: u64,
    pub manifests: u64,
    pub dead_letters: u64,
    pub failed_assets: u64,
    /// Whether the run stopped early (shutdown or enumeration failure).
    pub interrupted: bool,
    /// Where a follow-up `resume` should start.
    pub resume_cursor: Option<String>,
}

/// One row of run history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub start_cursor: String,
    pub stats: RunStats,
}

/// Last cursor recorded after a fully drained wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_id: i64,
    pub cursor: String,
    pub transferred: u64,
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Summary of the state database.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    pub runs: u64,
    pub manifests: u64,
    pub task_dead_letters: u64,
    pub failed_assets: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
    pub last_checkpoint: Option<Checkpoint>,
}
