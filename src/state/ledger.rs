//! Durable outcome records of one run.
//!
//! The JSONL logs are the record downstream systems consume, so a failed
//! append is returned to the caller. The state database is auxiliary: its
//! failures are logged and the run carries on.

use std::path::Path;
use std::sync::Arc;

use super::db::StateDb;
use super::error::StateError;
use super::jsonl::JsonlLog;
use super::types::{DeadLetterRecord, ManifestRecord, RunStats};

struct RunHandle {
    db: Arc<dyn StateDb>,
    run_id: i64,
}

pub struct Ledger {
    manifests: JsonlLog,
    dead_letters: JsonlLog,
    run: Option<RunHandle>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("manifests", &self.manifests.path())
            .field("dead_letters", &self.dead_letters.path())
            .field("run_id", &self.run.as_ref().map(|r| r.run_id))
            .finish()
    }
}

impl Ledger {
    /// Open both logs and, when a database is available, start a run in it.
    pub async fn open(
        manifest_log: &Path,
        dead_letter_log: &Path,
        db: Option<Arc<dyn StateDb>>,
        start_cursor: &str,
    ) -> Result<Self, StateError> {
        let manifests = JsonlLog::open(manifest_log).await?;
        let dead_letters = JsonlLog::open(dead_letter_log).await?;

        let run = match db {
            Some(db) => match db.start_run(start_cursor).await {
                Ok(run_id) => Some(RunHandle { db, run_id }),
                Err(e) => {
                    tracing::warn!("Failed to record run start, continuing without state DB: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            manifests,
            dead_letters,
            run,
        })
    }

    pub fn run_id(&self) -> Option<i64> {
        self.run.as_ref().map(|r| r.run_id)
    }

    pub async fn manifest(&self, record: &ManifestRecord) -> Result<(), StateError> {
        self.manifests.append(record).await?;
        if let Some(run) = &self.run {
            if let Err(e) = run.db.record_manifest(run.run_id, record).await {
                tracing::warn!(asset_id = %record.asset_id, "Failed to record manifest in state DB: {}", e);
            }
        }
        Ok(())
    }

    pub async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StateError> {
        self.dead_letters.append(record).await?;
        if let Some(run) = &self.run {
            if let Err(e) = run.db.record_dead_letter(run.run_id, record).await {
                tracing::warn!(asset_id = %record.asset_id, "Failed to record dead letter in state DB: {}", e);
            }
        }
        Ok(())
    }

    pub async fn checkpoint(&self, cursor: &str, transferred: u64) {
        if let Some(run) = &self.run {
            if let Err(e) = run.db.record_checkpoint(run.run_id, cursor, transferred).await {
                tracing::warn!("Failed to record checkpoint {}: {}", cursor, e);
            }
        }
    }

    pub async fn finish(&self, stats: &RunStats) {
        if let Some(run) = &self.run {
            if let Err(e) = run.db.complete_run(run.run_id, stats).await {
                tracing::warn!("Failed to record run completion: {}", e);
            }
        }
    }
}
