//! State database trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{
    Checkpoint, DeadLetterKind, DeadLetterRecord, ManifestRecord, MigrationSummary, RunRecord,
    RunStats,
};

/// Trait for run-state database operations.
///
/// Object-safe so it can be shared as `Arc<dyn StateDb>` across async tasks.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Start a new run and return its ID.
    async fn start_run(&self, start_cursor: &str) -> Result<i64, StateError>;

    /// Record the cursor a `resume` should use after a fully drained wave.
    async fn record_checkpoint(
        &self,
        run_id: i64,
        cursor: &str,
        transferred: u64,
    ) -> Result<(), StateError>;

    async fn record_manifest(&self, run_id: i64, record: &ManifestRecord) -> Result<(), StateError>;

    /// Record a dead-lettered task or a failed asset.
    async fn record_dead_letter(
        &self,
        run_id: i64,
        record: &DeadLetterRecord,
    ) -> Result<(), StateError>;

    /// Complete a run with statistics.
    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError>;

    /// Most recent checkpoint across all runs.
    async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, StateError>;

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StateError>;

    /// All dead letters, oldest first.
    async fn get_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StateError>;

    /// Get a summary of the database state.
    async fn get_summary(&self) -> Result<MigrationSummary, StateError>;
}

/// SQLite implementation of the state database.
pub struct SqliteStateDb {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

fn timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn count(conn: &Connection, sql: &str) -> Result<u64, StateError> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|n| n as u64)
        .map_err(StateError::query)
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn start_run(&self, start_cursor: &str) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO runs (started_at, start_cursor) VALUES (?1, ?2)",
            rusqlite::params![started_at, start_cursor],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn record_checkpoint(
        &self,
        run_id: i64,
        cursor: &str,
        transferred: u64,
    ) -> Result<(), StateError> {
        let recorded_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO checkpoints (run_id, cursor, transferred, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![run_id, cursor, transferred as i64, recorded_at],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn record_manifest(&self, run_id: i64, record: &ManifestRecord) -> Result<(), StateError> {
        let renditions = serde_json::to_string(&record.renditions)?;
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO manifests (asset_id, run_id, bucket, manifest_url, renditions, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(asset_id) DO UPDATE SET
                run_id = excluded.run_id,
                bucket = excluded.bucket,
                manifest_url = excluded.manifest_url,
                renditions = excluded.renditions,
                completed_at = excluded.completed_at
            "#,
            rusqlite::params![
                &record.asset_id,
                run_id,
                &record.bucket,
                &record.manifest_url,
                renditions,
                record.completed_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn record_dead_letter(
        &self,
        run_id: i64,
        record: &DeadLetterRecord,
    ) -> Result<(), StateError> {
        let paths = serde_json::to_string(&record.paths)?;
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO dead_letters (run_id, kind, asset_id, source, paths, attempts, error, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                run_id,
                record.kind.as_str(),
                &record.asset_id,
                &record.source,
                paths,
                record.attempts,
                &record.error,
                record.recorded_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let interrupted = if stats.interrupted { 1 } else { 0 };
        let conn = self.lock()?;

        conn.execute(
            "UPDATE runs SET completed_at = ?1, transferred = ?2, manifests = ?3, dead_letters = ?4, failed_assets = ?5, interrupted = ?6, resume_cursor = ?7 WHERE id = ?8",
            rusqlite::params![
                completed_at,
                stats.transferred as i64,
                stats.manifests as i64,
                stats.dead_letters as i64,
                stats.failed_assets as i64,
                interrupted,
                &stats.resume_cursor,
                run_id,
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, StateError> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT run_id, cursor, transferred, recorded_at FROM checkpoints ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(Checkpoint {
                    run_id: row.get(0)?,
                    cursor: row.get(1)?,
                    transferred: row.get::<_, i64>(2)? as u64,
                    recorded_at: timestamp(row.get(3)?),
                })
            },
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, started_at, completed_at, start_cursor, transferred, manifests, dead_letters, failed_assets, interrupted, resume_cursor FROM runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(StateError::query)?;

        let runs = stmt
            .query_map([limit], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    started_at: timestamp(row.get(1)?),
                    completed_at: timestamp(row.get(2)?),
                    start_cursor: row.get(3)?,
                    stats: RunStats {
                        transferred: row.get::<_, i64>(4)? as u64,
                        manifests: row.get::<_, i64>(5)? as u64,
                        dead_letters: row.get::<_, i64>(6)? as u64,
                        failed_assets: row.get::<_, i64>(7)? as u64,
                        interrupted: row.get::<_, i64>(8)? != 0,
                        resume_cursor: row.get(9)?,
                    },
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(runs)
    }

    async fn get_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT kind, asset_id, source, paths, attempts, error, recorded_at FROM dead_letters ORDER BY id",
            )
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let paths: String = row.get(3)?;
                let recorded_at: i64 = row.get(6)?;
                Ok(DeadLetterRecord {
                    kind: DeadLetterKind::from_str(&kind).unwrap_or(DeadLetterKind::Task),
                    asset_id: row.get(1)?,
                    source: row.get(2)?,
                    paths: serde_json::from_str(&paths).unwrap_or_default(),
                    attempts: row.get(4)?,
                    error: row.get(5)?,
                    recorded_at: timestamp(Some(recorded_at)).unwrap_or(DateTime::UNIX_EPOCH),
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn get_summary(&self) -> Result<MigrationSummary, StateError> {
        let last_checkpoint = self.latest_checkpoint().await?;
        let conn = self.lock()?;

        let runs = count(&conn, "SELECT COUNT(*) FROM runs")?;
        let manifests = count(&conn, "SELECT COUNT(*) FROM manifests")?;
        let task_dead_letters = count(&conn, "SELECT COUNT(*) FROM dead_letters WHERE kind = 'task'")?;
        let failed_assets = count(&conn, "SELECT COUNT(*) FROM dead_letters WHERE kind = 'asset'")?;

        let last_run: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_run_started, last_run_completed) = match last_run {
            Some((started, completed)) => (timestamp(started), timestamp(completed)),
            None => (None, None),
        };

        Ok(MigrationSummary {
            runs,
            manifests,
            task_dead_letters,
            failed_assets,
            last_run_started,
            last_run_completed,
            last_checkpoint,
        })
    }
}
