//! Bounded-concurrency transfer execution.
//!
//! A wave is run as a continuously refilling pool: at most `jobs` transfers
//! hold a semaphore permit at any time, and a freed permit is immediately
//! handed to the next queued task. Retries sleep out their backoff inside
//! the pool without holding a permit and then rejoin the queue. The wave
//! ends when every task has completed or been dead-lettered.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use indicatif::ProgressBar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::error::TransferError;
use super::tracker::{AssetResolution, CompletionTracker, FailureDisposition, TransferTask};
use super::worker::TransferWorker;
use crate::retry::RetryConfig;
use crate::state::{DeadLetterRecord, Ledger, ManifestRecord};

#[derive(Debug, Default)]
pub struct WaveReport {
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Tasks never started because shutdown was requested.
    pub unlaunched: Vec<TransferTask>,
    /// Manifest or dead-letter records that could not be written.
    pub ledger_failures: u64,
}

enum Joined {
    Finished {
        task: TransferTask,
        result: Result<u64, TransferError>,
    },
    /// A retry whose backoff has elapsed.
    Ready(TransferTask),
}

struct Wave<'a> {
    queue: VecDeque<TransferTask>,
    running: JoinSet<Joined>,
    report: WaveReport,
    shutdown: &'a CancellationToken,
    pb: &'a ProgressBar,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct TransferScheduler {
    jobs: usize,
    permits: Arc<Semaphore>,
    worker: Arc<TransferWorker>,
    tracker: Arc<CompletionTracker>,
    ledger: Arc<Ledger>,
    retry: RetryConfig,
}

impl TransferScheduler {
    pub fn new(
        jobs: usize,
        worker: Arc<TransferWorker>,
        tracker: Arc<CompletionTracker>,
        ledger: Arc<Ledger>,
        retry: RetryConfig,
    ) -> Self {
        let jobs = jobs.max(1);
        Self {
            jobs,
            permits: Arc::new(Semaphore::new(jobs)),
            worker,
            tracker,
            ledger,
            retry,
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Run `tasks` to completion. Once `shutdown` fires no new transfer
    /// starts; in-flight transfers finish and the rest come back in
    /// [`WaveReport::unlaunched`].
    pub async fn run_wave(
        &self,
        tasks: Vec<TransferTask>,
        shutdown: &CancellationToken,
        pb: &ProgressBar,
    ) -> WaveReport {
        let mut wave = Wave {
            queue: tasks.into(),
            running: JoinSet::new(),
            report: WaveReport::default(),
            shutdown,
            pb,
        };

        loop {
            if wave.queue.is_empty() && wave.running.is_empty() {
                break;
            }
            let launchable = !wave.queue.is_empty() && !shutdown.is_cancelled();

            tokio::select! {
                biased;

                Some(joined) = wave.running.join_next() => match joined {
                    Ok(Joined::Finished { task, result }) => {
                        self.settle(&mut wave, task, result).await;
                    }
                    Ok(Joined::Ready(task)) => wave.queue.push_back(task),
                    Err(e) => {
                        pb.suspend(|| tracing::error!("Transfer task was aborted: {}", e));
                    }
                },

                permit = self.permits.clone().acquire_owned(), if launchable => {
                    let Ok(permit) = permit else { break };
                    if let Some(task) = wave.queue.pop_front() {
                        let worker = self.worker.clone();
                        tracing::debug!(source = %task.source, attempt = task.attempt, "Starting transfer");
                        wave.running.spawn(async move {
                            let _permit = permit;
                            let result = AssertUnwindSafe(worker.execute(&task))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|payload| {
                                    Err(TransferError::Panicked(panic_message(payload.as_ref())))
                                });
                            Joined::Finished { task, result }
                        });
                    }
                },

                _ = shutdown.cancelled(), if !wave.queue.is_empty() => {
                    let unlaunched: Vec<TransferTask> = wave.queue.drain(..).collect();
                    pb.suspend(|| {
                        tracing::info!(
                            "Shutdown requested: {} queued transfers will not start",
                            unlaunched.len()
                        )
                    });
                    wave.report.unlaunched.extend(unlaunched);
                },

                else => break,
            }
        }

        wave.report
    }

    async fn settle(&self, wave: &mut Wave<'_>, task: TransferTask, result: Result<u64, TransferError>) {
        match result {
            Ok(bytes) => {
                tracing::debug!(source = %task.source, bytes, "Transferred");
                wave.report.completed += 1;
                wave.pb.inc(1);
                if let Some(resolution) = self.tracker.complete(&task.asset, &task.source) {
                    self.resolve(wave, resolution).await;
                }
            }
            Err(e) => {
                let reason = e.to_string();
                match self.tracker.fail(&task, &reason, e.is_retryable()) {
                    FailureDisposition::Retry(next) => {
                        let delay = self.retry.delay_for_retry(task.attempt.saturating_sub(1));
                        wave.pb.suspend(|| {
                            tracing::warn!(
                                "Transfer of {} failed (attempt {}/{}), retrying in {}s: {}",
                                task.source,
                                task.attempt,
                                task.attempt + task.attempts_remaining,
                                delay.as_secs(),
                                reason
                            )
                        });
                        wave.report.retried += 1;
                        let token = wave.shutdown.clone();
                        wave.running.spawn(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = token.cancelled() => {}
                            }
                            Joined::Ready(next)
                        });
                    }
                    FailureDisposition::DeadLetter {
                        task,
                        reason,
                        resolution,
                    } => {
                        wave.pb.suspend(|| {
                            tracing::error!(
                                "Giving up on {} after {} attempt(s): {}",
                                task.source,
                                task.attempt,
                                reason
                            )
                        });
                        wave.report.dead_lettered += 1;
                        let record = DeadLetterRecord::task(
                            task.asset.as_str(),
                            &task.source,
                            task.attempt,
                            &reason,
                        );
                        self.write_dead_letter(wave, &record).await;
                        if let Some(resolution) = resolution {
                            self.resolve(wave, resolution).await;
                        }
                    }
                }
            }
        }
    }

    async fn resolve(&self, wave: &mut Wave<'_>, resolution: AssetResolution) {
        match resolution {
            AssetResolution::Completed {
                asset_id,
                manifest_url,
                renditions,
            } => {
                let layout = self.worker.layout();
                let record = ManifestRecord {
                    asset_id: asset_id.to_string(),
                    bucket: self.worker.bucket().to_string(),
                    manifest_url,
                    renditions: renditions
                        .iter()
                        .filter_map(|source| layout.destination_key(source).ok())
                        .collect(),
                    completed_at: Utc::now(),
                };
                if let Err(e) = self.ledger.manifest(&record).await {
                    wave.report.ledger_failures += 1;
                    wave.pb.suspend(|| {
                        tracing::error!("Failed to write manifest for asset {}: {}", asset_id, e)
                    });
                    return;
                }
                wave.pb.suspend(|| {
                    tracing::info!("Asset {} complete: {}", asset_id, record.manifest_url)
                });
            }
            AssetResolution::Failed {
                asset_id,
                manifest_url,
                dead_lettered,
            } => {
                let reason = format!(
                    "{} rendition(s) dead-lettered; manifest {} not emitted",
                    dead_lettered.len(),
                    manifest_url
                );
                wave.pb
                    .suspend(|| tracing::error!("Asset {} failed: {}", asset_id, reason));
                let record = DeadLetterRecord::asset(asset_id.as_str(), &reason, dead_lettered);
                self.write_dead_letter(wave, &record).await;
            }
        }
    }

    async fn write_dead_letter(&self, wave: &mut Wave<'_>, record: &DeadLetterRecord) {
        if let Err(e) = self.ledger.dead_letter(record).await {
            wave.report.ledger_failures += 1;
            wave.pb.suspend(|| {
                tracing::error!("Failed to write dead letter for {}: {}", record.asset_id, e)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::paths::{AssetId, PathLayout};
    use crate::migrate::testing::{FakeOrigin, MemoryStore, ReadFailure};
    use crate::state::jsonl::read_all;
    use crate::state::types::DeadLetterKind;
    use std::time::Duration;

    struct Harness {
        scheduler: TransferScheduler,
        tracker: Arc<CompletionTracker>,
        store: MemoryStore,
        origin: Arc<FakeOrigin>,
        dir: tempfile::TempDir,
    }

    fn no_delay(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_secs: 0,
            max_delay_secs: 0,
        }
    }

    async fn harness(origin: FakeOrigin, store: MemoryStore, jobs: usize, retry: RetryConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(origin);
        let worker = Arc::new(TransferWorker::new(
            origin.clone(),
            Arc::new(store.clone()),
            PathLayout::new("/r", "", "https://cdn.example.com"),
            8,
            Duration::from_secs(5),
        ));
        let tracker = Arc::new(CompletionTracker::new());
        let ledger = Arc::new(
            Ledger::open(
                &dir.path().join("manifests.jsonl"),
                &dir.path().join("dead_letters.jsonl"),
                None,
                "/r",
            )
            .await
            .unwrap(),
        );
        Harness {
            scheduler: TransferScheduler::new(jobs, worker, tracker.clone(), ledger, retry),
            tracker,
            store,
            origin,
            dir,
        }
    }

    fn register(tracker: &CompletionTracker, asset: &str, sources: &[&str], retries: u32) -> Vec<TransferTask> {
        let id = AssetId::new(asset);
        let sources: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
        tracker.register(&id, &sources, &format!("https://cdn.example.com/{}/master.m3u8", asset));
        sources
            .into_iter()
            .map(|s| TransferTask::new(s, id.clone(), retries))
            .collect()
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_jobs() {
        let files: Vec<(String, &'static str)> = (0..12)
            .map(|i| (format!("/r/v{}/a_1.mp4", i), "payload"))
            .collect();
        let store = MemoryStore::new().with_finish_delay(Duration::from_millis(20));
        let h = harness(FakeOrigin::new(files), store, 3, no_delay(0)).await;

        let mut tasks = Vec::new();
        for i in 0..12 {
            tasks.extend(register(&h.tracker, &format!("v{}", i), &[format!("/r/v{}/a_1.mp4", i).as_str()], 0));
        }

        let report = h
            .scheduler
            .run_wave(tasks, &CancellationToken::new(), &ProgressBar::hidden())
            .await;

        assert_eq!(report.completed, 12);
        assert!(h.store.peak_concurrency() <= 3);
        assert!(h.store.peak_concurrency() >= 1);
        assert_eq!(h.tracker.counters().manifests, 12);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_success() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "x"), ("/r/v1/a_2.mp4", "y")]);
        origin.fail_reads("/r/v1/a_1.mp4", ReadFailure::TransientTimes(2));
        let h = harness(origin, MemoryStore::new(), 2, no_delay(2)).await;
        let tasks = register(&h.tracker, "v1", &["/r/v1/a_1.mp4", "/r/v1/a_2.mp4"], 2);

        let report = h
            .scheduler
            .run_wave(tasks, &CancellationToken::new(), &ProgressBar::hidden())
            .await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.retried, 2);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(h.origin.reads_of("/r/v1/a_1.mp4"), 3);
        assert_eq!(h.store.object("v1/a_1.mp4").unwrap(), b"x");

        let manifests: Vec<ManifestRecord> =
            read_all(&h.dir.path().join("manifests.jsonl")).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].renditions, vec!["v1/a_1.mp4", "v1/a_2.mp4"]);
        assert_eq!(manifests[0].bucket, "media-archive");
    }

    #[tokio::test]
    async fn test_always_failing_rendition_is_dead_lettered_after_budget() {
        let origin = FakeOrigin::new([("/r/v1/a_9.mp4", "x"), ("/r/v1/a_5.mp4", "y")]);
        origin.fail_reads("/r/v1/a_9.mp4", ReadFailure::Transient);
        let h = harness(origin, MemoryStore::new(), 2, no_delay(2)).await;
        let tasks = register(&h.tracker, "v1", &["/r/v1/a_9.mp4", "/r/v1/a_5.mp4"], 2);

        let report = h
            .scheduler
            .run_wave(tasks, &CancellationToken::new(), &ProgressBar::hidden())
            .await;

        assert_eq!(h.origin.reads_of("/r/v1/a_9.mp4"), 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.tracker.pending_count(), 0);

        let counters = h.tracker.counters();
        assert_eq!(counters.manifests, 0);
        assert_eq!(counters.failed_assets, 1);

        let manifests: Vec<ManifestRecord> =
            read_all(&h.dir.path().join("manifests.jsonl")).await.unwrap();
        assert!(manifests.is_empty());
        let dead: Vec<DeadLetterRecord> =
            read_all(&h.dir.path().join("dead_letters.jsonl")).await.unwrap();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].kind, DeadLetterKind::Task);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[1].kind, DeadLetterKind::Asset);
        assert_eq!(dead[1].paths, vec!["/r/v1/a_9.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "x")]);
        origin.fail_reads("/r/v1/a_1.mp4", ReadFailure::Missing);
        let h = harness(origin, MemoryStore::new(), 1, no_delay(5)).await;
        let tasks = register(&h.tracker, "v1", &["/r/v1/a_1.mp4"], 5);

        let report = h
            .scheduler
            .run_wave(tasks, &CancellationToken::new(), &ProgressBar::hidden())
            .await;

        assert_eq!(h.origin.reads_of("/r/v1/a_1.mp4"), 1);
        assert_eq!(report.retried, 0);
        assert_eq!(report.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_cancelled_wave_launches_nothing() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "x"), ("/r/v1/a_2.mp4", "y")]);
        let h = harness(origin, MemoryStore::new(), 1, no_delay(0)).await;
        let tasks = register(&h.tracker, "v1", &["/r/v1/a_1.mp4", "/r/v1/a_2.mp4"], 0);

        let token = CancellationToken::new();
        token.cancel();
        let report = h.scheduler.run_wave(tasks, &token, &ProgressBar::hidden()).await;

        assert_eq!(report.completed, 0);
        assert_eq!(report.unlaunched.len(), 2);
        assert!(h.store.keys().is_empty());
        assert_eq!(h.tracker.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_wave_finishes_in_flight() {
        let files: Vec<(String, &'static str)> = (0..6)
            .map(|i| (format!("/r/v1/a_{}.mp4", i), "payload"))
            .collect();
        let store = MemoryStore::new().with_finish_delay(Duration::from_millis(50));
        let h = harness(FakeOrigin::new(files), store, 2, no_delay(0)).await;
        let sources: Vec<String> = (0..6).map(|i| format!("/r/v1/a_{}.mp4", i)).collect();
        let refs: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
        let tasks = register(&h.tracker, "v1", &refs, 0);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let report = h.scheduler.run_wave(tasks, &token, &ProgressBar::hidden()).await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.unlaunched.len(), 4);
        assert_eq!(h.store.keys().len(), 2);
        assert_eq!(h.store.active(), 0);
        assert_eq!(h.tracker.counters().manifests, 0);
    }
}
