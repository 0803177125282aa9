//! Migration engine.
//!
//! The driver alternates between two phases until the listing is exhausted:
//!
//! - FILLING: pull listing pages and expand newly seen assets into transfer
//!   tasks while fewer than `jobs` tasks are pending
//! - DRAINING: hand the collected tasks to the scheduler and wait for every
//!   one to complete or be dead-lettered, then checkpoint the cursor
//!
//! Manifests are released by the [`CompletionTracker`] the moment an asset's
//! last rendition lands, so they appear in completion order rather than
//! listing order.

pub mod enumerator;
pub mod error;
pub mod grouper;
pub mod paths;
pub mod rendition;
pub mod scheduler;
pub mod tracker;
pub mod worker;

#[cfg(test)]
mod testing;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::destination::ObjectStore;
use crate::origin::OriginStore;
use crate::retry::RetryConfig;
use crate::state::{Ledger, RunStats};

use self::enumerator::{CursorEnumerator, PageBatch, PageOutcome};
use self::paths::{Cursor, PathLayout};
use self::rendition::RenditionSelector;
use self::scheduler::TransferScheduler;
use self::tracker::{CompletionTracker, Counters, TransferTask};
use self::worker::TransferWorker;

/// Engine settings derived from the validated application config.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub layout: PathLayout,
    pub extensions: Vec<String>,
    pub jobs: usize,
    /// Listing entries requested per page.
    pub page_size: usize,
    pub retry: RetryConfig,
    pub chunk_size: usize,
    pub transfer_timeout: Duration,
    pub no_progress_bar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Filling,
    Draining,
    Done,
}

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counters: Counters,
    pub discovered: usize,
    pub waves: u64,
    /// Where a follow-up `resume` should start when the run is incomplete.
    pub resume: Option<Cursor>,
    pub interrupted: bool,
    pub enumeration_error: Option<String>,
    pub ledger_failures: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Whether the listing was walked to its end and every selected
    /// rendition landed.
    pub fn is_complete(&self) -> bool {
        !self.interrupted
            && self.enumeration_error.is_none()
            && self.counters.pending == 0
            && self.counters.dead_lettered == 0
            && self.counters.failed_assets == 0
            && self.ledger_failures == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DryRunSummary {
    pub assets: usize,
    pub would_transfer: u64,
    pub failed_assets: usize,
    pub interrupted: bool,
    pub enumeration_error: Option<String>,
}

/// Spinner with transferred count; hidden when disabled or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} transferred {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Mutable bookkeeping of one driver run.
struct Driver {
    cursor: Option<Cursor>,
    /// Cursor a resume would start from without losing work.
    checkpoint: Option<Cursor>,
    /// Cursor of the listing call that failed, if any.
    failed_cursor: Option<Cursor>,
    wave: Vec<TransferTask>,
    waves: u64,
    interrupted: bool,
    enumeration_error: Option<String>,
    ledger_failures: u64,
}

impl Driver {
    async fn absorb(&mut self, batch: PageBatch, ledger: &Ledger, pb: &ProgressBar) {
        for record in &batch.failed_assets {
            if let Err(e) = ledger.dead_letter(record).await {
                self.ledger_failures += 1;
                pb.suspend(|| {
                    tracing::error!("Failed to write dead letter for {}: {}", record.asset_id, e)
                });
            }
        }
        self.wave.extend(batch.tasks);
    }
}

/// Run a migration from `start` until the listing is exhausted, discovery
/// fails, or `shutdown` fires.
pub async fn run(
    origin: Arc<dyn OriginStore>,
    destination: Arc<dyn ObjectStore>,
    ledger: Arc<Ledger>,
    config: &MigrateConfig,
    start: Cursor,
    shutdown: CancellationToken,
) -> RunSummary {
    let started = Instant::now();
    let jobs = config.jobs.max(1);
    let tracker = Arc::new(CompletionTracker::new());

    let mut enumerator = CursorEnumerator::new(
        origin.clone(),
        RenditionSelector::new(&config.extensions),
        config.layout.clone(),
        tracker.clone(),
        config.retry,
        config.page_size,
        false,
    );
    let worker = Arc::new(TransferWorker::new(
        origin,
        destination,
        config.layout.clone(),
        config.chunk_size,
        config.transfer_timeout,
    ));
    let scheduler = TransferScheduler::new(
        jobs,
        worker,
        tracker.clone(),
        ledger.clone(),
        config.retry,
    );

    tracing::info!(
        "Migrating from {} (jobs: {}, page size: {})",
        start,
        scheduler.jobs(),
        config.page_size
    );

    let pb = create_progress_bar(config.no_progress_bar);
    let mut driver = Driver {
        cursor: Some(start.clone()),
        checkpoint: Some(start),
        failed_cursor: None,
        wave: Vec::new(),
        waves: 0,
        interrupted: false,
        enumeration_error: None,
        ledger_failures: 0,
    };
    let mut state = DriverState::Filling;

    while state != DriverState::Done {
        state = match state {
            DriverState::Filling => {
                while tracker.pending_count() < jobs && !shutdown.is_cancelled() {
                    let Some(cursor) = driver.cursor.clone() else {
                        break;
                    };
                    match enumerator.next_page(&cursor).await {
                        PageOutcome::Page { next, batch } => {
                            driver.absorb(batch, &ledger, &pb).await;
                            driver.cursor = Some(next);
                        }
                        PageOutcome::Exhausted { batch } => {
                            driver.absorb(batch, &ledger, &pb).await;
                            driver.cursor = None;
                            pb.suspend(|| tracing::debug!("Listing exhausted after {}", cursor));
                        }
                        PageOutcome::Error(e) => {
                            pb.suspend(|| {
                                tracing::error!("Listing from {} failed, stopping discovery: {}", cursor, e)
                            });
                            driver.enumeration_error = Some(e.to_string());
                            driver.failed_cursor = Some(cursor);
                            driver.cursor = None;
                        }
                    }
                    pb.set_message(format!("{} pending", tracker.pending_count()));
                }

                if shutdown.is_cancelled() {
                    pb.suspend(|| tracing::info!("Shutdown requested, not starting another wave"));
                    driver.interrupted = true;
                    DriverState::Done
                } else if driver.wave.is_empty() {
                    DriverState::Done
                } else {
                    DriverState::Draining
                }
            }
            DriverState::Draining => {
                let tasks = std::mem::take(&mut driver.wave);
                driver.waves += 1;
                let report = scheduler.run_wave(tasks, &shutdown, &pb).await;
                driver.ledger_failures += report.ledger_failures;

                let counters = tracker.counters();
                let live_assets = tracker.live_assets();
                pb.set_message(format!("{} pending", counters.pending));
                pb.suspend(|| {
                    tracing::info!(
                        "Wave {}: pending {} ({} assets open), transferred {}, manifests {}, dead letters {}",
                        driver.waves,
                        counters.pending,
                        live_assets,
                        counters.transferred,
                        counters.manifests,
                        counters.dead_lettered
                    )
                });

                if report.unlaunched.is_empty() {
                    driver.checkpoint = driver
                        .cursor
                        .clone()
                        .or_else(|| driver.failed_cursor.clone());
                    if let Some(checkpoint) = &driver.checkpoint {
                        ledger
                            .checkpoint(checkpoint.as_str(), counters.transferred)
                            .await;
                    }
                }

                if shutdown.is_cancelled() {
                    driver.interrupted = true;
                    DriverState::Done
                } else if driver.cursor.is_some() {
                    DriverState::Filling
                } else {
                    DriverState::Done
                }
            }
            DriverState::Done => DriverState::Done,
        };
    }

    pb.finish_and_clear();

    let counters = tracker.counters();
    let resume = if driver.interrupted || driver.enumeration_error.is_some() {
        driver.checkpoint.clone()
    } else {
        None
    };
    let summary = RunSummary {
        counters,
        discovered: enumerator.discovered(),
        waves: driver.waves,
        resume,
        interrupted: driver.interrupted,
        enumeration_error: driver.enumeration_error,
        ledger_failures: driver.ledger_failures,
        elapsed: started.elapsed(),
    };

    ledger
        .finish(&RunStats {
            transferred: counters.transferred,
            manifests: counters.manifests,
            dead_letters: counters.dead_lettered,
            failed_assets: counters.failed_assets,
            interrupted: summary.interrupted || summary.enumeration_error.is_some(),
            resume_cursor: summary.resume.as_ref().map(|c| c.to_string()),
        })
        .await;

    log_summary(&summary);
    summary
}

fn log_summary(summary: &RunSummary) {
    let c = &summary.counters;
    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} assets discovered, {} manifests emitted, {} assets failed",
        summary.discovered,
        c.manifests,
        c.failed_assets
    );
    tracing::info!(
        "  {} transferred, {} dead-lettered, {} pending",
        c.transferred,
        c.dead_lettered,
        c.pending
    );
    tracing::info!("  waves: {}", summary.waves);
    tracing::info!("  elapsed: {}", format_duration(summary.elapsed));
    if let Some(e) = &summary.enumeration_error {
        tracing::warn!("  Listing failed: {}", e);
    }
    if summary.ledger_failures > 0 {
        tracing::error!("  {} records could not be written", summary.ledger_failures);
    }
    if let Some(cursor) = &summary.resume {
        tracing::info!("  resume with: ns-migrate resume {}", cursor);
    } else if summary.is_complete() {
        tracing::info!("Migration complete");
    }
}

/// Walk the listing and log what a run would transfer. Reads no object
/// bodies and writes nothing.
pub async fn dry_run(
    origin: Arc<dyn OriginStore>,
    config: &MigrateConfig,
    start: Cursor,
    shutdown: CancellationToken,
) -> DryRunSummary {
    let tracker = Arc::new(CompletionTracker::new());
    let mut enumerator = CursorEnumerator::new(
        origin,
        RenditionSelector::new(&config.extensions),
        config.layout.clone(),
        tracker,
        config.retry,
        config.page_size,
        true,
    );

    let mut summary = DryRunSummary::default();
    let mut cursor = Some(start);
    while let Some(current) = cursor.take() {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, stopping dry run");
            summary.interrupted = true;
            break;
        }
        let batch = match enumerator.next_page(&current).await {
            PageOutcome::Page { next, batch } => {
                cursor = Some(next);
                batch
            }
            PageOutcome::Exhausted { batch } => batch,
            PageOutcome::Error(e) => {
                tracing::error!("Listing from {} failed: {}", current, e);
                summary.enumeration_error = Some(e.to_string());
                break;
            }
        };
        summary.would_transfer += batch.would_transfer;
        summary.failed_assets += batch.failed_assets.len();
    }
    summary.assets = enumerator.discovered();

    tracing::info!("── Dry Run Summary ──");
    if summary.interrupted {
        tracing::info!("  Interrupted after scanning {} assets", summary.assets);
    }
    tracing::info!(
        "  {} files would be transferred from {} assets",
        summary.would_transfer,
        summary.assets
    );
    if summary.failed_assets > 0 {
        tracing::info!("  {} assets have no usable renditions", summary.failed_assets);
    }
    tracing::info!("  source root: {}", config.layout.source_root());
    tracing::info!("  concurrency: {}", config.jobs);
    summary
}
