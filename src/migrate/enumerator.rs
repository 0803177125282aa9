use std::sync::Arc;

use super::grouper::{AssetGrouper, DiscoveredAsset, Discovery};
use super::paths::{self, AssetId, Cursor, PathLayout};
use super::rendition::RenditionSelector;
use super::tracker::{CompletionTracker, TransferTask};
use crate::origin::{ListOptions, OriginError, OriginStore};
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::state::DeadLetterRecord;

fn classify(e: &OriginError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Work produced by one listing page.
#[derive(Debug, Default)]
pub struct PageBatch {
    pub tasks: Vec<TransferTask>,
    /// Assets that could not be expanded into tasks.
    pub failed_assets: Vec<DeadLetterRecord>,
    pub files_seen: usize,
    pub new_assets: usize,
    /// Transfers logged instead of queued (dry run only).
    pub would_transfer: u64,
}

#[derive(Debug)]
pub enum PageOutcome {
    /// More pages follow, starting at `next`.
    Page { next: Cursor, batch: PageBatch },
    /// The response carried no resume marker.
    Exhausted { batch: PageBatch },
    /// The listing call failed after retries. Nothing from it was applied.
    Error(OriginError),
}

/// Walks the origin's flat listing one bounded page at a time and turns
/// newly seen asset directories into transfer tasks.
pub struct CursorEnumerator {
    origin: Arc<dyn OriginStore>,
    grouper: AssetGrouper,
    selector: RenditionSelector,
    layout: PathLayout,
    tracker: Arc<CompletionTracker>,
    retry: RetryConfig,
    page_size: usize,
    dry_run: bool,
}

impl CursorEnumerator {
    pub fn new(
        origin: Arc<dyn OriginStore>,
        selector: RenditionSelector,
        layout: PathLayout,
        tracker: Arc<CompletionTracker>,
        retry: RetryConfig,
        page_size: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            origin,
            grouper: AssetGrouper::new(layout.clone()),
            selector,
            layout,
            tracker,
            retry,
            page_size: page_size.max(1),
            dry_run,
        }
    }

    /// Assets discovered so far this run.
    pub fn discovered(&self) -> usize {
        self.grouper.discovered()
    }

    pub async fn next_page(&mut self, cursor: &Cursor) -> PageOutcome {
        let options = ListOptions {
            max_entries: self.page_size,
            end: self.layout.list_end(),
        };
        let label = format!("list {}", cursor);
        let origin = self.origin.clone();
        let page = match retry_with_backoff(&self.retry, &label, classify, || {
            origin.list(cursor.as_str(), &options)
        })
        .await
        {
            Ok(page) => page,
            Err(e) => return PageOutcome::Error(e),
        };

        tracing::debug!(
            cursor = %cursor,
            entries = page.entries.len(),
            resume = ?page.resume,
            "Listed page"
        );

        let mut batch = PageBatch::default();
        for entry in page.entries.iter().filter(|e| e.is_file()) {
            batch.files_seen += 1;
            if !self.selector.is_candidate(&entry.name) {
                continue;
            }
            match self.grouper.on_file(&entry.name) {
                Some(Discovery::New(asset)) => {
                    batch.new_assets += 1;
                    self.expand(asset, &mut batch).await;
                }
                Some(Discovery::Collision { id, dir, known_dir }) => {
                    let reason = format!("asset id collides with {}", known_dir);
                    self.fail_asset(&id, &reason, vec![dir], &mut batch);
                }
                None => {}
            }
        }

        match page.resume {
            Some(next) => PageOutcome::Page {
                next: Cursor::new(next),
                batch,
            },
            None => PageOutcome::Exhausted { batch },
        }
    }

    /// Reads the asset directory, selects renditions and queues one task per
    /// rendition. Failures become asset-failure records.
    async fn expand(&self, asset: DiscoveredAsset, batch: &mut PageBatch) {
        let label = format!("dir {}", asset.dir);
        let origin = self.origin.clone();
        let dir = asset.dir.as_str();
        let entries = match retry_with_backoff(&self.retry, &label, classify, || origin.dir(dir)).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to read asset directory {}: {}", asset.dir, e);
                self.fail_asset(
                    &asset.id,
                    &format!("directory read failed: {}", e),
                    vec![asset.dir.clone()],
                    batch,
                );
                return;
            }
        };

        let Some(selection) = self.selector.select(&entries) else {
            tracing::warn!("No renditions found in {}", asset.dir);
            self.fail_asset(&asset.id, "no renditions", vec![asset.dir.clone()], batch);
            return;
        };

        let manifest_url = match self.layout.manifest_url(&asset.dir, &selection.urlset) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Cannot map asset {}: {}", asset.dir, e);
                self.fail_asset(&asset.id, &e.to_string(), vec![asset.dir.clone()], batch);
                return;
            }
        };

        let sources: Vec<String> = selection
            .renditions
            .iter()
            .map(|r| paths::join(&asset.dir, &r.name))
            .collect();

        if self.dry_run {
            for source in &sources {
                match self.layout.destination_key(source) {
                    Ok(key) => tracing::info!("[DRY RUN] Would transfer {} -> {}", source, key),
                    Err(e) => tracing::warn!("[DRY RUN] Cannot transfer {}: {}", source, e),
                }
            }
            tracing::info!("[DRY RUN] Would emit manifest {}", manifest_url);
            batch.would_transfer += sources.len() as u64;
            return;
        }

        self.tracker.register(&asset.id, &sources, &manifest_url);
        batch.tasks.extend(
            sources
                .into_iter()
                .map(|s| TransferTask::new(s, asset.id.clone(), self.retry.max_retries)),
        );
    }

    fn fail_asset(&self, id: &AssetId, reason: &str, dirs: Vec<String>, batch: &mut PageBatch) {
        if !self.dry_run {
            self.tracker.record_failed_asset();
        }
        batch
            .failed_assets
            .push(DeadLetterRecord::asset(id.as_str(), reason, dirs));
    }
}
