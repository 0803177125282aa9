//! Per-asset completion bookkeeping.
//!
//! Every selected rendition of an asset is a pending member; the manifest is
//! the asset's last member and is released only when every rendition has
//! been reported. `complete` is the single place a manifest can be produced,
//! so each asset emits at most one.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::paths::AssetId;

/// One unit of transfer work. Re-created (never mutated) on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub source: String,
    pub asset: AssetId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub attempts_remaining: u32,
}

impl TransferTask {
    pub fn new(source: impl Into<String>, asset: AssetId, max_retries: u32) -> Self {
        Self {
            source: source.into(),
            asset,
            attempt: 1,
            attempts_remaining: max_retries,
        }
    }

    /// The next attempt of this task, or `None` once the budget is spent.
    pub fn retry(&self) -> Option<Self> {
        if self.attempts_remaining == 0 {
            return None;
        }
        Some(Self {
            source: self.source.clone(),
            asset: self.asset.clone(),
            attempt: self.attempt + 1,
            attempts_remaining: self.attempts_remaining - 1,
        })
    }
}

/// Final outcome of an asset once its last member is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetResolution {
    Completed {
        asset_id: AssetId,
        manifest_url: String,
        renditions: Vec<String>,
    },
    Failed {
        asset_id: AssetId,
        manifest_url: String,
        dead_lettered: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Resubmit after backoff.
    Retry(TransferTask),
    /// Budget spent or permanent error.
    DeadLetter {
        task: TransferTask,
        reason: String,
        resolution: Option<AssetResolution>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub pending: usize,
    pub transferred: u64,
    pub dead_lettered: u64,
    pub manifests: u64,
    pub failed_assets: u64,
}

#[derive(Debug)]
struct PendingAsset {
    remaining: HashSet<String>,
    renditions: Vec<String>,
    manifest_url: String,
    dead_lettered: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    assets: HashMap<AssetId, PendingAsset>,
    counters: Counters,
}

#[derive(Debug, Default)]
pub struct CompletionTracker {
    inner: Mutex<TrackerState>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `paths` as pending members of `asset`. Only paths not already
    /// pending count toward the pending total; returns how many were added.
    pub fn register(&self, asset: &AssetId, paths: &[String], manifest_url: &str) -> usize {
        let mut state = self.state();
        let entry = state
            .assets
            .entry(asset.clone())
            .or_insert_with(|| PendingAsset {
                remaining: HashSet::new(),
                renditions: Vec::new(),
                manifest_url: manifest_url.to_string(),
                dead_lettered: Vec::new(),
            });

        let mut added = 0;
        for path in paths {
            if entry.remaining.insert(path.clone()) {
                entry.renditions.push(path.clone());
                added += 1;
            }
        }
        state.counters.pending += added;
        added
    }

    /// Marks one member transferred. Returns the asset's resolution when this
    /// was its last pending member.
    pub fn complete(&self, asset: &AssetId, path: &str) -> Option<AssetResolution> {
        let mut state = self.state();
        let Some(entry) = state.assets.get_mut(asset) else {
            tracing::warn!("Completion for unknown asset {} ({})", asset, path);
            return None;
        };
        if !entry.remaining.remove(path) {
            tracing::warn!("Completion for {} which is not pending under {}", path, asset);
            return None;
        }
        let drained = entry.remaining.is_empty();
        state.counters.pending -= 1;
        state.counters.transferred += 1;

        if drained {
            Self::resolve(&mut state, asset)
        } else {
            None
        }
    }

    /// Decides what happens to a failed attempt. A retry keeps the member
    /// pending; a dead letter removes it and marks the asset failed.
    pub fn fail(&self, task: &TransferTask, reason: &str, retryable: bool) -> FailureDisposition {
        if retryable {
            if let Some(next) = task.retry() {
                return FailureDisposition::Retry(next);
            }
        }

        let mut state = self.state();
        state.counters.dead_lettered += 1;

        let drained = match state.assets.get_mut(&task.asset) {
            Some(entry) => {
                if entry.remaining.remove(&task.source) {
                    entry.dead_lettered.push(task.source.clone());
                    Some(entry.remaining.is_empty())
                } else {
                    None
                }
            }
            None => None,
        };

        let resolution = match drained {
            Some(drained) => {
                state.counters.pending -= 1;
                if drained {
                    Self::resolve(&mut state, &task.asset)
                } else {
                    None
                }
            }
            None => {
                tracing::warn!(
                    "Dead letter for {} which is not pending under {}",
                    task.source,
                    task.asset
                );
                None
            }
        };

        FailureDisposition::DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            resolution,
        }
    }

    fn resolve(state: &mut TrackerState, asset: &AssetId) -> Option<AssetResolution> {
        let entry = state.assets.remove(asset)?;
        if entry.dead_lettered.is_empty() {
            state.counters.manifests += 1;
            Some(AssetResolution::Completed {
                asset_id: asset.clone(),
                manifest_url: entry.manifest_url,
                renditions: entry.renditions,
            })
        } else {
            state.counters.failed_assets += 1;
            Some(AssetResolution::Failed {
                asset_id: asset.clone(),
                manifest_url: entry.manifest_url,
                dead_lettered: entry.dead_lettered,
            })
        }
    }

    /// Counts an asset that failed before any task was created.
    pub fn record_failed_asset(&self) {
        self.state().counters.failed_assets += 1;
    }

    pub fn pending_count(&self) -> usize {
        self.state().counters.pending
    }

    pub fn counters(&self) -> Counters {
        self.state().counters
    }

    /// Assets with members still pending.
    pub fn live_assets(&self) -> usize {
        self.state().assets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AssetId {
        AssetId::new(s)
    }

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_task_retry_budget() {
        let task = TransferTask::new("/r/v1/a_1.mp4", id("v1"), 2);
        let second = task.retry().unwrap();
        assert_eq!((second.attempt, second.attempts_remaining), (2, 1));
        let third = second.retry().unwrap();
        assert_eq!((third.attempt, third.attempts_remaining), (3, 0));
        assert_eq!(third.retry(), None);
    }

    #[test]
    fn test_manifest_only_after_last_member() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_9", "/v1/a_5", "/v1/a_3"]), "m1");
        assert_eq!(tracker.pending_count(), 3);

        assert_eq!(tracker.complete(&id("v1"), "/v1/a_5"), None);
        assert_eq!(tracker.complete(&id("v1"), "/v1/a_9"), None);
        assert_eq!(tracker.pending_count(), 1);

        let resolution = tracker.complete(&id("v1"), "/v1/a_3").unwrap();
        assert_eq!(
            resolution,
            AssetResolution::Completed {
                asset_id: id("v1"),
                manifest_url: "m1".into(),
                renditions: paths(&["/v1/a_9", "/v1/a_5", "/v1/a_3"]),
            }
        );
        let c = tracker.counters();
        assert_eq!((c.pending, c.transferred, c.manifests), (0, 3, 1));
        assert_eq!(tracker.live_assets(), 0);
    }

    #[test]
    fn test_duplicate_completion_does_not_emit_twice() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_1"]), "m1");
        assert!(tracker.complete(&id("v1"), "/v1/a_1").is_some());
        assert!(tracker.complete(&id("v1"), "/v1/a_1").is_none());
        let c = tracker.counters();
        assert_eq!((c.pending, c.transferred, c.manifests), (0, 1, 1));
    }

    #[test]
    fn test_register_counts_only_new_paths() {
        let tracker = CompletionTracker::new();
        assert_eq!(tracker.register(&id("v1"), &paths(&["/a", "/b"]), "m"), 2);
        assert_eq!(tracker.register(&id("v1"), &paths(&["/b", "/c"]), "m"), 1);
        assert_eq!(tracker.pending_count(), 3);
    }

    #[test]
    fn test_retryable_failure_keeps_member_pending() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_1"]), "m1");
        let task = TransferTask::new("/v1/a_1", id("v1"), 1);

        match tracker.fail(&task, "503", true) {
            FailureDisposition::Retry(next) => assert_eq!(next.attempt, 2),
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_exhausted_failure_dead_letters_and_fails_asset() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_9", "/v1/a_5"]), "m1");
        let exhausted = TransferTask {
            source: "/v1/a_9".into(),
            asset: id("v1"),
            attempt: 3,
            attempts_remaining: 0,
        };

        match tracker.fail(&exhausted, "503", true) {
            FailureDisposition::DeadLetter { resolution, .. } => assert_eq!(resolution, None),
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(tracker.pending_count(), 1);

        let resolution = tracker.complete(&id("v1"), "/v1/a_5").unwrap();
        assert_eq!(
            resolution,
            AssetResolution::Failed {
                asset_id: id("v1"),
                manifest_url: "m1".into(),
                dead_lettered: paths(&["/v1/a_9"]),
            }
        );
        let c = tracker.counters();
        assert_eq!(
            (c.pending, c.transferred, c.dead_lettered, c.manifests, c.failed_assets),
            (0, 1, 1, 0, 1)
        );
    }

    #[test]
    fn test_permanent_failure_skips_retry_budget() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_1"]), "m1");
        let task = TransferTask::new("/v1/a_1", id("v1"), 5);

        match tracker.fail(&task, "404", false) {
            FailureDisposition::DeadLetter { resolution, reason, .. } => {
                assert_eq!(reason, "404");
                assert!(matches!(resolution, Some(AssetResolution::Failed { .. })));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_dead_letter_for_unknown_member_leaves_pending() {
        let tracker = CompletionTracker::new();
        tracker.register(&id("v1"), &paths(&["/v1/a_1"]), "m1");
        let stray = TransferTask::new("/v1/a_7", id("v1"), 0);

        match tracker.fail(&stray, "404", false) {
            FailureDisposition::DeadLetter { resolution, .. } => assert_eq!(resolution, None),
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.live_assets(), 1);
        assert!(tracker.complete(&id("v1"), "/v1/a_1").is_some());
    }

    #[test]
    fn test_concurrent_completions_emit_once() {
        let tracker = std::sync::Arc::new(CompletionTracker::new());
        let members: Vec<String> = (0..64).map(|i| format!("/v1/a_{}", i)).collect();
        tracker.register(&id("v1"), &members, "m1");

        let handles: Vec<_> = members
            .into_iter()
            .map(|path| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.complete(&AssetId::new("v1"), &path))
            })
            .collect();
        let emitted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(emitted, 1);
        assert_eq!(tracker.pending_count(), 0);
    }
}
