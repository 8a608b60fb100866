// Live batch progress, polled by the UI surface
//
// One tracker per provider service; a new batch resets it. Writers are the
// orchestrator's workers, so updates go through a parking_lot RwLock rather
// than an async one (no await while holding it).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

use crate::core::types::{CredentialStats, ProgressSnapshot};

#[derive(Default)]
struct ProgressInner {
    total: usize,
    completed: usize,
    current_item: Option<String>,
    stopped: bool,
    per_credential: HashMap<String, CredentialStats>,
    started_at: Option<Instant>,
}

#[derive(Default)]
pub struct ProgressTracker {
    inner: RwLock<ProgressInner>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new batch of `total` items.
    pub fn begin(&self, total: usize) {
        let mut inner = self.inner.write();
        *inner = ProgressInner {
            total,
            started_at: Some(Instant::now()),
            ..ProgressInner::default()
        };
    }

    pub fn set_current(&self, filename: &str) {
        self.inner.write().current_item = Some(filename.to_string());
    }

    fn stats_entry<'a>(
        inner: &'a mut ProgressInner,
        credential_id: &str,
    ) -> &'a mut CredentialStats {
        inner
            .per_credential
            .entry(credential_id.to_string())
            .or_default()
    }

    /// `items` results landed off one request on this credential.
    pub fn record_success(&self, credential_id: &str, items: usize) {
        let mut inner = self.inner.write();
        inner.completed += items;
        let elapsed = inner.started_at.map(|s| s.elapsed().as_millis() as u64);
        let stats = Self::stats_entry(&mut inner, credential_id);
        stats.processed += items;
        stats.last_used_ms = elapsed;
    }

    pub fn record_error(&self, credential_id: &str) {
        let mut inner = self.inner.write();
        let elapsed = inner.started_at.map(|s| s.elapsed().as_millis() as u64);
        let stats = Self::stats_entry(&mut inner, credential_id);
        stats.errors += 1;
        stats.last_used_ms = elapsed;
    }

    /// An item was abandoned (retries exhausted or invalid input); it still
    /// counts toward completion so the bar reaches 100%.
    pub fn record_failed_item(&self, items: usize) {
        self.inner.write().completed += items;
    }

    pub fn mark_stopped(&self) {
        self.inner.write().stopped = true;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.read();
        ProgressSnapshot {
            total: inner.total,
            completed: inner.completed,
            current_item: inner.current_item.clone(),
            stopped: inner.stopped,
            per_credential: inner.per_credential.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_resets_previous_batch() {
        let tracker = ProgressTracker::new();
        tracker.begin(3);
        tracker.record_success("cred-1", 3);
        tracker.mark_stopped();

        tracker.begin(10);
        let snap = tracker.snapshot();
        assert_eq!(snap.total, 10);
        assert_eq!(snap.completed, 0);
        assert!(!snap.stopped);
        assert!(snap.per_credential.is_empty());
    }

    #[test]
    fn per_credential_counters_accumulate() {
        let tracker = ProgressTracker::new();
        tracker.begin(4);
        tracker.record_success("cred-1", 2);
        tracker.record_error("cred-1");
        tracker.record_success("cred-2", 1);
        tracker.record_failed_item(1);

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 4);
        assert_eq!(snap.per_credential["cred-1"].processed, 2);
        assert_eq!(snap.per_credential["cred-1"].errors, 1);
        assert_eq!(snap.per_credential["cred-2"].processed, 1);
        assert!(snap.per_credential["cred-1"].last_used_ms.is_some());
    }
}
