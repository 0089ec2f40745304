//! Observable sync status shared by the remote store and the coordinator.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;

/// Snapshot handed to UI code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Remote writes currently in flight (never a backlog)
    pub pending_uploads: u32,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            is_online: true,
            last_sync_time: None,
            pending_uploads: 0,
            last_error: None,
        }
    }
}

/// Owner of the current [`SyncStatus`]. Every change is published to
/// subscribers through a `watch` channel; dropping a receiver unsubscribes.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StatusTracker {
    pub fn new(is_online: bool) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus {
            is_online,
            ..SyncStatus::default()
        });
        StatusTracker { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().is_online
    }

    /// Returns whether connectivity actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|status| {
            if status.is_online == online {
                return false;
            }
            status.is_online = online;
            true
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Counts one in-flight write until the returned guard is dropped.
    pub fn begin_operation(&self) -> PendingOperation {
        self.tx.send_modify(|status| status.pending_uploads += 1);
        PendingOperation {
            tracker: self.clone(),
        }
    }

    pub fn mark_synced(&self, at: DateTime<Utc>) {
        self.tx.send_modify(|status| {
            status.last_sync_time = Some(at);
            status.last_error = None;
        });
        debug!("Marked synced at {}", at);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Sync error: {}", message);
        self.tx.send_modify(|status| status.last_error = Some(message));
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|status| status.last_error.take().is_some());
    }
}

/// Guard for one pending remote write. Decrements on drop, so the counter
/// returns to its previous value on success, failure and cancellation.
#[derive(Debug)]
#[must_use = "the pending count drops as soon as the guard is dropped"]
pub struct PendingOperation {
    tracker: StatusTracker,
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        self.tracker
            .tx
            .send_modify(|status| status.pending_uploads = status.pending_uploads.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_guard_restores_count() {
        let tracker = StatusTracker::new(true);
        {
            let _a = tracker.begin_operation();
            let _b = tracker.begin_operation();
            assert_eq!(tracker.snapshot().pending_uploads, 2);
        }
        assert_eq!(tracker.snapshot().pending_uploads, 0);
    }

    #[test]
    fn connectivity_changes_are_published_once() {
        let tracker = StatusTracker::new(true);
        let mut rx = tracker.subscribe();
        rx.borrow_and_update();

        assert!(!tracker.set_online(true));
        assert!(!rx.has_changed().unwrap());

        assert!(tracker.set_online(false));
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().is_online);
    }

    #[test]
    fn sync_clears_previous_error() {
        let tracker = StatusTracker::default();
        tracker.record_error("boom");
        assert_eq!(tracker.snapshot().last_error.as_deref(), Some("boom"));

        tracker.mark_synced(Utc::now());
        let status = tracker.snapshot();
        assert!(status.last_error.is_none());
        assert!(status.last_sync_time.is_some());

        tracker.record_error("again");
        tracker.clear_error();
        assert!(tracker.snapshot().last_error.is_none());
    }
}
