//! Sync coordinator: pull-on-mount, manual sync and the status snapshot
//! consumed by UI code.
//!
//! # Invariants
//! - `mount` never fails because of the remote layer.
//! - `sync_now` always reports its outcome, and failures stay recorded
//!   until `clear_error` or the next successful sync. There is no retry.
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    MemoError, Note, NoteService, Outcome, RemoteStore, Result, StatusTracker, Subscription,
    SyncStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncActivity {
    Idle,
    Syncing,
}

/// Network transitions reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub connectivity: Connectivity,
    pub activity: SyncActivity,
    /// False when running local-only
    pub remote_available: bool,
}

/// Flips activity back to idle however the sync ends.
struct SyncingGuard<'a> {
    activity: &'a watch::Sender<SyncActivity>,
}

impl<'a> SyncingGuard<'a> {
    fn start(activity: &'a watch::Sender<SyncActivity>) -> Self {
        activity.send_replace(SyncActivity::Syncing);
        SyncingGuard { activity }
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.activity.send_replace(SyncActivity::Idle);
    }
}

pub struct SyncCoordinator {
    notes: Arc<NoteService>,
    remote: Option<Arc<RemoteStore>>,
    tracker: StatusTracker,
    activity: watch::Sender<SyncActivity>,
}

impl SyncCoordinator {
    /// Uses the note service's remote store, if any. Without one the
    /// coordinator still tracks connectivity but every sync fails fast.
    pub fn new(notes: Arc<NoteService>) -> Self {
        let remote = notes.remote().cloned();
        let tracker = remote
            .as_ref()
            .map(|r| r.tracker().clone())
            .unwrap_or_default();
        let (activity, _) = watch::channel(SyncActivity::Idle);
        SyncCoordinator {
            notes,
            remote,
            tracker,
            activity,
        }
    }

    fn remote_online(&self) -> bool {
        self.remote.is_some() && self.tracker.is_online()
    }

    /// Initial load: one remote pull when possible, otherwise local data.
    pub async fn mount(&self) -> Result<Vec<Note>> {
        if !self.remote_online() {
            debug!("Mounting from local storage");
            return self.notes.list(None);
        }

        let _syncing = SyncingGuard::start(&self.activity);
        match self.notes.pull_remote().await {
            Ok(outcome) => Ok(outcome.value),
            Err(e) => {
                warn!("Initial remote pull failed, using local data: {}", e);
                self.notes.list(None)
            }
        }
    }

    /// User-triggered pull. Failures are recorded in the status and
    /// returned.
    pub async fn sync_now(&self) -> Result<Outcome<Vec<Note>>> {
        if self.remote.is_none() {
            let e = MemoError::RemoteNotConfigured {
                message: "running in local-only mode".to_string(),
            };
            self.tracker.record_error(e.to_string());
            return Err(e);
        }
        if !self.tracker.is_online() {
            self.tracker.record_error(MemoError::Offline.to_string());
            return Err(MemoError::Offline);
        }

        let _syncing = SyncingGuard::start(&self.activity);
        let _pending = self.tracker.begin_operation();
        match self.notes.pull_remote().await {
            Ok(outcome) => {
                info!("Sync complete: {} notes", outcome.value.len());
                Ok(outcome)
            }
            Err(e) => {
                self.tracker.record_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Resets the error without retrying.
    pub fn clear_error(&self) {
        self.tracker.clear_error();
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let status = self.tracker.snapshot();
        SyncSnapshot {
            connectivity: if status.is_online {
                Connectivity::Online
            } else {
                Connectivity::Offline
            },
            status,
            activity: *self.activity.borrow(),
            remote_available: self.remote.is_some(),
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.tracker.subscribe()
    }

    pub fn watch_activity(&self) -> watch::Receiver<SyncActivity> {
        self.activity.subscribe()
    }

    /// Returns whether connectivity changed.
    pub fn handle_network_event(&self, event: NetworkEvent) -> bool {
        self.tracker.set_online(event == NetworkEvent::Online)
    }

    /// Forwards live remote snapshots to `on_change`. Feed errors are
    /// recorded in the status instead of being raised.
    pub fn subscribe_remote<F>(&self, on_change: F) -> Result<Subscription>
    where
        F: Fn(Vec<Note>) + Send + 'static,
    {
        let remote = self.remote.as_ref().ok_or_else(|| MemoError::RemoteNotConfigured {
            message: "running in local-only mode".to_string(),
        })?;
        let tracker = self.tracker.clone();
        Ok(remote.subscribe(on_change, move |e| tracker.record_error(e.to_string())))
    }
}
