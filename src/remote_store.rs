//! Remote document store mirror.
//!
//! # Responsibility
//! - CRUD over one flat collection of note-shaped documents.
//! - Live push of collection snapshots to subscribers.
//! - Connectivity gating and in-flight write accounting through
//!   [`StatusTracker`].
//!
//! # Invariants
//! - Writes attempted while offline fail with [`MemoError::Offline`] before
//!   touching the pending counter. Nothing is queued.
//! - Every write holds a [`crate::PendingOperation`] guard, so the counter
//!   only ever reflects writes in flight.
//! - Reads never change the pending counter.
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::{generate_id, MemoError, Note, RemoteConfig, Result, StatusTracker, SyncStatus};

const SYNCED_AT_FIELD: &str = "syncedAt";

/// Signal broadcast by a backend when its collection changes or when the
/// change feed itself hits an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSignal {
    Changed,
    Failed(String),
}

/// Transport to a remote document collection.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Stores a new document and returns its id. A string `"id"` field in
    /// the document is used as the id when present.
    async fn create(&self, document: Value) -> Result<String>;
    /// Replaces the document, creating it if it does not exist yet.
    async fn update(&self, id: &str, document: Value) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Value>>;
    async fn list_all(&self) -> Result<Vec<Value>>;
    /// Feed of change signals for the collection.
    async fn changes(&self) -> Result<broadcast::Receiver<ChangeSignal>>;
}

fn document_id(document: &Value) -> Option<String> {
    document
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// In-process document collection. Can be switched unreachable to simulate
/// network failures.
#[derive(Debug)]
pub struct MemoryDocumentBackend {
    documents: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<ChangeSignal>,
    unreachable: AtomicBool,
}

impl Default for MemoryDocumentBackend {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            documents: Mutex::new(BTreeMap::new()),
            changes,
            unreachable: AtomicBool::new(false),
        }
    }
}

impl MemoryDocumentBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().map(|docs| docs.len()).unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MemoError::network("remote document store unreachable"));
        }
        Ok(())
    }

    fn documents(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.documents
            .lock()
            .map_err(|_| MemoError::LockAcquisitionFailed {
                message: "Failed to acquire lock on document collection".to_string(),
            })
    }

    fn notify(&self) {
        // no receivers is fine
        let _ = self.changes.send(ChangeSignal::Changed);
    }
}

#[async_trait]
impl DocumentBackend for MemoryDocumentBackend {
    async fn create(&self, mut document: Value) -> Result<String> {
        self.check_reachable()?;
        let id = document_id(&document).unwrap_or_else(generate_id);
        if let Value::Object(fields) = &mut document {
            fields.insert("id".to_string(), Value::String(id.clone()));
        }
        self.documents()?.insert(id.clone(), document);
        self.notify();
        Ok(id)
    }

    async fn update(&self, id: &str, mut document: Value) -> Result<()> {
        self.check_reachable()?;
        if let Value::Object(fields) = &mut document {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }
        self.documents()?.insert(id.to_string(), document);
        self.notify();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check_reachable()?;
        let removed = self.documents()?.remove(id).is_some();
        if removed {
            self.notify();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>> {
        self.check_reachable()?;
        Ok(self.documents()?.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Value>> {
        self.check_reachable()?;
        Ok(self.documents()?.values().cloned().collect())
    }

    async fn changes(&self) -> Result<broadcast::Receiver<ChangeSignal>> {
        self.check_reachable()?;
        Ok(self.changes.subscribe())
    }
}

#[derive(Debug)]
struct HttpInner {
    client: Client,
    documents_url: String,
    api_key: String,
}

impl HttpInner {
    fn document_url(&self, id: &str) -> String {
        format!("{}/{}", self.documents_url, id)
    }

    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoError::network(format!(
                "{} returned {}: {}",
                action, status, body
            )));
        }
        Ok(response)
    }

    async fn list_all(&self) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(&self.documents_url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| MemoError::network(format!("Request failed: {}", e)))?;
        let response = Self::check(response, "list documents").await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| MemoError::network(format!("Failed to parse response: {}", e)))
    }
}

fn fingerprint(documents: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for document in documents {
        document.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// JSON-over-HTTP document backend.
///
/// Documents live under
/// `{endpoint}/projects/{project_id}/collections/{collection}/documents`.
/// The service has no push channel, so [`DocumentBackend::changes`] starts a
/// poller that broadcasts whenever the collection fingerprint changes. The
/// poller exits after the last change receiver is dropped and restarts on the
/// next call.
#[derive(Debug)]
pub struct HttpDocumentBackend {
    inner: Arc<HttpInner>,
    poll_interval: Duration,
    changes: broadcast::Sender<ChangeSignal>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpDocumentBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MemoError::network(format!("Failed to build HTTP client: {}", e)))?;

        let documents_url = format!(
            "{}/projects/{}/collections/{}/documents",
            config.endpoint.trim_end_matches('/'),
            config.project_id,
            config.collection
        );
        info!("Remote document store at {}", documents_url);

        let (changes, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                documents_url,
                api_key: config.api_key.clone(),
            }),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            changes,
            poller: Mutex::new(None),
        })
    }

    fn ensure_poller(&self) -> Result<()> {
        let mut poller = self.poller.lock().map_err(|_| MemoError::LockAcquisitionFailed {
            message: "Failed to acquire lock on change poller".to_string(),
        })?;
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let changes = self.changes.clone();
        let period = self.poll_interval;
        debug!("Starting change poller every {:?}", period);

        *poller = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut last: Option<u64> = None;
            loop {
                interval.tick().await;
                if changes.receiver_count() == 0 {
                    debug!("No change subscribers left, stopping poller");
                    break;
                }
                match inner.list_all().await {
                    Ok(documents) => {
                        let current = fingerprint(&documents);
                        if last.is_some_and(|previous| previous != current) {
                            trace!("Remote collection changed");
                            let _ = changes.send(ChangeSignal::Changed);
                        }
                        last = Some(current);
                    }
                    Err(e) => {
                        warn!("Change poll failed: {}", e);
                        let _ = changes.send(ChangeSignal::Failed(e.to_string()));
                    }
                }
            }
        }));
        Ok(())
    }

    /// Whether the change poller is running. It stops on its own once every
    /// change receiver is gone.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .map(|poller| poller.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for HttpDocumentBackend {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl DocumentBackend for HttpDocumentBackend {
    async fn create(&self, document: Value) -> Result<String> {
        let fallback_id = document_id(&document);
        let response = self
            .inner
            .client
            .post(&self.inner.documents_url)
            .bearer_auth(&self.inner.api_key)
            .json(&document)
            .send()
            .await
            .map_err(|e| MemoError::network(format!("Request failed: {}", e)))?;
        let response = HttpInner::check(response, "create document").await?;

        let created: Value = response
            .json()
            .await
            .map_err(|e| MemoError::network(format!("Failed to parse response: {}", e)))?;
        document_id(&created)
            .or(fallback_id)
            .ok_or_else(|| MemoError::network("create document returned no id"))
    }

    async fn update(&self, id: &str, document: Value) -> Result<()> {
        let response = self
            .inner
            .client
            .put(self.inner.document_url(id))
            .bearer_auth(&self.inner.api_key)
            .json(&document)
            .send()
            .await
            .map_err(|e| MemoError::network(format!("Request failed: {}", e)))?;
        HttpInner::check(response, "update document").await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .inner
            .client
            .delete(self.inner.document_url(id))
            .bearer_auth(&self.inner.api_key)
            .send()
            .await
            .map_err(|e| MemoError::network(format!("Request failed: {}", e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        HttpInner::check(response, "delete document").await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>> {
        let response = self
            .inner
            .client
            .get(self.inner.document_url(id))
            .bearer_auth(&self.inner.api_key)
            .send()
            .await
            .map_err(|e| MemoError::network(format!("Request failed: {}", e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = HttpInner::check(response, "get document").await?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| MemoError::network(format!("Failed to parse response: {}", e)))
    }

    async fn list_all(&self) -> Result<Vec<Value>> {
        self.inner.list_all().await
    }

    async fn changes(&self) -> Result<broadcast::Receiver<ChangeSignal>> {
        let receiver = self.changes.subscribe();
        self.ensure_poller()?;
        Ok(receiver)
    }
}

/// Serializes a note for the wire, stamping the sync time.
pub fn note_to_document(note: &Note) -> Result<Value> {
    let mut document = serde_json::to_value(note)?;
    if let Value::Object(fields) = &mut document {
        fields.insert(
            SYNCED_AT_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
    }
    Ok(document)
}

pub fn document_to_note(mut document: Value) -> Result<Note> {
    if let Value::Object(fields) = &mut document {
        fields.remove(SYNCED_AT_FIELD);
    }
    Ok(serde_json::from_value(document)?)
}

async fn fetch_sorted(backend: &dyn DocumentBackend) -> Result<Vec<Note>> {
    let mut notes = backend
        .list_all()
        .await?
        .into_iter()
        .map(document_to_note)
        .collect::<Result<Vec<_>>>()?;
    notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(notes)
}

/// Handle to a live subscription. Dropping it stops future callbacks.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Connectivity-aware facade over a [`DocumentBackend`].
pub struct RemoteStore {
    backend: Arc<dyn DocumentBackend>,
    tracker: StatusTracker,
    subscriptions: Mutex<Vec<AbortHandle>>,
}

impl RemoteStore {
    /// Validates credentials before wiring the backend. Placeholder or
    /// missing credentials fail with [`MemoError::RemoteNotConfigured`].
    pub fn connect(config: &RemoteConfig, backend: Arc<dyn DocumentBackend>) -> Result<Self> {
        config.validate().map_err(|e| {
            warn!("Remote store unavailable: {}", e);
            e
        })?;
        Ok(Self::with_backend(backend))
    }

    /// Wires a backend without a credential check.
    pub fn with_backend(backend: Arc<dyn DocumentBackend>) -> Self {
        RemoteStore {
            backend,
            tracker: StatusTracker::new(true),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn ensure_online(&self, operation: &str) -> Result<()> {
        if !self.tracker.is_online() {
            debug!("Rejecting {} while offline", operation);
            return Err(MemoError::Offline);
        }
        Ok(())
    }

    /// Creates the remote copy of `note` and returns the remote id, which
    /// matches the local id.
    pub async fn create(&self, note: &Note) -> Result<String> {
        self.ensure_online("create")?;
        let _pending = self.tracker.begin_operation();
        debug!("Creating remote document: {}", note.id);
        self.backend.create(note_to_document(note)?).await.map_err(|e| {
            error!("Remote create of {} failed: {}", note.id, e);
            e
        })
    }

    pub async fn update(&self, id: &str, note: &Note) -> Result<()> {
        self.ensure_online("update")?;
        let _pending = self.tracker.begin_operation();
        debug!("Updating remote document: {}", id);
        self.backend.update(id, note_to_document(note)?).await.map_err(|e| {
            error!("Remote update of {} failed: {}", id, e);
            e
        })
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_online("delete")?;
        let _pending = self.tracker.begin_operation();
        debug!("Deleting remote document: {}", id);
        self.backend.delete(id).await.map_err(|e| {
            error!("Remote delete of {} failed: {}", id, e);
            e
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Note>> {
        match self.backend.get(id).await? {
            Some(document) => Ok(Some(document_to_note(document)?)),
            None => Ok(None),
        }
    }

    /// Every remote note, most recently updated first.
    pub async fn list_all(&self) -> Result<Vec<Note>> {
        fetch_sorted(self.backend.as_ref()).await
    }

    /// Delivers the current collection to `on_change`, then again after
    /// every remote change, until the returned handle is dropped. Feed and
    /// fetch failures go to `on_error` without ending the subscription.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F, E>(&self, on_change: F, on_error: E) -> Subscription
    where
        F: Fn(Vec<Note>) + Send + 'static,
        E: Fn(MemoError) + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let tracker = self.tracker.clone();

        let handle = tokio::spawn(async move {
            let mut changes = match backend.changes().await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("Could not open remote change feed: {}", e);
                    on_error(e);
                    return;
                }
            };

            loop {
                match fetch_sorted(backend.as_ref()).await {
                    Ok(notes) => {
                        trace!("Delivering {} remote notes", notes.len());
                        tracker.mark_synced(Utc::now());
                        on_change(notes);
                    }
                    Err(e) => on_error(e),
                }

                loop {
                    match changes.recv().await {
                        Ok(ChangeSignal::Changed) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            break
                        }
                        Ok(ChangeSignal::Failed(message)) => on_error(MemoError::network(message)),
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Remote change feed closed");
                            return;
                        }
                    }
                }
            }
        });

        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.retain(|h| !h.is_finished());
            subscriptions.push(handle.abort_handle());
        }
        Subscription { handle }
    }

    /// Cancels every subscription created through this store.
    pub fn unsubscribe_all(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            debug!("Cancelling {} remote subscriptions", subscriptions.len());
            for handle in subscriptions.drain(..) {
                handle.abort();
            }
        }
    }

    /// Applies a network event. Returns whether connectivity changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tracker.set_online(online)
    }

    pub fn is_online(&self) -> bool {
        self.tracker.is_online()
    }

    pub fn status(&self) -> SyncStatus {
        self.tracker.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.tracker.subscribe()
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
