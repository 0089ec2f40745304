//! Composition root. One `MemoApp` owns every store and service of a
//! running session.
use std::{path::Path, sync::Arc};

use log::{debug, info, warn};

use crate::{
    initialize_logger, AttachmentService, BackupManager, Config, FileBackend,
    HttpDocumentBackend, IndexedStore, KeyValueStore, MemoError, MemoryBackend,
    MemoryIndexedStore, Note, NoteInput, NoteService, NoteUpdate, NotificationService, Outcome,
    RemoteStore, Reply, ReplyInput, ReplyService, RestoreBackupSummary, Result, SearchHit,
    SyncCoordinator, UserProfile, UserService, Warning, WarningSource,
};

pub struct MemoApp {
    config: Config,
    kv: Arc<KeyValueStore>,
    index: Arc<dyn IndexedStore>,
    notes: Arc<NoteService>,
    attachments: AttachmentService,
    replies: ReplyService,
    notifications: NotificationService,
    users: UserService,
    sync: SyncCoordinator,
    backups: BackupManager,
}

/// Builds the HTTP remote layer, or `None` for local-only mode.
fn connect_remote(config: &Config) -> Option<Arc<RemoteStore>> {
    if let Err(e) = config.remote.validate() {
        info!("Running in local-only mode: {}", e);
        return None;
    }
    let backend = match HttpDocumentBackend::new(&config.remote) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Remote backend unavailable, running local-only: {}", e);
            return None;
        }
    };
    match RemoteStore::connect(&config.remote, Arc::new(backend)) {
        Ok(remote) => Some(Arc::new(remote)),
        Err(e) => {
            warn!("Remote store unavailable, running local-only: {}", e);
            None
        }
    }
}

impl MemoApp {
    /// Opens the file-backed store from `config`, connects the remote layer
    /// when credentials are usable and re-projects stored notes and
    /// attachments into the fresh indexed store. Remote and index problems
    /// never fail this call.
    pub async fn open(config: Config) -> Result<Self> {
        initialize_logger(&config.log_level);

        let backend = FileBackend::open(
            &config.storage.data_file,
            Some(config.storage.quota_bytes),
        )?;
        let kv = Arc::new(KeyValueStore::new(
            Arc::new(backend),
            &config.storage.key_prefix,
            config.storage.quota_bytes,
        ));
        let remote = connect_remote(&config);
        let app = Self::with_stores(config, kv, Arc::new(MemoryIndexedStore::new()), remote);

        let reindexed = app.reindex().await?;
        for warning in &reindexed.warnings {
            warn!("Session opened degraded: {}", warning.message);
        }
        Ok(app)
    }

    /// Ephemeral, local-only session.
    pub fn in_memory(config: Config) -> Self {
        let kv = Arc::new(KeyValueStore::new(
            Arc::new(MemoryBackend::with_quota(config.storage.quota_bytes)),
            &config.storage.key_prefix,
            config.storage.quota_bytes,
        ));
        Self::with_stores(config, kv, Arc::new(MemoryIndexedStore::new()), None)
    }

    /// Wires injected stores. Call [`reindex`](Self::reindex) when `index`
    /// does not already reflect what `kv` holds.
    pub fn with_stores(
        config: Config,
        kv: Arc<KeyValueStore>,
        index: Arc<dyn IndexedStore>,
        remote: Option<Arc<RemoteStore>>,
    ) -> Self {
        let mut notes = NoteService::new(Arc::clone(&kv), Arc::clone(&index));
        if let Some(remote) = remote {
            notes = notes.with_remote(remote, config.remote.mirror_writes);
        }
        let notes = Arc::new(notes);

        debug!(
            "Memo app ready (remote: {})",
            if notes.remote().is_some() { "connected" } else { "none" }
        );
        MemoApp {
            attachments: AttachmentService::new(Arc::clone(&kv), Arc::clone(&index)),
            replies: ReplyService::new(Arc::clone(&kv)),
            notifications: NotificationService::new(Arc::clone(&kv)),
            users: UserService::new(Arc::clone(&kv)),
            sync: SyncCoordinator::new(Arc::clone(&notes)),
            backups: BackupManager::new(
                config.backup.backup_dir.clone(),
                config.backup.max_backups,
                Arc::clone(&kv),
            ),
            notes,
            index,
            kv,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kv(&self) -> &Arc<KeyValueStore> {
        &self.kv
    }

    pub fn notes(&self) -> &Arc<NoteService> {
        &self.notes
    }

    pub fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    pub fn replies(&self) -> &ReplyService {
        &self.replies
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn remote(&self) -> Option<&Arc<RemoteStore>> {
        self.notes.remote()
    }

    /// Rebuilds the search index and the attachment index from the
    /// key-value store.
    pub async fn reindex(&self) -> Result<Outcome<()>> {
        let notes = self.notes.rebuild_search_index().await?;
        let attachments = self.attachments.rebuild_index().await?;
        info!(
            "Reindexed {} notes and {} attachments",
            notes.value, attachments.value
        );
        let mut warnings = notes.warnings;
        warnings.extend(attachments.warnings);
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Searches notes with the configured default result limit.
    pub async fn search_memos(&self, query: &str) -> Result<Outcome<Vec<SearchHit>>> {
        self.notes
            .search(query, self.config.search.default_max_results)
            .await
    }

    fn author_of(
        &self,
        operation: &'static str,
        author_id: &str,
        warnings: &mut Vec<Warning>,
    ) -> Option<UserProfile> {
        if author_id.is_empty() {
            return None;
        }
        match self.users.get(author_id) {
            Ok(author) => author,
            Err(e) => {
                warn!("Author lookup for {} failed: {}", author_id, e);
                warnings.push(Warning::new(WarningSource::Notifications, operation, &e));
                None
            }
        }
    }

    /// Creates a note and notifies users mentioned in its body.
    /// Notification problems come back as warnings.
    pub async fn create_memo(&self, input: NoteInput) -> Result<Outcome<Note>> {
        let mut outcome = self.notes.create(input).await?;
        let note = &outcome.value;
        let mut warnings = Vec::new();

        if let Some(author) = self.author_of("createMemo", &note.author_id, &mut warnings) {
            if let Err(e) = self
                .notifications
                .notify_mentions(&self.users, &note.body, &author, note)
            {
                warn!("Mention notifications for {} failed: {}", note.id, e);
                warnings.push(Warning::new(WarningSource::Notifications, "createMemo", &e));
            }
        }
        outcome.warnings.extend(warnings);
        Ok(outcome)
    }

    /// Deletes a note with its attachments and replies.
    pub async fn delete_memo(&self, id: &str) -> Result<Outcome<()>> {
        let mut outcome = self.notes.delete(id).await?;
        let attachments = self.attachments.delete_by_memo(id).await?;
        outcome.warnings.extend(attachments.warnings);
        let replies = self.replies.delete_by_memo(id)?;

        debug!(
            "Deleted memo {} with {} attachments and {} replies",
            id, attachments.value, replies
        );
        Ok(outcome)
    }

    /// Clones a note together with copies of its attachments. Attachments
    /// that can no longer be found are dropped from the copy.
    pub async fn clone_memo(&self, id: &str) -> Result<Outcome<Note>> {
        let cloned = self.notes.duplicate(id).await?;
        let mut warnings = cloned.warnings;
        let copy = cloned.value;
        if copy.attachment_ids.is_empty() {
            return Ok(Outcome::with_warnings(copy, warnings));
        }

        let mut attachment_ids = Vec::with_capacity(copy.attachment_ids.len());
        for attachment_id in &copy.attachment_ids {
            match self.attachments.clone_to_memo(attachment_id, &copy.id).await {
                Ok(outcome) => {
                    warnings.extend(outcome.warnings);
                    attachment_ids.push(outcome.value.id);
                }
                Err(e) if e.is_not_found() => {
                    warnings.push(Warning::new(WarningSource::Attachments, "cloneMemo", &e));
                }
                Err(e) => return Err(e),
            }
        }

        let updated = self
            .notes
            .update(
                &copy.id,
                NoteUpdate {
                    attachment_ids: Some(attachment_ids),
                    ..Default::default()
                },
            )
            .await?;
        warnings.extend(updated.warnings);
        Ok(Outcome::with_warnings(updated.value, warnings))
    }

    /// Posts a reply, then notifies the memo author and mentioned users.
    /// Notification problems come back as warnings.
    pub async fn post_reply(&self, input: ReplyInput) -> Result<Outcome<Reply>> {
        let memo = self
            .notes
            .get(&input.memo_id)?
            .ok_or_else(|| MemoError::not_found("createReply", &input.memo_id))?;
        let reply = self.replies.create(input)?;
        let mut warnings = Vec::new();

        if let Err(e) = self.notifications.notify_reply(&memo, &reply) {
            warn!("Reply notification for {} failed: {}", reply.id, e);
            warnings.push(Warning::new(WarningSource::Notifications, "createReply", &e));
        }
        if let Some(author) = self.author_of("createReply", &reply.author_id, &mut warnings) {
            if let Err(e) = self
                .notifications
                .notify_mentions(&self.users, &reply.content, &author, &memo)
            {
                warn!("Mention notifications for {} failed: {}", reply.id, e);
                warnings.push(Warning::new(WarningSource::Notifications, "createReply", &e));
            }
        }
        Ok(Outcome::with_warnings(reply, warnings))
    }

    /// Restores a backup archive and re-projects notes and attachments into
    /// the indexed store.
    pub async fn restore_backup(
        &self,
        backup_path: &Path,
        overwrite_existing: bool,
    ) -> Result<Outcome<RestoreBackupSummary>> {
        let summary = self.backups.restore_backup(backup_path, overwrite_existing)?;
        let reindexed = self.reindex().await?;
        Ok(Outcome::with_warnings(summary, reindexed.warnings))
    }

    /// Wipes local data under the key prefix and the indexed store.
    pub async fn clear_local_data(&self) -> Result<()> {
        self.kv.clear()?;
        if let Err(e) = self.index.clear_all().await {
            warn!("Failed to clear indexed store: {}", e);
        }
        info!("Cleared local data");
        Ok(())
    }
}
