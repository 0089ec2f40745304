//! Asynchronous structured store holding attachment blobs and the note
//! search index.
//!
//! # Responsibility
//! - Keep two independent collections: `attachments` (by id and by owning
//!   memo) and `search-index` (by note id).
//! - Answer token searches over the denormalized search text.
//!
//! # Invariants
//! - Nothing here is authoritative. Every record can be rebuilt from the
//!   key-value store, and callers treat any failure as a cue to fall back.
//! - Each call is its own transaction; there is no cross-collection
//!   atomicity.
use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{Attachment, MemoError, Note, Result};

pub const SCHEMA_VERSION: u32 = 1;
pub const ATTACHMENTS_STORE: &str = "attachments";
pub const SEARCH_INDEX_STORE: &str = "search-index";
/// Upper bound on records returned by [`IndexedStore::search`].
pub const MAX_SEARCH_RESULTS: usize = 50;

/// Denormalized search projection of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub id: String,
    /// Lowercased title, body and tags
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl SearchRecord {
    pub fn from_note(note: &Note) -> Self {
        SearchRecord {
            id: note.id.clone(),
            text: note.search_text().to_lowercase(),
            created_at: note.created_at,
        }
    }
}

#[async_trait]
pub trait IndexedStore: Send + Sync {
    async fn put_attachment(&self, attachment: &Attachment) -> Result<()>;
    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>>;
    /// Attachments owned by `owner_id`, oldest upload first.
    async fn get_attachments_by_owner(&self, owner_id: &str) -> Result<Vec<Attachment>>;
    async fn delete_attachment(&self, id: &str) -> Result<()>;
    /// Returns how many attachments were removed.
    async fn delete_attachments_by_owner(&self, owner_id: &str) -> Result<usize>;
    async fn upsert_search_record(&self, note: &Note) -> Result<()>;
    async fn delete_search_record(&self, id: &str) -> Result<()>;
    /// Drops every search record, leaving attachments alone.
    async fn clear_search_index(&self) -> Result<()>;
    /// Best records first, at most [`MAX_SEARCH_RESULTS`].
    async fn search(&self, query: &str) -> Result<Vec<SearchRecord>>;
    async fn estimate_usage_bytes(&self) -> Result<u64>;
    async fn clear_all(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Collections {
    attachments: HashMap<String, Attachment>,
    by_owner: HashMap<String, BTreeSet<String>>,
    search_index: HashMap<String, SearchRecord>,
}

impl Collections {
    fn unlink_owner(&mut self, attachment: &Attachment) {
        if let Some(ids) = self.by_owner.get_mut(&attachment.memo_id) {
            ids.remove(&attachment.id);
            if ids.is_empty() {
                self.by_owner.remove(&attachment.memo_id);
            }
        }
    }
}

/// In-process implementation of [`IndexedStore`].
#[derive(Debug, Default)]
pub struct MemoryIndexedStore {
    inner: RwLock<Collections>,
}

impl MemoryIndexedStore {
    pub fn new() -> Self {
        debug!(
            "Opening indexed store (schema v{}, stores: {}, {})",
            SCHEMA_VERSION, ATTACHMENTS_STORE, SEARCH_INDEX_STORE
        );
        Self::default()
    }

    pub async fn search_record_count(&self) -> usize {
        self.inner.read().await.search_index.len()
    }
}

fn tokenize(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in query.to_lowercase().split_whitespace() {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

#[async_trait]
impl IndexedStore for MemoryIndexedStore {
    async fn put_attachment(&self, attachment: &Attachment) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.attachments.remove(&attachment.id) {
            inner.unlink_owner(&previous);
        }
        inner
            .by_owner
            .entry(attachment.memo_id.clone())
            .or_default()
            .insert(attachment.id.clone());
        inner
            .attachments
            .insert(attachment.id.clone(), attachment.clone());
        trace!("Stored attachment {} for memo {}", attachment.id, attachment.memo_id);
        Ok(())
    }

    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        Ok(self.inner.read().await.attachments.get(id).cloned())
    }

    async fn get_attachments_by_owner(&self, owner_id: &str) -> Result<Vec<Attachment>> {
        let inner = self.inner.read().await;
        let mut found: Vec<Attachment> = inner
            .by_owner
            .get(owner_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.attachments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by_key(|a| a.uploaded_at);
        Ok(found)
    }

    async fn delete_attachment(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(removed) = inner.attachments.remove(id) {
            inner.unlink_owner(&removed);
        }
        Ok(())
    }

    async fn delete_attachments_by_owner(&self, owner_id: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let ids = inner.by_owner.remove(owner_id).unwrap_or_default();
        for id in &ids {
            inner.attachments.remove(id);
        }
        debug!("Removed {} attachments owned by {}", ids.len(), owner_id);
        Ok(ids.len())
    }

    async fn upsert_search_record(&self, note: &Note) -> Result<()> {
        let record = SearchRecord::from_note(note);
        self.inner
            .write()
            .await
            .search_index
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_search_record(&self, id: &str) -> Result<()> {
        self.inner.write().await.search_index.remove(id);
        Ok(())
    }

    async fn clear_search_index(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        debug!("Dropping {} search records", inner.search_index.len());
        inner.search_index.clear();
        Ok(())
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchRecord>> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().await;
        let mut ranked: Vec<(bool, usize, &SearchRecord)> = inner
            .search_index
            .values()
            .filter_map(|record| {
                let starts = tokens.iter().any(|t| record.text.starts_with(t.as_str()));
                let matched = tokens
                    .iter()
                    .filter(|t| record.text.contains(t.as_str()))
                    .count();
                (matched > 0).then_some((starts, matched, record))
            })
            .collect();

        ranked.sort_by_key(|(starts, matched, record)| {
            (Reverse(*starts), Reverse(*matched), Reverse(record.created_at))
        });

        trace!("Index search for {:?} matched {} records", query, ranked.len());
        Ok(ranked
            .into_iter()
            .take(MAX_SEARCH_RESULTS)
            .map(|(_, _, record)| record.clone())
            .collect())
    }

    async fn estimate_usage_bytes(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        let attachments: usize = inner
            .attachments
            .values()
            .map(|a| a.id.len() + a.memo_id.len() + a.file_name.len() + a.content.len())
            .sum();
        let index: usize = inner
            .search_index
            .values()
            .map(|r| r.id.len() + r.text.len())
            .sum();
        Ok((attachments + index) as u64)
    }

    async fn clear_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner = Collections::default();
        debug!("Cleared indexed store");
        Ok(())
    }
}

/// Stand-in for an indexed database that could not be opened. Every call
/// fails, which drives callers onto their key-value fallback paths.
#[derive(Debug, Clone)]
pub struct UnavailableIndexedStore {
    reason: String,
}

impl UnavailableIndexedStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(MemoError::indexed_store(self.reason.clone()))
    }
}

#[async_trait]
impl IndexedStore for UnavailableIndexedStore {
    async fn put_attachment(&self, _attachment: &Attachment) -> Result<()> {
        self.fail()
    }

    async fn get_attachment(&self, _id: &str) -> Result<Option<Attachment>> {
        self.fail()
    }

    async fn get_attachments_by_owner(&self, _owner_id: &str) -> Result<Vec<Attachment>> {
        self.fail()
    }

    async fn delete_attachment(&self, _id: &str) -> Result<()> {
        self.fail()
    }

    async fn delete_attachments_by_owner(&self, _owner_id: &str) -> Result<usize> {
        self.fail()
    }

    async fn upsert_search_record(&self, _note: &Note) -> Result<()> {
        self.fail()
    }

    async fn delete_search_record(&self, _id: &str) -> Result<()> {
        self.fail()
    }

    async fn clear_search_index(&self) -> Result<()> {
        self.fail()
    }

    async fn search(&self, _query: &str) -> Result<Vec<SearchRecord>> {
        self.fail()
    }

    async fn estimate_usage_bytes(&self) -> Result<u64> {
        self.fail()
    }

    async fn clear_all(&self) -> Result<()> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn attachment(id: &str, memo_id: &str, offset_secs: i64) -> Attachment {
        Attachment {
            id: id.into(),
            memo_id: memo_id.into(),
            file_name: format!("{id}.txt"),
            file_type: "text/plain".into(),
            file_size: 5,
            content: "aGVsbG8=".into(),
            thumbnail_url: None,
            uploaded_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn attachments_are_indexed_by_owner() {
        let store = MemoryIndexedStore::new();
        store.put_attachment(&attachment("a2", "m1", 10)).await.unwrap();
        store.put_attachment(&attachment("a1", "m1", 0)).await.unwrap();
        store.put_attachment(&attachment("b1", "m2", 0)).await.unwrap();

        let owned = store.get_attachments_by_owner("m1").await.unwrap();
        let ids: Vec<_> = owned.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);

        // moving an attachment re-links its owner
        store.put_attachment(&attachment("a1", "m2", 0)).await.unwrap();
        assert_eq!(store.get_attachments_by_owner("m1").await.unwrap().len(), 1);

        assert_eq!(store.delete_attachments_by_owner("m2").await.unwrap(), 2);
        assert!(store.get_attachment("b1").await.unwrap().is_none());
        assert!(store.estimate_usage_bytes().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn search_ranks_prefix_then_token_count() {
        let store = MemoryIndexedStore::new();
        let release = Note::new("Release Notes", "v1 ships tomorrow", vec!["release".into()]);
        let mention = Note::new("Weekly sync", "talked about the release plan", Vec::new());
        let both = Note::new("Plan", "release plan for v2", Vec::new());
        for note in [&release, &mention, &both] {
            store.upsert_search_record(note).await.unwrap();
        }

        let hits = store.search("release").await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].id, release.id);

        let hits = store.search("PLAN release").await.unwrap();
        assert_eq!(hits[0].id, both.id);
        assert!(store.search("   ").await.unwrap().is_empty());

        store.delete_search_record(&release.id).await.unwrap();
        assert_eq!(store.search_record_count().await, 2);
    }

    #[tokio::test]
    async fn clearing_search_index_keeps_attachments() {
        let store = MemoryIndexedStore::new();
        store.put_attachment(&attachment("a1", "m1", 0)).await.unwrap();
        let note = Note::new("Release Notes", "body", Vec::new());
        store.upsert_search_record(&note).await.unwrap();

        store.clear_search_index().await.unwrap();
        assert_eq!(store.search_record_count().await, 0);
        assert!(store.get_attachment("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_is_capped() {
        let store = MemoryIndexedStore::new();
        for i in 0..60 {
            let note = Note::new(&format!("note {i}"), "common body", Vec::new());
            store.upsert_search_record(&note).await.unwrap();
        }
        assert_eq!(store.search("common").await.unwrap().len(), MAX_SEARCH_RESULTS);
        store.clear_all().await.unwrap();
        assert!(store.search("common").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = UnavailableIndexedStore::new("indexed database blocked");
        let err = store.search("x").await.unwrap_err();
        assert!(matches!(err, MemoError::IndexedStore { .. }));
        assert!(store.clear_all().await.is_err());
    }
}
