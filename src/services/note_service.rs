//! Notes: the primary entity service.
//!
//! # Responsibility
//! - CRUD, lifecycle, tagging and search over notes.
//! - Keep the search index and the remote mirror in step with local writes.
//!
//! # Invariants
//! - The key-value write is the success criterion of every mutation. Index
//!   and remote failures become [`Warning`]s on the returned [`Outcome`].
//! - Validation errors are returned untouched; storage errors carry the
//!   operation name and note id.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::Utc;
use log::{debug, info, trace, warn};

use crate::{
    sanitize_text,
    validation::{validate_body, validate_tags, validate_title, TITLE_MAX_CHARS},
    Highlight, HighlightField, IndexedStore, KeyValueStore, MemoError, Note, NoteFilters,
    NoteInput, NoteStatus, NoteUpdate, Outcome, RecordCollection, RemoteStore, Result,
    SearchHit, Warning, WarningSource,
};

pub const MEMOS_KEY: &str = "memos";
const COPY_SUFFIX: &str = " (copy)";
const MAX_HIGHLIGHTS: usize = 3;
const CONTEXT_CHARS: usize = 20;
const MIN_FALLBACK_TERM_CHARS: usize = 2;

enum Mirror<'a> {
    Create(&'a Note),
    Update(&'a Note),
    Delete(&'a str),
}

pub struct NoteService {
    memos: RecordCollection<Note>,
    index: Arc<dyn IndexedStore>,
    remote: Option<Arc<RemoteStore>>,
    mirror_writes: bool,
}

fn sanitize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| sanitize_text(t))
        .filter(|t| !t.is_empty())
        .collect()
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query.to_lowercase().split_whitespace() {
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
    terms
}

/// `±CONTEXT_CHARS` characters around the first match of any term.
fn body_snippet(body: &str, terms: &[String]) -> Option<String> {
    let lower = body.to_lowercase();
    let (byte_pos, term) = terms
        .iter()
        .filter_map(|t| lower.find(t.as_str()).map(|pos| (pos, t)))
        .min_by_key(|(pos, _)| *pos)?;

    // Lowercasing can change character counts; snippet the lowered text then.
    let source: Vec<char> = if lower.chars().count() == body.chars().count() {
        body.chars().collect()
    } else {
        lower.chars().collect()
    };
    let start_char = lower[..byte_pos].chars().count();
    let term_chars = term.chars().count();

    let start = start_char.saturating_sub(CONTEXT_CHARS);
    let end = (start_char + term_chars + CONTEXT_CHARS).min(source.len());

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.extend(&source[start..end]);
    if end < source.len() {
        snippet.push_str("...");
    }
    Some(snippet)
}

/// Up to three highlights: title, then body context, then tags.
fn highlights_for(note: &Note, terms: &[String]) -> Vec<Highlight> {
    let mut highlights = Vec::new();

    let title = note.title.to_lowercase();
    if terms.iter().any(|t| title.contains(t.as_str())) {
        highlights.push(Highlight {
            field: HighlightField::Title,
            text: note.title.clone(),
        });
    }

    if let Some(snippet) = body_snippet(&note.body, terms) {
        highlights.push(Highlight {
            field: HighlightField::Body,
            text: snippet,
        });
    }

    for tag in &note.tags {
        if highlights.len() >= MAX_HIGHLIGHTS {
            break;
        }
        let lowered = tag.to_lowercase();
        if terms.iter().any(|t| lowered.contains(t.as_str())) {
            highlights.push(Highlight {
                field: HighlightField::Tag,
                text: format!("tag: {}", tag),
            });
        }
    }

    highlights.truncate(MAX_HIGHLIGHTS);
    highlights
}

fn fallback_score(note: &Note, terms: &[String]) -> u32 {
    let title = note.title.to_lowercase();
    let body = note.body.to_lowercase();
    let tags: Vec<String> = note.tags.iter().map(|t| t.to_lowercase()).collect();

    terms
        .iter()
        .map(|term| {
            let mut score = 0;
            if title.contains(term.as_str()) {
                score += 3;
            }
            if body.contains(term.as_str()) {
                score += 2;
            }
            if tags.iter().any(|t| t.contains(term.as_str())) {
                score += 1;
            }
            score
        })
        .sum()
}

impl NoteService {
    pub fn new(kv: Arc<KeyValueStore>, index: Arc<dyn IndexedStore>) -> Self {
        NoteService {
            memos: RecordCollection::new(kv, MEMOS_KEY),
            index,
            remote: None,
            mirror_writes: false,
        }
    }

    /// Attaches the remote layer. With `mirror_writes`, local mutations are
    /// mirrored while online.
    pub fn with_remote(mut self, remote: Arc<RemoteStore>, mirror_writes: bool) -> Self {
        self.remote = Some(remote);
        self.mirror_writes = mirror_writes;
        self
    }

    pub fn remote(&self) -> Option<&Arc<RemoteStore>> {
        self.remote.as_ref()
    }

    fn load(&self, operation: &'static str, id: &str) -> Result<Note> {
        self.memos
            .find(id)
            .map_err(|e| e.in_operation(operation, Some(id)))?
            .ok_or_else(|| MemoError::not_found(operation, id))
    }

    fn store(&self, operation: &'static str, note: &Note) -> Result<()> {
        self.memos
            .upsert(note)
            .map_err(|e| e.in_operation(operation, Some(&note.id)))
    }

    async fn index_note(&self, operation: &'static str, note: &Note, warnings: &mut Vec<Warning>) {
        if let Err(e) = self.index.upsert_search_record(note).await {
            warn!("Search index update for {} failed: {}", note.id, e);
            warnings.push(Warning::new(WarningSource::SearchIndex, operation, &e));
        }
    }

    async fn mirror(&self, operation: &'static str, action: Mirror<'_>, warnings: &mut Vec<Warning>) {
        let Some(remote) = self.remote.as_ref().filter(|_| self.mirror_writes) else {
            return;
        };
        if !remote.is_online() {
            debug!("Offline, not mirroring {}", operation);
            return;
        }

        let result = match action {
            Mirror::Create(note) => remote.create(note).await.map(|_| ()),
            Mirror::Update(note) => remote.update(&note.id, note).await,
            Mirror::Delete(id) => remote.delete(id).await,
        };
        if let Err(e) = result {
            warn!("Remote mirror of {} failed: {}", operation, e);
            warnings.push(Warning::new(WarningSource::Remote, operation, &e));
        }
    }

    /// Validates, stores and indexes a new draft note.
    pub async fn create(&self, input: NoteInput) -> Result<Outcome<Note>> {
        let title = sanitize_text(&input.title);
        let body = sanitize_text(&input.body);
        let tags = sanitize_tags(&input.tags);

        validate_title(&title).map_err(MemoError::validation)?;
        validate_body(&body).map_err(MemoError::validation)?;
        validate_tags(&tags).map_err(MemoError::validation)?;

        let mut note = Note::new(&title, &body, tags);
        note.attachment_ids = input.attachment_ids;
        note.priority = input.priority.unwrap_or_default();
        note.project_id = input.project_id;
        note.author_id = input.author_id;
        note.author_name = sanitize_text(&input.author_name);
        note.linked_cards = input.linked_cards;

        debug!("Saving note: {}", note.id);
        self.store("createMemo", &note)?;

        let mut warnings = Vec::new();
        self.index_note("createMemo", &note, &mut warnings).await;
        self.mirror("createMemo", Mirror::Create(&note), &mut warnings).await;

        info!("Created note {}", note.id);
        Ok(Outcome::with_warnings(note, warnings))
    }

    pub fn get(&self, id: &str) -> Result<Option<Note>> {
        self.memos
            .find(id)
            .map_err(|e| e.in_operation("getMemo", Some(id)))
    }

    /// All notes, most recently updated first.
    pub fn list(&self, filters: Option<&NoteFilters>) -> Result<Vec<Note>> {
        let mut notes = self
            .memos
            .load_all()
            .map_err(|e| e.in_operation("listMemos", None))?;
        if let Some(filters) = filters {
            notes.retain(|n| filters.matches(n));
        }
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(notes)
    }

    /// Applies the supplied fields. Only those fields are validated.
    pub async fn update(&self, id: &str, update: NoteUpdate) -> Result<Outcome<Note>> {
        let mut note = self.load("updateMemo", id)?;

        if let Some(title) = update.title {
            let title = sanitize_text(&title);
            validate_title(&title).map_err(MemoError::validation)?;
            note.title = title;
        }
        if let Some(body) = update.body {
            let body = sanitize_text(&body);
            validate_body(&body).map_err(MemoError::validation)?;
            note.body = body;
        }
        if let Some(tags) = update.tags {
            let tags = sanitize_tags(&tags);
            validate_tags(&tags).map_err(MemoError::validation)?;
            note.tags = tags;
        }
        if let Some(status) = update.status {
            note.set_status(status)?;
        }
        if let Some(attachment_ids) = update.attachment_ids {
            note.attachment_ids = attachment_ids;
        }
        if let Some(priority) = update.priority {
            note.priority = priority;
        }
        if let Some(project_id) = update.project_id {
            note.project_id = project_id;
        }
        if let Some(linked_cards) = update.linked_cards {
            note.linked_cards = linked_cards;
        }
        note.touch();

        debug!("Updating note: {}", id);
        self.store("updateMemo", &note)?;

        let mut warnings = Vec::new();
        self.index_note("updateMemo", &note, &mut warnings).await;
        self.mirror("updateMemo", Mirror::Update(&note), &mut warnings).await;
        Ok(Outcome::with_warnings(note, warnings))
    }

    /// Removes a note. Deleting a missing id succeeds.
    pub async fn delete(&self, id: &str) -> Result<Outcome<()>> {
        let removed = self
            .memos
            .remove(id)
            .map_err(|e| e.in_operation("deleteMemo", Some(id)))?;

        let mut warnings = Vec::new();
        if let Err(e) = self.index.delete_search_record(id).await {
            warn!("Search index removal for {} failed: {}", id, e);
            warnings.push(Warning::new(WarningSource::SearchIndex, "deleteMemo", &e));
        }
        if removed {
            info!("Deleted note {}", id);
            self.mirror("deleteMemo", Mirror::Delete(id), &mut warnings).await;
        } else {
            debug!("Delete of missing note {} ignored", id);
        }
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Searches through the index, falling back to a scored scan of every
    /// note when the index fails. Blank queries return nothing.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Outcome<Vec<SearchHit>>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Outcome::new(Vec::new()));
        }

        match self.index.search(query).await {
            Ok(records) => {
                let by_id: HashMap<String, Note> = self
                    .memos
                    .load_all()
                    .map_err(|e| e.in_operation("searchMemos", None))?
                    .into_iter()
                    .map(|n| (n.id.clone(), n))
                    .collect();

                let hits: Vec<SearchHit> = records
                    .into_iter()
                    // stale index entries have no note behind them
                    .filter_map(|record| by_id.get(&record.id).cloned())
                    .take(max_results)
                    .map(|note| SearchHit {
                        highlights: highlights_for(&note, &terms),
                        note,
                        score: None,
                    })
                    .collect();
                trace!("Index search for {:?} returned {} hits", query, hits.len());
                Ok(Outcome::new(hits))
            }
            Err(e) => {
                warn!("Index search failed, scanning all notes: {}", e);
                let warning = Warning::new(WarningSource::SearchIndex, "searchMemos", &e);
                let hits = self.scan(&terms, max_results)?;
                Ok(Outcome::with_warnings(hits, vec![warning]))
            }
        }
    }

    fn scan(&self, terms: &[String], max_results: usize) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = terms
            .iter()
            .filter(|t| t.chars().count() >= MIN_FALLBACK_TERM_CHARS)
            .cloned()
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u32, Note)> = self
            .memos
            .load_all()
            .map_err(|e| e.in_operation("searchMemos", None))?
            .into_iter()
            .map(|note| (fallback_score(&note, &terms), note))
            .filter(|(score, _)| *score > 0)
            .collect();
        // stable: ties keep storage order
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(max_results)
            .map(|(score, note)| SearchHit {
                highlights: highlights_for(&note, &terms),
                note,
                score: Some(score),
            })
            .collect())
    }

    async fn change_status(
        &self,
        operation: &'static str,
        id: &str,
        status: NoteStatus,
    ) -> Result<Outcome<Note>> {
        let mut note = self.load(operation, id)?;
        note.set_status(status)?;
        self.store(operation, &note)?;

        let mut warnings = Vec::new();
        self.index_note(operation, &note, &mut warnings).await;
        self.mirror(operation, Mirror::Update(&note), &mut warnings).await;
        Ok(Outcome::with_warnings(note, warnings))
    }

    pub async fn publish(&self, id: &str) -> Result<Outcome<Note>> {
        self.change_status("publishMemo", id, NoteStatus::Published).await
    }

    pub async fn archive(&self, id: &str) -> Result<Outcome<Note>> {
        self.change_status("archiveMemo", id, NoteStatus::Archived).await
    }

    pub async fn set_draft(&self, id: &str) -> Result<Outcome<Note>> {
        self.change_status("draftMemo", id, NoteStatus::Draft).await
    }

    /// Copies a note under a new id as a draft. Attachment ids are copied
    /// as-is; use `MemoApp::clone_memo` to duplicate the attachments too.
    pub async fn duplicate(&self, id: &str) -> Result<Outcome<Note>> {
        let source = self.load("cloneMemo", id)?;

        let base: String = source
            .title
            .chars()
            .take(TITLE_MAX_CHARS - COPY_SUFFIX.chars().count())
            .collect();
        let mut copy = Note::new(&format!("{}{}", base, COPY_SUFFIX), &source.body, Vec::new());
        copy.tags = source.tags.clone();
        copy.attachment_ids = source.attachment_ids.clone();
        copy.priority = source.priority;
        copy.project_id = source.project_id.clone();
        copy.author_id = source.author_id.clone();
        copy.author_name = source.author_name.clone();
        copy.linked_cards = source.linked_cards.clone();

        self.store("cloneMemo", &copy)?;

        let mut warnings = Vec::new();
        self.index_note("cloneMemo", &copy, &mut warnings).await;
        self.mirror("cloneMemo", Mirror::Create(&copy), &mut warnings).await;
        info!("Cloned note {} as {}", id, copy.id);
        Ok(Outcome::with_warnings(copy, warnings))
    }

    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<Outcome<Note>> {
        let mut note = self.load("addTag", id)?;
        note.add_tag(tag)?;
        self.store("addTag", &note)?;

        let mut warnings = Vec::new();
        self.index_note("addTag", &note, &mut warnings).await;
        self.mirror("addTag", Mirror::Update(&note), &mut warnings).await;
        Ok(Outcome::with_warnings(note, warnings))
    }

    /// Removing a tag the note does not carry is a no-op.
    pub async fn remove_tag(&self, id: &str, tag: &str) -> Result<Outcome<Note>> {
        let mut note = self.load("removeTag", id)?;
        if !note.remove_tag(tag) {
            return Ok(Outcome::new(note));
        }
        self.store("removeTag", &note)?;

        let mut warnings = Vec::new();
        self.index_note("removeTag", &note, &mut warnings).await;
        self.mirror("removeTag", Mirror::Update(&note), &mut warnings).await;
        Ok(Outcome::with_warnings(note, warnings))
    }

    /// Replaces local notes with the remote collection. Remote wins.
    pub async fn pull_remote(&self) -> Result<Outcome<Vec<Note>>> {
        let remote = self.remote.as_ref().ok_or_else(|| MemoError::RemoteNotConfigured {
            message: "no remote store attached".to_string(),
        })?;
        if !remote.is_online() {
            return Err(MemoError::Offline);
        }

        let notes = remote.list_all().await?;
        self.memos
            .replace_all(&notes)
            .map_err(|e| e.in_operation("syncFromRemote", None))?;
        info!("Pulled {} notes from remote", notes.len());

        let rebuilt = self.rebuild_search_index().await?;
        remote.tracker().mark_synced(Utc::now());
        Ok(Outcome::with_warnings(notes, rebuilt.warnings))
    }

    /// Like [`pull_remote`](Self::pull_remote), but never fails because of
    /// the remote layer: the local list is returned instead.
    pub async fn sync_from_remote(&self) -> Result<Outcome<Vec<Note>>> {
        let available = self.remote.as_ref().is_some_and(|r| r.is_online());
        if !available {
            debug!("Remote unavailable, serving local notes");
            return Ok(Outcome::new(self.list(None)?));
        }

        match self.pull_remote().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Remote sync failed, serving local notes: {}", e);
                let warning = Warning::new(WarningSource::Remote, "syncFromRemote", &e);
                Ok(Outcome::with_warnings(self.list(None)?, vec![warning]))
            }
        }
    }

    /// Drops the search index and re-projects every note into it. Stops at
    /// the first index failure and reports it as a warning.
    pub async fn rebuild_search_index(&self) -> Result<Outcome<usize>> {
        let notes = self
            .memos
            .load_all()
            .map_err(|e| e.in_operation("rebuildSearchIndex", None))?;

        if let Err(e) = self.index.clear_search_index().await {
            warn!("Search index could not be cleared, not rebuilding: {}", e);
            let warning = Warning::new(WarningSource::SearchIndex, "rebuildSearchIndex", &e);
            return Ok(Outcome::with_warnings(0, vec![warning]));
        }
        for (indexed, note) in notes.iter().enumerate() {
            if let Err(e) = self.index.upsert_search_record(note).await {
                warn!("Search index rebuild stopped after {} notes: {}", indexed, e);
                let warning = Warning::new(WarningSource::SearchIndex, "rebuildSearchIndex", &e);
                return Ok(Outcome::with_warnings(indexed, vec![warning]));
            }
        }
        debug!("Rebuilt search index for {} notes", notes.len());
        Ok(Outcome::new(notes.len()))
    }

    /// Tag usage across all notes, most used first.
    pub fn tag_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for note in self
            .memos
            .load_all()
            .map_err(|e| e.in_operation("tagCounts", None))?
        {
            for tag in note.tags {
                *counts.entry(tag).or_default() += 1;
            }
        }
        let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(counts)
    }
}
