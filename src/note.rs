//! The memo (note) entity.
//!
//! Notes are serialized in camelCase with ISO-8601 timestamps, which is the
//! shape stored in the key-value store and mirrored to the remote store.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    generate_id, now_not_before, sanitize_text, Record,
    validation::{validate_tag, TAGS_MAX_COUNT},
    MemoError, Result,
};

/// Publication state of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl NoteStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// draft -> published, any -> archived, published/archived -> draft.
    /// Setting the current status again is a no-op and always allowed.
    pub fn can_transition_to(self, next: NoteStatus) -> bool {
        match (self, next) {
            (current, next) if current == next => true,
            (_, NoteStatus::Archived) => true,
            (NoteStatus::Draft, NoteStatus::Published) => true,
            (NoteStatus::Published | NoteStatus::Archived, NoteStatus::Draft) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Represents a single memo in our system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Unique identifier for the note
    pub id: String,
    pub title: String,
    pub body: String,
    /// Unique tags in insertion order
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
    #[serde(default)]
    pub status: NoteStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    /// Last modification time, never earlier than `created_at`
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_cards: Vec<String>,
}

impl Note {
    /// Creates a draft note with a fresh id. Text fields are sanitized but
    /// not validated; validation belongs to the service layer.
    pub fn new(title: &str, body: &str, tags: Vec<String>) -> Self {
        let now = Utc::now();
        Note {
            id: generate_id(),
            title: sanitize_text(title),
            body: sanitize_text(body),
            tags: tags.iter().map(|t| sanitize_text(t)).collect(),
            attachment_ids: Vec::new(),
            status: NoteStatus::Draft,
            priority: Priority::Medium,
            project_id: None,
            author_id: String::new(),
            author_name: String::new(),
            created_at: now,
            updated_at: now,
            linked_cards: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Note> {
        Ok(serde_json::from_str(json)?)
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = now_not_before(self.created_at);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = sanitize_text(tag);
        self.tags.iter().any(|t| *t == tag)
    }

    /// Appends a tag, rejecting duplicates and overflow. On failure the tag
    /// list is left untouched.
    pub fn add_tag(&mut self, tag: &str) -> Result<()> {
        let tag = sanitize_text(tag);
        validate_tag(&tag).map_err(MemoError::validation)?;
        if self.tags.iter().any(|t| *t == tag) {
            return Err(MemoError::validation(format!("Duplicate tag \"{}\"", tag)));
        }
        if self.tags.len() >= TAGS_MAX_COUNT {
            return Err(MemoError::validation(format!(
                "A memo can have at most {} tags",
                TAGS_MAX_COUNT
            )));
        }
        self.tags.push(tag);
        self.touch();
        Ok(())
    }

    /// Removes a tag. Returns whether it was present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let tag = sanitize_text(tag);
        let before = self.tags.len();
        self.tags.retain(|t| *t != tag);
        let removed = self.tags.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Moves the note to `next`, enforcing the lifecycle rules.
    pub fn set_status(&mut self, next: NoteStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MemoError::validation(format!(
                "Cannot change status from {:?} to {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachment_ids.is_empty()
    }

    /// Title, body and tags concatenated for substring search.
    pub fn search_text(&self) -> String {
        let mut text = String::with_capacity(self.title.len() + self.body.len() + 32);
        text.push_str(&self.title);
        text.push(' ');
        text.push_str(&self.body);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }
}

impl Record for Note {
    fn record_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_every_field() {
        let mut note = Note::new("Release Notes", "v1 ships tomorrow", vec!["release".into()]);
        note.project_id = Some("p1".into());
        note.attachment_ids = vec!["a1".into()];
        note.priority = Priority::High;
        note.touch();

        let json = note.to_json().unwrap();
        assert!(json.contains("\"attachmentIds\""));
        assert!(json.contains("\"createdAt\""));

        let restored = Note::from_json(&json).unwrap();
        assert_eq!(restored, note);
    }

    #[test]
    fn add_tag_rejects_duplicates_without_mutation() {
        let mut note = Note::new("t", "b", vec!["release".into()]);
        let err = note.add_tag(" release ").unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
        assert_eq!(note.tags, vec!["release".to_string()]);
    }

    #[test]
    fn add_tag_stops_at_twenty() {
        let mut note = Note::new("t", "b", Vec::new());
        for i in 0..20 {
            note.add_tag(&format!("tag{i}")).unwrap();
        }
        assert!(note.add_tag("tag20").is_err());
        assert_eq!(note.tags.len(), 20);
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        let mut note = Note::new("t", "b", Vec::new());
        note.set_status(NoteStatus::Published).unwrap();
        note.set_status(NoteStatus::Archived).unwrap();
        assert!(note.set_status(NoteStatus::Published).is_err());
        note.set_status(NoteStatus::Draft).unwrap();
        assert_eq!(note.status, NoteStatus::Draft);
        assert!(note.updated_at >= note.created_at);
    }
}
