//! Core data structures shared across the memosync services.
//!
//! This module holds the crate `Result` alias, the best-effort outcome
//! channel, and the request/response shapes of the entity services.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MemoError, Note, NoteStatus, Priority};

/// A specialized Result type for memosync operations.
pub type Result<T> = std::result::Result<T, MemoError>;

/// Which secondary subsystem degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningSource {
    SearchIndex,
    Remote,
    Attachments,
    Notifications,
}

/// A failure in a best-effort projection that did not fail the primary write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub source: WarningSource,
    pub operation: &'static str,
    pub message: String,
}

impl Warning {
    pub fn new(source: WarningSource, operation: &'static str, error: &MemoError) -> Self {
        Warning {
            source,
            operation,
            message: error.to_string(),
        }
    }
}

/// Primary result of an operation plus any degraded-projection warnings.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Outcome {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Outcome { value, warnings }
    }

    /// True when at least one secondary write failed.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}

/// Filters for `NoteService::list`. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct NoteFilters {
    /// Matches notes carrying any of these tags
    pub tags: Vec<String>,
    pub project_id: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub created_to: Option<DateTime<Utc>>,
    pub has_attachments: Option<bool>,
}

impl NoteFilters {
    pub fn matches(&self, note: &Note) -> bool {
        if !self.tags.is_empty() && !self.tags.iter().any(|t| note.tags.contains(t)) {
            return false;
        }
        if let Some(project_id) = &self.project_id {
            if note.project_id.as_ref() != Some(project_id) {
                return false;
            }
        }
        if let Some(from) = self.created_from {
            if note.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if note.created_at > to {
                return false;
            }
        }
        if let Some(wanted) = self.has_attachments {
            if note.has_attachments() != wanted {
                return false;
            }
        }
        true
    }
}

/// Input for creating a note.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoteInput {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub attachment_ids: Vec<String>,
    pub priority: Option<Priority>,
    pub project_id: Option<String>,
    pub author_id: String,
    pub author_name: String,
    pub linked_cards: Vec<String>,
}

impl NoteInput {
    pub fn new(title: &str, body: &str) -> Self {
        NoteInput {
            title: title.to_string(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update for a note. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<Vec<String>>,
    pub attachment_ids: Option<Vec<String>>,
    pub status: Option<NoteStatus>,
    pub priority: Option<Priority>,
    /// `Some(None)` detaches the note from its project
    pub project_id: Option<Option<String>>,
    pub linked_cards: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightField {
    Title,
    Body,
    Tag,
}

/// A snippet explaining why a note matched a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Highlight {
    pub field: HighlightField,
    pub text: String,
}

/// One search result. `score` is only set by the fallback scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub note: Note,
    pub highlights: Vec<Highlight>,
    pub score: Option<u32>,
}

/// Summary of a backup restoration operation
#[derive(Debug, Clone)]
pub struct RestoreBackupSummary {
    /// Path to the backup file that was restored
    pub backup_file: PathBuf,
    /// Total number of entries found in the backup
    pub total_entries: usize,
    /// Number of entries written back to the store
    pub entries_restored: usize,
    /// Entries skipped because the key existed and overwrite was disabled
    pub entries_skipped: usize,
    /// (key, error_message) for entries that could not be restored
    pub failed_entries: Vec<(String, String)>,
}
