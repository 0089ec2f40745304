//! Secondary entities: attachments, replies, notifications and users.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Record;

/// A file attached to exactly one memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    /// Owning memo
    pub memo_id: String,
    pub file_name: String,
    /// MIME type
    pub file_type: String,
    /// Size in bytes of the decoded payload
    pub file_size: u64,
    /// Base64 payload, usually as a data URL
    pub content: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.file_type.starts_with("image/")
    }
}

/// A reply posted under a memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: String,
    pub memo_id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set the first time content or attachments change after creation
    #[serde(default)]
    pub is_edited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Mention,
    Reply,
    MemoUpdate,
    System,
}

/// Kind of entity a notification points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedType {
    Memo,
    Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub related_id: String,
    pub related_type: RelatedType,
    pub from_user_id: String,
    pub from_username: String,
    pub to_user_id: String,
    pub created_at: DateTime<Utc>,
    /// `None` while unread
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// Stored case-folded
    pub email: String,
    /// Argon2id PHC string
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// The parts of a [`User`] that are safe to hand to UI code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        UserProfile {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
            last_login_at: user.last_login_at,
            is_active: user.is_active,
        }
    }
}

impl Record for Attachment {
    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Reply {
    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Notification {
    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for User {
    fn record_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_type_serializes_under_type_key() {
        let notification = Notification {
            id: "n1".into(),
            kind: NotificationType::MemoUpdate,
            title: "t".into(),
            message: "m".into(),
            related_id: "m1".into(),
            related_type: RelatedType::Memo,
            from_user_id: "u1".into(),
            from_username: "alice".into(),
            to_user_id: "u2".into(),
            created_at: Utc::now(),
            read_at: None,
            data: Value::Null,
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["type"], "memo_update");
        assert_eq!(json["readAt"], Value::Null);
        assert!(!notification.is_read());
    }
}
