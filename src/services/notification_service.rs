use std::sync::Arc;

use chrono::Utc;
use log::{debug, trace};
use serde_json::{json, Value};

use crate::{
    extract_mentions, generate_id, sanitize_text, validation::validate_notification_parties,
    KeyValueStore, MemoError, Note, Notification, NotificationType, RecordCollection, RelatedType,
    Reply, Result, UserProfile, UserService,
};

pub const NOTIFICATIONS_KEY: &str = "notifications";

#[derive(Debug, Clone)]
pub struct NotificationInput {
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub related_id: String,
    pub related_type: RelatedType,
    pub from_user_id: String,
    pub from_username: String,
    pub to_user_id: String,
    pub data: Value,
}

pub struct NotificationService {
    notifications: RecordCollection<Notification>,
}

impl NotificationService {
    pub fn new(kv: Arc<KeyValueStore>) -> Self {
        NotificationService {
            notifications: RecordCollection::new(kv, NOTIFICATIONS_KEY),
        }
    }

    /// Stores an unread notification. Sender and recipient must differ.
    pub fn create(&self, input: NotificationInput) -> Result<Notification> {
        validate_notification_parties(&input.from_user_id, &input.to_user_id)
            .map_err(MemoError::validation)?;

        let notification = Notification {
            id: generate_id(),
            kind: input.kind,
            title: sanitize_text(&input.title),
            message: sanitize_text(&input.message),
            related_id: input.related_id,
            related_type: input.related_type,
            from_user_id: input.from_user_id,
            from_username: input.from_username,
            to_user_id: input.to_user_id,
            created_at: Utc::now(),
            read_at: None,
            data: input.data,
        };
        self.notifications
            .upsert(&notification)
            .map_err(|e| e.in_operation("createNotification", Some(&notification.id)))?;

        debug!(
            "Notification {} for user {}",
            notification.id, notification.to_user_id
        );
        Ok(notification)
    }

    /// Notifications addressed to `user_id`, newest first.
    pub fn list_for_user(&self, user_id: &str, unread_only: bool) -> Result<Vec<Notification>> {
        let mut found: Vec<Notification> = self
            .notifications
            .load_all()
            .map_err(|e| e.in_operation("listNotifications", Some(user_id)))?
            .into_iter()
            .filter(|n| n.to_user_id == user_id && (!unread_only || !n.is_read()))
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    pub fn unread_count(&self, user_id: &str) -> Result<usize> {
        Ok(self.list_for_user(user_id, true)?.len())
    }

    fn set_read(&self, operation: &'static str, id: &str, read: bool) -> Result<Notification> {
        let mut notification = self
            .notifications
            .find(id)
            .map_err(|e| e.in_operation(operation, Some(id)))?
            .ok_or_else(|| MemoError::not_found(operation, id))?;

        if notification.is_read() == read {
            return Ok(notification);
        }
        notification.read_at = read.then(Utc::now);
        self.notifications
            .upsert(&notification)
            .map_err(|e| e.in_operation(operation, Some(id)))?;
        Ok(notification)
    }

    /// Keeps the original read time when already read.
    pub fn mark_read(&self, id: &str) -> Result<Notification> {
        self.set_read("markRead", id, true)
    }

    pub fn mark_unread(&self, id: &str) -> Result<Notification> {
        self.set_read("markUnread", id, false)
    }

    /// Returns how many notifications changed state.
    pub fn mark_all_read(&self, user_id: &str) -> Result<usize> {
        let mut all = self
            .notifications
            .load_all()
            .map_err(|e| e.in_operation("markAllRead", Some(user_id)))?;

        let now = Utc::now();
        let mut changed = 0;
        for notification in all
            .iter_mut()
            .filter(|n| n.to_user_id == user_id && !n.is_read())
        {
            notification.read_at = Some(now);
            changed += 1;
        }
        if changed > 0 {
            self.notifications
                .replace_all(&all)
                .map_err(|e| e.in_operation("markAllRead", Some(user_id)))?;
        }
        Ok(changed)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.notifications
            .remove(id)
            .map_err(|e| e.in_operation("deleteNotification", Some(id)))
    }

    /// Notifies every active user mentioned as `@username` in `text`.
    /// Unknown names and self-mentions are skipped.
    pub fn notify_mentions(
        &self,
        users: &UserService,
        text: &str,
        from: &UserProfile,
        memo: &Note,
    ) -> Result<Vec<Notification>> {
        let mut sent = Vec::new();
        for username in extract_mentions(text) {
            let Some(target) = users.find_by_username(&username)? else {
                trace!("Skipping mention of unknown user {}", username);
                continue;
            };
            if target.id == from.id || !target.is_active {
                continue;
            }

            sent.push(self.create(NotificationInput {
                kind: NotificationType::Mention,
                title: "You were mentioned".to_string(),
                message: format!("{} mentioned you in \"{}\"", from.username, memo.title),
                related_id: memo.id.clone(),
                related_type: RelatedType::Memo,
                from_user_id: from.id.clone(),
                from_username: from.username.clone(),
                to_user_id: target.id,
                data: json!({ "memoId": memo.id }),
            })?);
        }
        Ok(sent)
    }

    /// Tells the memo author about a new reply, unless they wrote it.
    pub fn notify_reply(&self, memo: &Note, reply: &Reply) -> Result<Option<Notification>> {
        if memo.author_id.is_empty() || memo.author_id == reply.author_id {
            return Ok(None);
        }

        let notification = self.create(NotificationInput {
            kind: NotificationType::Reply,
            title: "New reply".to_string(),
            message: format!("{} replied to \"{}\"", reply.author_name, memo.title),
            related_id: reply.id.clone(),
            related_type: RelatedType::Reply,
            from_user_id: reply.author_id.clone(),
            from_username: reply.author_name.clone(),
            to_user_id: memo.author_id.clone(),
            data: json!({ "memoId": memo.id }),
        })?;
        Ok(Some(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(from: &str, to: &str) -> NotificationInput {
        NotificationInput {
            kind: NotificationType::System,
            title: "Hello".into(),
            message: "World".into(),
            related_id: "m1".into(),
            related_type: RelatedType::Memo,
            from_user_id: from.into(),
            from_username: from.into(),
            to_user_id: to.into(),
            data: Value::Null,
        }
    }

    #[test]
    fn cannot_notify_yourself() {
        let notifications = NotificationService::new(Arc::new(KeyValueStore::in_memory("t_")));
        assert!(notifications.create(input("u1", "u1")).unwrap_err().is_validation());
    }

    #[test]
    fn read_state_transitions() {
        let notifications = NotificationService::new(Arc::new(KeyValueStore::in_memory("t_")));
        let first = notifications.create(input("u1", "u2")).unwrap();
        notifications.create(input("u1", "u2")).unwrap();
        notifications.create(input("u2", "u1")).unwrap();

        assert_eq!(notifications.unread_count("u2").unwrap(), 2);
        let read = notifications.mark_read(&first.id).unwrap();
        let again = notifications.mark_read(&first.id).unwrap();
        assert_eq!(read.read_at, again.read_at);
        assert_eq!(notifications.unread_count("u2").unwrap(), 1);

        assert_eq!(notifications.mark_all_read("u2").unwrap(), 1);
        assert_eq!(notifications.unread_count("u2").unwrap(), 0);
        assert_eq!(notifications.unread_count("u1").unwrap(), 1);

        notifications.mark_unread(&first.id).unwrap();
        assert_eq!(notifications.list_for_user("u2", true).unwrap().len(), 1);
        assert!(notifications.delete(&first.id).unwrap());
        assert!(notifications.mark_read(&first.id).unwrap_err().is_not_found());
    }

    #[test]
    fn mentions_notify_known_users_only() {
        let kv = Arc::new(KeyValueStore::in_memory("t_"));
        let users = UserService::new(kv.clone());
        let notifications = NotificationService::new(kv);

        let alice = users.register("alice", "alice@example.com", "password1").unwrap();
        let bob = users.register("bob", "bob@example.com", "password1").unwrap();
        let memo = Note::new("Plan", "body", Vec::new());

        let sent = notifications
            .notify_mentions(&users, "@bob @alice @nobody please review", &alice, &memo)
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_user_id, bob.id);
        assert_eq!(sent[0].kind, NotificationType::Mention);
        assert_eq!(sent[0].data["memoId"], memo.id.as_str());
    }

    #[test]
    fn reply_notifies_author_of_others() {
        let notifications = NotificationService::new(Arc::new(KeyValueStore::in_memory("t_")));
        let mut memo = Note::new("Plan", "body", Vec::new());
        memo.author_id = "u1".into();

        let mut reply = Reply {
            id: "r1".into(),
            memo_id: memo.id.clone(),
            content: "nice".into(),
            author_id: "u1".into(),
            author_name: "alice".into(),
            attachment_ids: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_edited: false,
        };
        assert!(notifications.notify_reply(&memo, &reply).unwrap().is_none());

        reply.author_id = "u2".into();
        reply.author_name = "bob".into();
        let sent = notifications.notify_reply(&memo, &reply).unwrap().unwrap();
        assert_eq!(sent.to_user_id, "u1");
        assert_eq!(sent.related_type, RelatedType::Reply);
    }
}
