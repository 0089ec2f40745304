use std::sync::Arc;

use chrono::Utc;
use log::debug;

use crate::{
    generate_id, now_not_before, sanitize_text, validation::validate_reply_content,
    KeyValueStore, MemoError, RecordCollection, Reply, Result,
};

pub const REPLIES_KEY: &str = "replies";

#[derive(Debug, Clone, Default)]
pub struct ReplyInput {
    pub memo_id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    pub attachment_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplyUpdate {
    pub content: Option<String>,
    pub attachment_ids: Option<Vec<String>>,
}

pub struct ReplyService {
    replies: RecordCollection<Reply>,
}

impl ReplyService {
    pub fn new(kv: Arc<KeyValueStore>) -> Self {
        ReplyService {
            replies: RecordCollection::new(kv, REPLIES_KEY),
        }
    }

    pub fn create(&self, input: ReplyInput) -> Result<Reply> {
        if input.memo_id.trim().is_empty() {
            return Err(MemoError::validation("Reply must belong to a memo"));
        }
        let content = sanitize_text(&input.content);
        validate_reply_content(&content).map_err(MemoError::validation)?;

        let now = Utc::now();
        let reply = Reply {
            id: generate_id(),
            memo_id: input.memo_id,
            content,
            author_id: input.author_id,
            author_name: sanitize_text(&input.author_name),
            attachment_ids: input.attachment_ids,
            created_at: now,
            updated_at: now,
            is_edited: false,
        };

        debug!("Saving reply {} on memo {}", reply.id, reply.memo_id);
        self.replies
            .upsert(&reply)
            .map_err(|e| e.in_operation("createReply", Some(&reply.id)))?;
        Ok(reply)
    }

    pub fn get(&self, id: &str) -> Result<Option<Reply>> {
        self.replies
            .find(id)
            .map_err(|e| e.in_operation("getReply", Some(id)))
    }

    /// Replies of one memo, oldest first.
    pub fn list_by_memo(&self, memo_id: &str) -> Result<Vec<Reply>> {
        let mut replies: Vec<Reply> = self
            .replies
            .load_all()
            .map_err(|e| e.in_operation("listReplies", Some(memo_id)))?
            .into_iter()
            .filter(|r| r.memo_id == memo_id)
            .collect();
        replies.sort_by_key(|r| r.created_at);
        Ok(replies)
    }

    /// Marks the reply edited only when content or attachments change.
    pub fn update(&self, id: &str, update: ReplyUpdate) -> Result<Reply> {
        let mut reply = self
            .get(id)?
            .ok_or_else(|| MemoError::not_found("updateReply", id))?;

        let mut changed = false;
        if let Some(content) = update.content {
            let content = sanitize_text(&content);
            validate_reply_content(&content).map_err(MemoError::validation)?;
            if content != reply.content {
                reply.content = content;
                changed = true;
            }
        }
        if let Some(attachment_ids) = update.attachment_ids {
            if attachment_ids != reply.attachment_ids {
                reply.attachment_ids = attachment_ids;
                changed = true;
            }
        }
        if !changed {
            return Ok(reply);
        }

        reply.is_edited = true;
        reply.updated_at = now_not_before(reply.created_at);
        self.replies
            .upsert(&reply)
            .map_err(|e| e.in_operation("updateReply", Some(id)))?;
        Ok(reply)
    }

    /// Idempotent.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.replies
            .remove(id)
            .map_err(|e| e.in_operation("deleteReply", Some(id)))
    }

    pub fn delete_by_memo(&self, memo_id: &str) -> Result<usize> {
        let removed = self
            .replies
            .remove_where(|r| r.memo_id == memo_id)
            .map_err(|e| e.in_operation("deleteReplies", Some(memo_id)))?;
        Ok(removed.len())
    }

    pub fn count_by_memo(&self, memo_id: &str) -> Result<usize> {
        Ok(self.list_by_memo(memo_id)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ReplyService {
        ReplyService::new(Arc::new(KeyValueStore::in_memory("test_")))
    }

    fn input(memo_id: &str, content: &str) -> ReplyInput {
        ReplyInput {
            memo_id: memo_id.into(),
            content: content.into(),
            author_id: "u1".into(),
            author_name: "alice".into(),
            ..Default::default()
        }
    }

    #[test]
    fn content_limits_apply() {
        let replies = service();
        assert!(replies.create(input("m1", "  ")).unwrap_err().is_validation());
        assert!(replies
            .create(input("m1", &"x".repeat(1001)))
            .unwrap_err()
            .is_validation());
        assert!(replies.create(input("m1", &"x".repeat(1000))).is_ok());
    }

    #[test]
    fn is_edited_only_on_real_change() {
        let replies = service();
        let reply = replies.create(input("m1", "first")).unwrap();

        let same = replies
            .update(&reply.id, ReplyUpdate { content: Some(" first ".into()), ..Default::default() })
            .unwrap();
        assert!(!same.is_edited);

        let edited = replies
            .update(&reply.id, ReplyUpdate { content: Some("second".into()), ..Default::default() })
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(replies.get(&reply.id).unwrap().unwrap().content, "second");

        assert!(replies
            .update("missing", ReplyUpdate::default())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn listing_and_cleanup_per_memo() {
        let replies = service();
        let first = replies.create(input("m1", "one")).unwrap();
        replies.create(input("m1", "two")).unwrap();
        replies.create(input("m2", "other")).unwrap();

        let listed = replies.list_by_memo("m1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);

        assert!(replies.delete(&first.id).unwrap());
        assert!(!replies.delete(&first.id).unwrap());
        assert_eq!(replies.delete_by_memo("m1").unwrap(), 1);
        assert_eq!(replies.count_by_memo("m2").unwrap(), 1);
    }
}
