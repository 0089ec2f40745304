use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    decode_data_url, encode_data_url, generate_id, sanitize_text, validation::validate_file,
    Attachment, IndexedStore, KeyValueStore, MemoError, Outcome, RecordCollection, Result,
    Warning, WarningSource,
};

pub const ATTACHMENTS_KEY: &str = "attachments";

/// A file to attach, already read into memory.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub memo_id: String,
    pub file_name: String,
    pub file_type: String,
    pub data: Vec<u8>,
    pub thumbnail_url: Option<String>,
}

/// Result of uploading several files. Each file succeeds or fails alone.
#[derive(Debug, Default)]
pub struct BatchUpload {
    pub created: Vec<Attachment>,
    /// (file name, reason)
    pub failed: Vec<(String, MemoError)>,
    pub warnings: Vec<Warning>,
}

impl BatchUpload {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUsage {
    pub count: usize,
    /// Sum of decoded file sizes
    pub total_bytes: u64,
    /// Indexed store estimate, `None` when it could not be read
    pub indexed_bytes: Option<u64>,
}

/// Attachments are stored in the key-value store and mirrored into the
/// indexed store, which serves reads when it can.
pub struct AttachmentService {
    records: RecordCollection<Attachment>,
    index: Arc<dyn IndexedStore>,
}

impl AttachmentService {
    pub fn new(kv: Arc<KeyValueStore>, index: Arc<dyn IndexedStore>) -> Self {
        AttachmentService {
            records: RecordCollection::new(kv, ATTACHMENTS_KEY),
            index,
        }
    }

    async fn index_attachment(
        &self,
        operation: &'static str,
        attachment: &Attachment,
        warnings: &mut Vec<Warning>,
    ) {
        if let Err(e) = self.index.put_attachment(attachment).await {
            warn!("Indexed copy of attachment {} failed: {}", attachment.id, e);
            warnings.push(Warning::new(WarningSource::Attachments, operation, &e));
        }
    }

    /// Validates type and size, encodes the payload as a data URL and stores
    /// the attachment.
    pub async fn create(&self, new: NewAttachment) -> Result<Outcome<Attachment>> {
        let file_name = sanitize_text(&new.file_name);
        if new.memo_id.trim().is_empty() {
            return Err(MemoError::validation("Attachment must belong to a memo"));
        }
        validate_file(&file_name, &new.file_type, new.data.len() as u64)
            .map_err(MemoError::validation)?;

        let attachment = Attachment {
            id: generate_id(),
            memo_id: new.memo_id,
            content: encode_data_url(&new.file_type, &new.data),
            file_name,
            file_type: new.file_type,
            file_size: new.data.len() as u64,
            thumbnail_url: new.thumbnail_url,
            uploaded_at: Utc::now(),
        };

        debug!("Saving attachment: {}", attachment.id);
        self.records
            .upsert(&attachment)
            .map_err(|e| e.in_operation("createAttachment", Some(&attachment.id)))?;

        let mut warnings = Vec::new();
        self.index_attachment("createAttachment", &attachment, &mut warnings).await;
        Ok(Outcome::with_warnings(attachment, warnings))
    }

    /// Uploads every file independently so one bad file does not sink the
    /// batch.
    pub async fn create_many(&self, files: Vec<NewAttachment>) -> BatchUpload {
        let mut batch = BatchUpload::default();
        for file in files {
            let file_name = file.file_name.clone();
            match self.create(file).await {
                Ok(outcome) => {
                    batch.warnings.extend(outcome.warnings);
                    batch.created.push(outcome.value);
                }
                Err(e) => {
                    warn!("Upload of {} failed: {}", file_name, e);
                    let reason = match e {
                        MemoError::Validation { message } => MemoError::FileProcessing {
                            file_name: file_name.clone(),
                            message,
                        },
                        other => other,
                    };
                    batch.failed.push((file_name, reason));
                }
            }
        }
        info!(
            "Uploaded {} files, {} failed",
            batch.created.len(),
            batch.failed.len()
        );
        batch
    }

    pub async fn get(&self, id: &str) -> Result<Option<Attachment>> {
        match self.index.get_attachment(id).await {
            Ok(Some(attachment)) => return Ok(Some(attachment)),
            Ok(None) => {}
            Err(e) => debug!("Indexed lookup of {} failed, using key-value copy: {}", id, e),
        }
        self.records
            .find(id)
            .map_err(|e| e.in_operation("getAttachment", Some(id)))
    }

    /// Attachments of one memo, oldest upload first. The key-value copy is
    /// authoritative here: the index may hold only a subset after a restart
    /// or a failed indexed write.
    pub async fn list_by_memo(&self, memo_id: &str) -> Result<Vec<Attachment>> {
        let mut found: Vec<Attachment> = self
            .records
            .load_all()
            .map_err(|e| e.in_operation("listAttachments", Some(memo_id)))?
            .into_iter()
            .filter(|a| a.memo_id == memo_id)
            .collect();
        found.sort_by_key(|a| a.uploaded_at);
        Ok(found)
    }

    /// Copies every stored attachment into the indexed store. Stops at the
    /// first index failure and reports it as a warning.
    pub async fn rebuild_index(&self) -> Result<Outcome<usize>> {
        let attachments = self
            .records
            .load_all()
            .map_err(|e| e.in_operation("rebuildAttachmentIndex", None))?;

        for (indexed, attachment) in attachments.iter().enumerate() {
            if let Err(e) = self.index.put_attachment(attachment).await {
                warn!("Attachment index rebuild stopped after {} files: {}", indexed, e);
                let warning = Warning::new(WarningSource::Attachments, "rebuildAttachmentIndex", &e);
                return Ok(Outcome::with_warnings(indexed, vec![warning]));
            }
        }
        debug!("Indexed {} attachments", attachments.len());
        Ok(Outcome::new(attachments.len()))
    }

    /// Returns whether an attachment was removed.
    pub async fn delete(&self, id: &str) -> Result<Outcome<bool>> {
        let removed = self
            .records
            .remove(id)
            .map_err(|e| e.in_operation("deleteAttachment", Some(id)))?;

        let mut warnings = Vec::new();
        if let Err(e) = self.index.delete_attachment(id).await {
            warn!("Indexed removal of attachment {} failed: {}", id, e);
            warnings.push(Warning::new(WarningSource::Attachments, "deleteAttachment", &e));
        }
        Ok(Outcome::with_warnings(removed, warnings))
    }

    /// Removes every attachment of a memo and returns how many there were.
    pub async fn delete_by_memo(&self, memo_id: &str) -> Result<Outcome<usize>> {
        let removed = self
            .records
            .remove_where(|a| a.memo_id == memo_id)
            .map_err(|e| e.in_operation("deleteAttachments", Some(memo_id)))?;

        let mut warnings = Vec::new();
        if let Err(e) = self.index.delete_attachments_by_owner(memo_id).await {
            warn!("Indexed removal for memo {} failed: {}", memo_id, e);
            warnings.push(Warning::new(WarningSource::Attachments, "deleteAttachments", &e));
        }
        debug!("Deleted {} attachments of memo {}", removed.len(), memo_id);
        Ok(Outcome::with_warnings(removed.len(), warnings))
    }

    /// Copies an attachment under a new id owned by `memo_id`. The source
    /// keeps its owner.
    pub async fn clone_to_memo(&self, id: &str, memo_id: &str) -> Result<Outcome<Attachment>> {
        let source = self
            .get(id)
            .await?
            .ok_or_else(|| MemoError::not_found("cloneAttachment", id))?;

        let copy = Attachment {
            id: generate_id(),
            memo_id: memo_id.to_string(),
            uploaded_at: Utc::now(),
            ..source
        };
        self.records
            .upsert(&copy)
            .map_err(|e| e.in_operation("cloneAttachment", Some(&copy.id)))?;

        let mut warnings = Vec::new();
        self.index_attachment("cloneAttachment", &copy, &mut warnings).await;
        Ok(Outcome::with_warnings(copy, warnings))
    }

    /// Decodes the stored payload back into bytes.
    pub fn decode_content(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        decode_data_url(&attachment.file_name, &attachment.content)
    }

    pub async fn usage(&self) -> Result<AttachmentUsage> {
        let records = self
            .records
            .load_all()
            .map_err(|e| e.in_operation("attachmentUsage", None))?;
        let indexed_bytes = match self.index.estimate_usage_bytes().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("Indexed usage unavailable: {}", e);
                None
            }
        };
        Ok(AttachmentUsage {
            count: records.len(),
            total_bytes: records.iter().map(|a| a.file_size).sum(),
            indexed_bytes,
        })
    }
}
