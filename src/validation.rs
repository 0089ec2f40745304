//! Business-rule validation for user input.
//!
//! Every validator is a pure function returning `Ok(())` or the first
//! violated rule as a user-facing message. Services turn the message into
//! [`crate::MemoError::Validation`].

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

pub const TITLE_MAX_CHARS: usize = 200;
pub const TAGS_MAX_COUNT: usize = 20;
pub const TAG_MIN_CHARS: usize = 2;
pub const TAG_MAX_CHARS: usize = 30;
pub const REPLY_MAX_CHARS: usize = 1000;
pub const USERNAME_MIN_CHARS: usize = 3;
pub const USERNAME_MAX_CHARS: usize = 20;
pub const PASSWORD_MIN_CHARS: usize = 8;
pub const FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// MIME types accepted for attachments.
pub const ALLOWED_FILE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "application/pdf",
    "text/plain",
    "text/markdown",
    "text/csv",
    "application/json",
    "application/zip",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

pub type ValidationResult = std::result::Result<(), String>;

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}_\-]+$").expect("valid tag regex"));
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid username regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid email regex")
});

pub fn validate_title(title: &str) -> ValidationResult {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err("Title is required".to_string());
    }
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        return Err(format!(
            "Title must be at most {} characters",
            TITLE_MAX_CHARS
        ));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> ValidationResult {
    if body.trim().is_empty() {
        return Err("Body is required".to_string());
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> ValidationResult {
    let trimmed = tag.trim();
    let len = trimmed.chars().count();
    if len < TAG_MIN_CHARS || len > TAG_MAX_CHARS {
        return Err(format!(
            "Tag \"{}\" must be between {} and {} characters",
            trimmed, TAG_MIN_CHARS, TAG_MAX_CHARS
        ));
    }
    if !TAG_RE.is_match(trimmed) {
        return Err(format!(
            "Tag \"{}\" may only contain letters, digits, '-' and '_'",
            trimmed
        ));
    }
    Ok(())
}

/// Validates a full tag list: count limit, per-tag rules and uniqueness.
pub fn validate_tags(tags: &[String]) -> ValidationResult {
    if tags.len() > TAGS_MAX_COUNT {
        return Err(format!("A memo can have at most {} tags", TAGS_MAX_COUNT));
    }

    let mut seen = HashSet::with_capacity(tags.len());
    for tag in tags {
        validate_tag(tag)?;
        if !seen.insert(tag.trim()) {
            return Err(format!("Duplicate tag \"{}\"", tag.trim()));
        }
    }
    Ok(())
}

pub fn validate_reply_content(content: &str) -> ValidationResult {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("Reply content is required".to_string());
    }
    if trimmed.chars().count() > REPLY_MAX_CHARS {
        return Err(format!(
            "Reply must be at most {} characters",
            REPLY_MAX_CHARS
        ));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> ValidationResult {
    let len = username.chars().count();
    if !(USERNAME_MIN_CHARS..=USERNAME_MAX_CHARS).contains(&len) {
        return Err(format!(
            "Username must be between {} and {} characters",
            USERNAME_MIN_CHARS, USERNAME_MAX_CHARS
        ));
    }
    if !USERNAME_RE.is_match(username) {
        return Err("Username may only contain letters, digits and '_'".to_string());
    }
    Ok(())
}

pub fn validate_email(email: &str) -> ValidationResult {
    if email.trim().is_empty() {
        return Err("Email is required".to_string());
    }
    if !EMAIL_RE.is_match(email.trim()) {
        return Err("Email address is not valid".to_string());
    }
    Ok(())
}

pub fn validate_password(password: &str) -> ValidationResult {
    if password.chars().count() < PASSWORD_MIN_CHARS {
        return Err(format!(
            "Password must be at least {} characters",
            PASSWORD_MIN_CHARS
        ));
    }
    let has_letter = password.chars().any(|c| c.is_alphabetic());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err("Password must contain both letters and digits".to_string());
    }
    Ok(())
}

/// Allow-list check for attachment size and MIME type.
pub fn validate_file(file_name: &str, file_type: &str, file_size: u64) -> ValidationResult {
    if file_name.trim().is_empty() {
        return Err("File name is required".to_string());
    }
    if file_size == 0 {
        return Err(format!("File \"{}\" is empty", file_name));
    }
    if file_size > FILE_MAX_BYTES {
        return Err(format!(
            "File \"{}\" exceeds the {} MB limit",
            file_name,
            FILE_MAX_BYTES / (1024 * 1024)
        ));
    }
    let normalized = file_type.trim().to_ascii_lowercase();
    if !ALLOWED_FILE_TYPES.contains(&normalized.as_str()) {
        return Err(format!("File type \"{}\" is not allowed", file_type));
    }
    Ok(())
}

/// A user cannot notify themselves.
pub fn validate_notification_parties(from_user_id: &str, to_user_id: &str) -> ValidationResult {
    if to_user_id.trim().is_empty() {
        return Err("Notification recipient is required".to_string());
    }
    if from_user_id == to_user_id {
        return Err("Cannot send a notification to yourself".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_rules() {
        assert!(validate_title("   ").is_err());
        assert!(validate_title("Release Notes").is_ok());
        assert!(validate_title(&"x".repeat(201)).is_err());
        assert!(validate_title(&"x".repeat(200)).is_ok());
    }

    #[test]
    fn tag_rules_accept_unicode_letters() {
        assert!(validate_tag("release").is_ok());
        assert!(validate_tag("リリース").is_ok());
        assert!(validate_tag("a").is_err());
        assert!(validate_tag("has space").is_err());
        assert!(validate_tag(&"t".repeat(31)).is_err());
    }

    #[test]
    fn tag_list_rejects_duplicates_and_overflow() {
        let dup = vec!["alpha".to_string(), " alpha ".to_string()];
        assert!(validate_tags(&dup).unwrap_err().contains("Duplicate"));

        let many: Vec<String> = (0..21).map(|i| format!("tag{i}")).collect();
        assert!(validate_tags(&many).unwrap_err().contains("at most 20"));
    }

    #[test]
    fn file_rules() {
        assert!(validate_file("a.png", "image/png", 1024).is_ok());
        assert!(validate_file("a.exe", "application/x-msdownload", 1024).is_err());
        assert!(validate_file("big.png", "image/png", FILE_MAX_BYTES + 1).is_err());
        assert!(validate_file("empty.png", "image/png", 0).is_err());
    }

    #[test]
    fn user_rules() {
        assert!(validate_username("al").is_err());
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_username("alice!").is_err());
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email("alice@").is_err());
        assert!(validate_password("short1").is_err());
        assert!(validate_password("longenough").is_err());
        assert!(validate_password("longenough1").is_ok());
    }

    #[test]
    fn notification_parties_must_differ() {
        assert!(validate_notification_parties("u1", "u1").is_err());
        assert!(validate_notification_parties("u1", "u2").is_ok());
    }
}
