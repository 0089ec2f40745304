use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::{MemoError, Result};

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_])@([A-Za-z0-9_]{3,20})").expect("valid mention regex"));

/// Returns a new globally-unique opaque id.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current time, never earlier than `floor`.
pub fn now_not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}

/// Strips control characters (keeping newlines and tabs) and trims.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extracts unique `@username` mentions in order of first appearance.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        if let Some(name) = caps.get(1) {
            let name = name.as_str().to_string();
            if !mentions.contains(&name) {
                mentions.push(name);
            }
        }
    }
    trace!("Extracted {} mentions", mentions.len());
    mentions
}

/// Encodes file bytes as a base64 data URL.
pub fn encode_data_url(file_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", file_type, STANDARD.encode(bytes))
}

/// Decodes attachment content that is either a data URL or bare base64.
pub fn decode_data_url(file_name: &str, content: &str) -> Result<Vec<u8>> {
    let payload = match content.strip_prefix("data:") {
        Some(rest) => match rest.split_once(";base64,") {
            Some((_, data)) => data,
            None => {
                return Err(MemoError::FileProcessing {
                    file_name: file_name.to_string(),
                    message: "data URL is not base64 encoded".to_string(),
                })
            }
        },
        None => content,
    };

    STANDARD
        .decode(payload.trim())
        .map_err(|e| MemoError::FileProcessing {
            file_name: file_name.to_string(),
            message: format!("invalid base64 content: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize_text("  a\u{0007}b\nc\u{0000} "), "ab\nc");
    }

    #[test]
    fn mentions_are_unique_and_ignore_emails() {
        let found = extract_mentions("@alice hi @bob_2, again @alice; mail me at x@example.com");
        assert_eq!(found, vec!["alice".to_string(), "bob_2".to_string()]);
    }

    #[test]
    fn data_url_round_trip() {
        let url = encode_data_url("text/plain", b"hello");
        assert!(url.starts_with("data:text/plain;base64,"));
        assert_eq!(decode_data_url("a.txt", &url).unwrap(), b"hello");
        assert_eq!(decode_data_url("a.txt", "aGVsbG8=").unwrap(), b"hello");
        assert!(decode_data_url("a.txt", "data:text/plain,hello").is_err());
    }
}
