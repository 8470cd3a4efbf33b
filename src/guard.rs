//! Input guard for inbound chat messages.
//!
//! Checks run in a fixed order and stop at the first failure: presence,
//! emptiness, length, then the block patterns.  The character whitelist is
//! intentionally blunt: anything outside ASCII word characters, plain
//! whitespace and a short punctuation list is refused, which also refuses
//! most non-Latin scripts.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const MAX_MESSAGE_CHARS: usize = 800;

/// URLs at or below this many characters are tolerated.
const MAX_URL_CHARS: usize = 20;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:https?://|www\.)\S+").unwrap());

static SPAM_PHRASES: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(["free money", "giveaway"])
        .unwrap()
});

static DISALLOWED_CHAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^A-Za-z0-9_ \t\r\n.,!?'"()\[\]:;\-/@#&+%*=]"#).unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Missing message")]
    MissingMessage,
    #[error("Message cannot be empty")]
    EmptyMessage,
    #[error("Message too long (max {max} characters)")]
    TooLong { max: usize },
    #[error("Message was rejected by the content filter")]
    SpamLike,
}

impl GuardError {
    pub fn http_status(&self) -> u16 {
        match self {
            GuardError::TooLong { .. } => 413,
            _ => 400,
        }
    }
}

/// Validate the raw `message` field of a request body and return it trimmed.
pub fn validate(raw: Option<&Value>) -> Result<String, GuardError> {
    match raw {
        Some(Value::String(text)) => validate_text(text),
        _ => Err(GuardError::MissingMessage),
    }
}

/// Run the emptiness, length and pattern checks against already-extracted text.
pub fn validate_text(text: &str) -> Result<String, GuardError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(GuardError::EmptyMessage);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(GuardError::TooLong {
            max: MAX_MESSAGE_CHARS,
        });
    }
    if let Some(reason) = blocked_reason(trimmed) {
        tracing::warn!(reason, "message rejected by input guard");
        return Err(GuardError::SpamLike);
    }
    Ok(trimmed.to_string())
}

fn blocked_reason(text: &str) -> Option<&'static str> {
    if URL_RE
        .find_iter(text)
        .any(|m| m.as_str().chars().count() > MAX_URL_CHARS)
    {
        return Some("long_url");
    }
    if SPAM_PHRASES.is_match(text) {
        return Some("spam_phrase");
    }
    if DISALLOWED_CHAR_RE.is_match(text) {
        return Some("charset");
    }
    None
}
