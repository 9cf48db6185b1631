use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::hex_digest;

/// Stable identity of a conversation: every message among the same set of
/// people lands in the same thread regardless of direction or casing.
///
/// `signature = sha256(join("|", sort(unique(lowercase(participants)))))`,
/// truncated to 16 hex chars. The same value doubles as the Space id.
pub fn participant_signature<I, S>(participants: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let unique: BTreeSet<String> = participants
        .into_iter()
        .map(|p| p.as_ref().trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    let joined = unique.into_iter().collect::<Vec<_>>().join("|");
    hex_digest(joined.as_bytes())[..16].to_string()
}

/// Derived view over one inbox thread directory.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub participants: Vec<String>,
    pub unread_count: usize,
    pub last_message_at: DateTime<Utc>,
    pub last_message_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Listing scope accepted by `list_message_threads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadScope {
    All,
    Unread,
    Participant(String),
}

impl ThreadScope {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "all" => ThreadScope::All,
            "unread" => ThreadScope::Unread,
            other => ThreadScope::Participant(other.to_ascii_lowercase()),
        }
    }

    pub fn matches(&self, thread: &ThreadView) -> bool {
        match self {
            ThreadScope::All => true,
            ThreadScope::Unread => thread.unread_count > 0,
            ThreadScope::Participant(email) => {
                thread.participants.iter().any(|p| p == email)
            }
        }
    }
}

pub fn preview_of(body: &str) -> String {
    const PREVIEW_LEN: usize = 80;
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_LEN {
        flat
    } else {
        let truncated: String = flat.chars().take(PREVIEW_LEN).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_order_case_and_duplicates() {
        let a = participant_signature(["a@x", "b@x"]);
        let b = participant_signature(["B@X", "a@x", "b@x"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn signature_differs_for_different_sets() {
        assert_ne!(
            participant_signature(["a@x", "b@x"]),
            participant_signature(["a@x", "c@x"])
        );
    }

    #[test]
    fn signature_matches_joined_form() {
        // hash("a@x|b@x") per the documented formula.
        let expected = &hex_digest(b"a@x|b@x")[..16];
        assert_eq!(participant_signature(["b@x", "a@x"]), expected);
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(ThreadScope::parse("all"), ThreadScope::All);
        assert_eq!(ThreadScope::parse(""), ThreadScope::All);
        assert_eq!(ThreadScope::parse("unread"), ThreadScope::Unread);
        assert_eq!(
            ThreadScope::parse("B@X"),
            ThreadScope::Participant("b@x".into())
        );
    }

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        assert_eq!(preview_of("hello\n  world"), "hello world");
        let long = "x".repeat(200);
        let preview = preview_of(&long);
        assert_eq!(preview.chars().count(), 81);
        assert!(preview.ends_with('…'));
    }
}
