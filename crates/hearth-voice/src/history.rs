//! Conversation history: the ordered turns sent to the response pipeline and
//! the persisted conversation record they belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title given to a conversation before its first user turn.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Longest title (in characters) derived from the first user turn.
const TITLE_MAX_CHARS: usize = 50;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One prior turn as the response pipeline sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Fresh conversation with a random id and the default title.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the message list, bump `updated_at`, and name the conversation
    /// after its first user turn if it still carries the default title.
    pub fn update_messages(&mut self, messages: Vec<ChatTurn>) {
        self.messages = messages;
        self.updated_at = Utc::now();
        if self.title == DEFAULT_TITLE {
            if let Some(title) = derive_title(&self.messages) {
                self.title = title;
            }
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// First user turn, cut to 50 characters with a trailing ellipsis.
pub fn derive_title(messages: &[ChatTurn]) -> Option<String> {
    let first = messages.iter().find(|m| m.role == Role::User)?;
    let content = first.content.trim();
    if content.chars().count() > TITLE_MAX_CHARS {
        let cut: String = content.chars().take(TITLE_MAX_CHARS).collect();
        Some(format!("{cut}..."))
    } else {
        Some(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversation_has_default_title() {
        let c = Conversation::new();
        assert_eq!(c.title, DEFAULT_TITLE);
        assert!(c.messages.is_empty());
        assert!(!c.id.is_empty());
    }

    #[test]
    fn title_comes_from_first_user_turn() {
        let mut c = Conversation::new();
        c.update_messages(vec![
            ChatTurn::assistant("Hey! How's your day going?"),
            ChatTurn::user("Pretty good, thanks"),
        ]);
        assert_eq!(c.title, "Pretty good, thanks");

        // Once named, later turns don't rename it.
        c.update_messages(vec![ChatTurn::user("Something else entirely")]);
        assert_eq!(c.title, "Pretty good, thanks");
    }

    #[test]
    fn long_titles_are_truncated_on_char_boundaries() {
        let long = "é".repeat(60);
        let title = derive_title(&[ChatTurn::user(long)]).unwrap();
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn assistant_only_history_keeps_default_title() {
        let mut c = Conversation::new();
        c.update_messages(vec![ChatTurn::assistant("Welcome!")]);
        assert_eq!(c.title, DEFAULT_TITLE);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatTurn::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
