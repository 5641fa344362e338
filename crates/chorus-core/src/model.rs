use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Stage name of one chorus step, normalized to lowercase.
///
/// The pipeline emits a fixed set of named stages but the client carries
/// unknown names verbatim so a newer server does not break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(String);

impl StageName {
    pub const ACTION: &'static str = "action";
    pub const EXPERIENCE: &'static str = "experience";
    pub const INTENTION: &'static str = "intention";
    pub const OBSERVATION: &'static str = "observation";
    pub const UPDATE: &'static str = "update";
    pub const YIELD: &'static str = "yield";
    pub const FINAL: &'static str = "final";

    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The distinguished terminator stage.
    pub fn is_final(&self) -> bool {
        self.0 == Self::FINAL
    }

    /// Sources ride only on this stage.
    pub fn carries_sources(&self) -> bool {
        self.0 == Self::EXPERIENCE
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl Default for MessageRole {
    fn default() -> Self {
        Self::Assistant
    }
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// One persisted message as the server stores it. Step is present only on
/// assistant messages that belong to a chorus pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// A piece of supporting evidence surfaced during the `experience` stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
    #[serde(default)]
    pub token_value: Option<f64>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Source {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}

/// One conversation thread as announced by the server. `messages` holds
/// message ids, not message bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatThread {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// The server-side user record bound to a wallet public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_name_normalizes_case_and_whitespace() {
        assert_eq!(StageName::new(" Final ").as_str(), "final");
        assert!(StageName::new("FINAL").is_final());
        assert!(!StageName::new("finale").is_final());
        assert!(StageName::new("Experience").carries_sources());
    }

    #[test]
    fn source_parses_rfc3339_created_at() {
        let source = Source {
            id: "s-1".to_string(),
            content: String::new(),
            role: None,
            thread_id: None,
            created_at: Some("2026-08-01T12:00:00Z".to_string()),
            agent: None,
            similarity: None,
            token_value: None,
            extra: HashMap::new(),
        };
        assert!(source.created_at_utc().is_some());

        let bad = Source {
            created_at: Some("yesterday".to_string()),
            ..source
        };
        assert!(bad.created_at_utc().is_none());
    }

    #[test]
    fn chat_thread_tolerates_unknown_fields() {
        let thread: ChatThread = serde_json::from_str(
            r#"{
                "id": "t-1",
                "user_id": "u-1",
                "name": "Chat 1",
                "messages": ["m-1"],
                "pinned": true
            }"#,
        )
        .expect("parse thread");
        assert_eq!(thread.id, "t-1");
        assert_eq!(thread.messages, vec!["m-1".to_string()]);
        assert!(thread.extra.contains_key("pinned"));
    }
}
