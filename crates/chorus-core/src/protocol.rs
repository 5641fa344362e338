//! Wire protocol for the chorus backend: JSON text frames over a
//! persistent duplex socket. Inbound frames are discriminated by an
//! optional `type` field; a frame without one is a chorus response, which
//! older servers still emit.

use crate::model::{ChatThread, Source, User, WireMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const EVENT_TYPE_CHORUS_RESPONSE: &str = "chorus_response";
pub const EVENT_TYPE_THREAD_MESSAGES: &str = "thread_messages";
pub const EVENT_TYPE_NEW_THREAD: &str = "new_thread";
pub const EVENT_TYPE_INIT: &str = "init";
pub const EVENT_TYPE_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("frame parse failed: {0}")]
    ParseFailure(String),
    #[error("unknown event type: {0}")]
    UnknownType(String),
}

/// One step of an in-flight chorus run. Everything is optional on the
/// wire; `thread_id` is accepted for servers that scope their pushes but
/// is absent in the baseline protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChorusResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadMessagesPayload {
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewThreadPayload {
    pub chat_thread: ChatThread,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitPayload {
    pub user: User,
    #[serde(default)]
    pub chat_threads: Vec<ChatThread>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}

/// The closed set of inbound events. Every downstream component matches
/// over this exhaustively; nothing dispatches on raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Chorus(ChorusResponse),
    ThreadMessages(ThreadMessagesPayload),
    NewThread(NewThreadPayload),
    Init(InitPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Chorus(_) => EVENT_TYPE_CHORUS_RESPONSE,
            ServerEvent::ThreadMessages(_) => EVENT_TYPE_THREAD_MESSAGES,
            ServerEvent::NewThread(_) => EVENT_TYPE_NEW_THREAD,
            ServerEvent::Init(_) => EVENT_TYPE_INIT,
            ServerEvent::Error(_) => EVENT_TYPE_ERROR,
        }
    }
}

/// Decode one inbound text frame. A missing `type` field falls back to
/// `chorus_response`; unknown types and malformed JSON come back as
/// errors for the caller to log and drop.
pub fn decode_event(raw: &str) -> Result<ServerEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::ParseFailure(err.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::ParseFailure(
            "frame is not a JSON object".to_string(),
        ));
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(EVENT_TYPE_CHORUS_RESPONSE)
        .to_string();

    let decoded = match kind.as_str() {
        EVENT_TYPE_CHORUS_RESPONSE => serde_json::from_value(value).map(ServerEvent::Chorus),
        EVENT_TYPE_THREAD_MESSAGES => {
            serde_json::from_value(value).map(ServerEvent::ThreadMessages)
        }
        EVENT_TYPE_NEW_THREAD => serde_json::from_value(value).map(ServerEvent::NewThread),
        EVENT_TYPE_INIT => serde_json::from_value(value).map(ServerEvent::Init),
        EVENT_TYPE_ERROR => serde_json::from_value(value).map(ServerEvent::Error),
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    decoded.map_err(|err| DecodeError::ParseFailure(err.to_string()))
}

/// Outbound frames. Identity and prompt frames are untyped objects for
/// compatibility with the original protocol; the rest carry a `type` tag.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ClientFrame {
    Identity(IdentityAnnounce),
    Prompt(PromptSubmit),
    CreateThread(CreateThreadRequest),
    ThreadHistory(ThreadHistoryRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityAnnounce {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptSubmit {
    pub prompt: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateThreadRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadHistoryRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub thread_id: String,
}

impl ClientFrame {
    pub fn identity(public_key: impl Into<String>) -> Self {
        Self::Identity(IdentityAnnounce {
            public_key: public_key.into(),
        })
    }

    pub fn prompt(prompt: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self::Prompt(PromptSubmit {
            prompt: prompt.into(),
            thread_id: thread_id.into(),
        })
    }

    pub fn create_thread(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::CreateThread(CreateThreadRequest {
            kind: "create_thread".to_string(),
            user_id: user_id.into(),
            name: name.into(),
        })
    }

    pub fn thread_history(thread_id: impl Into<String>) -> Self {
        Self::ThreadHistory(ThreadHistoryRequest {
            kind: "get_thread_messages".to_string(),
            thread_id: thread_id.into(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Identity(_) => "identity",
            ClientFrame::Prompt(_) => "prompt",
            ClientFrame::CreateThread(_) => "create_thread",
            ClientFrame::ThreadHistory(_) => "get_thread_messages",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
