//! Shared data model and wire protocol for the chorus chat client.

pub mod model;
pub mod protocol;

pub use model::{ChatThread, MessageRole, Source, StageName, User, WireMessage};
pub use protocol::{
    decode_event, ChorusResponse, ClientFrame, DecodeError, ErrorPayload, InitPayload,
    NewThreadPayload, ServerEvent, ThreadMessagesPayload,
};
