use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// Frames pushed over the realtime socket, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    NewMessage {
        message: ChatMessage,
    },
    #[serde(rename = "typing")]
    TypingIndicator {
        chat_id: String,
        user_id: String,
        is_typing: bool,
    },
    #[serde(rename = "presence")]
    PresenceUpdate {
        user_id: String,
        status: PresenceStatus,
    },
    #[serde(rename = "reaction")]
    ReactionChange {
        message_id: String,
        user_id: String,
        emoji: String,
        action: ReactionAction,
    },
}

pub const FRAME_TYPES: [&str; 4] = ["new_message", "typing", "presence", "reaction"];

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not a JSON object: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("malformed '{kind}' frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::TypingIndicator { .. } => "typing",
            Self::PresenceUpdate { .. } => "presence",
            Self::ReactionChange { .. } => "reaction",
        }
    }

    /// Decodes a text frame, telling unknown discriminators apart from
    /// known ones with a bad body.
    pub fn decode(frame: &str) -> Result<Self, FrameDecodeError> {
        let value: Value = serde_json::from_str(frame).map_err(FrameDecodeError::Json)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameDecodeError::MissingType)?
            .to_string();
        if !FRAME_TYPES.contains(&kind.as_str()) {
            return Err(FrameDecodeError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|source| FrameDecodeError::Malformed { kind, source })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
