use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::FrameError,
};

/// Sentinel message identifier meaning "every message in the conversation".
pub const ALL_MESSAGES: &str = "ALL";

/// One decoded frame received from the chat backend.
///
/// The backend does not commit to a schema, so the payload is kept as the raw
/// JSON object and interpreted by whichever listener cares about it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, FrameError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(payload) => Ok(Self::new(payload)),
            other => Err(FrameError::NotAnObject {
                found: json_kind(&other),
            }),
        }
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The frame's event discriminator, when the backend sent one.
    pub fn event_type(&self) -> Option<&str> {
        ["type", "event"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    All,
    Message(MessageId),
}

impl MessageTarget {
    pub fn from_raw(raw: &str) -> Self {
        if raw == ALL_MESSAGES {
            Self::All
        } else {
            Self::Message(MessageId::new(raw))
        }
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(ALL_MESSAGES),
            Self::Message(id) => write!(f, "{id}"),
        }
    }
}

/// Canonical delivery/read state change for one message (or all of them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message: MessageTarget,
    pub conversation_id: Option<ConversationId>,
    pub sender_id: Option<UserId>,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    /// Set for optimistic updates produced on this device before the server confirms them.
    pub is_local: bool,
}

impl StatusUpdate {
    pub fn local_read(conversation_id: ConversationId) -> Self {
        Self {
            message: MessageTarget::All,
            conversation_id: Some(conversation_id),
            sender_id: None,
            status: MessageStatus::Read,
            delivered_at: None,
            read_at: Some(Utc::now()),
            is_local: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        client_message_id: Uuid,
        conversation_id: ConversationId,
        sender_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
}

impl ClientFrame {
    pub fn message(
        conversation_id: ConversationId,
        sender_id: UserId,
        receiver_id: Option<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self::Message {
            client_message_id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            receiver_id,
            content: content.into(),
        }
    }
}
