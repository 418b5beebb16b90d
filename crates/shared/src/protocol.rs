use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{ConversationId, MessageId, TokenPair, UserId},
    error::{ApiError, FrameError},
};

/// Normalized shape of every HTTP response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    /// Builds an envelope from a raw response, whatever shape the backend
    /// chose for this endpoint.
    ///
    /// Bodies that already carry a boolean `success` are taken as-is (loose
    /// sibling fields become `data` when `data` is absent). Any other JSON
    /// value becomes the `data` of a 2xx response, with `error`/`message`
    /// lifted out of objects. An empty body yields an envelope with no data.
    pub fn normalize(status: u16, body: &[u8]) -> Result<Self, serde_json::Error> {
        let ok = (200..300).contains(&status);
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self {
                success: ok,
                ..Self::default()
            });
        }

        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(mut fields) = value else {
            return Ok(Self {
                success: ok,
                data: ok.then_some(value),
                ..Self::default()
            });
        };

        let error = fields.get("error").and_then(text_of);
        let message = fields.get("message").and_then(text_of);

        if let Some(success) = fields.get("success").and_then(Value::as_bool) {
            let data = match fields.remove("data") {
                Some(Value::Null) | None => {
                    for key in ["success", "error", "message"] {
                        fields.remove(key);
                    }
                    (!fields.is_empty()).then_some(Value::Object(fields))
                }
                Some(data) => Some(data),
            };
            return Ok(Self {
                success,
                data,
                error,
                message,
            });
        }

        Ok(Self {
            success: ok,
            data: ok.then_some(Value::Object(fields)),
            error,
            message,
        })
    }

    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// Fresh credentials embedded in the payload (login, signup, refresh).
    pub fn token_pair(&self) -> Option<TokenPair> {
        self.data.as_ref().and_then(TokenPair::find_in)
    }

    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let data = self.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|err| ApiError::parse(format!("response data: {err}")))
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(inner) => inner
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

/// Frames the client sends over the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "join:conversation", rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },
    #[serde(rename = "leave:conversation", rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },
    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { conversation_id: ConversationId },
    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { conversation_id: ConversationId },
    #[serde(rename = "message:delivered", rename_all = "camelCase")]
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
}

impl ClientFrame {
    pub fn typing(conversation_id: ConversationId, active: bool) -> Self {
        if active {
            Self::TypingStart { conversation_id }
        } else {
            Self::TypingStop { conversation_id }
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join:conversation",
            Self::LeaveConversation { .. } => "leave:conversation",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::MessageDelivered { .. } => "message:delivered",
            Self::MessageRead { .. } => "message:read",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Tag of an inbound realtime frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventTag {
    AuthSuccess,
    MessageNew,
    MessageDelivered,
    MessageRead,
    TypingStart,
    TypingStop,
    Error,
    Joined,
    Left,
    Other(String),
}

impl EventTag {
    pub const KNOWN: [EventTag; 9] = [
        EventTag::AuthSuccess,
        EventTag::MessageNew,
        EventTag::MessageDelivered,
        EventTag::MessageRead,
        EventTag::TypingStart,
        EventTag::TypingStop,
        EventTag::Error,
        EventTag::Joined,
        EventTag::Left,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::AuthSuccess => "auth:success",
            Self::MessageNew => "message:new",
            Self::MessageDelivered => "message:delivered",
            Self::MessageRead => "message:read",
            Self::TypingStart => "typing:start",
            Self::TypingStop => "typing:stop",
            Self::Error => "error",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Other(tag) => tag,
        }
    }
}

impl From<&str> for EventTag {
    fn from(value: &str) -> Self {
        match value {
            "auth:success" => Self::AuthSuccess,
            "message:new" => Self::MessageNew,
            "message:delivered" => Self::MessageDelivered,
            "message:read" => Self::MessageRead,
            "typing:start" => Self::TypingStart,
            "typing:stop" => Self::TypingStop,
            "error" => Self::Error,
            "joined" => Self::Joined,
            "left" => Self::Left,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for EventTag {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<EventTag> for String {
    fn from(value: EventTag) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound frame: its tag plus every other field, untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub tag: EventTag,
    pub fields: Map<String, Value>,
}

impl ServerEvent {
    pub fn new(tag: EventTag, fields: Map<String, Value>) -> Self {
        Self { tag, fields }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(FrameError::NotAnObject);
        };
        let tag = match fields.remove("type") {
            Some(Value::String(tag)) if !tag.is_empty() => EventTag::from(tag),
            Some(_) => return Err(FrameError::InvalidTag),
            None => return Err(FrameError::MissingTag),
        };
        Ok(Self { tag, fields })
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.str_field("conversationId").map(ConversationId::from)
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.str_field("messageId").map(MessageId::from)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.str_field("userId").map(UserId::from)
    }

    /// Deserializes the whole frame (minus its tag) into a caller type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|err| FrameError::Payload(err.to_string()))
    }
}
