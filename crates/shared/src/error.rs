use thiserror::Error;

/// Outcome of a failed HTTP call. Every variant carries enough text for a
/// screen to render without inspecting transport details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {reason}")]
    Network { reason: String },
    #[error("not authorized: {reason}")]
    Auth { reason: String },
    #[error("request rejected ({status}): {}", describe(.error, .message))]
    Validation {
        status: u16,
        error: Option<String>,
        message: Option<String>,
    },
    #[error("server error ({status}): {}", describe(.error, .message))]
    Server {
        status: u16,
        error: Option<String>,
        message: Option<String>,
    },
    #[error("unreadable response: {reason}")]
    Parse { reason: String },
}

impl ApiError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Text suitable for showing to the user: the backend's `message`, then
    /// its `error`, then a generic description.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { error, message, .. } | Self::Server { error, message, .. } => {
                message
                    .clone()
                    .or_else(|| error.clone())
                    .unwrap_or_else(|| self.to_string())
            }
            Self::Auth { reason } => reason.clone(),
            Self::Network { .. } => "Unable to reach the server. Check your connection.".into(),
            Self::Parse { .. } => "The server sent an unexpected response.".into(),
        }
    }
}

fn describe(error: &Option<String>, message: &Option<String>) -> String {
    match (error, message) {
        (Some(error), Some(message)) if error != message => format!("{error} ({message})"),
        (Some(text), _) | (None, Some(text)) => text.clone(),
        (None, None) => "no details".to_string(),
    }
}

/// A realtime frame that cannot be turned into a tagged event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no `type` tag")]
    MissingTag,
    #[error("frame `type` tag is not a non-empty string")]
    InvalidTag,
    #[error("frame payload does not match the expected shape: {0}")]
    Payload(String),
}
