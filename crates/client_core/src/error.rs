use thiserror::Error;

pub use shared::error::{ApiError, FrameError};

/// Failures while assembling the client at startup. Runtime failures never
/// use this type: HTTP calls return [`ApiError`] and the realtime channel only
/// logs.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid {field} '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported realtime scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
