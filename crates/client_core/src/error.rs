use reqwest::StatusCode;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("server rejected the change as conflicting: {0}")]
    Conflict(String),
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid mutation: {0}")]
    Invalid(String),
    #[error("{operation} is not supported for {entity_type}")]
    Unsupported {
        entity_type: String,
        operation: String,
    },
}

impl DispatchError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::InvalidUrl(_) | Self::Invalid(_) | Self::Unsupported { .. }
        )
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Conflict(_) => Some(StatusCode::CONFLICT),
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// Builds the error for a non-success response, preferring the
    /// service's `{code, message}` body when it sends one.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ApiError>(&body).ok();
        let message = match &parsed {
            Some(api_error) => api_error.message.clone(),
            None if body.is_empty() => status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
            None => body,
        };
        let conflict = status == StatusCode::CONFLICT
            || parsed.is_some_and(|api_error| api_error.code == ErrorCode::Conflict);
        if conflict {
            Self::Conflict(message)
        } else {
            Self::Status { status, message }
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("no access token available for the realtime channel")]
    MissingCredentials,
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
    #[error("invalid authorization header")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
