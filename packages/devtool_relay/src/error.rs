use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("peer connection is closed")]
    PeerClosed,

    #[error("invalid long-poll body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("no long-poll session for channel {0}")]
    UnknownSession(String),

    #[error("failed to open internal socket: {0}")]
    InternalSocket(#[from] Box<tungstenite::Error>),

    #[error("missing targetId query parameter")]
    MissingTargetId,
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        Self::InternalSocket(Box::new(err))
    }
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidBody(_) | RelayError::MissingTargetId => StatusCode::BAD_REQUEST,
            RelayError::UnknownSession(_) => StatusCode::NOT_FOUND,
            RelayError::InternalSocket(_) => StatusCode::BAD_GATEWAY,
            RelayError::PeerClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
