use axum::{
    Json,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response, sse::Sse},
};
use tracing::debug;

use crate::AppState;
use crate::error::RelayError;

/// `POST /target/{id}` with a JSON array of frames. The first element
/// `"connect"` opens (or replaces) the session; the response is every frame
/// buffered for the page since its previous poll.
pub async fn target_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Vec<String>>, RelayError> {
    let messages: Vec<String> = serde_json::from_slice(&body)?;
    let batch = state
        .long_poll
        .post(&id, query.as_deref(), messages)
        .await?;
    Ok(Json(batch))
}

/// Plain `GET /target/{id}`: attach a server-sent event stream to the
/// session. Without a session this is an empty 200.
pub(crate) async fn attach_stream(state: &AppState, id: &str) -> Response {
    match state.long_poll.attach(id).await {
        Some(stream) => ([(header::CONNECTION, "keep-alive")], Sse::new(stream)).into_response(),
        None => {
            debug!(channel = %id, "Event stream requested without a session");
            StatusCode::OK.into_response()
        }
    }
}
