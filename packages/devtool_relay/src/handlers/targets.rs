use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Every live channel keyed by id: its first target's metadata plus the
/// number of attached devtools.
pub async fn get_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.channels.get_targets().await)
}
