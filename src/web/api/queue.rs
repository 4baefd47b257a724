//! Queue status endpoint.

use axum::{extract::State, http::StatusCode, Json};

use super::api_error;
use crate::web::AppState;

/// Aggregated queue counts plus live conversation count.
pub async fn status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let counts = state
        .store
        .queue_status()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(serde_json::json!({
        "pending": counts.pending,
        "processing": counts.processing,
        "completed": counts.completed,
        "dead": counts.dead,
        "responsesPending": counts.responses_pending,
        "activeConversations": state.conversations.active_count(),
    })))
}
