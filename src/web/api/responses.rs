//! Response polling and acknowledgement endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{api_error, merge_agent_filter};
use crate::core::store::StoredResponse;
use crate::web::AppState;

#[derive(Deserialize)]
pub struct PendingQuery {
    pub channel: Option<String>,
}

/// Undelivered responses for one channel, oldest first.
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<StoredResponse>>, (StatusCode, Json<serde_json::Value>)> {
    let Some(channel) = query.channel.filter(|c| !c.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "channel is required"));
    };
    let responses = state
        .store
        .pending_responses(&channel)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(responses))
}

/// Mark a response delivered. Safe to call twice.
pub async fn ack_response(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    state
        .store
        .ack_response(id)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub agent: Option<String>,
    pub agents: Option<String>,
    pub limit: Option<usize>,
}

/// Recent responses, optionally filtered by agent ids.
pub async fn list_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<StoredResponse>>, (StatusCode, Json<serde_json::Value>)> {
    let filter = merge_agent_filter(query.agent, query.agents);
    let limit = query.limit.unwrap_or(50).min(500);
    let responses = state
        .store
        .recent_responses(filter.as_deref(), limit)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(responses))
}
