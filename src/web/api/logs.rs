//! Structured-log tail endpoint.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::web::AppState;

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// Tail of the current rolling log file.
pub async fn tail(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(100).min(2000);
    let lines = crate::logging::tail_log(&state.log_dir, limit);
    Json(serde_json::json!({ "lines": lines }))
}
