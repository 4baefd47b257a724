//! Message intake and message-row endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{api_error, merge_agent_filter};
use crate::core::events::EventKind;
use crate::core::store::{MessageData, StoredMessage};
use crate::web::AppState;

/// `POST /api/message` body.
#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub message: String,
    pub agent: Option<String>,
    pub sender: Option<String>,
    pub channel: Option<String>,
    pub files: Option<Vec<String>>,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(rename = "senderId")]
    pub sender_id: Option<String>,
}

/// Enqueue a message from a transport adapter.
pub async fn post_message(
    State(state): State<AppState>,
    Json(payload): Json<PostMessageRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }

    // A channel/sender pair becomes a context prefix on the stored body; the
    // router keeps it but routes on the token that follows.
    let explicit_pair = payload.channel.is_some() && payload.sender.is_some();
    let channel = payload.channel.unwrap_or_else(|| "api".to_string());
    let sender = payload.sender.unwrap_or_else(|| "user".to_string());
    let content = if explicit_pair {
        format!("[{}/{}]: {}", channel, sender, payload.message)
    } else {
        payload.message.clone()
    };

    let mut data = MessageData::new(&channel, &sender, &content);
    if let Some(id) = payload.message_id {
        let id = id.trim().to_string();
        if !id.is_empty() {
            data.message_id = id;
        }
    }
    data.sender_id = payload.sender_id;
    data.files = payload.files;
    data.agent = payload.agent.filter(|a| !a.trim().is_empty());

    state.events.publish(EventKind::MessageReceived {
        channel: channel.clone(),
        sender: sender.clone(),
        message_id: data.message_id.clone(),
    });

    let message_id = data.message_id.clone();
    state
        .store
        .enqueue_message(data)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(serde_json::json!({ "ok": true, "messageId": message_id })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub agent: Option<String>,
    pub agents: Option<String>,
    pub limit: Option<usize>,
}

/// Recent top-level (non-internal) messages.
pub async fn list_sent(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<StoredMessage>>, (StatusCode, Json<serde_json::Value>)> {
    let filter = merge_agent_filter(query.agent, query.agents);
    let limit = query.limit.unwrap_or(50).min(500);
    let messages = state
        .store
        .recent_sent_messages(filter.as_deref(), limit)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(messages))
}

/// Dead-lettered messages awaiting manual intervention.
pub async fn list_dead(
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredMessage>>, (StatusCode, Json<serde_json::Value>)> {
    let messages = state
        .store
        .dead_messages()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(messages))
}

/// Requeue a dead message with a fresh retry budget.
pub async fn retry_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    state
        .store
        .retry_message(id)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Delete a message row.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    state
        .store
        .delete_message(id)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
