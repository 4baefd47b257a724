//! Bearer-token authentication for the control API.
//!
//! The key is auto-generated on first start and persisted in the settings
//! document. Adapters send it as `Authorization: Bearer <key>` or
//! `?api_key=<key>`. Auth can be switched off in settings or with
//! `AGENTMUX_API_AUTH=off`.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::AppState;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "Missing or invalid API key" })),
    )
        .into_response()
}

fn query_api_key(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("api_key") {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

fn bearer_token(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").map(str::trim)
}

/// Middleware enforcing the bearer key on every API route.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let snapshot = state.config.snapshot();
    if !snapshot.api.auth_enabled() {
        return next.run(request).await;
    }
    let Some(expected) = snapshot.api.key.clone() else {
        // No key persisted yet; nothing to check against.
        return next.run(request).await;
    };

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if bearer_token(header) == Some(expected.as_str()) {
        return next.run(request).await;
    }
    if query_api_key(request.uri().query()).as_deref() == Some(expected.as_str()) {
        return next.run(request).await;
    }
    unauthorized()
}
