//! Route definitions for the control API.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use super::{api, auth, AppState};

/// Create the API router.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        // Message intake and message rows
        .route("/message", post(api::messages::post_message))
        .route("/messages/sent", get(api::messages::list_sent))
        .route("/messages/dead", get(api::messages::list_dead))
        .route("/messages/:id/retry", post(api::messages::retry_message))
        .route(
            "/messages/:id",
            axum::routing::delete(api::messages::delete_message),
        )
        // Responses
        .route("/responses", get(api::responses::list_recent))
        .route("/responses/pending", get(api::responses::list_pending))
        .route("/responses/:id/ack", post(api::responses::ack_response))
        // Queue and observability
        .route("/queue/status", get(api::queue::status))
        .route("/logs", get(api::logs::tail))
        .route("/events/stream", get(api::events::stream))
        // Configuration CRUD
        .route(
            "/agents",
            get(api::agents::list_agents).post(api::agents::create_agent),
        )
        .route(
            "/agents/:id",
            get(api::agents::get_agent).delete(api::agents::delete_agent),
        )
        .route(
            "/teams",
            get(api::teams::list_teams).post(api::teams::create_team),
        )
        .route(
            "/teams/:id",
            get(api::teams::get_team).delete(api::teams::delete_team),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state)
}

/// Create the full app router.
pub fn create_app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", create_api_router(state))
        .route("/health", get(health_check))
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
