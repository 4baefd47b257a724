//! Control API server using Axum.

use axum::http::{HeaderValue, Method};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use super::{router::create_app_router, AppState};
use crate::error::{Error, Result};

/// CORS limited to localhost origins on the API port.
fn build_localhost_cors(port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

/// Run the control API server. Binds loopback by default; anything else is
/// an explicit operator choice in settings.
pub async fn run_web_server(state: AppState) -> Result<()> {
    let (host, port) = {
        let snapshot = state.config.snapshot();
        (snapshot.api.host.clone(), snapshot.api.port)
    };

    if let Err(e) = state.config.ensure_api_key() {
        tracing::warn!("Could not ensure API key: {}", e);
    }

    let app = create_app_router(state).layer(build_localhost_cors(port));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| Error::Web(format!("Invalid address: {}", e)))?;

    tracing::info!("Control API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Web(format!("bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Web(e.to_string()))?;

    Ok(())
}
