//! Server-sent event stream of dispatch events.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::web::AppState;

/// `GET /api/events/stream` — every event bus event as SSE. Subscribers that
/// fall behind simply miss events; the bus never blocks the dispatcher.
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(data)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
