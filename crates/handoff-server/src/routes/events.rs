use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use handoff_core::types::{EventInput, SessionId};
use serde::Deserialize;
use tokio_stream::StreamExt as _;
use tracing::debug;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Replay only events with a sequence number above this.
    pub after: Option<u64>,
}

/// Resume point: `?after=` wins, then the SSE `Last-Event-ID` header.
fn resume_after(query: &EventsQuery, headers: &HeaderMap) -> Option<u64> {
    query.after.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// POST /api/sessions/{id}/events — publish one event.
pub async fn publish(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<EventInput>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sid = SessionId::parse(&id)?;
    let event = app.notifier().publish(&sid, input);
    Ok(Json(serde_json::to_value(event)?))
}

/// GET /api/sessions/{id}/events — SSE stream of buffered then live events.
/// Each SSE message carries the event type as its name and `seq` as its id.
pub async fn sse_events(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let sid = app.known_session(&id)?;
    let after = resume_after(&query, &headers);
    debug!(session = %sid, after = ?after, "sse subscriber attached");
    let stream = app.notifier().subscribe(&sid, after).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .event(event.kind.as_str())
                .id(event.seq.to_string())
                .data(data),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
