//! Bidirectional per-session event socket.
//!
//! The server pushes every event (replay from `?after=` first) as a JSON
//! text frame. Clients may publish by sending an event JSON text frame,
//! which is how a long-lived assistant-side helper reports without spawning
//! a process per event.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use handoff_core::types::{EventInput, SessionId};
use tokio_stream::StreamExt as _;
use tracing::{debug, warn};

use super::events::EventsQuery;
use crate::error::AppError;
use crate::state::AppState;

/// GET /ws/{id}
pub async fn session_socket(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let sid = app.known_session(&id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, app, sid, query.after)))
}

/// Parse a client frame into an event to publish.
pub fn parse_client_event(text: &str) -> serde_json::Result<EventInput> {
    serde_json::from_str(text)
}

async fn handle_socket(mut socket: WebSocket, app: AppState, sid: SessionId, after: Option<u64>) {
    let mut events = app.notifier().subscribe(&sid, after);
    debug!(session = %sid, "websocket attached");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let json = serde_json::to_string(&event).unwrap_or_default();
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_client_event(text.as_str()) {
                        Ok(input) => {
                            app.notifier().publish(&sid, input);
                        }
                        Err(e) => {
                            warn!(session = %sid, error = %e, "rejected websocket frame");
                            let reply = serde_json::json!({ "error": e.to_string() }).to_string();
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!(session = %sid, "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_core::types::EventKind;

    #[test]
    fn client_frames_are_event_inputs() {
        let input = parse_client_event(r#"{"type":"progress","data":30,"taskId":"t-1"}"#).unwrap();
        assert_eq!(input.kind, EventKind::Progress);
        assert!(parse_client_event("not json").is_err());
        assert!(parse_client_event(r#"{"data":1}"#).is_err());
    }
}
