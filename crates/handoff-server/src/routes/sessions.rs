use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use handoff_core::types::SessionId;
use handoff_core::HandoffError;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/sessions — ids of every session with a workspace.
pub async fn list_sessions(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ids = app.coordinator.sessions()?;
    let list: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "sessionId": id,
                "inFlight": app.coordinator.in_flight(id),
            })
        })
        .collect();
    Ok(Json(serde_json::json!(list)))
}

/// GET /api/sessions/{id}/status — the durable status record.
pub async fn get_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sid = SessionId::parse(&id)?;
    let status = app
        .coordinator
        .status(&sid)?
        .ok_or_else(|| HandoffError::SessionNotFound(id.clone()))?;
    Ok(Json(serde_json::to_value(status)?))
}

/// GET /api/sessions/{id}/history — buffered events, oldest first; 404 when
/// the session has neither events nor a workspace.
pub async fn get_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sid = app.known_session(&id)?;
    let events = app.notifier().history(&sid);
    Ok(Json(serde_json::json!({
        "sessionId": sid,
        "events": events,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

/// POST /api/sessions/{id}/cancel — cancel pending, queued and in-flight tasks.
pub async fn cancel(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let sid = SessionId::parse(&id)?;
    let body: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::bad_request(e.to_string()))?
    };
    let reason = body.reason.unwrap_or_else(|| "cancelled by caller".into());
    let cancelled = app.coordinator.cancel(&sid, &reason).await?;
    Ok(Json(serde_json::json!({
        "sessionId": sid,
        "cancelled": cancelled,
    })))
}
