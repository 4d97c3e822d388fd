use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::AppError;
use crate::state::AppState;

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub identity: Vec<String>,
    pub payload: String,
    #[serde(default = "default_wait")]
    pub wait: bool,
}

/// POST /api/submit — run a task in the caller's session.
///
/// With `wait` (the default) the response is the finished task report.
/// Otherwise the task runs in the background and the response points at the
/// status and event endpoints.
pub async fn submit(
    State(app): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, AppError> {
    if body.identity.iter().all(|p| p.trim().is_empty()) {
        return Err(AppError::bad_request("identity must not be empty"));
    }

    if body.wait {
        let report = app.coordinator.submit(&body.identity, &body.payload).await?;
        return Ok(Json(report).into_response());
    }

    let ticket = app.coordinator.submit_async(&body.identity, &body.payload)?;
    let sid = ticket.session_id.clone();
    tokio::spawn(async move {
        let session = ticket.session_id.clone();
        match ticket.wait().await {
            Ok(report) => info!(session = %session, status = %report.task.status, "background task finished"),
            Err(e) => warn!(session = %session, error = %e, "background task failed"),
        }
    });
    let body = serde_json::json!({
        "sessionId": sid,
        "status": format!("/api/sessions/{sid}/status"),
        "events": format!("/api/sessions/{sid}/events"),
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}
