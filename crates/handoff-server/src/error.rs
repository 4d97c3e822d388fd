use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use handoff_core::HandoffError;

/// Carries an explicit 400 through the `anyhow::Error` chain for request
/// validation that has no `HandoffError` counterpart.
#[derive(Debug)]
struct BadRequest(String);

impl std::fmt::Display for BadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequest {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }
}

fn status_for(err: &HandoffError) -> StatusCode {
    match err {
        HandoffError::Busy(_) => StatusCode::CONFLICT,
        HandoffError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        HandoffError::InvalidInstruction(_) | HandoffError::Config(_) => StatusCode::BAD_REQUEST,
        HandoffError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        HandoffError::Workspace { .. }
        | HandoffError::Launch { .. }
        | HandoffError::ProbeTimeout { .. }
        | HandoffError::Delivery { .. } => StatusCode::SERVICE_UNAVAILABLE,
        HandoffError::Http(_) => StatusCode::BAD_GATEWAY,
        HandoffError::Io(_) | HandoffError::Yaml(_) | HandoffError::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequest>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let (status, remediation) = match self.0.downcast_ref::<HandoffError>() {
            Some(e) => (status_for(e), Some(e.remediation())),
            None => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "remediation": remediation,
        });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status(err: HandoffError) -> StatusCode {
        AppError(err.into()).into_response().status()
    }

    #[test]
    fn busy_maps_to_409() {
        assert_eq!(status(HandoffError::Busy("s-1".into())), StatusCode::CONFLICT);
    }

    #[test]
    fn session_not_found_maps_to_404() {
        assert_eq!(
            status(HandoffError::SessionNotFound("s-1".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn invalid_instruction_maps_to_400() {
        assert_eq!(
            status(HandoffError::InvalidInstruction("payload is empty".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn session_fatal_errors_map_to_503() {
        assert_eq!(
            status(HandoffError::ProbeTimeout {
                session: "s-1".into(),
                waited: Duration::from_secs(60),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(HandoffError::Launch {
                context: "handoff-s-1".into(),
                reason: "tmux missing".into(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn io_error_maps_to_500() {
        let err = HandoffError::Io(std::io::Error::other("disk full"));
        assert_eq!(status(err), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn foreign_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bad_request_constructor_maps_to_400() {
        let err = AppError::bad_request("identity must not be empty");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
