pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health::health))
        // Submission
        .route("/api/submit", post(routes::submit::submit))
        // Sessions
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/{id}/status",
            get(routes::sessions::get_status),
        )
        .route(
            "/api/sessions/{id}/history",
            get(routes::sessions::get_history),
        )
        .route(
            "/api/sessions/{id}/cancel",
            post(routes::sessions::cancel),
        )
        // Events
        .route(
            "/api/sessions/{id}/events",
            get(routes::events::sse_events).post(routes::events::publish),
        )
        .route("/ws/{id}", get(routes::ws::session_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the server on `0.0.0.0:<port>`.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(app_state, listener).await
}

/// Start the server on a pre-bound listener.
///
/// The caller can read the actual port before starting (useful when
/// `port = 0` and the OS picks a free port).
pub async fn serve_on(
    app_state: AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("handoff server listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
