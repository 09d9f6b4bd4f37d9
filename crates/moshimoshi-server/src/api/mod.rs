mod meetings;

pub use meetings::{AttendResponse, LeaveResponse};

use crate::state::AppState;
use crate::ws;
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let allow_origin = match origin.map(HeaderValue::from_str) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(e)) => {
            tracing::warn!("Ignoring invalid CORS_ORIGIN: {}", e);
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Meeting routes
        .route(
            "/api/meetings",
            get(meetings::list_meetings).post(meetings::create_meeting),
        )
        .route("/api/meetings/{id}", get(meetings::get_meeting))
        .route("/api/meetings/{id}/attend", post(meetings::attend_meeting))
        .route("/api/meetings/{id}/leave", post(meetings::leave_meeting))
        .route(
            "/api/meetings/{id}/participants",
            get(meetings::list_participants),
        )
        // WebSocket endpoint
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
