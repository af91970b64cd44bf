use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub(crate) mod health;
pub(crate) mod transcribe;

pub(crate) fn router(state: AppState, max_upload_bytes: usize) -> Router {
    // TODO act on request cancellation by aborting the decoding loop
    Router::new()
        .route("/health", get(health::handle_health_request))
        .route(
            "/transcribe",
            post(transcribe::handle_transcribe_request)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
