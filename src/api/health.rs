use axum::Json;
use serde::Serialize;

#[derive(Serialize, Debug)]
pub(crate) struct HealthResponse {
    status: &'static str,
}

/// Liveness only, does not touch models or disk
#[axum_macros::debug_handler]
pub(crate) async fn handle_health_request() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
