use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use tracing::error;

use super::api_error;
use crate::web::AppState;

/// Liveness: healthy only while the time-series store answers.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let repo = state.health.clone();
    let ping = tokio::task::spawn_blocking(move || repo.ping()).await;
    match ping {
        Ok(Ok(())) => Json(json!({ "status": "healthy" })).into_response(),
        Ok(Err(e)) => {
            error!("Store unavailable: {e:#}");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "time-series store unavailable")
        }
        Err(e) => {
            error!("Health probe task failed: {e}");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "health probe failed")
        }
    }
}
