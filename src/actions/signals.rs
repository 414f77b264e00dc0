use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::error;

use super::{api_error, parse_kit_filter, parse_limit, parse_time_range};
use crate::signals::{DETECTION_ANALOG, DETECTION_DJI};
use crate::signals_repo::SignalQuery;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalQueryParams {
    pub time_range: Option<String>,
    pub kit_id: Option<String>,
    pub detection_type: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/signals`: RF detection query across kits.
pub async fn query_signals(
    State(state): State<AppState>,
    Query(params): Query<SignalQueryParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let limit = match parse_limit(params.limit) {
        Ok(l) => l,
        Err(resp) => return resp,
    };
    let detection_type = match params.detection_type.as_deref() {
        None => None,
        Some(t @ (DETECTION_ANALOG | DETECTION_DJI)) => Some(t.to_string()),
        Some(other) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("detection_type must be 'analog' or 'dji', got '{other}'"),
            );
        }
    };

    let query = SignalQuery {
        range,
        kit_ids: parse_kit_filter(params.kit_id.as_deref()),
        detection_type,
        limit,
    };
    let repo = state.signals.clone();
    match tokio::task::spawn_blocking(move || repo.query(&query)).await {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => {
            error!("Signal query failed: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "signal query failed")
        }
        Err(e) => {
            error!("Signal query task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "signal query failed")
        }
    }
}
