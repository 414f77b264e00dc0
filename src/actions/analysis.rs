use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use super::api_error;
use crate::estimator::{self, EstimatorParams};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct EstimateParams {
    /// Target instant; defaults to the drone's most recent observation.
    pub timestamp: Option<DateTime<Utc>>,
    pub time_window_seconds: Option<i64>,
    pub tx_power_dbm: Option<f64>,
    pub path_loss_exponent: Option<f64>,
}

/// `GET /api/analysis/estimate-location/{drone_id}`: RSSI geolocation
/// with spoofing detection. 404 when no kit heard the drone with an RSSI
/// and a known observer position inside the window.
pub async fn estimate_location(
    State(state): State<AppState>,
    Path(drone_id): Path<String>,
    Query(params): Query<EstimateParams>,
) -> impl IntoResponse {
    let window_secs = params.time_window_seconds.unwrap_or(30);
    if !(1..=3600).contains(&window_secs) {
        return api_error(
            StatusCode::BAD_REQUEST,
            "time_window_seconds must be between 1 and 3600",
        );
    }
    let estimator_params = EstimatorParams {
        tx_power_dbm: params.tx_power_dbm.unwrap_or(state.config.tx_power_dbm),
        path_loss_exponent: params
            .path_loss_exponent
            .unwrap_or(state.config.path_loss_exponent),
    };
    if estimator_params.path_loss_exponent <= 0.0
        || !estimator_params.path_loss_exponent.is_finite()
    {
        return api_error(StatusCode::BAD_REQUEST, "path_loss_exponent must be positive");
    }

    // Anchor the window on the requested instant or the latest sighting.
    let center = match params.timestamp {
        Some(ts) => ts,
        None => {
            let repo = state.tracks.clone();
            let id = drone_id.clone();
            match tokio::task::spawn_blocking(move || repo.latest_time(&id)).await {
                Ok(Ok(Some(ts))) => ts,
                Ok(Ok(None)) => {
                    return api_error(
                        StatusCode::NOT_FOUND,
                        format!("no observations of drone '{drone_id}'"),
                    );
                }
                Ok(Err(e)) => {
                    error!("Estimator anchor lookup failed: {e:#}");
                    return api_error(StatusCode::INTERNAL_SERVER_ERROR, "estimator failed");
                }
                Err(e) => {
                    error!("Estimator anchor task failed: {e}");
                    return api_error(StatusCode::INTERNAL_SERVER_ERROR, "estimator failed");
                }
            }
        }
    };

    let tracks_repo = state.tracks.clone();
    let health_repo = state.health.clone();
    let id = drone_id.clone();
    let fetched = tokio::task::spawn_blocking(move || {
        let observations = tracks_repo.rssi_observations(&id, center, window_secs)?;
        let kit_positions = health_repo.kit_positions_near(center, window_secs)?;
        anyhow::Ok((observations, kit_positions))
    })
    .await;
    let (tracks, kit_positions) = match fetched {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            error!("Estimator window fetch failed: {e:#}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "estimator failed");
        }
        Err(e) => {
            error!("Estimator window task failed: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "estimator failed");
        }
    };

    let observations =
        estimator::collect_observations(&tracks, &kit_positions, center, &estimator_params);
    let actual = estimator::reported_position(&tracks, center);

    match estimator::estimate(&observations, actual) {
        Some(result) => Json(result).into_response(),
        None => api_error(
            StatusCode::NOT_FOUND,
            format!(
                "no RSSI observations of drone '{drone_id}' with known kit positions within {window_secs}s of {center}"
            ),
        ),
    }
}
