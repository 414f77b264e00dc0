use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::{PATTERN_WINDOW_CAP, PatternEnvelope, api_error, parse_time_range};
use crate::patterns;
use crate::time_range::TimeRange;
use crate::tracks::TrackRecord;
use crate::web::AppState;

/// Fetch the track window every pattern endpoint operates on.
async fn fetch_window(state: &AppState, range: TimeRange) -> Result<Vec<TrackRecord>, Response> {
    let repo = state.tracks.clone();
    match tokio::task::spawn_blocking(move || repo.in_window(&range, PATTERN_WINDOW_CAP)).await {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => {
            error!("Pattern window fetch failed: {e:#}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "pattern window fetch failed",
            ))
        }
        Err(e) => {
            error!("Pattern window task failed: {e}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "pattern window fetch failed",
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RepeatedParams {
    pub time_range: Option<String>,
    pub min_appearances: Option<usize>,
}

pub async fn repeated_drones(
    State(state): State<AppState>,
    Query(params): Query<RepeatedParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let min_appearances = params.min_appearances.unwrap_or(2).max(1);
    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::repeated_contacts(&tracks, min_appearances);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "min_appearances": min_appearances,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CoordinatedParams {
    pub time_range: Option<String>,
    pub distance_m: Option<f64>,
    pub window_min: Option<i64>,
}

pub async fn coordinated(
    State(state): State<AppState>,
    Query(params): Query<CoordinatedParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let distance_m = params.distance_m.unwrap_or(500.0);
    let window_min = params.window_min.unwrap_or(60);
    if distance_m <= 0.0 || !distance_m.is_finite() {
        return api_error(StatusCode::BAD_REQUEST, "distance_m must be positive");
    }
    if window_min <= 0 {
        return api_error(StatusCode::BAD_REQUEST, "window_min must be positive");
    }

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::coordinated_activity(&tracks, distance_m, window_min);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "distance_m": distance_m,
            "window_min": window_min,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct PilotReuseParams {
    pub time_range: Option<String>,
    pub pilot_distance_m: Option<f64>,
}

pub async fn pilot_reuse_endpoint(
    State(state): State<AppState>,
    Query(params): Query<PilotReuseParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let pilot_distance_m = params.pilot_distance_m.unwrap_or(50.0);
    if pilot_distance_m <= 0.0 || !pilot_distance_m.is_finite() {
        return api_error(StatusCode::BAD_REQUEST, "pilot_distance_m must be positive");
    }

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::pilot_reuse(&tracks, pilot_distance_m);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "pilot_distance_m": pilot_distance_m,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct WindowOnlyParams {
    pub time_range: Option<String>,
}

pub async fn anomalies_endpoint(
    State(state): State<AppState>,
    Query(params): Query<WindowOnlyParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::anomalies(&tracks);
    Json(PatternEnvelope::new(
        json!({ "time_range": { "start": range.start, "end": range.end } }),
        results,
    ))
    .into_response()
}

pub async fn multi_kit(
    State(state): State<AppState>,
    Query(params): Query<WindowOnlyParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::multi_kit_contacts(&tracks);
    Json(PatternEnvelope::new(
        json!({ "time_range": { "start": range.start, "end": range.end } }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SecurityAlertParams {
    pub time_range: Option<String>,
    pub night_start: Option<u32>,
    pub night_end: Option<u32>,
    pub tz_offset_hours: Option<i32>,
}

pub async fn security_alerts_endpoint(
    State(state): State<AppState>,
    Query(params): Query<SecurityAlertParams>,
) -> impl IntoResponse {
    // The consolidated score runs over the last four hours by default.
    let range = match parse_time_range(params.time_range.as_deref(), "4h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let night_start = params.night_start.unwrap_or(22);
    let night_end = params.night_end.unwrap_or(5);
    let tz_offset_hours = params.tz_offset_hours.unwrap_or(0);
    if night_start > 23 || night_end > 23 {
        return api_error(StatusCode::BAD_REQUEST, "night hours must be 0-23");
    }
    if !(-14..=14).contains(&tz_offset_hours) {
        return api_error(StatusCode::BAD_REQUEST, "tz_offset_hours must be -14..14");
    }

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::security_alerts(&tracks, night_start, night_end, tz_offset_hours);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "night_start": night_start,
            "night_end": night_end,
            "tz_offset_hours": tz_offset_hours,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoiteringParams {
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub radius_m: Option<f64>,
    pub min_duration_min: Option<f64>,
    pub time_range: Option<String>,
}

pub async fn loitering_endpoint(
    State(state): State<AppState>,
    Query(params): Query<LoiteringParams>,
) -> impl IntoResponse {
    let (Some(center_lat), Some(center_lon)) = (params.center_lat, params.center_lon) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "center_lat and center_lon are required",
        );
    };
    if !(-90.0..=90.0).contains(&center_lat) || !(-180.0..=180.0).contains(&center_lon) {
        return api_error(StatusCode::BAD_REQUEST, "center coordinates out of range");
    }
    let radius_m = params.radius_m.unwrap_or(500.0);
    let min_duration_min = params.min_duration_min.unwrap_or(10.0);
    if radius_m <= 0.0 || !radius_m.is_finite() {
        return api_error(StatusCode::BAD_REQUEST, "radius_m must be positive");
    }
    if min_duration_min < 0.0 || !min_duration_min.is_finite() {
        return api_error(StatusCode::BAD_REQUEST, "min_duration_min must be >= 0");
    }
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::loitering(&tracks, center_lat, center_lon, radius_m, min_duration_min);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "center_lat": center_lat,
            "center_lon": center_lon,
            "radius_m": radius_m,
            "min_duration_min": min_duration_min,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RapidDescentParams {
    pub time_range: Option<String>,
    pub min_descent_m: Option<f64>,
    pub min_descent_rate_mps: Option<f64>,
}

pub async fn rapid_descent_endpoint(
    State(state): State<AppState>,
    Query(params): Query<RapidDescentParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let min_descent_m = params.min_descent_m.unwrap_or(20.0);
    let min_descent_rate_mps = params.min_descent_rate_mps.unwrap_or(5.0);
    if min_descent_m <= 0.0 || min_descent_rate_mps <= 0.0 {
        return api_error(
            StatusCode::BAD_REQUEST,
            "min_descent_m and min_descent_rate_mps must be positive",
        );
    }

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::rapid_descent(&tracks, min_descent_m, min_descent_rate_mps);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "min_descent_m": min_descent_m,
            "min_descent_rate_mps": min_descent_rate_mps,
        }),
        results,
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct NightActivityParams {
    pub time_range: Option<String>,
    pub night_start: Option<u32>,
    pub night_end: Option<u32>,
    pub tz_offset_hours: Option<i32>,
}

pub async fn night_activity_endpoint(
    State(state): State<AppState>,
    Query(params): Query<NightActivityParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let night_start = params.night_start.unwrap_or(22);
    let night_end = params.night_end.unwrap_or(5);
    let tz_offset_hours = params.tz_offset_hours.unwrap_or(0);
    if night_start > 23 || night_end > 23 {
        return api_error(StatusCode::BAD_REQUEST, "night hours must be 0-23");
    }
    if !(-14..=14).contains(&tz_offset_hours) {
        return api_error(StatusCode::BAD_REQUEST, "tz_offset_hours must be -14..14");
    }

    let tracks = match fetch_window(&state, range).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let results = patterns::night_activity(&tracks, night_start, night_end, tz_offset_hours);
    Json(PatternEnvelope::new(
        json!({
            "time_range": { "start": range.start, "end": range.end },
            "night_start": night_start,
            "night_end": night_end,
            "tz_offset_hours": tz_offset_hours,
        }),
        results,
    ))
    .into_response()
}
