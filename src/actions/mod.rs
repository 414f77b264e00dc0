pub mod analysis;
pub mod drones;
pub mod kits;
pub mod patterns;
pub mod signals;
pub mod status;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::time_range::TimeRange;

/// Hard ceiling on `limit` for every row-returning endpoint.
pub const MAX_LIMIT: i64 = 10_000;
pub const DEFAULT_LIMIT: i64 = 1_000;

/// Row cap for pattern-engine window fetches.
pub const PATTERN_WINDOW_CAP: i64 = 100_000;

/// Every error leaves the API as `{"detail": "..."}` with a stable status.
pub fn api_error(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

/// Stable envelope for the pattern endpoints: result count, the parameters
/// the query actually ran with, and the typed result list.
#[derive(Debug, Serialize)]
pub struct PatternEnvelope<T: Serialize> {
    pub count: usize,
    pub parameters: serde_json::Value,
    pub results: Vec<T>,
}

impl<T: Serialize> PatternEnvelope<T> {
    pub fn new(parameters: serde_json::Value, results: Vec<T>) -> Self {
        Self {
            count: results.len(),
            parameters,
            results,
        }
    }
}

/// Parse the optional `time_range` parameter, falling back to a default
/// window. Malformed input turns into a field-level 400.
pub fn parse_time_range(raw: Option<&str>, default: &str) -> Result<TimeRange, Response> {
    let token = raw.unwrap_or(default);
    TimeRange::parse(token, Utc::now()).map_err(|reason| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("time_range: {reason}"),
        )
    })
}

/// Split a comma-separated `kit_id` filter; `None` means all kits.
pub fn parse_kit_filter(raw: Option<&str>) -> Option<Vec<String>> {
    let list: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if list.is_empty() { None } else { Some(list) }
}

/// Clamp `limit` into `[1, MAX_LIMIT]`; out-of-range input is a 400, not a
/// silent truncation.
pub fn parse_limit(raw: Option<i64>) -> Result<i64, Response> {
    match raw {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if n >= 1 && n <= MAX_LIMIT => Ok(n),
        Some(n) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_LIMIT}, got {n}"),
        )),
    }
}

/// Validate an optional `track_type` filter.
pub fn parse_track_type(raw: Option<&str>) -> Result<Option<String>, Response> {
    match raw {
        None => Ok(None),
        Some("drone") => Ok(Some("drone".to_string())),
        Some("aircraft") => Ok(Some("aircraft".to_string())),
        Some(other) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("track_type must be 'drone' or 'aircraft', got '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kit_filter_parsing() {
        assert_eq!(parse_kit_filter(None), None);
        assert_eq!(parse_kit_filter(Some("")), None);
        assert_eq!(
            parse_kit_filter(Some("a,b, c")),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(parse_kit_filter(Some(",,")), None);
    }

    #[test]
    fn test_limit_bounds() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some(1)).unwrap(), 1);
        assert_eq!(parse_limit(Some(MAX_LIMIT)).unwrap(), MAX_LIMIT);
        assert!(parse_limit(Some(0)).is_err());
        assert!(parse_limit(Some(MAX_LIMIT + 1)).is_err());
        assert!(parse_limit(Some(-5)).is_err());
    }

    #[test]
    fn test_track_type_validation() {
        assert_eq!(parse_track_type(None).unwrap(), None);
        assert_eq!(parse_track_type(Some("drone")).unwrap().as_deref(), Some("drone"));
        assert!(parse_track_type(Some("helicopter")).is_err());
    }
}
