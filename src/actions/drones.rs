use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::error;

use super::{api_error, parse_kit_filter, parse_limit, parse_time_range, parse_track_type};
use crate::tracks::TrackRecord;
use crate::tracks_repo::{PageCursor, TrackQuery, TracksRepository};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct DroneQueryParams {
    pub time_range: Option<String>,
    pub kit_id: Option<String>,
    pub rid_make: Option<String>,
    pub track_type: Option<String>,
    pub limit: Option<i64>,
    pub deduplicate: Option<bool>,
}

fn build_query(params: &DroneQueryParams) -> Result<TrackQuery, Response> {
    Ok(TrackQuery {
        range: parse_time_range(params.time_range.as_deref(), "24h")?,
        kit_ids: parse_kit_filter(params.kit_id.as_deref()),
        rid_make: params.rid_make.clone().filter(|s| !s.is_empty()),
        track_type: parse_track_type(params.track_type.as_deref())?,
        limit: parse_limit(params.limit)?,
        deduplicate: params.deduplicate.unwrap_or(false),
    })
}

async fn run_query(
    repo: TracksRepository,
    query: TrackQuery,
) -> anyhow::Result<Vec<TrackRecord>> {
    tokio::task::spawn_blocking(move || repo.query(&query)).await?
}

/// `GET /api/drones`: cross-kit track query with optional
/// deduplication to the most recent row per drone.
pub async fn query_drones(
    State(state): State<AppState>,
    Query(params): Query<DroneQueryParams>,
) -> impl IntoResponse {
    let query = match build_query(&params) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    match run_query(state.tracks.clone(), query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("Track query failed: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "track query failed")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrackHistoryParams {
    pub time_range: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TrackPoint {
    pub time: DateTime<Utc>,
    pub kit_id: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct TrackHistory {
    pub drone_id: String,
    pub count: usize,
    pub points: Vec<TrackPoint>,
}

/// `GET /api/drones/{id}/track`: ordered polyline for one drone.
pub async fn drone_track(
    State(state): State<AppState>,
    Path(drone_id): Path<String>,
    Query(params): Query<TrackHistoryParams>,
) -> impl IntoResponse {
    let range = match parse_time_range(params.time_range.as_deref(), "24h") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let limit = match parse_limit(params.limit) {
        Ok(l) => l,
        Err(resp) => return resp,
    };

    let repo = state.tracks.clone();
    let id = drone_id.clone();
    let rows = tokio::task::spawn_blocking(move || repo.history(&id, &range, limit)).await;
    match rows {
        Ok(Ok(rows)) => {
            let points: Vec<TrackPoint> = rows
                .iter()
                .map(|t| TrackPoint {
                    time: t.time,
                    kit_id: t.kit_id.clone(),
                    lat: t.lat,
                    lon: t.lon,
                    alt: t.alt,
                    speed: t.speed,
                    heading: t.heading,
                })
                .collect();
            Json(TrackHistory {
                drone_id,
                count: points.len(),
                points,
            })
            .into_response()
        }
        Ok(Err(e)) => {
            error!("Track history failed: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "track history failed")
        }
        Err(e) => {
            error!("Track history task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "track history failed")
        }
    }
}

/// CSV column order is part of the API contract.
pub const CSV_COLUMNS: [&str; 24] = [
    "time",
    "kit_id",
    "drone_id",
    "track_type",
    "lat",
    "lon",
    "alt",
    "speed",
    "heading",
    "vspeed",
    "height",
    "direction",
    "operator_id",
    "caa_id",
    "rid_make",
    "rid_model",
    "rid_source",
    "pilot_lat",
    "pilot_lon",
    "home_lat",
    "home_lon",
    "mac",
    "rssi",
    "freq_mhz",
];

fn opt_f64(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_str(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("")
}

/// Serialise one chunk of rows through the csv writer.
pub fn csv_chunk(rows: &[TrackRecord], include_header: bool) -> Vec<u8> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if include_header {
        // The header row is emitted even for an empty result set.
        let _ = writer.write_record(CSV_COLUMNS);
    }
    for t in rows {
        let _ = writer.write_record([
            t.time.to_rfc3339().as_str(),
            t.kit_id.as_str(),
            t.drone_id.as_str(),
            t.track_type.as_str(),
            opt_f64(t.lat).as_str(),
            opt_f64(t.lon).as_str(),
            opt_f64(t.alt).as_str(),
            opt_f64(t.speed).as_str(),
            opt_f64(t.heading).as_str(),
            opt_f64(t.vspeed).as_str(),
            opt_f64(t.height).as_str(),
            opt_f64(t.direction).as_str(),
            opt_str(&t.operator_id),
            opt_str(&t.caa_id),
            opt_str(&t.rid_make),
            opt_str(&t.rid_model),
            opt_str(&t.rid_source),
            opt_f64(t.pilot_lat).as_str(),
            opt_f64(t.pilot_lon).as_str(),
            opt_f64(t.home_lat).as_str(),
            opt_f64(t.home_lon).as_str(),
            opt_str(&t.mac),
            opt_f64(t.rssi).as_str(),
            opt_f64(t.freq_mhz).as_str(),
        ]);
    }
    writer.into_inner().unwrap_or_default()
}

/// Rows fetched (and encoded) per keyset page during export.
const CSV_PAGE_ROWS: i64 = 500;

/// `GET /api/export/csv`: track query streamed as CSV. Rows are pulled
/// from the store one keyset page at a time and encoded as they arrive,
/// so at most one page is resident; zero matching rows still produce the
/// header line.
pub async fn export_csv(
    State(state): State<AppState>,
    Query(params): Query<DroneQueryParams>,
) -> impl IntoResponse {
    let query = match build_query(&params) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let repo = state.tracks.clone();

    // The bounded channel is the backpressure: the pager blocks on send
    // until the client has consumed earlier chunks.
    let (tx, rx) = flume::bounded::<Bytes>(4);
    tokio::task::spawn_blocking(move || {
        if tx.send(Bytes::from(csv_chunk(&[], true))).is_err() {
            return;
        }
        let mut cursor: Option<PageCursor> = None;
        let mut remaining = query.limit;
        while remaining > 0 {
            let page_size = remaining.min(CSV_PAGE_ROWS);
            let rows = match repo.query_page(&query, cursor.as_ref(), page_size) {
                Ok(rows) => rows,
                // The 200 and header are already on the wire; all that is
                // left is to stop and leave the response truncated.
                Err(e) => {
                    error!("CSV export page failed: {e:#}");
                    break;
                }
            };
            if rows.is_empty() {
                break;
            }
            remaining -= rows.len() as i64;
            let exhausted = (rows.len() as i64) < page_size;
            cursor = PageCursor::from_last(&rows);
            if tx.send(Bytes::from(csv_chunk(&rows, false))).is_err() {
                // Client hung up.
                return;
            }
            if exhausted {
                break;
            }
        }
    });

    let stream = rx.into_stream().map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
        .header(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"tracks.csv\"",
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "csv export failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::TRACK_TYPE_DRONE;
    use chrono::TimeZone;

    fn sample() -> TrackRecord {
        TrackRecord {
            time: Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap(),
            kit_id: "kit-1".into(),
            drone_id: "drone-1".into(),
            track_type: TRACK_TYPE_DRONE.into(),
            lat: Some(40.7128),
            lon: Some(-74.006),
            alt: Some(120.0),
            speed: None,
            heading: None,
            vspeed: None,
            height: None,
            direction: None,
            operator_id: Some("OP-1".into()),
            caa_id: None,
            rid_make: Some("DJI".into()),
            rid_model: None,
            rid_source: None,
            pilot_lat: None,
            pilot_lon: None,
            home_lat: None,
            home_lon: None,
            mac: None,
            rssi: Some(-70.0),
            freq_mhz: Some(2437.0),
        }
    }

    #[test]
    fn test_csv_empty_result_is_header_only() {
        let bytes = csv_chunk(&[], true);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("time,kit_id,drone_id,track_type"));
    }

    #[test]
    fn test_csv_row_matches_column_order() {
        let bytes = csv_chunk(&[sample()], true);
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(header, CSV_COLUMNS.to_vec());

        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), CSV_COLUMNS.len());
        assert_eq!(row[1], "kit-1");
        assert_eq!(row[2], "drone-1");
        assert_eq!(row[4], "40.7128");
        // Absent optionals serialise as empty cells.
        assert_eq!(row[7], "");
    }

    #[test]
    fn test_csv_round_trips_through_reader() {
        let original = sample();
        let bytes = csv_chunk(&[original.clone()], true);
        let mut reader = csv::ReaderBuilder::new().from_reader(bytes.as_slice());
        let row = reader.records().next().unwrap().unwrap();

        assert_eq!(&row[0], &original.time.to_rfc3339());
        assert_eq!(&row[1], original.kit_id.as_str());
        assert_eq!(row[4].parse::<f64>().unwrap(), original.lat.unwrap());
        assert_eq!(&row[14], "DJI");
        assert_eq!(row[22].parse::<f64>().unwrap(), original.rssi.unwrap());
    }

    #[test]
    fn test_page_cursor_tracks_last_row() {
        let mut rows = vec![sample(), sample()];
        rows[1].time = rows[1].time + chrono::Duration::seconds(30);
        rows[1].kit_id = "kit-2".into();
        rows[1].drone_id = "drone-9".into();

        let cursor = PageCursor::from_last(&rows).unwrap();
        assert_eq!(cursor.kit_id, "kit-2");
        assert_eq!(cursor.drone_id, "drone-9");
        assert_eq!(cursor.time, rows[1].time);

        assert!(PageCursor::from_last(&[]).is_none());
    }

    #[test]
    fn test_csv_header_only_on_first_chunk() {
        let rows = vec![sample(), sample()];
        let first = String::from_utf8(csv_chunk(&rows[..1], true)).unwrap();
        let second = String::from_utf8(csv_chunk(&rows[1..], false)).unwrap();
        assert_eq!(first.lines().count(), 2);
        assert_eq!(second.lines().count(), 1);
        assert!(!second.starts_with("time,"));
    }
}
