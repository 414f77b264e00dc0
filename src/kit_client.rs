use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::kit_health::HealthRecord;
use crate::signals::SignalRecord;
use crate::tracks::{TRACK_TYPE_DRONE, TrackRecord};

/// Retry schedule inside a single poll tick. Only retriable failures
/// (timeouts, connect errors, 5xx) consume these; a 4xx fails the tick
/// immediately.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// A failed endpoint fetch, classified for the retry policy.
#[derive(Debug)]
pub struct FetchError {
    pub message: String,
    pub retriable: bool,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        let retriable = e.is_timeout() || e.is_connect();
        Self {
            message: format!("{e}"),
            retriable,
        }
    }

    fn from_status(status: StatusCode) -> Self {
        Self {
            message: format!("kit answered {status}"),
            retriable: status.is_server_error(),
        }
    }
}

/// Wire shape of `GET {api_url}/api/drones`. The kit HTTP schema uses the
/// internal field names directly (the bus is where the broadcast aliases
/// live).
#[derive(Debug, Deserialize)]
pub struct KitApiDrone {
    pub id: String,
    #[serde(default)]
    pub track_type: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub vspeed: Option<f64>,
    pub height: Option<f64>,
    pub direction: Option<f64>,
    pub operator_id: Option<String>,
    pub caa_id: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub pilot_lat: Option<f64>,
    pub pilot_lon: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub mac: Option<String>,
    pub rssi: Option<f64>,
    pub freq: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Wire shape of `GET {api_url}/api/signals`.
#[derive(Debug, Deserialize)]
pub struct KitApiSignal {
    pub freq_mhz: f64,
    pub power_dbm: Option<f64>,
    pub bandwidth_mhz: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default)]
    pub detection_type: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    pub pal_confidence: Option<f64>,
    pub ntsc_confidence: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Wire shape of `GET {api_url}/api/status`.
#[derive(Debug, Deserialize)]
pub struct KitApiStatus {
    pub kit_id: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub uptime_hours: Option<f64>,
    pub temp_cpu: Option<f64>,
    pub temp_gpu: Option<f64>,
    pub temp_sdr: Option<f64>,
    pub gps_speed: Option<f64>,
    pub gps_track: Option<f64>,
    pub gps_fix: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Result of an admin connection test.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeResult {
    pub reachable: bool,
    pub kit_id: Option<String>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// HTTP client for kit telemetry APIs. One instance is shared by every
/// polling loop; reqwest pools connections per kit underneath.
#[derive(Clone)]
pub struct KitClient {
    http: reqwest::Client,
}

impl KitClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("dragnet/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http })
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, FetchError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        if !resp.status().is_success() {
            return Err(FetchError::from_status(resp.status()));
        }
        resp.json::<T>().await.map_err(|e| FetchError {
            message: format!("decoding response from {url}: {e}"),
            retriable: false,
        })
    }

    /// One endpoint fetch with the in-tick retry schedule.
    async fn fetch_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        max_retries: u32,
    ) -> Result<T, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_json::<T>(url).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retriable && attempt < max_retries => {
                    let delay = RETRY_DELAYS[(attempt as usize).min(RETRY_DELAYS.len() - 1)];
                    debug!("Retrying {url} in {delay:?} after: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn fetch_drones(
        &self,
        api_url: &str,
        kit_id: &str,
        max_retries: u32,
    ) -> Result<Vec<TrackRecord>, FetchError> {
        let payload: Vec<KitApiDrone> = self
            .fetch_with_retry(&format!("{}/api/drones", api_url.trim_end_matches('/')), max_retries)
            .await?;
        let now = Utc::now();
        Ok(payload
            .into_iter()
            .map(|d| normalize_drone(d, kit_id, now))
            .collect())
    }

    pub async fn fetch_signals(
        &self,
        api_url: &str,
        kit_id: &str,
        max_retries: u32,
    ) -> Result<Vec<SignalRecord>, FetchError> {
        let payload: Vec<KitApiSignal> = self
            .fetch_with_retry(&format!("{}/api/signals", api_url.trim_end_matches('/')), max_retries)
            .await?;
        let now = Utc::now();
        Ok(payload
            .into_iter()
            .map(|s| normalize_signal(s, kit_id, now))
            .collect())
    }

    pub async fn fetch_status(
        &self,
        api_url: &str,
        kit_id: &str,
        max_retries: u32,
    ) -> Result<HealthRecord, FetchError> {
        let payload: KitApiStatus = self
            .fetch_with_retry(&format!("{}/api/status", api_url.trim_end_matches('/')), max_retries)
            .await?;
        Ok(normalize_status(payload, kit_id, Utc::now()))
    }

    /// Single bounded probe for the admin connection test. Never retries;
    /// the caller wants the first answer, good or bad.
    pub async fn probe(&self, api_url: &str) -> ProbeResult {
        let url = format!("{}/api/status", api_url.trim_end_matches('/'));
        let started = Instant::now();
        match self.fetch_json::<KitApiStatus>(&url).await {
            Ok(status) => ProbeResult {
                reachable: true,
                kit_id: status.kit_id,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => ProbeResult {
                reachable: false,
                kit_id: None,
                latency_ms: None,
                error: Some(e.message),
            },
        }
    }
}

pub fn normalize_drone(d: KitApiDrone, kit_id: &str, fallback_time: DateTime<Utc>) -> TrackRecord {
    TrackRecord {
        time: d.timestamp.unwrap_or(fallback_time),
        kit_id: kit_id.to_string(),
        drone_id: d.id,
        track_type: d
            .track_type
            .unwrap_or_else(|| TRACK_TYPE_DRONE.to_string()),
        lat: d.lat,
        lon: d.lon,
        alt: d.alt,
        speed: d.speed,
        heading: d.heading,
        vspeed: d.vspeed,
        height: d.height,
        direction: d.direction,
        operator_id: d.operator_id,
        caa_id: d.caa_id,
        rid_make: d.make,
        rid_model: d.model,
        rid_source: d.source,
        pilot_lat: d.pilot_lat,
        pilot_lon: d.pilot_lon,
        home_lat: d.home_lat,
        home_lon: d.home_lon,
        mac: d.mac,
        rssi: d.rssi,
        freq_mhz: d.freq,
    }
}

pub fn normalize_signal(
    s: KitApiSignal,
    kit_id: &str,
    fallback_time: DateTime<Utc>,
) -> SignalRecord {
    SignalRecord {
        time: s.timestamp.unwrap_or(fallback_time),
        kit_id: kit_id.to_string(),
        freq_mhz: s.freq_mhz,
        power_dbm: s.power_dbm,
        bandwidth_mhz: s.bandwidth_mhz,
        lat: s.lat,
        lon: s.lon,
        detection_type: s
            .detection_type
            .unwrap_or_else(|| crate::signals::DETECTION_ANALOG.to_string()),
        stage: s
            .stage
            .unwrap_or_else(|| crate::signals::STAGE_GUARD.to_string()),
        pal_confidence: s.pal_confidence,
        ntsc_confidence: s.ntsc_confidence,
    }
}

pub fn normalize_status(
    s: KitApiStatus,
    kit_id: &str,
    fallback_time: DateTime<Utc>,
) -> HealthRecord {
    HealthRecord {
        time: s.timestamp.unwrap_or(fallback_time),
        kit_id: kit_id.to_string(),
        lat: s.lat,
        lon: s.lon,
        alt: s.alt,
        cpu_percent: s.cpu_percent,
        memory_percent: s.memory_percent,
        disk_percent: s.disk_percent,
        uptime_hours: s.uptime_hours,
        temp_cpu: s.temp_cpu,
        temp_gpu: s.temp_gpu,
        temp_sdr: s.temp_sdr,
        gps_speed: s.gps_speed,
        gps_track: s.gps_track,
        gps_fix: s.gps_fix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drone_from_kit_payload() {
        let json = r#"{
            "id": "drone-abc",
            "lat": 40.71, "lon": -74.01, "alt": 120.5,
            "speed": 12.0, "heading": 185.0,
            "make": "DJI", "model": "Mini 4 Pro", "source": "ble",
            "mac": "aa:bb:cc:dd:ee:ff", "rssi": -71.0, "freq": 2437.0,
            "timestamp": "2025-06-15T12:00:00Z"
        }"#;
        let payload: KitApiDrone = serde_json::from_str(json).unwrap();
        let rec = normalize_drone(payload, "wardragon-001", Utc::now());

        assert_eq!(rec.kit_id, "wardragon-001");
        assert_eq!(rec.drone_id, "drone-abc");
        assert_eq!(rec.track_type, TRACK_TYPE_DRONE);
        assert_eq!(rec.rid_make.as_deref(), Some("DJI"));
        assert_eq!(rec.rssi, Some(-71.0));
        assert_eq!(rec.freq_mhz, Some(2437.0));
        assert_eq!(rec.time.to_rfc3339(), "2025-06-15T12:00:00+00:00");
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_normalize_drone_missing_timestamp_uses_poll_time() {
        let json = r#"{"id": "drone-1", "lat": 1.0, "lon": 2.0}"#;
        let payload: KitApiDrone = serde_json::from_str(json).unwrap();
        let fallback = Utc::now();
        let rec = normalize_drone(payload, "kit", fallback);
        assert_eq!(rec.time, fallback);
    }

    #[test]
    fn test_normalize_signal_defaults() {
        let json = r#"{"freq_mhz": 5800.0, "power_dbm": -50.0}"#;
        let payload: KitApiSignal = serde_json::from_str(json).unwrap();
        let rec = normalize_signal(payload, "kit", Utc::now());
        assert_eq!(rec.detection_type, "analog");
        assert_eq!(rec.stage, "guard");
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(FetchError::from_status(StatusCode::INTERNAL_SERVER_ERROR).retriable);
        assert!(FetchError::from_status(StatusCode::BAD_GATEWAY).retriable);
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND).retriable);
        assert!(!FetchError::from_status(StatusCode::UNPROCESSABLE_ENTITY).retriable);
    }
}
