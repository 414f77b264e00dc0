use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A single observation of a drone or aircraft by one kit at one instant.
/// Keyed by `(time, kit_id, drone_id)`; the same airframe seen by N kits
/// produces N rows. Rows are insert-only.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::tracks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TrackRecord {
    pub time: DateTime<Utc>,
    pub kit_id: String,
    pub drone_id: String,
    pub track_type: String,
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
    pub rid_make: Option<String>,
    pub rid_model: Option<String>,
    pub rid_source: Option<String>,
    pub pilot_lat: Option<f64>,
    pub pilot_lon: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub mac: Option<String>,
    pub rssi: Option<f64>,
    pub freq_mhz: Option<f64>,
}

pub const TRACK_TYPE_DRONE: &str = "drone";
pub const TRACK_TYPE_AIRCRAFT: &str = "aircraft";

fn in_range(v: Option<f64>, lo: f64, hi: f64) -> bool {
    v.map_or(true, |v| v.is_finite() && (lo..=hi).contains(&v))
}

fn finite(v: Option<f64>) -> bool {
    v.map_or(true, f64::is_finite)
}

impl TrackRecord {
    /// Schema validation applied before insert; a failing row is rejected
    /// individually and never aborts its batch.
    pub fn validate(&self) -> Result<(), String> {
        if self.kit_id.is_empty() {
            return Err("kit_id must not be empty".into());
        }
        if self.drone_id.is_empty() {
            return Err("drone_id must not be empty".into());
        }
        if self.track_type != TRACK_TYPE_DRONE && self.track_type != TRACK_TYPE_AIRCRAFT {
            return Err(format!("unknown track_type '{}'", self.track_type));
        }
        if !in_range(self.lat, -90.0, 90.0) || !in_range(self.pilot_lat, -90.0, 90.0)
            || !in_range(self.home_lat, -90.0, 90.0)
        {
            return Err("latitude out of range".into());
        }
        if !in_range(self.lon, -180.0, 180.0) || !in_range(self.pilot_lon, -180.0, 180.0)
            || !in_range(self.home_lon, -180.0, 180.0)
        {
            return Err("longitude out of range".into());
        }
        if !finite(self.alt)
            || !finite(self.speed)
            || !finite(self.heading)
            || !finite(self.vspeed)
            || !finite(self.height)
            || !finite(self.direction)
            || !finite(self.rssi)
            || !finite(self.freq_mhz)
        {
            return Err("non-finite numeric field".into());
        }
        Ok(())
    }

    /// Reported position, with `(0, 0)` treated as "not reported".
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }

    /// Reported pilot position, same `(0, 0)` convention.
    pub fn pilot_position(&self) -> Option<(f64, f64)> {
        match (self.pilot_lat, self.pilot_lon) {
            (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample(kit_id: &str, drone_id: &str) -> TrackRecord {
        TrackRecord {
            time: Utc::now(),
            kit_id: kit_id.to_string(),
            drone_id: drone_id.to_string(),
            track_type: TRACK_TYPE_DRONE.to_string(),
            lat: Some(40.7128),
            lon: Some(-74.0060),
            alt: Some(120.0),
            speed: Some(8.5),
            heading: Some(270.0),
            vspeed: Some(0.2),
            height: Some(80.0),
            direction: None,
            operator_id: None,
            caa_id: None,
            rid_make: Some("DJI".to_string()),
            rid_model: Some("Mavic 3".to_string()),
            rid_source: Some("ble".to_string()),
            pilot_lat: None,
            pilot_lon: None,
            home_lat: None,
            home_lon: None,
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            rssi: Some(-72.0),
            freq_mhz: Some(2437.0),
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(sample("kit-1", "drone-1").validate().is_ok());
    }

    #[test]
    fn test_empty_drone_id_rejected() {
        let rec = sample("kit-1", "");
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_latitude_out_of_range_rejected() {
        let mut rec = sample("kit-1", "drone-1");
        rec.lat = Some(91.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_nan_speed_rejected() {
        let mut rec = sample("kit-1", "drone-1");
        rec.speed = Some(f64::NAN);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_unknown_track_type_rejected() {
        let mut rec = sample("kit-1", "drone-1");
        rec.track_type = "balloon".to_string();
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_zero_zero_position_not_reported() {
        let mut rec = sample("kit-1", "drone-1");
        rec.lat = Some(0.0);
        rec.lon = Some(0.0);
        assert_eq!(rec.position(), None);

        rec.lat = Some(0.0);
        rec.lon = Some(12.5);
        assert_eq!(rec.position(), Some((0.0, 12.5)));
    }
}
