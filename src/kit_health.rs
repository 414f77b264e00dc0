use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A kit system-health sample, keyed by `(time, kit_id)`. Carries the
/// kit's own GPS position, which the location estimator uses as the
/// observer coordinate.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::kit_health)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HealthRecord {
    pub time: DateTime<Utc>,
    pub kit_id: String,
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
}

fn percent_ok(v: Option<f64>) -> bool {
    v.map_or(true, |v| v.is_finite() && (0.0..=100.0).contains(&v))
}

impl HealthRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.kit_id.is_empty() {
            return Err("kit_id must not be empty".into());
        }
        if !percent_ok(self.cpu_percent)
            || !percent_ok(self.memory_percent)
            || !percent_ok(self.disk_percent)
        {
            return Err("percentage outside [0, 100]".into());
        }
        if self.uptime_hours.is_some_and(|u| !u.is_finite() || u < 0.0) {
            return Err("uptime_hours must be >= 0".into());
        }
        if self.lat.is_some_and(|v| !v.is_finite() || !(-90.0..=90.0).contains(&v))
            || self.lon.is_some_and(|v| !v.is_finite() || !(-180.0..=180.0).contains(&v))
        {
            return Err("observer position out of range".into());
        }
        Ok(())
    }

    /// Observer position, with `(0, 0)` treated as "no GPS lock yet".
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat != 0.0 || lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HealthRecord {
        HealthRecord {
            time: Utc::now(),
            kit_id: "kit-1".to_string(),
            lat: Some(40.0),
            lon: Some(-74.0),
            alt: Some(15.0),
            cpu_percent: Some(37.2),
            memory_percent: Some(61.0),
            disk_percent: Some(44.8),
            uptime_hours: Some(102.4),
            temp_cpu: Some(58.0),
            temp_gpu: Some(49.5),
            temp_sdr: Some(41.0),
            gps_speed: Some(0.0),
            gps_track: Some(0.0),
            gps_fix: Some(true),
        }
    }

    #[test]
    fn test_valid_health_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_percent_out_of_range_rejected() {
        let mut rec = sample();
        rec.cpu_percent = Some(104.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_negative_uptime_rejected() {
        let mut rec = sample();
        rec.uptime_hours = Some(-1.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_no_fix_position_is_none() {
        let mut rec = sample();
        rec.lat = Some(0.0);
        rec.lon = Some(0.0);
        assert_eq!(rec.position(), None);
    }
}
