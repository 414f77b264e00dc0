use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A detected RF emission, keyed by `(time, kit_id, freq_mhz)`. Primarily
/// FPV video carriers from the analog sweep and DJI OcuSync bursts.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::signals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SignalRecord {
    pub time: DateTime<Utc>,
    pub kit_id: String,
    pub freq_mhz: f64,
    pub power_dbm: Option<f64>,
    pub bandwidth_mhz: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub detection_type: String,
    pub stage: String,
    pub pal_confidence: Option<f64>,
    pub ntsc_confidence: Option<f64>,
}

pub const DETECTION_ANALOG: &str = "analog";
pub const DETECTION_DJI: &str = "dji";
pub const STAGE_GUARD: &str = "guard";
pub const STAGE_CONFIRM: &str = "confirm";

fn confidence_ok(v: Option<f64>) -> bool {
    v.map_or(true, |v| v.is_finite() && (0.0..=1.0).contains(&v))
}

impl SignalRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.kit_id.is_empty() {
            return Err("kit_id must not be empty".into());
        }
        if !self.freq_mhz.is_finite() || self.freq_mhz <= 0.0 {
            return Err(format!("invalid freq_mhz {}", self.freq_mhz));
        }
        if self.detection_type != DETECTION_ANALOG && self.detection_type != DETECTION_DJI {
            return Err(format!("unknown detection_type '{}'", self.detection_type));
        }
        if self.stage != STAGE_GUARD && self.stage != STAGE_CONFIRM {
            return Err(format!("unknown stage '{}'", self.stage));
        }
        if !confidence_ok(self.pal_confidence) || !confidence_ok(self.ntsc_confidence) {
            return Err("confidence outside [0, 1]".into());
        }
        if self.power_dbm.is_some_and(|p| !p.is_finite())
            || self.bandwidth_mhz.is_some_and(|b| !b.is_finite())
        {
            return Err("non-finite numeric field".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SignalRecord {
        SignalRecord {
            time: Utc::now(),
            kit_id: "kit-1".to_string(),
            freq_mhz: 5800.0,
            power_dbm: Some(-48.5),
            bandwidth_mhz: Some(20.0),
            lat: Some(40.0),
            lon: Some(-74.0),
            detection_type: DETECTION_ANALOG.to_string(),
            stage: STAGE_CONFIRM.to_string(),
            pal_confidence: Some(0.82),
            ntsc_confidence: Some(0.11),
        }
    }

    #[test]
    fn test_valid_signal_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let mut rec = sample();
        rec.freq_mhz = 0.0;
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_confidence_above_one_rejected() {
        let mut rec = sample();
        rec.pal_confidence = Some(1.3);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let mut rec = sample();
        rec.stage = "sweep".to_string();
        assert!(rec.validate().is_err());
    }
}
