use chrono::{DateTime, Duration, Utc};

/// A resolved query window. Parsed from the `time_range` parameter
/// accepted by every read endpoint: `Nh`, `Nd`, or `custom:ISO,ISO`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Parse a `time_range` token relative to `now`. Returns a field-level
    /// message on malformed input so handlers can answer 400 precisely.
    pub fn parse(token: &str, now: DateTime<Utc>) -> Result<Self, String> {
        if let Some(bounds) = token.strip_prefix("custom:") {
            let (start_str, end_str) = bounds
                .split_once(',')
                .ok_or_else(|| "custom range must be 'custom:ISO,ISO'".to_string())?;
            let start = DateTime::parse_from_rfc3339(start_str.trim())
                .map_err(|e| format!("invalid start timestamp: {e}"))?
                .with_timezone(&Utc);
            let end = DateTime::parse_from_rfc3339(end_str.trim())
                .map_err(|e| format!("invalid end timestamp: {e}"))?
                .with_timezone(&Utc);
            if start >= end {
                return Err("start must be before end".to_string());
            }
            return Ok(Self { start, end });
        }

        let (digits, unit) = token.split_at(token.len().saturating_sub(1));
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("invalid time_range '{token}'"))?;
        if n <= 0 {
            return Err(format!("time_range '{token}' must be positive"));
        }
        let span = match unit {
            "h" => Duration::hours(n),
            "d" => Duration::days(n),
            _ => return Err(format!("invalid time_range '{token}', expected Nh, Nd or custom:ISO,ISO")),
        };
        Ok(Self {
            start: now - span,
            end: now,
        })
    }
}
