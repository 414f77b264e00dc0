//! Pattern detection over windowed track fetches. Every function here is
//! pure: the HTTP layer fetches a window through the repository and feeds
//! it in, which keeps the detection logic testable without a store.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::geo::haversine_m;
use crate::tracks::{TRACK_TYPE_DRONE, TrackRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationScore {
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Repeated contacts

#[derive(Debug, Clone, Serialize)]
pub struct RepeatedContact {
    pub drone_id: String,
    pub appearance_count: usize,
    pub kit_count: usize,
    pub rid_make: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Drones appearing at least `min_appearances` times in the window,
/// ordered by appearance count, then recency.
pub fn repeated_contacts(tracks: &[TrackRecord], min_appearances: usize) -> Vec<RepeatedContact> {
    let mut by_drone: BTreeMap<&str, RepeatedContact> = BTreeMap::new();
    let mut kits: HashMap<&str, BTreeSet<&str>> = HashMap::new();

    for t in tracks {
        kits.entry(&t.drone_id).or_default().insert(&t.kit_id);
        by_drone
            .entry(&t.drone_id)
            .and_modify(|c| {
                c.appearance_count += 1;
                c.first_seen = c.first_seen.min(t.time);
                c.last_seen = c.last_seen.max(t.time);
                if c.rid_make.is_none() {
                    c.rid_make = t.rid_make.clone();
                }
            })
            .or_insert_with(|| RepeatedContact {
                drone_id: t.drone_id.clone(),
                appearance_count: 1,
                kit_count: 0,
                rid_make: t.rid_make.clone(),
                first_seen: t.time,
                last_seen: t.time,
            });
    }

    let mut contacts: Vec<RepeatedContact> = by_drone
        .into_values()
        .filter(|c| c.appearance_count >= min_appearances)
        .map(|mut c| {
            c.kit_count = kits.get(c.drone_id.as_str()).map_or(0, BTreeSet::len);
            c
        })
        .collect();
    contacts.sort_by(|a, b| {
        b.appearance_count
            .cmp(&a.appearance_count)
            .then(b.last_seen.cmp(&a.last_seen))
    });
    contacts
}

// ---------------------------------------------------------------------------
// Coordinated activity

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatedGroup {
    pub drone_ids: Vec<String>,
    pub drone_count: usize,
    pub pair_count: usize,
    pub correlation_score: CorrelationScore,
    pub max_distance_m: f64,
}

/// Single-link pair clustering on each drone's most recent position.
/// Deliberately not transitive-closure cliques: a group is an anchor plus
/// its direct neighbours, deduplicated by member set. Callers that need
/// true cliques must post-filter.
pub fn coordinated_activity(
    tracks: &[TrackRecord],
    distance_threshold_m: f64,
    time_window_mins: i64,
) -> Vec<CoordinatedGroup> {
    // Most recent positioned observation per drone.
    let mut latest: BTreeMap<&str, &TrackRecord> = BTreeMap::new();
    for t in tracks {
        if t.position().is_none() {
            continue;
        }
        latest
            .entry(&t.drone_id)
            .and_modify(|cur| {
                if t.time > cur.time {
                    *cur = t;
                }
            })
            .or_insert(t);
    }
    let drones: Vec<&TrackRecord> = latest.into_values().collect();

    // Candidate pairs (i < j): close in space and in time.
    let mut neighbours: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    let mut pairs: Vec<(&str, &str, f64)> = Vec::new();
    for (i, a) in drones.iter().enumerate() {
        for b in drones.iter().skip(i + 1) {
            let (Some((la, lo)), Some((lb, lob))) = (a.position(), b.position()) else {
                continue;
            };
            let dt = (a.time - b.time).num_minutes().abs();
            if dt > time_window_mins {
                continue;
            }
            let d = haversine_m(la, lo, lb, lob);
            if d <= distance_threshold_m {
                pairs.push((&a.drone_id, &b.drone_id, d));
                neighbours.entry(&a.drone_id).or_default().insert(&b.drone_id);
                neighbours.entry(&b.drone_id).or_default().insert(&a.drone_id);
            }
        }
    }

    // One group per anchor with >= 1 neighbour, deduplicated on members.
    let mut seen_members: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut groups = Vec::new();
    for (anchor, others) in &neighbours {
        if others.is_empty() {
            continue;
        }
        let mut members: Vec<String> = others.iter().map(|s| s.to_string()).collect();
        members.push(anchor.to_string());
        members.sort();
        if !seen_members.insert(members.clone()) {
            continue;
        }

        let member_set: BTreeSet<&str> = members.iter().map(String::as_str).collect();
        let group_pairs: Vec<&(&str, &str, f64)> = pairs
            .iter()
            .filter(|(a, b, _)| member_set.contains(a) && member_set.contains(b))
            .collect();
        let pair_count = group_pairs.len();
        let max_distance_m = group_pairs
            .iter()
            .map(|(_, _, d)| *d)
            .fold(0.0_f64, f64::max);

        let correlation_score = if pair_count >= 4 {
            CorrelationScore::High
        } else if pair_count >= 2 {
            CorrelationScore::Medium
        } else {
            CorrelationScore::Low
        };

        groups.push(CoordinatedGroup {
            drone_count: members.len(),
            drone_ids: members,
            pair_count,
            correlation_score,
            max_distance_m,
        });
    }
    groups.sort_by(|a, b| b.drone_count.cmp(&a.drone_count));
    groups
}

// ---------------------------------------------------------------------------
// Pilot reuse

#[derive(Debug, Clone, Serialize)]
pub struct PilotReuse {
    pub method: String,
    pub operator_id: Option<String>,
    pub drone_ids: Vec<String>,
    pub drone_count: usize,
}

/// Multiple distinct drones attributed to one operator, by exact Remote-ID
/// operator match and by spatial clustering of reported pilot positions;
/// the two methods are unioned.
pub fn pilot_reuse(tracks: &[TrackRecord], pilot_distance_m: f64) -> Vec<PilotReuse> {
    let mut results = Vec::new();

    // Method 1: exact operator_id match.
    let mut by_operator: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for t in tracks {
        if let Some(op) = t.operator_id.as_deref() {
            if !op.is_empty() {
                by_operator.entry(op).or_default().insert(&t.drone_id);
            }
        }
    }
    for (op, drones) in by_operator {
        if drones.len() >= 2 {
            results.push(PilotReuse {
                method: "operator_id".to_string(),
                operator_id: Some(op.to_string()),
                drone_count: drones.len(),
                drone_ids: drones.into_iter().map(String::from).collect(),
            });
        }
    }

    // Method 2: single-link clustering of pilot positions.
    let mut pilot_obs: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for t in tracks {
        if let Some(pos) = t.pilot_position() {
            // Latest pilot position per drone wins; the window is short
            // enough that pilots rarely relocate far inside it.
            pilot_obs.insert(&t.drone_id, pos);
        }
    }
    let entries: Vec<(&str, (f64, f64))> = pilot_obs.into_iter().collect();
    let mut cluster_of: Vec<usize> = (0..entries.len()).collect();
    fn find(cluster_of: &mut Vec<usize>, i: usize) -> usize {
        let mut root = i;
        while cluster_of[root] != root {
            root = cluster_of[root];
        }
        cluster_of[i] = root;
        root
    }
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let (a, b) = (entries[i].1, entries[j].1);
            if haversine_m(a.0, a.1, b.0, b.1) <= pilot_distance_m {
                let (ra, rb) = (find(&mut cluster_of, i), find(&mut cluster_of, j));
                cluster_of[ra] = rb;
            }
        }
    }
    let mut clusters: BTreeMap<usize, BTreeSet<&str>> = BTreeMap::new();
    for i in 0..entries.len() {
        let root = find(&mut cluster_of, i);
        clusters.entry(root).or_default().insert(entries[i].0);
    }
    for drones in clusters.into_values() {
        if drones.len() >= 2 {
            results.push(PilotReuse {
                method: "pilot_location".to_string(),
                operator_id: None,
                drone_count: drones.len(),
                drone_ids: drones.into_iter().map(String::from).collect(),
            });
        }
    }

    results.sort_by(|a, b| b.drone_count.cmp(&a.drone_count));
    results
}

// ---------------------------------------------------------------------------
// Anomalies

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub drone_id: String,
    pub kit_id: String,
    pub time: DateTime<Utc>,
    pub anomaly_type: String,
    pub severity: Severity,
    pub value: f64,
}

fn speed_severity(speed: f64) -> Option<Severity> {
    if speed > 50.0 {
        Some(Severity::Critical)
    } else if speed > 40.0 {
        Some(Severity::High)
    } else if speed > 30.0 {
        Some(Severity::Medium)
    } else {
        None
    }
}

fn altitude_severity(alt: f64) -> Option<Severity> {
    if alt > 500.0 {
        Some(Severity::Critical)
    } else if alt > 450.0 {
        Some(Severity::High)
    } else if alt > 400.0 {
        Some(Severity::Medium)
    } else {
        None
    }
}

fn climb_rate_severity(rate: f64) -> Option<Severity> {
    if rate > 10.0 {
        Some(Severity::Critical)
    } else if rate > 7.5 {
        Some(Severity::High)
    } else if rate > 5.0 {
        Some(Severity::Medium)
    } else {
        None
    }
}

/// Per-row speed/altitude flags plus rapid altitude change computed from
/// consecutive samples of the same drone at least 10 s apart.
pub fn anomalies(tracks: &[TrackRecord]) -> Vec<Anomaly> {
    let mut found = Vec::new();

    for t in tracks {
        if let Some(sev) = t.speed.and_then(speed_severity) {
            found.push(Anomaly {
                drone_id: t.drone_id.clone(),
                kit_id: t.kit_id.clone(),
                time: t.time,
                anomaly_type: "speed".to_string(),
                severity: sev,
                value: t.speed.unwrap_or_default(),
            });
        }
        if t.track_type == TRACK_TYPE_DRONE {
            if let Some(sev) = t.alt.and_then(altitude_severity) {
                found.push(Anomaly {
                    drone_id: t.drone_id.clone(),
                    kit_id: t.kit_id.clone(),
                    time: t.time,
                    anomaly_type: "altitude".to_string(),
                    severity: sev,
                    value: t.alt.unwrap_or_default(),
                });
            }
        }
    }

    for (drone_id, samples) in per_drone_sorted(tracks) {
        for pair in samples.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let dt = (cur.time - prev.time).num_seconds();
            if dt < 10 {
                continue;
            }
            let (Some(a0), Some(a1)) = (prev.alt, cur.alt) else {
                continue;
            };
            let rate = (a1 - a0).abs() / dt as f64;
            if let Some(sev) = climb_rate_severity(rate) {
                found.push(Anomaly {
                    drone_id: drone_id.to_string(),
                    kit_id: cur.kit_id.clone(),
                    time: cur.time,
                    anomaly_type: "rapid_altitude_change".to_string(),
                    severity: sev,
                    value: rate,
                });
            }
        }
    }

    found.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.time.cmp(&a.time)));
    found
}

// ---------------------------------------------------------------------------
// Multi-kit correlation

#[derive(Debug, Clone, Serialize)]
pub struct KitObservation {
    pub kit_id: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub rssi: Option<f64>,
    pub freq_mhz: Option<f64>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiKitContact {
    pub drone_id: String,
    pub slot: DateTime<Utc>,
    pub kit_count: usize,
    pub triangulation_possible: bool,
    pub observations: Vec<KitObservation>,
}

/// Drones seen by two or more kits inside the same one-minute slot.
/// Observations come back strongest-signal-first; three or more distinct
/// kits makes the contact a trilateration candidate.
pub fn multi_kit_contacts(tracks: &[TrackRecord]) -> Vec<MultiKitContact> {
    let mut slots: BTreeMap<(i64, &str), Vec<&TrackRecord>> = BTreeMap::new();
    for t in tracks {
        let slot = t.time.timestamp() - t.time.timestamp().rem_euclid(60);
        slots.entry((slot, &t.drone_id)).or_default().push(t);
    }

    let mut contacts = Vec::new();
    for ((slot, drone_id), obs) in slots {
        let kit_count = obs
            .iter()
            .map(|t| t.kit_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        if kit_count < 2 {
            continue;
        }

        let mut observations: Vec<KitObservation> = obs
            .iter()
            .map(|t| KitObservation {
                kit_id: t.kit_id.clone(),
                lat: t.lat,
                lon: t.lon,
                rssi: t.rssi,
                freq_mhz: t.freq_mhz,
                time: t.time,
            })
            .collect();
        // Strongest first; missing RSSI sorts last.
        observations.sort_by(|a, b| {
            b.rssi
                .unwrap_or(f64::NEG_INFINITY)
                .partial_cmp(&a.rssi.unwrap_or(f64::NEG_INFINITY))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        contacts.push(MultiKitContact {
            drone_id: drone_id.to_string(),
            slot: DateTime::from_timestamp(slot, 0).unwrap_or_default(),
            kit_count,
            triangulation_possible: kit_count >= 3,
            observations,
        });
    }
    contacts.sort_by(|a, b| b.kit_count.cmp(&a.kit_count).then(b.slot.cmp(&a.slot)));
    contacts
}

// ---------------------------------------------------------------------------
// Security patterns

#[derive(Debug, Clone, Serialize)]
pub struct LoiteringEvent {
    pub drone_id: String,
    pub duration_mins: f64,
    pub observation_count: usize,
    pub threat_level: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

fn loiter_threat(duration_mins: f64) -> Severity {
    if duration_mins > 30.0 {
        Severity::Critical
    } else if duration_mins > 15.0 {
        Severity::High
    } else if duration_mins > 10.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Drones whose longest contiguous run of observations stays within
/// `radius_m` of the centre for at least `min_duration_mins`.
pub fn loitering(
    tracks: &[TrackRecord],
    center_lat: f64,
    center_lon: f64,
    radius_m: f64,
    min_duration_mins: f64,
) -> Vec<LoiteringEvent> {
    let mut events = Vec::new();

    for (drone_id, samples) in per_drone_sorted(tracks) {
        let mut best: Option<(DateTime<Utc>, DateTime<Utc>, usize)> = None;
        let mut run: Option<(DateTime<Utc>, DateTime<Utc>, usize)> = None;

        for t in &samples {
            let inside = t
                .position()
                .is_some_and(|(lat, lon)| haversine_m(lat, lon, center_lat, center_lon) <= radius_m);
            if inside {
                run = Some(match run {
                    Some((start, _, n)) => (start, t.time, n + 1),
                    None => (t.time, t.time, 1),
                });
                let current = run.unwrap_or((t.time, t.time, 1));
                let longer = best.is_none_or(|(s, e, _)| current.1 - current.0 > e - s);
                if longer {
                    best = Some(current);
                }
            } else {
                run = None;
            }
        }

        if let Some((start, end, count)) = best {
            let duration_mins = (end - start).num_seconds() as f64 / 60.0;
            if duration_mins >= min_duration_mins {
                events.push(LoiteringEvent {
                    drone_id: drone_id.to_string(),
                    duration_mins,
                    observation_count: count,
                    threat_level: loiter_threat(duration_mins),
                    first_seen: start,
                    last_seen: end,
                });
            }
        }
    }
    events.sort_by(|a, b| {
        b.duration_mins
            .partial_cmp(&a.duration_mins)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    events
}

#[derive(Debug, Clone, Serialize)]
pub struct RapidDescentEvent {
    pub drone_id: String,
    pub kit_id: String,
    pub time: DateTime<Utc>,
    pub descent_m: f64,
    pub descent_rate_mps: f64,
    pub possible_payload_drop: bool,
}

/// Consecutive-sample descents of at least `min_descent_m` at
/// `min_descent_rate_mps` or faster. A fast drop with little horizontal
/// motion is additionally flagged as a possible payload drop.
pub fn rapid_descent(
    tracks: &[TrackRecord],
    min_descent_m: f64,
    min_descent_rate_mps: f64,
) -> Vec<RapidDescentEvent> {
    let mut events = Vec::new();
    for (drone_id, samples) in per_drone_sorted(tracks) {
        for pair in samples.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let dt = (cur.time - prev.time).num_seconds();
            if dt <= 0 {
                continue;
            }
            let (Some(a0), Some(a1)) = (prev.alt, cur.alt) else {
                continue;
            };
            let descent = a0 - a1;
            if descent < min_descent_m {
                continue;
            }
            let rate = descent / dt as f64;
            if rate < min_descent_rate_mps {
                continue;
            }
            let horizontal_speed = cur.speed.or(prev.speed);
            events.push(RapidDescentEvent {
                drone_id: drone_id.to_string(),
                kit_id: cur.kit_id.clone(),
                time: cur.time,
                descent_m: descent,
                descent_rate_mps: rate,
                possible_payload_drop: rate > 8.0
                    && horizontal_speed.is_some_and(|s| s < 5.0),
            });
        }
    }
    events.sort_by(|a, b| {
        b.descent_rate_mps
            .partial_cmp(&a.descent_rate_mps)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    events
}

#[derive(Debug, Clone, Serialize)]
pub struct NightActivity {
    pub drone_id: String,
    pub detection_count: usize,
    pub risk_level: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// True when `hour` falls inside a night window that may wrap midnight.
pub fn is_night_hour(hour: u32, night_start: u32, night_end: u32) -> bool {
    if night_start > night_end {
        hour >= night_start || hour <= night_end
    } else {
        (night_start..=night_end).contains(&hour)
    }
}

fn night_risk(count: usize) -> Severity {
    if count > 10 {
        Severity::Critical
    } else if count > 5 {
        Severity::High
    } else if count > 2 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Drone observations whose local hour lies in the night window,
/// aggregated per drone. `tz_offset_hours` shifts message timestamps into
/// kit-local time.
pub fn night_activity(
    tracks: &[TrackRecord],
    night_start: u32,
    night_end: u32,
    tz_offset_hours: i32,
) -> Vec<NightActivity> {
    let mut by_drone: BTreeMap<&str, NightActivity> = BTreeMap::new();
    for t in tracks {
        if t.track_type != TRACK_TYPE_DRONE {
            continue;
        }
        let local = t.time + chrono::Duration::hours(tz_offset_hours as i64);
        if !is_night_hour(local.hour(), night_start, night_end) {
            continue;
        }
        by_drone
            .entry(&t.drone_id)
            .and_modify(|n| {
                n.detection_count += 1;
                n.first_seen = n.first_seen.min(t.time);
                n.last_seen = n.last_seen.max(t.time);
            })
            .or_insert_with(|| NightActivity {
                drone_id: t.drone_id.clone(),
                detection_count: 1,
                risk_level: Severity::Low,
                first_seen: t.time,
                last_seen: t.time,
            });
    }
    let mut results: Vec<NightActivity> = by_drone
        .into_values()
        .map(|mut n| {
            n.risk_level = night_risk(n.detection_count);
            n
        })
        .collect();
    results.sort_by(|a, b| b.detection_count.cmp(&a.detection_count));
    results
}

// ---------------------------------------------------------------------------
// Consolidated security alerts

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub drone_id: String,
    pub kit_id: String,
    pub time: DateTime<Utc>,
    pub score: u32,
    pub level: Severity,
    pub factors: Vec<String>,
}

/// Weighted per-observation scoring over the last window: rapid descent
/// +3, night flight +2, low-and-slow +2, high speed +1. Levels: >=5
/// critical, >=3 high, >=1 medium.
pub fn security_alerts(
    tracks: &[TrackRecord],
    night_start: u32,
    night_end: u32,
    tz_offset_hours: i32,
) -> Vec<SecurityAlert> {
    // Mark the later sample of every qualifying rapid-descent pair.
    let descent_events = rapid_descent(tracks, 20.0, 5.0);
    let descent_keys: BTreeSet<(&str, DateTime<Utc>)> = descent_events
        .iter()
        .map(|e| (e.drone_id.as_str(), e.time))
        .collect();

    let mut alerts = Vec::new();
    for t in tracks {
        if t.track_type != TRACK_TYPE_DRONE {
            continue;
        }
        let mut score = 0u32;
        let mut factors = Vec::new();

        if descent_keys.contains(&(t.drone_id.as_str(), t.time)) {
            score += 3;
            factors.push("rapid_descent".to_string());
        }
        let local = t.time + chrono::Duration::hours(tz_offset_hours as i64);
        if is_night_hour(local.hour(), night_start, night_end) {
            score += 2;
            factors.push("night_flight".to_string());
        }
        if t.alt.is_some_and(|a| a < 50.0) && t.speed.is_some_and(|s| s > 0.0 && s < 5.0) {
            score += 2;
            factors.push("low_and_slow".to_string());
        }
        if t.speed.is_some_and(|s| s > 25.0) {
            score += 1;
            factors.push("high_speed".to_string());
        }

        if score == 0 {
            continue;
        }
        let level = if score >= 5 {
            Severity::Critical
        } else if score >= 3 {
            Severity::High
        } else {
            Severity::Medium
        };
        alerts.push(SecurityAlert {
            drone_id: t.drone_id.clone(),
            kit_id: t.kit_id.clone(),
            time: t.time,
            score,
            level,
            factors,
        });
    }
    alerts.sort_by(|a, b| b.score.cmp(&a.score).then(b.time.cmp(&a.time)));
    alerts
}

// ---------------------------------------------------------------------------

/// Tracks grouped by drone and sorted by time, for consecutive-sample
/// analyses.
fn per_drone_sorted(tracks: &[TrackRecord]) -> BTreeMap<&str, Vec<&TrackRecord>> {
    let mut by_drone: BTreeMap<&str, Vec<&TrackRecord>> = BTreeMap::new();
    for t in tracks {
        by_drone.entry(&t.drone_id).or_default().push(t);
    }
    for samples in by_drone.values_mut() {
        samples.sort_by_key(|t| t.time);
    }
    by_drone
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 14, 0, 0).unwrap()
    }

    fn obs(drone: &str, kit: &str, secs: i64, lat: f64, lon: f64) -> TrackRecord {
        TrackRecord {
            time: t0() + chrono::Duration::seconds(secs),
            kit_id: kit.to_string(),
            drone_id: drone.to_string(),
            track_type: TRACK_TYPE_DRONE.to_string(),
            lat: Some(lat),
            lon: Some(lon),
            alt: Some(100.0),
            speed: Some(5.0),
            heading: None,
            vspeed: None,
            height: None,
            direction: None,
            operator_id: None,
            caa_id: None,
            rid_make: None,
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
    fn test_repeated_contacts_threshold_and_order() {
        let tracks = vec![
            obs("d1", "k1", 0, 40.0, -74.0),
            obs("d1", "k2", 60, 40.0, -74.0),
            obs("d1", "k1", 120, 40.0, -74.0),
            obs("d2", "k1", 0, 40.0, -74.0),
            obs("d2", "k1", 30, 40.0, -74.0),
            obs("d3", "k1", 0, 40.0, -74.0),
        ];
        let contacts = repeated_contacts(&tracks, 2);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].drone_id, "d1");
        assert_eq!(contacts[0].appearance_count, 3);
        assert_eq!(contacts[0].kit_count, 2);
        assert_eq!(contacts[1].drone_id, "d2");
        assert_eq!(contacts[1].kit_count, 1);
    }

    #[test]
    fn test_coordinated_three_drone_cluster() {
        // Three drones ~200m apart within a minute: one merged group,
        // three pairs, medium correlation.
        let tracks = vec![
            obs("d1", "k1", 0, 40.0000, -74.0000),
            obs("d2", "k1", 20, 40.0018, -74.0000),
            obs("d3", "k1", 40, 40.0009, -74.0010),
        ];
        let groups = coordinated_activity(&tracks, 500.0, 60);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].drone_count, 3);
        assert_eq!(groups[0].pair_count, 3);
        assert_eq!(groups[0].correlation_score, CorrelationScore::Medium);
    }

    #[test]
    fn test_coordinated_far_drones_no_group() {
        let tracks = vec![
            obs("d1", "k1", 0, 40.0, -74.0),
            obs("d2", "k1", 0, 41.0, -74.0),
        ];
        assert!(coordinated_activity(&tracks, 500.0, 60).is_empty());
    }

    #[test]
    fn test_coordinated_time_window_excludes() {
        let tracks = vec![
            obs("d1", "k1", 0, 40.0, -74.0),
            obs("d2", "k1", 2 * 3600, 40.0001, -74.0),
        ];
        assert!(coordinated_activity(&tracks, 500.0, 60).is_empty());
    }

    #[test]
    fn test_pilot_reuse_by_operator_id() {
        let mut a = obs("d1", "k1", 0, 40.0, -74.0);
        a.operator_id = Some("OP-123".to_string());
        let mut b = obs("d2", "k1", 60, 40.1, -74.1);
        b.operator_id = Some("OP-123".to_string());
        let mut c = obs("d3", "k1", 90, 40.2, -74.2);
        c.operator_id = Some("OP-999".to_string());

        let reuse = pilot_reuse(&[a, b, c], 50.0);
        assert_eq!(reuse.len(), 1);
        assert_eq!(reuse[0].method, "operator_id");
        assert_eq!(reuse[0].drone_ids, vec!["d1", "d2"]);
    }

    #[test]
    fn test_pilot_reuse_by_location_cluster() {
        let mut a = obs("d1", "k1", 0, 40.0, -74.0);
        a.pilot_lat = Some(40.5000);
        a.pilot_lon = Some(-74.5000);
        let mut b = obs("d2", "k1", 60, 40.1, -74.1);
        // ~22m from a's pilot.
        b.pilot_lat = Some(40.5002);
        b.pilot_lon = Some(-74.5000);
        let mut c = obs("d3", "k1", 90, 40.2, -74.2);
        c.pilot_lat = Some(40.9);
        c.pilot_lon = Some(-74.9);

        let reuse = pilot_reuse(&[a, b, c], 50.0);
        assert_eq!(reuse.len(), 1);
        assert_eq!(reuse[0].method, "pilot_location");
        assert_eq!(reuse[0].drone_ids, vec!["d1", "d2"]);
    }

    #[test]
    fn test_anomaly_thresholds() {
        let mut fast = obs("d1", "k1", 0, 40.0, -74.0);
        fast.speed = Some(45.0);
        let mut high = obs("d2", "k1", 0, 40.0, -74.0);
        high.alt = Some(480.0);
        let mut extreme = obs("d3", "k1", 0, 40.0, -74.0);
        extreme.speed = Some(55.0);
        extreme.alt = Some(520.0);

        let found = anomalies(&[fast, high, extreme]);
        let types: Vec<(&str, Severity)> = found
            .iter()
            .map(|a| (a.anomaly_type.as_str(), a.severity))
            .collect();
        assert!(types.contains(&("speed", Severity::High)));
        assert!(types.contains(&("altitude", Severity::High)));
        assert!(types.contains(&("speed", Severity::Critical)));
        assert!(types.contains(&("altitude", Severity::Critical)));
    }

    #[test]
    fn test_rapid_altitude_change_needs_ten_seconds() {
        let mut a = obs("d1", "k1", 0, 40.0, -74.0);
        a.alt = Some(100.0);
        let mut b = obs("d1", "k1", 5, 40.0, -74.0);
        b.alt = Some(200.0); // 20 m/s but only 5s apart
        let found = anomalies(&[a.clone(), b]);
        assert!(!found.iter().any(|x| x.anomaly_type == "rapid_altitude_change"));

        let mut c = obs("d1", "k1", 20, 40.0, -74.0);
        c.alt = Some(300.0); // 200m over 20s = 10+ m/s? (300-100)/20 = 10 exactly -> high
        let found = anomalies(&[a, c]);
        let rapid: Vec<_> = found
            .iter()
            .filter(|x| x.anomaly_type == "rapid_altitude_change")
            .collect();
        assert_eq!(rapid.len(), 1);
        assert_eq!(rapid[0].severity, Severity::High);
    }

    #[test]
    fn test_multi_kit_same_slot() {
        let tracks = vec![
            obs("d1", "k1", 10, 40.0, -74.0),
            obs("d1", "k2", 30, 40.0, -74.0),
            obs("d1", "k3", 50, 40.0, -74.0),
            obs("d2", "k1", 10, 40.0, -74.0),
        ];
        let contacts = multi_kit_contacts(&tracks);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].drone_id, "d1");
        assert_eq!(contacts[0].kit_count, 3);
        assert!(contacts[0].triangulation_possible);
        assert_eq!(contacts[0].observations.len(), 3);
    }

    #[test]
    fn test_multi_kit_rssi_ordering() {
        let mut a = obs("d1", "k1", 10, 40.0, -74.0);
        a.rssi = Some(-90.0);
        let mut b = obs("d1", "k2", 20, 40.0, -74.0);
        b.rssi = Some(-60.0);
        let contacts = multi_kit_contacts(&[a, b]);
        assert_eq!(contacts[0].observations[0].kit_id, "k2");
        assert_eq!(contacts[0].observations[0].rssi, Some(-60.0));
    }

    #[test]
    fn test_loitering_contiguous_run() {
        // 12 minutes of samples inside a 100m radius.
        let mut tracks = Vec::new();
        for i in 0..13 {
            tracks.push(obs("d1", "k1", i * 60, 40.0, -74.0));
        }
        // A drone that passes through once.
        tracks.push(obs("d2", "k1", 0, 40.0, -74.0));

        let events = loitering(&tracks, 40.0, -74.0, 100.0, 10.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].drone_id, "d1");
        assert!((events[0].duration_mins - 12.0).abs() < 0.01);
        assert_eq!(events[0].threat_level, Severity::Medium);
    }

    #[test]
    fn test_loitering_run_broken_by_excursion() {
        let mut tracks = Vec::new();
        for i in 0..6 {
            tracks.push(obs("d1", "k1", i * 60, 40.0, -74.0));
        }
        // Excursion 5km away breaks the run.
        tracks.push(obs("d1", "k1", 6 * 60, 40.05, -74.0));
        for i in 7..13 {
            tracks.push(obs("d1", "k1", i * 60, 40.0, -74.0));
        }
        let events = loitering(&tracks, 40.0, -74.0, 100.0, 10.0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_loiter_threat_levels() {
        assert_eq!(loiter_threat(8.0), Severity::Low);
        assert_eq!(loiter_threat(12.0), Severity::Medium);
        assert_eq!(loiter_threat(20.0), Severity::High);
        assert_eq!(loiter_threat(35.0), Severity::Critical);
    }

    #[test]
    fn test_rapid_descent_and_payload_drop() {
        let mut a = obs("d1", "k1", 0, 40.0, -74.0);
        a.alt = Some(300.0);
        let mut b = obs("d1", "k1", 10, 40.0, -74.0);
        b.alt = Some(200.0); // 100m over 10s = 10 m/s
        b.speed = Some(2.0);

        let events = rapid_descent(&[a, b], 20.0, 5.0);
        assert_eq!(events.len(), 1);
        assert!((events[0].descent_rate_mps - 10.0).abs() < 1e-9);
        assert!(events[0].possible_payload_drop);
    }

    #[test]
    fn test_rapid_descent_fast_forward_flight_not_drop() {
        let mut a = obs("d1", "k1", 0, 40.0, -74.0);
        a.alt = Some(300.0);
        let mut b = obs("d1", "k1", 10, 40.0, -74.0);
        b.alt = Some(200.0);
        b.speed = Some(20.0); // moving fast horizontally

        let events = rapid_descent(&[a, b], 20.0, 5.0);
        assert_eq!(events.len(), 1);
        assert!(!events[0].possible_payload_drop);
    }

    #[test]
    fn test_night_hour_wraps_midnight() {
        assert!(is_night_hour(23, 22, 5));
        assert!(is_night_hour(0, 22, 5));
        assert!(is_night_hour(5, 22, 5));
        assert!(!is_night_hour(12, 22, 5));
        assert!(!is_night_hour(21, 22, 5));
    }

    #[test]
    fn test_night_activity_risk_levels() {
        let mut tracks = Vec::new();
        // 14:00 UTC is 23:00 at +9.
        for i in 0..6 {
            tracks.push(obs("d1", "k1", i, 40.0, -74.0));
        }
        tracks.push(obs("d2", "k1", 0, 40.0, -74.0));

        let activity = night_activity(&tracks, 22, 5, 9);
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].drone_id, "d1");
        assert_eq!(activity[0].risk_level, Severity::High);
        assert_eq!(activity[1].risk_level, Severity::Low);

        // Same tracks in local daytime produce nothing.
        assert!(night_activity(&tracks, 22, 5, 0).is_empty());
    }

    #[test]
    fn test_security_alert_weights_sum() {
        // Night (+2), low-and-slow (+2): high.
        let mut t = obs("d1", "k1", 0, 40.0, -74.0);
        t.alt = Some(30.0);
        t.speed = Some(2.0);
        let alerts = security_alerts(&[t], 22, 5, 9);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].score, 4);
        assert_eq!(alerts[0].level, Severity::High);
        assert!(alerts[0].factors.contains(&"night_flight".to_string()));
        assert!(alerts[0].factors.contains(&"low_and_slow".to_string()));
    }

    #[test]
    fn test_security_alert_high_speed_only_is_medium() {
        let mut t = obs("d1", "k1", 0, 40.0, -74.0);
        t.speed = Some(30.0);
        t.alt = Some(200.0);
        let alerts = security_alerts(&[t], 22, 5, 0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].score, 1);
        assert_eq!(alerts[0].level, Severity::Medium);
    }
}
