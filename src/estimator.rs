//! RSSI geolocation. Converts per-kit signal strength into range estimates
//! with the log-distance path-loss model, positions the target by kit
//! count (single kit, two-kit weighted, trilateration), and scores the
//! drone's self-reported GPS against the estimate for spoofing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::geo::{LocalPlane, haversine_m};
use crate::kit_health::HealthRecord;
use crate::tracks::TrackRecord;

/// Solver iteration cap.
const MAX_ITERATIONS: usize = 100;
/// Stop once one iteration shifts the estimate less than this (meters).
const CONVERGENCE_TOLERANCE_M: f64 = 1.0;
/// Gradient step scale, in meters of shift per unit of gradient.
const GRADIENT_STEP: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct EstimatorParams {
    pub tx_power_dbm: f64,
    pub path_loss_exponent: f64,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            tx_power_dbm: 0.0,
            path_loss_exponent: 2.5,
        }
    }
}

/// Log-distance path-loss model: `d = 10^((TxPower − RSSI) / (10 · n))`.
pub fn rssi_to_distance_m(rssi_dbm: f64, params: &EstimatorParams) -> f64 {
    10f64.powf((params.tx_power_dbm - rssi_dbm) / (10.0 * params.path_loss_exponent))
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimatorObservation {
    pub kit_id: String,
    pub kit_lat: f64,
    pub kit_lon: f64,
    pub rssi_dbm: f64,
    pub estimated_distance_m: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationEstimate {
    pub algorithm: &'static str,
    pub observations: Vec<EstimatorObservation>,
    pub estimated: LatLon,
    pub actual: Option<LatLon>,
    pub error_meters: Option<f64>,
    pub confidence_radius_m: f64,
    pub spoofing_score: Option<f64>,
    pub spoofing_suspected: Option<bool>,
    pub spoofing_reason: Option<String>,
}

/// Pair each observing kit's position (from its health samples) with that
/// kit's RSSI observation nearest the target instant.
pub fn collect_observations(
    tracks: &[TrackRecord],
    kit_positions: &[HealthRecord],
    center: DateTime<Utc>,
    params: &EstimatorParams,
) -> Vec<EstimatorObservation> {
    let positions: HashMap<&str, (f64, f64)> = kit_positions
        .iter()
        .filter_map(|h| h.position().map(|p| (h.kit_id.as_str(), p)))
        .collect();

    let mut best: HashMap<&str, &TrackRecord> = HashMap::new();
    for t in tracks {
        let Some(rssi) = t.rssi else { continue };
        if !rssi.is_finite() || !positions.contains_key(t.kit_id.as_str()) {
            continue;
        }
        best.entry(&t.kit_id)
            .and_modify(|cur| {
                let closer = (t.time - center).abs() < (cur.time - center).abs();
                if closer {
                    *cur = t;
                }
            })
            .or_insert(t);
    }

    let mut observations: Vec<EstimatorObservation> = best
        .into_iter()
        .map(|(kit, t)| {
            let (kit_lat, kit_lon) = positions[kit];
            let rssi = t.rssi.unwrap_or_default();
            EstimatorObservation {
                kit_id: kit.to_string(),
                kit_lat,
                kit_lon,
                rssi_dbm: rssi,
                estimated_distance_m: rssi_to_distance_m(rssi, params),
                time: t.time,
            }
        })
        .collect();
    observations.sort_by(|a, b| a.kit_id.cmp(&b.kit_id));
    observations
}

/// The drone's own GPS report nearest the target instant, if any row in
/// the window carries one.
pub fn reported_position(tracks: &[TrackRecord], center: DateTime<Utc>) -> Option<LatLon> {
    tracks
        .iter()
        .filter_map(|t| t.position().map(|(lat, lon)| (t.time, lat, lon)))
        .min_by_key(|(time, _, _)| (*time - center).abs())
        .map(|(_, lat, lon)| LatLon { lat, lon })
}

/// Estimate the target position from one or more ranged observations.
/// Returns `None` only for an empty observation set.
pub fn estimate(
    observations: &[EstimatorObservation],
    actual: Option<LatLon>,
) -> Option<LocationEstimate> {
    if observations.is_empty() {
        return None;
    }

    let (algorithm, estimated, confidence_radius_m) = match observations.len() {
        1 => {
            let o = &observations[0];
            (
                "single_kit",
                LatLon {
                    lat: o.kit_lat,
                    lon: o.kit_lon,
                },
                o.estimated_distance_m,
            )
        }
        2 => two_kit_weighted(&observations[0], &observations[1]),
        _ => trilaterate(observations),
    };

    let error_meters = actual
        .as_ref()
        .map(|a| haversine_m(estimated.lat, estimated.lon, a.lat, a.lon));
    let spoofing_score = error_meters.map(|e| spoofing_score(e, confidence_radius_m));
    let spoofing_suspected = spoofing_score.map(|s| s >= 0.5);
    let spoofing_reason = match (error_meters, spoofing_suspected) {
        (Some(error), Some(true)) => {
            let ratio = error / confidence_radius_m.max(1.0);
            Some(format!(
                "Position error ({:.0}m) is {:.1}x the expected accuracy ({:.0}m)",
                error, ratio, confidence_radius_m
            ))
        }
        _ => None,
    };

    Some(LocationEstimate {
        algorithm,
        observations: observations.to_vec(),
        estimated,
        actual,
        error_meters,
        confidence_radius_m,
        spoofing_score,
        spoofing_suspected,
        spoofing_reason,
    })
}

/// Two observers: the estimate sits on the line between the kits, pulled
/// toward the one that measured the shorter range (weight ∝ 1/d).
fn two_kit_weighted(
    a: &EstimatorObservation,
    b: &EstimatorObservation,
) -> (&'static str, LatLon, f64) {
    let wa = 1.0 / a.estimated_distance_m.max(1.0);
    let wb = 1.0 / b.estimated_distance_m.max(1.0);
    let lat = (a.kit_lat * wa + b.kit_lat * wb) / (wa + wb);
    let lon = (a.kit_lon * wa + b.kit_lon * wb) / (wa + wb);
    let confidence = (a.estimated_distance_m + b.estimated_distance_m) / 2.0;
    ("two_kit_weighted", LatLon { lat, lon }, confidence)
}

/// Three or more observers: gradient descent on the squared range
/// residuals `(‖p − kit_i‖ − d_i)²` in a local tangent plane, seeded at
/// the 1/d-weighted centroid of the kits. Iteration is bounded and stops
/// once a step shifts the estimate by less than the tolerance; the RMS
/// residual at the final point is the confidence radius.
fn trilaterate(observations: &[EstimatorObservation]) -> (&'static str, LatLon, f64) {
    let origin_lat =
        observations.iter().map(|o| o.kit_lat).sum::<f64>() / observations.len() as f64;
    let origin_lon =
        observations.iter().map(|o| o.kit_lon).sum::<f64>() / observations.len() as f64;
    let plane = LocalPlane::new(origin_lat, origin_lon);

    let kits_xy: Vec<(f64, f64, f64)> = observations
        .iter()
        .map(|o| {
            let (x, y) = plane.to_xy(o.kit_lat, o.kit_lon);
            (x, y, o.estimated_distance_m)
        })
        .collect();

    // Weighted centroid start: nearer kits pull harder.
    let mut weight_sum = 0.0;
    let (mut px, mut py) = (0.0, 0.0);
    for (x, y, d) in &kits_xy {
        let w = 1.0 / d.max(1.0);
        px += x * w;
        py += y * w;
        weight_sum += w;
    }
    px /= weight_sum;
    py /= weight_sum;

    for _ in 0..MAX_ITERATIONS {
        let (mut gx, mut gy) = (0.0, 0.0);
        for (x, y, d) in &kits_xy {
            let dx = px - x;
            let dy = py - y;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist < 1e-6 {
                continue;
            }
            let residual = dist - d;
            gx += 2.0 * residual * dx / dist;
            gy += 2.0 * residual * dy / dist;
        }
        let step_x = -GRADIENT_STEP * gx;
        let step_y = -GRADIENT_STEP * gy;
        px += step_x;
        py += step_y;
        if (step_x * step_x + step_y * step_y).sqrt() < CONVERGENCE_TOLERANCE_M {
            break;
        }
    }

    let residual_sq_sum: f64 = kits_xy
        .iter()
        .map(|(x, y, d)| {
            let dist = ((px - x).powi(2) + (py - y).powi(2)).sqrt();
            (dist - d).powi(2)
        })
        .sum();
    let confidence = (residual_sq_sum / kits_xy.len() as f64).sqrt();

    let (lat, lon) = plane.to_lat_lon(px, py);
    ("trilateration", LatLon { lat, lon }, confidence)
}

/// Map the error-to-confidence ratio onto [0, 1]: a monotone piecewise
/// curve through (0, 0), (1, 0.3), (3, 0.5), (6, 0.7), saturating toward
/// 1 beyond that. `>= 0.5` flags the report as suspected spoofing.
pub fn spoofing_score(error_m: f64, confidence_radius_m: f64) -> f64 {
    let r = error_m / confidence_radius_m.max(1.0);
    if r <= 1.0 {
        0.3 * r
    } else if r <= 3.0 {
        0.3 + 0.2 * (r - 1.0) / 2.0
    } else if r <= 6.0 {
        0.5 + 0.2 * (r - 3.0) / 3.0
    } else {
        1.0 - 0.3 * (-(r - 6.0) / 10.0).exp()
    }
}
