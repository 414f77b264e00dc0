//! Great-circle geometry on the WGS84 sphere. Everything here works in
//! decimal degrees and meters; earth radius fixed at 6 371 000 m.

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two lat/lon points, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// NULL-propagating haversine: any missing coordinate yields `None`.
pub fn haversine_opt(
    lat1: Option<f64>,
    lon1: Option<f64>,
    lat2: Option<f64>,
    lon2: Option<f64>,
) -> Option<f64> {
    match (lat1, lon1, lat2, lon2) {
        (Some(a), Some(b), Some(c), Some(d)) => Some(haversine_m(a, b, c, d)),
        _ => None,
    }
}

/// Local tangent-plane projection around an origin. Good to well under a
/// meter over the few-kilometer baselines kits operate at, which is all the
/// trilateration solver needs.
#[derive(Debug, Clone, Copy)]
pub struct LocalPlane {
    origin_lat: f64,
    origin_lon: f64,
    cos_lat: f64,
}

impl LocalPlane {
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
            cos_lat: origin_lat.to_radians().cos(),
        }
    }

    /// Degrees to local east/north meters.
    pub fn to_xy(&self, lat: f64, lon: f64) -> (f64, f64) {
        let x = (lon - self.origin_lon).to_radians() * self.cos_lat * EARTH_RADIUS_M;
        let y = (lat - self.origin_lat).to_radians() * EARTH_RADIUS_M;
        (x, y)
    }

    /// Local east/north meters back to degrees.
    pub fn to_lat_lon(&self, x: f64, y: f64) -> (f64, f64) {
        let lat = self.origin_lat + (y / EARTH_RADIUS_M).to_degrees();
        let lon = self.origin_lon + (x / (EARTH_RADIUS_M * self.cos_lat)).to_degrees();
        (lat, lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_identity() {
        assert_eq!(haversine_m(51.5, -0.12, 51.5, -0.12), 0.0);
    }

    #[test]
    fn test_haversine_symmetry() {
        let d1 = haversine_m(40.7128, -74.0060, 51.5074, -0.1278);
        let d2 = haversine_m(51.5074, -0.1278, 40.7128, -74.0060);
        assert!((d1 - d2).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_known_distance() {
        // NYC to London, about 5570 km.
        let d = haversine_m(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((d - 5_570_000.0).abs() < 10_000.0);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        // One degree of latitude is ~111.2 km on this sphere.
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn test_haversine_null_propagation() {
        assert_eq!(haversine_opt(None, Some(0.0), Some(1.0), Some(1.0)), None);
        assert_eq!(haversine_opt(Some(0.0), None, Some(1.0), Some(1.0)), None);
        assert_eq!(haversine_opt(Some(0.0), Some(0.0), None, None), None);
        assert!(haversine_opt(Some(0.0), Some(0.0), Some(0.0), Some(0.0)).is_some());
    }

    #[test]
    fn test_local_plane_round_trip() {
        let plane = LocalPlane::new(40.7128, -74.0060);
        let (x, y) = plane.to_xy(40.7228, -74.0160);
        let (lat, lon) = plane.to_lat_lon(x, y);
        assert!((lat - 40.7228).abs() < 1e-9);
        assert!((lon - -74.0160).abs() < 1e-9);
    }

    #[test]
    fn test_local_plane_agrees_with_haversine() {
        let plane = LocalPlane::new(40.0, -74.0);
        let (x, y) = plane.to_xy(40.005, -74.007);
        let planar = (x * x + y * y).sqrt();
        let sphere = haversine_m(40.0, -74.0, 40.005, -74.007);
        assert!((planar - sphere).abs() / sphere < 1e-3);
    }
}
