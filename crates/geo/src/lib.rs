//! Geodesy helpers for the dive-processing workspace: degrees-per-metre
//! scale factors, antimeridian-aware averaging, and heading projection.
//!
//! All angles in this crate are degrees unless a function name says
//! otherwise; all distances are metres.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Metres per degree of latitude (constant to the precision this workspace
/// needs; a full ellipsoidal model is out of scope).
pub fn m_per_deg_lat() -> f64 {
    EARTH_RADIUS_M * std::f64::consts::PI / 180.0
}

/// Metres per degree of longitude at a given latitude (degrees).
pub fn m_per_deg_lon(lat_deg: f64) -> f64 {
    m_per_deg_lat() * lat_deg.to_radians().cos()
}

/// Wrap a longitude into `[-180, 180)`.
pub fn wrap_lon(lon_deg: f64) -> f64 {
    let mut l = (lon_deg + 180.0) % 360.0;
    if l < 0.0 {
        l += 360.0;
    }
    l - 180.0
}

/// Mean of a set of longitudes, antimeridian-aware: averages the unit
/// vectors `(cos lon, sin lon)` rather than the raw degree values, so a
/// dive track straddling +/-180 does not average to 0.
pub fn mean_lon(lons_deg: &[f64]) -> Option<f64> {
    if lons_deg.is_empty() {
        return None;
    }
    let (mut sx, mut sy) = (0.0, 0.0);
    for &lon in lons_deg {
        let r = lon.to_radians();
        sx += r.cos();
        sy += r.sin();
    }
    Some(sy.atan2(sx).to_degrees())
}

/// Arithmetic mean of a set of latitudes (latitude never wraps in the
/// glider's operating envelope, so a plain mean is adequate).
pub fn mean_lat(lats_deg: &[f64]) -> Option<f64> {
    if lats_deg.is_empty() {
        return None;
    }
    Some(lats_deg.iter().sum::<f64>() / lats_deg.len() as f64)
}

/// East/north displacement (metres) between two lat/lon points, small-angle
/// planar approximation valid over a single dive's footprint.
pub fn displacement_m(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> (f64, f64) {
    let mean_lat = 0.5 * (lat0 + lat1);
    let dlon = wrap_lon(lon1 - lon0);
    let east = dlon * m_per_deg_lon(mean_lat);
    let north = (lat1 - lat0) * m_per_deg_lat();
    (east, north)
}

/// Advance a lat/lon point by an east/north displacement in metres.
pub fn advance(lat: f64, lon: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    let new_lat = lat + north_m / m_per_deg_lat();
    let mean_lat = 0.5 * (lat + new_lat);
    let new_lon = wrap_lon(lon + east_m / m_per_deg_lon(mean_lat));
    (new_lat, new_lon)
}

/// Decompose a horizontal speed (m/s) and compass heading (degrees, 0 =
/// north, clockwise positive) into east/north components (m/s).
pub fn heading_to_en(speed: f64, heading_deg: f64) -> (f64, f64) {
    let h = heading_deg.to_radians();
    (speed * h.sin(), speed * h.cos())
}

/// Recover speed and heading from east/north components.
pub fn en_to_heading(east: f64, north: f64) -> (f64, f64) {
    let speed = (east * east + north * north).sqrt();
    let mut heading = east.atan2(north).to_degrees();
    if heading < 0.0 {
        heading += 360.0;
    }
    (speed, heading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_lon_handles_antimeridian() {
        assert!((wrap_lon(181.0) - (-179.0)).abs() < 1e-9);
        assert!((wrap_lon(-181.0) - 179.0).abs() < 1e-9);
    }

    #[test]
    fn mean_lon_across_dateline_is_near_180() {
        let m = mean_lon(&[179.5, -179.5]).unwrap();
        assert!(m.abs() > 179.0, "mean_lon = {m}");
    }

    #[test]
    fn displacement_and_advance_round_trip() {
        let (lat0, lon0) = (10.0, 20.0);
        let (east, north) = (1500.0, -800.0);
        let (lat1, lon1) = advance(lat0, lon0, east, north);
        let (e2, n2) = displacement_m(lat0, lon0, lat1, lon1);
        assert!((e2 - east).abs() < 1.0);
        assert!((n2 - north).abs() < 1.0);
    }

    #[test]
    fn heading_round_trip() {
        let (e, n) = heading_to_en(3.0, 45.0);
        let (speed, heading) = en_to_heading(e, n);
        assert!((speed - 3.0).abs() < 1e-9);
        assert!((heading - 45.0).abs() < 1e-6);
    }
}
