//! Displacement & DAC (`SPEC_FULL.md` §4.7) and surface drift (§4.8).

use sgcore_geo::{displacement_m, heading_to_en, m_per_deg_lat};
use thiserror::Error;

/// A validated GPS fix as seen by this crate (quality gating happens in
/// `sgcore_preflight::GpsTriple::validate`; this crate only consumes the
/// result).
#[derive(Debug, Clone, Copy)]
pub struct Fix {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub time_s: f64,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacQc {
    Good,
    ProbablyGood,
    Bad,
}

#[derive(Debug, Clone)]
pub struct DisplacementResult {
    pub dac_east_cm_s: f64,
    pub dac_north_cm_s: f64,
    pub lat_deg: Vec<f64>,
    pub lon_deg: Vec<f64>,
    pub dac_qc: DacQc,
}

#[derive(Debug, Error)]
pub enum DisplacementError {
    #[error("fewer than 2 samples supplied")]
    TooFewSamples,
}

/// Quality-gate inputs that can downgrade `dac_qc` beyond the raw GPS
/// validity check (§4.7 "Quality gates").
#[derive(Debug, Clone, Copy, Default)]
pub struct DacQualityInputs {
    pub subsurface_dive: bool,
    pub under_ice_fix: bool,
    pub bad_hdm_qc: bool,
    pub unmodelled_time_fraction: f64,
    pub upwelling_sample_fraction: f64,
    pub gps_error_m: f64,
}

/// Integrate modelled speed/heading over the dive, compare with the
/// GPS2->GPSE surface displacement, and solve for the depth-averaged
/// current (§4.7 steps 1-6).
pub fn solve_dac(
    time_s: &[f64],
    speed_cm_s: &[f64],
    heading_deg: &[f64],
    gps2: Fix,
    gpse: Fix,
    surface_maneuver_time_s: f64,
    quality: &DacQualityInputs,
) -> Result<DisplacementResult, DisplacementError> {
    let n = time_s.len();
    if n < 2 {
        return Err(DisplacementError::TooFewSamples);
    }

    let mut modelled_east = vec![0.0; n];
    let mut modelled_north = vec![0.0; n];
    let mut sum_east = 0.0;
    let mut sum_north = 0.0;
    for i in 1..n {
        let dt = time_s[i] - time_s[i - 1];
        let (e_rate, n_rate) = heading_to_en(speed_cm_s[i] / 100.0, heading_deg[i]);
        let d_east = e_rate * dt;
        let d_north = n_rate * dt;
        sum_east += d_east;
        sum_north += d_north;
        modelled_east[i] = modelled_east[i - 1] + d_east;
        modelled_north[i] = modelled_north[i - 1] + d_north;
    }

    let (actual_east, actual_north) = displacement_m(gps2.lat_deg, gps2.lon_deg, gpse.lat_deg, gpse.lon_deg);

    let flight_time_s = time_s.last().unwrap() - time_s.first().unwrap();
    let denom = flight_time_s + surface_maneuver_time_s;
    let (dac_east, dac_north) = if denom.abs() > 1e-9 {
        ((actual_east - sum_east) / denom, (actual_north - sum_north) / denom)
    } else {
        (0.0, 0.0)
    };
    let dac_east_cm_s = dac_east * 100.0;
    let dac_north_cm_s = dac_north * 100.0;

    let mut lat = vec![gps2.lat_deg; n];
    let mut lon = vec![gps2.lon_deg; n];
    for i in 1..n {
        let dt = time_s[i] - time_s[i - 1];
        let e_total = modelled_east[i] - modelled_east[i - 1] + dac_east * dt;
        let n_total = modelled_north[i] - modelled_north[i - 1] + dac_north * dt;
        let (new_lat, new_lon) = sgcore_geo::advance(lat[i - 1], lon[i - 1], e_total, n_total);
        lat[i] = new_lat;
        lon[i] = new_lon;
    }

    let dac_magnitude_cm_s = (dac_east_cm_s * dac_east_cm_s + dac_north_cm_s * dac_north_cm_s).sqrt();
    let gps_noise_floor_cm_s = if flight_time_s.abs() > 1e-9 { 100.0 * quality.gps_error_m / flight_time_s } else { f64::INFINITY };

    let dac_qc = if !gps2.valid || !gpse.valid {
        DacQc::Bad
    } else if quality.subsurface_dive
        || quality.under_ice_fix
        || quality.bad_hdm_qc
        || quality.unmodelled_time_fraction > 0.20
        || quality.upwelling_sample_fraction > 0.10
        || dac_magnitude_cm_s < gps_noise_floor_cm_s
    {
        DacQc::ProbablyGood
    } else {
        DacQc::Good
    };

    log::debug!(
        "dac: east={dac_east_cm_s:.3} cm/s north={dac_north_cm_s:.3} cm/s qc={dac_qc:?} noise_floor={gps_noise_floor_cm_s:.3}"
    );

    Ok(DisplacementResult { dac_east_cm_s, dac_north_cm_s, lat_deg: lat, lon_deg: lon, dac_qc })
}

/// Surface drift between GPS1 and GPS2 (§4.8): a scalar current over the
/// surface interval, in cm/s and compass-heading degrees.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDrift {
    pub speed_cm_s: f64,
    pub heading_deg: f64,
}

pub fn surface_drift(gps1: Fix, gps2: Fix) -> Option<SurfaceDrift> {
    if !gps1.valid || !gps2.valid {
        return None;
    }
    let dt = gps2.time_s - gps1.time_s;
    if dt.abs() < 1e-9 {
        return None;
    }
    let (east, north) = displacement_m(gps1.lat_deg, gps1.lon_deg, gps2.lat_deg, gps2.lon_deg);
    let (speed_m_s, heading) = sgcore_geo::en_to_heading(east / dt, north / dt);
    Some(SurfaceDrift { speed_cm_s: speed_m_s * 100.0, heading_deg: heading })
}

/// Override the pre-flare interval's modelled speed/heading with the
/// surface drift, so DAC integration starts from the onset of submergence
/// rather than the surface fix (§4.8).
pub fn apply_pre_flare_override(speed_cm_s: &mut [f64], heading_deg: &mut [f64], flare_i: usize, drift: SurfaceDrift) {
    for i in 0..flare_i.min(speed_cm_s.len()) {
        speed_cm_s[i] = drift.speed_cm_s;
        heading_deg[i] = drift.heading_deg;
    }
}

/// Metres-per-degree latitude, exposed for callers validating GPS error
/// thresholds in the same units as `DacQualityInputs::gps_error_m`.
pub fn m_per_deg() -> f64 {
    m_per_deg_lat()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_current_when_gps_matches_modelled_track() {
        let n = 11;
        let time_s: Vec<f64> = (0..n).map(|i| i as f64 * 60.0).collect();
        let speed_cm_s = vec![25.0; n];
        let heading_deg = vec![90.0; n];

        let total_east_m = 0.25 * 600.0;
        let gps2 = Fix { lat_deg: 10.0, lon_deg: 20.0, time_s: 0.0, valid: true };
        let (lat1, lon1) = sgcore_geo::advance(gps2.lat_deg, gps2.lon_deg, total_east_m, 0.0);
        let gpse = Fix { lat_deg: lat1, lon_deg: lon1, time_s: 600.0, valid: true };

        let out = solve_dac(&time_s, &speed_cm_s, &heading_deg, gps2, gpse, 0.0, &DacQualityInputs::default()).unwrap();
        assert!(out.dac_east_cm_s.abs() < 1e-3, "dac_east={}", out.dac_east_cm_s);
        assert!(out.dac_north_cm_s.abs() < 1e-3);
        assert_eq!(out.dac_qc, DacQc::Good);
    }

    #[test]
    fn invalid_gps_forces_bad_qc() {
        let time_s = vec![0.0, 60.0];
        let speed = vec![25.0, 25.0];
        let heading = vec![90.0, 90.0];
        let gps2 = Fix { lat_deg: 10.0, lon_deg: 20.0, time_s: 0.0, valid: false };
        let gpse = Fix { lat_deg: 10.01, lon_deg: 20.01, time_s: 60.0, valid: true };
        let out = solve_dac(&time_s, &speed, &heading, gps2, gpse, 0.0, &DacQualityInputs::default()).unwrap();
        assert_eq!(out.dac_qc, DacQc::Bad);
    }

    #[test]
    fn surface_drift_overrides_pre_flare_interval() {
        let gps1 = Fix { lat_deg: 10.0, lon_deg: 20.0, time_s: 0.0, valid: true };
        let gps2 = Fix { lat_deg: 10.001, lon_deg: 20.0, time_s: 300.0, valid: true };
        let drift = surface_drift(gps1, gps2).expect("valid fixes yield a drift");
        let mut speed = vec![0.0; 5];
        let mut heading = vec![0.0; 5];
        apply_pre_flare_override(&mut speed, &mut heading, 3, drift);
        assert_eq!(speed[0], drift.speed_cm_s);
        assert_eq!(speed[3], 0.0, "flare index itself is untouched");
    }

    #[test]
    fn too_few_samples_errors() {
        let gps2 = Fix { lat_deg: 0.0, lon_deg: 0.0, time_s: 0.0, valid: true };
        let gpse = Fix { lat_deg: 0.0, lon_deg: 0.0, time_s: 1.0, valid: true };
        let result = solve_dac(&[0.0], &[0.0], &[0.0], gps2, gpse, 0.0, &DacQualityInputs::default());
        assert!(matches!(result, Err(DisplacementError::TooFewSamples)));
    }
}
