//! Outer TSV (temperature-salinity-velocity) iterative solver
//! (`SPEC_FULL.md` §4.6 (a), (j), "Convergence", "Fallback"). Drives the
//! per-iteration physics in `sgcore_thermal` and the flight model in
//! `sgcore_flight` to a self-consistent fixed point.

use sgcore_config::CalibrationSet;
use sgcore_core::seawater;
use sgcore_flight::{FlightConstants, StallConfig, gsm, hdm};
use sgcore_thermal::{ModalConstants, ModeTableCache, density, flush, transit};
use thiserror::Error;

const MAX_ITERATIONS: usize = 21;
const CONVERGENCE_CM_S: f64 = 0.1;
const TMC_DISABLE_THRESHOLD_C: f64 = 0.5;
const C3515: f64 = 4.2914;
const CELL_DRAG_C_D0: f64 = 1.0;
const CELL_DRAG_C_D0_REF: f64 = 1.0;
const ATTACK_ANGLE_REGRESSION_SLOPE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Dive,
    Climb,
}

/// Everything the solver needs for one dive's CT/flight grid; all vectors
/// are length `N_ct` and share a common time base.
#[derive(Debug, Clone)]
pub struct TsvInputs {
    pub time_s: Vec<f64>,
    pub pressure_dbar: Vec<f64>,
    /// Latitude-corrected depth, same grid as `pressure_dbar`; used only to
    /// seed the GSM initial-speed guess via vertical velocity.
    pub depth_m: Vec<f64>,
    pub raw_temp_c: Vec<f64>,
    pub raw_cond_s_m: Vec<f64>,
    pub pitch_deg: Vec<f64>,
    pub attack_angle_deg: Vec<f64>,
    pub leg: Vec<Leg>,
    /// Samples excluded up front by manual QC flags (uncorrectable).
    pub manually_bad: Vec<bool>,
    /// Buoyancy estimate at the start of the first iteration, grams.
    pub initial_buoyancy_g: Vec<f64>,
    pub is_pumped: bool,
    pub pumped_u_f_cm_s: f64,
}

#[derive(Debug, Clone)]
pub struct TsvOutcome {
    pub temp_c: Vec<f64>,
    pub cond_s_m: Vec<f64>,
    pub salinity: Vec<f64>,
    pub speed_cm_s: Vec<f64>,
    pub theta_rad: Vec<f64>,
    pub valid: Vec<bool>,
    pub converged: bool,
    pub iterations: usize,
    pub tmc_disabled: bool,
    pub max_residual_cm_s: f64,
    pub used_averaged_speeds: bool,
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("fewer than 3 valid samples remain after reduction")]
    TooFewValid,
}

/// Run the TSV solver to convergence, or exhaust the iteration cap and
/// return the best achieved state with `converged = false`. `tmc_requested`
/// is the caller's `correct_thermal_inertia_effects` directive verdict;
/// thermal-mass correction only runs when this is true *and* the mode
/// cache carries at least one precomputed mode.
pub fn run(inputs: &TsvInputs, cal: &CalibrationSet, modes: &ModeTableCache, stall: &StallConfig, tmc_requested: bool) -> Result<TsvOutcome, SolverError> {
    run_with_options(inputs, cal, modes, stall, tmc_requested && modes.mode_count() > 0, false)
}

/// Vertical velocity (cm/s, positive down) by central difference of depth
/// over time, for seeding the GSM initial-speed guess.
fn vertical_velocity_cm_s(time_s: &[f64], depth_m: &[f64]) -> Vec<f64> {
    let n = depth_m.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n - 1);
            if hi == lo {
                return 0.0;
            }
            let dt = time_s[hi] - time_s[lo];
            if dt.abs() > 1e-9 { (depth_m[hi] - depth_m[lo]) / dt * 100.0 } else { 0.0 }
        })
        .collect()
}

fn run_with_options(
    inputs: &TsvInputs,
    cal: &CalibrationSet,
    modes: &ModeTableCache,
    stall: &StallConfig,
    tmc_enabled: bool,
    use_averaged_speeds: bool,
) -> Result<TsvOutcome, SolverError> {
    let n = inputs.time_s.len();
    let hd = FlightConstants {
        hd_a: cal.hd_a,
        hd_b: cal.hd_b,
        hd_c: cal.hd_c,
        hd_s: cal.hd_s,
        rho0: cal.rho0,
        glider_length: cal.glider_length,
    };

    let w_cm_s = vertical_velocity_cm_s(&inputs.time_s, &inputs.depth_m);
    let gsm_guess = gsm::solve(&w_cm_s, &inputs.pitch_deg, &hd, stall);
    let mut speed_cm_s: Vec<f64> = (0..n)
        .map(|i| if gsm_guess.stalled[i] || gsm_guess.speed_cm_s[i] == 0.0 { 20.0 } else { gsm_guess.speed_cm_s[i].abs() })
        .collect();
    let mut theta_rad: Vec<f64> = (0..n).map(|i| if gsm_guess.stalled[i] { -0.3 } else { gsm_guess.theta_rad[i] }).collect();
    let mut stalled = vec![false; n];
    let mut temp_c = inputs.raw_temp_c.clone();
    let mut cond_s_m = inputs.raw_cond_s_m.clone();
    let mut salinity = vec![35.0; n];

    let mut converged = false;
    let mut max_residual = f64::INFINITY;
    let mut iterations = 0;

    for iter in 1..=MAX_ITERATIONS {
        iterations = iter;

        let valid: Vec<bool> = (0..n)
            .map(|i| !inputs.manually_bad[i] && !(stalled[i] && !inputs.is_pumped))
            .collect();
        if valid.iter().filter(|&&v| v).count() < 3 {
            return Err(SolverError::TooFewValid);
        }

        let (_mu, nu, _pr) = sgcore_thermal::viscosity_prandtl(mean_valid(&temp_c, &valid), cal.rho0);

        let u_f: Vec<f64> = if inputs.is_pumped {
            vec![inputs.pumped_u_f_cm_s; n]
        } else {
            let u_sensor = flush::sensor_speed(&speed_cm_s, &inputs.pitch_deg);
            let alpha_sensor = flush::sensor_attack_angle(&inputs.attack_angle_deg, ATTACK_ANGLE_REGRESSION_SLOPE);
            (0..n)
                .map(|i| {
                    let cd = flush::cell_drag(CELL_DRAG_C_D0, CELL_DRAG_C_D0_REF, alpha_sensor[i]);
                    flush::unpumped_tube_flow(u_sensor[i], nu, cal.glider_length, cal.geometry.narrow_radius_m, cd)
                })
                .collect()
        };

        let cell_volume_m3 = std::f64::consts::PI * cal.geometry.narrow_radius_m.powi(2) * cal.geometry.cell_length_m;
        let vol_ec = transit::cumulative_volume(&inputs.time_s, &u_f, cal.geometry.narrow_radius_m);
        let tau1_s: Vec<f64> = (0..n)
            .map(|i| {
                let u = (speed_cm_s[i] / 100.0).abs().max(1e-6);
                (cal.geometry.glider_xt_m.powi(2) + cal.geometry.glider_zt_m.powi(2)).sqrt() / u
            })
            .collect();

        let (t_a, t_sample) = sgcore_thermal::tube_average_temperature(&inputs.time_s, &inputs.raw_temp_c, &vol_ec, cell_volume_m3, &tau1_s, 6);

        let (t_c, max_abs_tc_ta) = if tmc_enabled {
            let modal = ModalConstants::default();
            let (t_w_minus_t_a, w_bl) = sgcore_thermal::modal_boundary_correction(
                &inputs.time_s,
                &t_a,
                &u_f,
                &speed_cm_s,
                nu,
                &cal.geometry,
                cal.glider_length,
                &modal,
                modes,
            );
            let t_c = sgcore_thermal::cell_temperature(&t_a, &t_w_minus_t_a, &w_bl);
            let max_diff = t_c
                .iter()
                .zip(&t_a)
                .map(|(&c, &a)| (c - a).abs())
                .fold(0.0_f64, f64::max);
            (t_c, max_diff)
        } else {
            (t_a.clone(), 0.0)
        };

        let new_salinity = sgcore_thermal::salinity_recovery(&cond_s_m, &t_c, &inputs.pressure_dbar, &t_sample, &inputs.time_s, C3515, &salinity);

        temp_c = t_c;
        cond_s_m = inputs.raw_cond_s_m.clone();
        salinity = new_salinity;

        let volume_cc: Vec<f64> = (0..n)
            .map(|i| density::hull_volume_cc(cal.volmax, cal.abs_compress, cal.therm_expan, inputs.pressure_dbar[i], temp_c[i], cal.temp_ref))
            .collect();
        let rho: Vec<f64> = (0..n)
            .map(|i| seawater::density(salinity[i], temp_c[i], inputs.pressure_dbar[i]))
            .collect();
        let computed_buoyancy_g: Vec<f64> = (0..n).map(|i| density::buoyancy_g(rho[i], volume_cc[i], cal.mass)).collect();
        let buoyancy_g = if iter == 1 && inputs.initial_buoyancy_g.len() == n && inputs.initial_buoyancy_g.iter().any(|&b| b != 0.0) {
            inputs.initial_buoyancy_g.clone()
        } else {
            computed_buoyancy_g
        };

        let hdm_out = hdm::solve(&buoyancy_g, &inputs.pitch_deg, &hd);
        let smoothed = sgcore_flight::smoothing::filter_unsteady(&inputs.time_s, &hdm_out.speed_cm_s, &hdm_out.theta_rad, 1.0, 20.0);

        let new_speed = if use_averaged_speeds {
            smoothed.speed_cm_s.iter().zip(&speed_cm_s).map(|(&new, &old)| 0.5 * (new + old)).collect::<Vec<_>>()
        } else {
            smoothed.speed_cm_s.clone()
        };

        max_residual = (0..n)
            .filter(|&i| valid[i])
            .map(|i| (new_speed[i] - speed_cm_s[i]).abs())
            .fold(0.0_f64, f64::max);

        speed_cm_s = new_speed;
        theta_rad = smoothed.theta_rad;
        stalled = hdm_out.stalled;

        log::debug!("tsv iteration {iter}: max_residual={max_residual:.4} cm/s, max|Tc-Ta|={max_abs_tc_ta:.4} C");

        if max_residual < CONVERGENCE_CM_S || !tmc_enabled {
            converged = true;
            break;
        }

        if iter == MAX_ITERATIONS && max_abs_tc_ta > TMC_DISABLE_THRESHOLD_C {
            log::warn!("max|Tc-Ta|={max_abs_tc_ta:.3} C exceeds {TMC_DISABLE_THRESHOLD_C} C after {MAX_ITERATIONS} iterations; rerunning with thermal-mass correction disabled");
            return run_with_options(inputs, cal, modes, stall, false, use_averaged_speeds);
        }
    }

    if !converged && !use_averaged_speeds {
        log::warn!("TSV solver failed to converge after {MAX_ITERATIONS} iterations; retrying with averaged-speed damping");
        return run_with_options(inputs, cal, modes, stall, tmc_enabled, true);
    }

    let valid: Vec<bool> = (0..n)
        .map(|i| !inputs.manually_bad[i] && !(stalled[i] && !inputs.is_pumped))
        .collect();

    // find_stalled reconciles the HDM-reported stall mask against the
    // configured stall envelope for downstream QC reporting.
    let stall_check = sgcore_flight::find_stalled(&speed_cm_s, &inputs.pitch_deg, stall);
    let stalled_final: Vec<bool> = stalled.iter().zip(&stall_check).map(|(&a, &b)| a || b).collect();

    Ok(TsvOutcome {
        temp_c,
        cond_s_m,
        salinity,
        speed_cm_s,
        theta_rad,
        valid: valid.iter().zip(&stalled_final).map(|(&v, &s)| v && !s).collect(),
        converged,
        iterations,
        tmc_disabled: !tmc_enabled,
        max_residual_cm_s: max_residual,
        used_averaged_speeds: use_averaged_speeds,
    })
}

fn mean_valid(v: &[f64], valid: &[bool]) -> f64 {
    let (sum, count) = v.iter().zip(valid).filter(|(_, &ok)| ok).fold((0.0, 0usize), |(s, c), (&x, _)| (s + x, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgcore_config::{AnomalyThresholds, CellGeometry, ChannelThresholds, ConfigOptions, QcFlagConfig, QcThresholds};

    fn thresholds() -> ChannelThresholds {
        ChannelThresholds { min: -5.0, max: 40.0, spike_shallow: 0.02, spike_deep: 0.01, spike_depth_m: 100.0, noise_window: None, noise_sigma: 0.0 }
    }

    fn calibration() -> CalibrationSet {
        CalibrationSet {
            rho0: 1027.5,
            hd_a: 3.8,
            hd_b: 0.00655,
            hd_c: 9e-5,
            hd_s: 0.25,
            glider_length: 1.8,
            mass: 53.0,
            volmax: 52_000.0,
            temp_ref: 10.0,
            therm_expan: 7e-5,
            abs_compress: 1e-6,
            geometry: CellGeometry::default(),
            qc: QcThresholds {
                temp: thresholds(),
                cond: thresholds(),
                salin: thresholds(),
                bound_action: QcFlagConfig::Bad,
                spike_action: QcFlagConfig::ProbablyBad,
                overall_ctd_percentage: 20.0,
                overall_speed_percentage: 20.0,
            },
            anomaly: AnomalyThresholds::default(),
            options: ConfigOptions::default(),
            extra: Default::default(),
        }
    }

    fn inputs(n: usize) -> TsvInputs {
        TsvInputs {
            time_s: (0..n).map(|i| i as f64 * 2.0).collect(),
            pressure_dbar: (0..n).map(|i| i as f64 * 5.0).collect(),
            depth_m: (0..n).map(|i| i as f64 * 5.0).collect(),
            raw_temp_c: vec![12.0; n],
            raw_cond_s_m: vec![3.5; n],
            pitch_deg: vec![-20.0; n],
            attack_angle_deg: vec![2.0; n],
            leg: vec![Leg::Dive; n],
            manually_bad: vec![false; n],
            initial_buoyancy_g: vec![-200.0; n],
            is_pumped: false,
            pumped_u_f_cm_s: 0.0,
        }
    }

    #[test]
    fn too_few_valid_samples_errors() {
        let cal = calibration();
        let modes = ModeTableCache::builtin(0);
        let stall = StallConfig { min_stall_speed_cm_s: 1.0, max_stall_speed_cm_s: 60.0, min_stall_angle_deg: 5.0 };
        let mut inp = inputs(5);
        inp.manually_bad = vec![true, true, true, false, false];
        let result = run(&inp, &cal, &modes, &stall, true);
        assert!(matches!(result, Err(SolverError::TooFewValid)));
    }

    #[test]
    fn solver_runs_to_a_terminal_state_with_tmc_disabled() {
        let cal = calibration();
        let modes = ModeTableCache::builtin(0);
        let stall = StallConfig { min_stall_speed_cm_s: 1.0, max_stall_speed_cm_s: 60.0, min_stall_angle_deg: 5.0 };
        let inp = inputs(10);
        let out = run(&inp, &cal, &modes, &stall, true).expect("solver should not error with 10 valid samples");
        assert_eq!(out.speed_cm_s.len(), 10);
        assert!(out.tmc_disabled, "zero-mode cache means TMC is off from the first iteration");
        assert!(out.iterations >= 1);
    }
}
