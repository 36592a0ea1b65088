//! Per-dive processing facade: sequences pre-flight conditioning, raw QC,
//! the TSV iterative solver and displacement/DAC into one `process_dive`
//! call.
//!
//! Dive-local failures (non-convergence, a too-thin valid set, a requested
//! skip) are never propagated as `Err` — they surface as fields on
//! `DiveOutcome`. `DiveError` is reserved for failures that make it
//! impossible to even produce a skipped-profile outcome (`SPEC_FULL.md` §7).

use sgcore_config::CalibrationSet;
use sgcore_core::qcflag::QcFlag;
use sgcore_directives::{DiveContext, ProfileDirectives};
use sgcore_flight::StallConfig;
use sgcore_preflight::{GcRecord, GpsTriple};
use sgcore_qc::QcSeries;
use sgcore_solver::{Leg, TsvInputs};
use sgcore_tracelog::ProcessingLog;
use thiserror::Error;

/// Raw engineering telemetry for one dive/climb cycle, on a shared
/// measurement-time grid.
#[derive(Debug, Clone)]
pub struct DiveInputs {
    pub dive_number: i64,
    pub time_s: Vec<f64>,
    pub depth_counts: Vec<f64>,
    pub depth_slope: f64,
    pub depth_intercept: f64,
    pub raw_temp_c: Vec<f64>,
    pub raw_cond_s_m: Vec<f64>,
    pub pitch_deg: Vec<f64>,
    pub attack_angle_deg: Vec<f64>,
    /// Compass heading, degrees true. Carried through unmodified; heading
    /// correction against a compass calibration is out of scope here.
    pub heading_deg: Vec<f64>,
    pub gcs: Vec<GcRecord>,
    pub gps: GpsTriple,
    pub manually_bad: Vec<bool>,
    pub is_pumped: bool,
    pub pumped_u_f_cm_s: f64,
    pub directives_text: String,
}

/// Scalar verdicts reported alongside the corrected vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtdQc {
    Good,
    ProbablyGood,
    Bad,
}

/// The pure-function output of one `process_dive` call.
#[derive(Debug, Clone)]
pub struct DiveOutcome {
    pub dive_number: i64,
    pub temp_c: Vec<f64>,
    pub cond_s_m: Vec<f64>,
    pub salinity: Vec<f64>,
    pub speed_cm_s: Vec<f64>,
    pub temp_qc: Vec<QcFlag>,
    pub cond_qc: Vec<QcFlag>,
    pub salin_qc: Vec<QcFlag>,
    pub dac_east_cm_s: f64,
    pub dac_north_cm_s: f64,
    pub lat_deg: Vec<f64>,
    pub lon_deg: Vec<f64>,
    pub ctd_qc: CtdQc,
    pub dac_qc: sgcore_displacement::DacQc,
    pub converged: bool,
    pub skipped_profile: bool,
    pub processing_error: Option<String>,
    pub suggestions: Vec<String>,
    pub log: ProcessingLog,
}

/// Non-dive-local failures: a malformed calibration or a directives file
/// the total parser could not even reduce to zero-or-more lines.
#[derive(Debug, Error)]
pub enum DiveError {
    #[error("input missing or inconsistent: {0}")]
    InputMissing(String),
    #[error("displacement stage failed: {0}")]
    Displacement(#[from] sgcore_displacement::DisplacementError),
}

/// Run the full per-dive pipeline: `[A]` pre-flight conditioning, `[B]` raw
/// QC and directive application, `[C]`/`[D]` the TSV solver, `[E]`
/// displacement/DAC, and `[F]` final QC reconciliation.
pub fn process_dive(
    inputs: &DiveInputs,
    cal: &CalibrationSet,
    modes: &sgcore_thermal::ModeTableCache,
) -> Result<DiveOutcome, DiveError> {
    let mut log = ProcessingLog::new();
    let mut suggestions = Vec::new();

    let directives = ProfileDirectives::parse(&inputs.directives_text);
    if directives.wants_skip(inputs.dive_number) {
        log::info!("dive {}: skip_profile directive matched, skipping", inputs.dive_number);
        return Ok(skipped_outcome(inputs, log));
    }

    if inputs.time_s.is_empty() {
        return Err(DiveError::InputMissing("time_s is empty".to_string()));
    }

    let pressure_dbar = sgcore_preflight::pressure_from_depth_counts(&inputs.depth_counts, inputs.depth_slope, inputs.depth_intercept, None, None);
    let (mean_lat, _mean_lon) = inputs.gps.mean_lat_lon();
    let depth_m = sgcore_preflight::depth_from_pressure(&pressure_dbar, mean_lat);

    let Some(events) = sgcore_preflight::extract_events(&inputs.gcs, &inputs.time_s, &inputs.pitch_deg) else {
        log::warn!("dive {}: could not extract GC event anchors, treating dive as non-convergent", inputs.dive_number);
        return Ok(non_convergent_outcome(inputs, log, "no GC event anchors found".to_string()));
    };

    let mut temp = QcSeries::new(inputs.raw_temp_c.clone());
    let mut cond = QcSeries::new(inputs.raw_cond_s_m.clone());
    let mut salin = QcSeries::new(vec![35.0; inputs.time_s.len()]);

    sgcore_qc::checks::bounds(&mut temp, &cal.qc.temp, cal.qc.bound_action);
    sgcore_qc::checks::bounds(&mut cond, &cal.qc.cond, cal.qc.bound_action);
    sgcore_qc::checks::spike(&mut temp, &depth_m, &cal.qc.temp, cal.qc.spike_action);
    sgcore_qc::checks::spike(&mut cond, &depth_m, &cal.qc.cond, cal.qc.spike_action);

    let mut ctx = DiveContext::new();
    ctx.register("depth", depth_m.clone());
    ctx.register("time", inputs.time_s.clone());
    ctx.register("data_points", (0..inputs.time_s.len()).map(|i| i as f64).collect());
    ctx.register(
        "dive_depth",
        depth_m.iter().enumerate().map(|(i, &d)| if i < events.start_of_climb_i { d } else { f64::NAN }).collect(),
    );
    ctx.register(
        "climb_depth",
        depth_m.iter().enumerate().map(|(i, &d)| if i >= events.start_of_climb_i { d } else { f64::NAN }).collect(),
    );
    if let Ok(directed_bad) = sgcore_directives::eval_function(&directives, inputs.dive_number, "bad_temperature", &ctx) {
        temp.qc_mut().assert_at(QcFlag::Bad, directed_bad);
    }
    if let Ok(directed_bad) = sgcore_directives::eval_function(&directives, inputs.dive_number, "bad_conductivity", &ctx) {
        cond.qc_mut().assert_at(QcFlag::Bad, directed_bad);
    }

    if !directives.is_disabled(inputs.dive_number, "detect_conductivity_anomalies") {
        let (applied, suspect) = sgcore_qc::anomaly::cond_anomaly(
            temp.values(),
            cond.values(),
            &depth_m,
            events.start_of_climb_i,
            depth_m.get(events.flare_i).copied().unwrap_or(0.0),
            depth_m.first().copied().unwrap_or(0.0),
            &cal.anomaly,
        );
        for a in &applied {
            let indices: Vec<usize> = (a.first_point..=a.last_point).collect();
            cond.qc_mut().assert_at(a.verdict, indices.clone());
            log.record(format!("conductivity anomaly ({:?}, {:?})", a.resolution, a.leg), a.verdict, &indices);
        }
        for a in &suspect {
            suggestions.push(format!(
                "suspect conductivity anomaly ({:?}) between samples {} and {}: consider a manual bad_conductivity directive",
                a.resolution, a.first_point, a.last_point
            ));
        }
    }

    if !directives.is_disabled(inputs.dive_number, "detect_vbd_bleed")
        && sgcore_preflight::vbd_bleed_suspected(&inputs.gcs, cal.anomaly.vbd_bleed_tolerance_cc)
    {
        suggestions.push(
            "vbd bleed suspected: a GC move's start position did not match the prior move's commanded end position within tolerance".to_string(),
        );
    }

    sgcore_qc::reconcile::inherit_ctd(&mut temp, &mut cond, &mut salin);

    let manually_bad: Vec<bool> = (0..inputs.time_s.len())
        .map(|i| inputs.manually_bad[i] || temp.qc().get(i).is_terminal_bad() || cond.qc().get(i).is_terminal_bad())
        .collect();

    let leg: Vec<Leg> = (0..inputs.time_s.len()).map(|i| if i < events.start_of_climb_i { Leg::Dive } else { Leg::Climb }).collect();

    // A rough first buoyancy estimate from raw temperature and an assumed
    // 35 PSU salinity, seeding the solver's first iteration instead of 0.
    let initial_buoyancy_g: Vec<f64> = (0..inputs.time_s.len())
        .map(|i| {
            let volume_cc =
                sgcore_thermal::density::hull_volume_cc(cal.volmax, cal.abs_compress, cal.therm_expan, pressure_dbar[i], inputs.raw_temp_c[i], cal.temp_ref);
            let rho = sgcore_core::seawater::density(35.0, inputs.raw_temp_c[i], pressure_dbar[i]);
            sgcore_thermal::density::buoyancy_g(rho, volume_cc, cal.mass)
        })
        .collect();

    let tsv_inputs = TsvInputs {
        time_s: inputs.time_s.clone(),
        pressure_dbar: pressure_dbar.clone(),
        depth_m: depth_m.clone(),
        raw_temp_c: temp.values().to_vec(),
        raw_cond_s_m: cond.values().to_vec(),
        pitch_deg: inputs.pitch_deg.clone(),
        attack_angle_deg: inputs.attack_angle_deg.clone(),
        leg,
        manually_bad,
        initial_buoyancy_g,
        is_pumped: inputs.is_pumped,
        pumped_u_f_cm_s: inputs.pumped_u_f_cm_s,
    };

    let stall = StallConfig { min_stall_speed_cm_s: 1.0, max_stall_speed_cm_s: 60.0, min_stall_angle_deg: 5.0 };
    let tmc_requested = !directives.is_disabled(inputs.dive_number, "correct_thermal_inertia_effects");

    let tsv = match sgcore_solver::run(&tsv_inputs, cal, modes, &stall, tmc_requested) {
        Ok(out) => out,
        Err(sgcore_solver::SolverError::TooFewValid) => {
            return Ok(non_convergent_outcome(inputs, log, "fewer than 3 valid samples after reduction".to_string()));
        }
    };

    if !tsv.converged {
        suggestions.push("skip_profile: TSV solver did not converge".to_string());
    }
    if tsv.tmc_disabled {
        suggestions.push("high temperature correction: thermal-mass correction was disabled after non-convergence".to_string());
    }

    for (i, &v) in tsv.valid.iter().enumerate() {
        if !v {
            temp.qc_mut().assert_at(QcFlag::Bad, [i]);
            cond.qc_mut().assert_at(QcFlag::Bad, [i]);
            salin.qc_mut().assert_at(QcFlag::Bad, [i]);
        }
    }

    let gps_validity = inputs.gps.validate(cal.options.gps_hdop_threshold, cal.options.gps_max_error_m);
    let gps2 = sgcore_displacement::Fix {
        lat_deg: inputs.gps.gps2.lat_deg,
        lon_deg: inputs.gps.gps2.lon_deg,
        time_s: inputs.gps.gps2.time_s,
        valid: gps_validity.gps2_ok,
    };
    let gpse = sgcore_displacement::Fix {
        lat_deg: inputs.gps.gpse.lat_deg,
        lon_deg: inputs.gps.gpse.lon_deg,
        time_s: inputs.gps.gpse.time_s,
        valid: gps_validity.gpse_ok,
    };

    let n = inputs.time_s.len();
    let unmodelled_time_fraction = tsv.valid.iter().filter(|&&v| !v).count() as f64 / n.max(1) as f64;
    let upwelling_sample_fraction = (0..n)
        .filter(|&i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n - 1);
            let dt = inputs.time_s[hi] - inputs.time_s[lo];
            let measured_w = if hi != lo && dt.abs() > 1e-9 { (depth_m[hi] - depth_m[lo]) / dt * 100.0 } else { 0.0 };
            let modelled_w = tsv.speed_cm_s[i] * tsv.theta_rad[i].sin();
            measured_w != 0.0 && modelled_w != 0.0 && measured_w.signum() != modelled_w.signum()
        })
        .count() as f64
        / n.max(1) as f64;
    let quality = sgcore_displacement::DacQualityInputs {
        bad_hdm_qc: !tsv.converged,
        unmodelled_time_fraction,
        upwelling_sample_fraction,
        gps_error_m: inputs.gps.gps2.error_m.max(inputs.gps.gpse.error_m),
        ..Default::default()
    };

    let displacement = match sgcore_displacement::solve_dac(&inputs.time_s, &tsv.speed_cm_s, &inputs.heading_deg, gps2, gpse, 0.0, &quality) {
        Ok(d) => d,
        Err(sgcore_displacement::DisplacementError::TooFewSamples) => {
            return Ok(non_convergent_outcome(inputs, log, "fewer than 2 samples for displacement integration".to_string()));
        }
    };

    let ctd_qc = overall_ctd_qc(&temp, &cond, &salin, cal.qc.overall_ctd_percentage);

    Ok(DiveOutcome {
        dive_number: inputs.dive_number,
        temp_c: temp.finalized_values(),
        cond_s_m: cond.finalized_values(),
        salinity: salin.finalized_values(),
        speed_cm_s: tsv.speed_cm_s,
        temp_qc: qc_vec(&temp),
        cond_qc: qc_vec(&cond),
        salin_qc: qc_vec(&salin),
        dac_east_cm_s: displacement.dac_east_cm_s,
        dac_north_cm_s: displacement.dac_north_cm_s,
        lat_deg: displacement.lat_deg,
        lon_deg: displacement.lon_deg,
        ctd_qc,
        dac_qc: displacement.dac_qc,
        converged: tsv.converged,
        skipped_profile: false,
        processing_error: None,
        suggestions,
        log,
    })
}

fn qc_vec(series: &QcSeries) -> Vec<QcFlag> {
    (0..series.len()).map(|i| series.qc().get(i)).collect()
}

fn overall_ctd_qc(temp: &QcSeries, cond: &QcSeries, salin: &QcSeries, percentage_threshold: f64) -> CtdQc {
    let n = temp.len().max(1);
    let bad_count = (0..n)
        .filter(|&i| temp.qc().get(i).is_terminal_bad() || cond.qc().get(i).is_terminal_bad() || salin.qc().get(i).is_terminal_bad())
        .count();
    let bad_pct = 100.0 * bad_count as f64 / n as f64;
    if bad_pct > 2.0 * percentage_threshold {
        CtdQc::Bad
    } else if bad_pct > percentage_threshold {
        CtdQc::ProbablyGood
    } else {
        CtdQc::Good
    }
}

fn skipped_outcome(inputs: &DiveInputs, log: ProcessingLog) -> DiveOutcome {
    DiveOutcome {
        dive_number: inputs.dive_number,
        temp_c: Vec::new(),
        cond_s_m: Vec::new(),
        salinity: Vec::new(),
        speed_cm_s: Vec::new(),
        temp_qc: Vec::new(),
        cond_qc: Vec::new(),
        salin_qc: Vec::new(),
        dac_east_cm_s: 0.0,
        dac_north_cm_s: 0.0,
        lat_deg: Vec::new(),
        lon_deg: Vec::new(),
        ctd_qc: CtdQc::Bad,
        dac_qc: sgcore_displacement::DacQc::Bad,
        converged: false,
        skipped_profile: true,
        processing_error: None,
        suggestions: Vec::new(),
        log,
    }
}

fn non_convergent_outcome(inputs: &DiveInputs, log: ProcessingLog, reason: String) -> DiveOutcome {
    DiveOutcome {
        dive_number: inputs.dive_number,
        temp_c: inputs.raw_temp_c.clone(),
        cond_s_m: inputs.raw_cond_s_m.clone(),
        salinity: vec![f64::NAN; inputs.time_s.len()],
        speed_cm_s: vec![f64::NAN; inputs.time_s.len()],
        temp_qc: vec![QcFlag::Bad; inputs.time_s.len()],
        cond_qc: vec![QcFlag::Bad; inputs.time_s.len()],
        salin_qc: vec![QcFlag::Bad; inputs.time_s.len()],
        dac_east_cm_s: 0.0,
        dac_north_cm_s: 0.0,
        lat_deg: Vec::new(),
        lon_deg: Vec::new(),
        ctd_qc: CtdQc::Bad,
        dac_qc: sgcore_displacement::DacQc::Bad,
        converged: false,
        skipped_profile: false,
        processing_error: Some(reason),
        suggestions: Vec::new(),
        log,
    }
}

/// Returns the version of this facade crate, for smoke tests.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgcore_config::{AnomalyThresholds, CellGeometry, ChannelThresholds, ConfigOptions, QcFlagConfig, QcThresholds};
    use sgcore_preflight::{GcRecord, GpsFix, GpsTriple};

    fn thresholds() -> ChannelThresholds {
        ChannelThresholds { min: -5.0, max: 40.0, spike_shallow: 0.2, spike_deep: 0.1, spike_depth_m: 100.0, noise_window: None, noise_sigma: 0.0 }
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

    fn sample_inputs(n: usize) -> DiveInputs {
        let gcs = vec![
            GcRecord { pitch_motor_start_s: 0.0, pitch_motor_seconds: 5.0, vbd_motor_start_s: 0.0, vbd_motor_seconds: 10.0, vbd_pos_start_cc: 0.0, vbd_pos_end_cc: 100.0 },
            GcRecord { pitch_motor_start_s: 800.0, pitch_motor_seconds: 5.0, vbd_motor_start_s: 800.0, vbd_motor_seconds: 10.0, vbd_pos_start_cc: 100.0, vbd_pos_end_cc: 0.0 },
        ];
        let fix = |t, lat, lon| GpsFix { time_s: t, lat_deg: lat, lon_deg: lon, hdop: 1.0, error_m: 5.0, directive_bad: false };
        DiveInputs {
            dive_number: 1,
            time_s: (0..n).map(|i| i as f64 * 2.0).collect(),
            depth_counts: (0..n).map(|i| i as f64).collect(),
            depth_slope: 1.0,
            depth_intercept: 0.0,
            raw_temp_c: vec![12.0; n],
            raw_cond_s_m: vec![3.5; n],
            pitch_deg: (0..n).map(|i| if i * 2 < 800 { -20.0 } else { 20.0 }).collect(),
            attack_angle_deg: vec![2.0; n],
            heading_deg: vec![90.0; n],
            gcs,
            gps: GpsTriple { gps1: fix(-100.0, 10.0, 20.0), gps2: fix(0.0, 10.0, 20.0), gpse: fix((n as f64) * 2.0, 10.001, 20.001) },
            manually_bad: vec![false; n],
            is_pumped: false,
            pumped_u_f_cm_s: 0.0,
            directives_text: String::new(),
        }
    }

    #[test]
    fn skip_profile_directive_short_circuits_processing() {
        let cal = calibration();
        let modes = sgcore_thermal::ModeTableCache::builtin(0);
        let mut inputs = sample_inputs(10);
        inputs.directives_text = "* skip_profile\n".to_string();
        let outcome = process_dive(&inputs, &cal, &modes).unwrap();
        assert!(outcome.skipped_profile);
    }

    #[test]
    fn empty_time_series_is_input_missing() {
        let cal = calibration();
        let modes = sgcore_thermal::ModeTableCache::builtin(0);
        let mut inputs = sample_inputs(0);
        inputs.time_s.clear();
        let result = process_dive(&inputs, &cal, &modes);
        assert!(matches!(result, Err(DiveError::InputMissing(_))));
    }

    #[test]
    fn a_reasonable_dive_produces_a_terminal_outcome() {
        let cal = calibration();
        let modes = sgcore_thermal::ModeTableCache::builtin(0);
        let inputs = sample_inputs(500);
        let outcome = process_dive(&inputs, &cal, &modes).expect("should not hard-error");
        assert_eq!(outcome.temp_c.len(), 500);
        assert_eq!(outcome.dive_number, 1);
    }
}
