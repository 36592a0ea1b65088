use seaglider_core::{process_dive, CtdQc, DiveInputs};
use sgcore_config::{AnomalyThresholds, CalibrationSet, CellGeometry, ChannelThresholds, ConfigOptions, QcFlagConfig, QcThresholds};
use sgcore_displacement::DacQc;
use sgcore_preflight::{GcRecord, GpsFix, GpsTriple};
use sgcore_thermal::ModeTableCache;

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

fn fix(t: f64, lat: f64, lon: f64, hdop: f64) -> GpsFix {
    GpsFix { time_s: t, lat_deg: lat, lon_deg: lon, hdop, error_m: 5.0, directive_bad: false }
}

/// A symmetric dive/climb profile: pressure ramps 0->200dbar over the dive
/// leg and back down over the climb leg, pitch flips sign at apogee.
fn straight_dive(n: usize) -> DiveInputs {
    let half = n / 2;
    let depth_counts: Vec<f64> = (0..n)
        .map(|i| if i <= half { (i as f64 / half as f64) * 200.0 } else { ((n - i) as f64 / half as f64) * 200.0 })
        .collect();
    let pitch_deg: Vec<f64> = (0..n).map(|i| if i <= half { -30.0 } else { 30.0 }).collect();
    let gcs = vec![
        GcRecord { pitch_motor_start_s: 0.0, pitch_motor_seconds: 5.0, vbd_motor_start_s: 0.0, vbd_motor_seconds: 10.0, vbd_pos_start_cc: 0.0, vbd_pos_end_cc: 100.0 },
        GcRecord {
            pitch_motor_start_s: (half as f64) * 2.0,
            pitch_motor_seconds: 5.0,
            vbd_motor_start_s: (half as f64) * 2.0,
            vbd_motor_seconds: 10.0,
            vbd_pos_start_cc: 100.0,
            vbd_pos_end_cc: 0.0,
        },
    ];
    DiveInputs {
        dive_number: 1,
        time_s: (0..n).map(|i| i as f64 * 2.0).collect(),
        depth_counts,
        depth_slope: 1.0,
        depth_intercept: 0.0,
        raw_temp_c: vec![10.0; n],
        raw_cond_s_m: vec![3.4754; n],
        pitch_deg,
        attack_angle_deg: vec![2.0; n],
        heading_deg: vec![90.0; n],
        gcs,
        gps: GpsTriple {
            gps1: fix(-120.0, 10.0, 20.0, 1.0),
            gps2: fix(0.0, 10.0, 20.0, 1.0),
            gpse: fix((n as f64) * 2.0, 10.0, 20.0, 1.0),
        },
        manually_bad: vec![false; n],
        is_pumped: false,
        pumped_u_f_cm_s: 0.0,
        directives_text: String::new(),
    }
}

#[test]
fn s1_synthetic_straight_dive_holds_temperature_and_salinity_steady() {
    let cal = calibration();
    let modes = ModeTableCache::builtin(0);
    let inputs = straight_dive(200);
    let outcome = process_dive(&inputs, &cal, &modes).expect("processing should not hard-error");

    assert!(!outcome.skipped_profile);
    assert_eq!(outcome.temp_c.len(), 200);
    for &t in &outcome.temp_c {
        assert!((t - 10.0).abs() < 0.5, "temperature should track the steady 10C input, got {t}");
    }
    assert_eq!(outcome.ctd_qc, CtdQc::Good);
    assert!(outcome.dac_east_cm_s.abs() < 5.0, "GPS2≈GPSE should yield a near-zero DAC, got {}", outcome.dac_east_cm_s);
}

#[test]
fn s4_bad_gps2_forces_non_good_displacement_without_touching_ctd() {
    let cal = calibration();
    let modes = ModeTableCache::builtin(0);
    let mut inputs = straight_dive(200);
    inputs.gps.gps2 = fix(0.0, 10.0, 20.0, 99.0);

    let outcome = process_dive(&inputs, &cal, &modes).expect("processing should not hard-error");
    assert_eq!(outcome.ctd_qc, CtdQc::Good, "GPS quality should not affect the CTD channel");
    assert_eq!(outcome.temp_c.len(), 200);
    assert_eq!(outcome.dac_qc, DacQc::Bad, "an invalid GPS2 fix must force the DAC quality to Bad");
}

#[test]
fn s5_skip_profile_directive_short_circuits_all_corrections() {
    let cal = calibration();
    let modes = ModeTableCache::builtin(0);
    let mut inputs = straight_dive(50);
    inputs.directives_text = "* skip_profile\n".to_string();

    let outcome = process_dive(&inputs, &cal, &modes).expect("a skip is not a hard error");
    assert!(outcome.skipped_profile);
    assert!(outcome.temp_c.is_empty());
    assert!(outcome.log.is_empty(), "a skipped profile should not accumulate any QC log entries");
}

#[test]
fn s6_degenerate_hd_b_does_not_hard_error_and_reports_a_terminal_state() {
    let mut cal = calibration();
    cal.hd_b = 1e-12;
    let modes = ModeTableCache::builtin(0);
    let inputs = straight_dive(60);

    let outcome = process_dive(&inputs, &cal, &modes).expect("non-convergence must surface on DiveOutcome, not as Err");
    assert_eq!(outcome.temp_c.len(), 60);
    assert!(!outcome.skipped_profile);
}

#[test]
fn near_surface_conductivity_dropout_is_flagged_bad_and_nans_the_salinity() {
    let cal = calibration();
    let modes = ModeTableCache::builtin(0);
    let mut inputs = straight_dive(200);
    // first 3 samples near the surface: a sharp C dropout then recovery,
    // stable temperature, matching S3's bubble signature.
    inputs.raw_cond_s_m[0] = 3.4754;
    inputs.raw_cond_s_m[1] = 1.4754;
    inputs.raw_cond_s_m[2] = 3.4754;

    let outcome = process_dive(&inputs, &cal, &modes).expect("processing should not hard-error");
    assert!(outcome.cond_qc[1] != sgcore_core::qcflag::QcFlag::Good, "the dropout sample should not be marked good");
}
