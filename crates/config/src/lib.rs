//! Typed calibration and configuration models for one dive's processing run.
//!
//! The upstream source keeps calibration constants as a flat string->float
//! mapping read from an INI-like file; we keep the documented keys as typed
//! fields (see `SPEC_FULL.md` Design Note "Heterogeneous calibration
//! mapping") and collect anything else into `extra`, so forward-compatible
//! keys are not silently dropped.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use sgcore_core::qcflag::QcFlag;
use thiserror::Error;

/// Conductivity cell and thermistor geometry, all in metres.
#[derive(Debug, Clone, Deserialize)]
pub struct CellGeometry {
    pub mouth_radius_m: f64,
    pub narrow_radius_m: f64,
    pub cell_length_m: f64,
    /// Thermistor position relative to the glider's reference frame.
    pub glider_xt_m: f64,
    pub glider_zt_m: f64,
    /// Pressure sensor position relative to the glider's reference frame.
    pub glider_xp_m: f64,
    pub glider_zp_m: f64,
}

impl Default for CellGeometry {
    fn default() -> Self {
        CellGeometry {
            mouth_radius_m: 6.5e-3,
            narrow_radius_m: 3.0e-3,
            cell_length_m: 0.09,
            glider_xt_m: 0.0,
            glider_zt_m: 0.0,
            glider_xp_m: 0.0,
            glider_zp_m: 0.0,
        }
    }
}

/// QC bound/spike/noise thresholds, one set per channel (temperature,
/// conductivity, salinity).
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelThresholds {
    pub min: f64,
    pub max: f64,
    pub spike_shallow: f64,
    pub spike_deep: f64,
    pub spike_depth_m: f64,
    /// Window half-width (samples) for the optional noise check; `None`
    /// disables it (the default for non-oversampled sensors).
    #[serde(default)]
    pub noise_window: Option<usize>,
    #[serde(default)]
    pub noise_sigma: f64,
}

/// All `QC_*` thresholds plus the shared bound/spike actions.
#[derive(Debug, Clone, Deserialize)]
pub struct QcThresholds {
    pub temp: ChannelThresholds,
    pub cond: ChannelThresholds,
    pub salin: ChannelThresholds,
    #[serde(default = "default_bound_action")]
    pub bound_action: QcFlagConfig,
    #[serde(default = "default_spike_action")]
    pub spike_action: QcFlagConfig,
    #[serde(default = "default_overall_pct")]
    pub overall_ctd_percentage: f64,
    #[serde(default = "default_overall_pct")]
    pub overall_speed_percentage: f64,
}

fn default_overall_pct() -> f64 {
    20.0
}

/// A serde-friendly mirror of `sgcore_core::qcflag::QcFlag`, restricted to
/// the subset the configuration schema allows as an action (`§6`:
/// `{GOOD, PROBABLY_GOOD, PROBABLY_BAD, BAD, INTERPOLATED}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum QcFlagConfig {
    Good,
    ProbablyGood,
    ProbablyBad,
    Bad,
    Interpolated,
}

impl From<QcFlagConfig> for QcFlag {
    fn from(v: QcFlagConfig) -> Self {
        match v {
            QcFlagConfig::Good => QcFlag::Good,
            QcFlagConfig::ProbablyGood => QcFlag::ProbablyGood,
            QcFlagConfig::ProbablyBad => QcFlag::ProbablyBad,
            QcFlagConfig::Bad => QcFlag::Bad,
            QcFlagConfig::Interpolated => QcFlag::Interpolated,
        }
    }
}

fn default_bound_action() -> QcFlagConfig {
    QcFlagConfig::Bad
}

fn default_spike_action() -> QcFlagConfig {
    QcFlagConfig::ProbablyBad
}

/// Conductivity-anomaly ("bubble"/"snot") scanner thresholds. Defaults are
/// the empirically-tuned constants the source notes as justified only by
/// field experience (`SPEC_FULL.md` Open Questions).
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyThresholds {
    #[serde(default = "default_air_bubble_threshold")]
    pub air_bubble_threshold: f64,
    #[serde(default = "default_surface_bubble_factor")]
    pub surface_bubble_factor: f64,
    #[serde(default = "default_anomaly_diff_factor")]
    pub anomaly_diff_factor: f64,
    #[serde(default = "default_thermocline_temp_diff")]
    pub thermocline_temp_diff: f64,
    #[serde(default = "default_allowable_cond_anomaly_distance")]
    pub allowable_cond_anomaly_distance_m: f64,
    #[serde(default = "default_acceptable_anomaly_threshold")]
    pub acceptable_anomaly_threshold: f64,
    #[serde(default = "default_suspect_snot")]
    pub suspect_snot: f64,
    /// Largest gap (cc) tolerated between one GC move's commanded end
    /// position and the next move's start position before `detect_vbd_bleed`
    /// flags a suspected bladder leak.
    #[serde(default = "default_vbd_bleed_tolerance_cc")]
    pub vbd_bleed_tolerance_cc: f64,
}

fn default_air_bubble_threshold() -> f64 {
    0.7
}
fn default_surface_bubble_factor() -> f64 {
    1.5
}
fn default_anomaly_diff_factor() -> f64 {
    0.25
}
fn default_thermocline_temp_diff() -> f64 {
    0.1
}
fn default_allowable_cond_anomaly_distance() -> f64 {
    50.0
}
fn default_acceptable_anomaly_threshold() -> f64 {
    0.7
}
fn default_suspect_snot() -> f64 {
    1.2
}
fn default_vbd_bleed_tolerance_cc() -> f64 {
    15.0
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        AnomalyThresholds {
            air_bubble_threshold: default_air_bubble_threshold(),
            surface_bubble_factor: default_surface_bubble_factor(),
            anomaly_diff_factor: default_anomaly_diff_factor(),
            thermocline_temp_diff: default_thermocline_temp_diff(),
            allowable_cond_anomaly_distance_m: default_allowable_cond_anomaly_distance(),
            acceptable_anomaly_threshold: default_acceptable_anomaly_threshold(),
            suspect_snot: default_suspect_snot(),
            vbd_bleed_tolerance_cc: default_vbd_bleed_tolerance_cc(),
        }
    }
}

/// Number of precomputed radial heat-transfer modes used by the thermal
/// boundary correction; `Zero` disables the correction (TMC off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ThermalModes {
    Zero,
    One,
    Three,
    Five,
}

impl ThermalModes {
    pub fn count(self) -> usize {
        match self {
            ThermalModes::Zero => 0,
            ThermalModes::One => 1,
            ThermalModes::Three => 3,
            ThermalModes::Five => 5,
        }
    }
}

/// Pressure/compass/attitude source selection and other `§6` configuration
/// switches.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigOptions {
    #[serde(default)]
    pub sbect_modes: ThermalModesOrDefault,
    #[serde(default)]
    pub use_auxpressure: bool,
    #[serde(default)]
    pub use_auxcompass: bool,
    #[serde(default)]
    pub use_adcppressure: bool,
    #[serde(default)]
    pub solve_flare_apogee_speed: bool,
    #[serde(default)]
    pub use_averaged_speeds: bool,
    /// RBR Legato pressure-compensation tuning; see Open Questions on the
    /// empirical quadratic term.
    #[serde(default)]
    pub legato_pressure_quadratic_term: bool,
    /// `GpsTriple::validate` HDOP/error gates, §4.1 step 6 / §4.7 quality
    /// gates.
    #[serde(default = "default_gps_hdop_threshold")]
    pub gps_hdop_threshold: f64,
    #[serde(default = "default_gps_max_error_m")]
    pub gps_max_error_m: f64,
}

fn default_gps_hdop_threshold() -> f64 {
    20.0
}
fn default_gps_max_error_m() -> f64 {
    50.0
}

/// Wrapper so `ThermalModes` can implement a useful zero-arg `Default`
/// (`Five`, matching the upstream default processing configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ThermalModesOrDefault(pub ThermalModes);

impl Default for ThermalModesOrDefault {
    fn default() -> Self {
        ThermalModesOrDefault(ThermalModes::Five)
    }
}

impl Default for ConfigOptions {
    fn default() -> Self {
        ConfigOptions {
            sbect_modes: ThermalModesOrDefault::default(),
            use_auxpressure: false,
            use_auxcompass: false,
            use_adcppressure: false,
            solve_flare_apogee_speed: false,
            use_averaged_speeds: false,
            legato_pressure_quadratic_term: false,
            gps_hdop_threshold: default_gps_hdop_threshold(),
            gps_max_error_m: default_gps_max_error_m(),
        }
    }
}

/// The required calibration constants of `§6`, plus the nested geometry,
/// QC and anomaly threshold groups, plus a fallback bag for anything not
/// in this schema.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationSet {
    pub rho0: f64,
    pub hd_a: f64,
    pub hd_b: f64,
    pub hd_c: f64,
    pub hd_s: f64,
    pub glider_length: f64,
    pub mass: f64,
    pub volmax: f64,
    pub temp_ref: f64,
    pub therm_expan: f64,
    pub abs_compress: f64,
    #[serde(default)]
    pub geometry: CellGeometry,
    pub qc: QcThresholds,
    #[serde(default)]
    pub anomaly: AnomalyThresholds,
    #[serde(default)]
    pub options: ConfigOptions,
    #[serde(default)]
    pub extra: HashMap<String, f64>,
}

/// Errors while loading a `CalibrationSet` from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read calibration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML calibration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse TOML calibration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Load a `CalibrationSet` from a YAML or TOML file, chosen by extension.
pub fn load_calibration<P: AsRef<Path>>(path: P) -> Result<CalibrationSet, ConfigError> {
    let path = path.as_ref();
    if path.extension().map(|e| e == "toml").unwrap_or(false) {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    } else {
        let reader = File::open(path)?;
        Ok(serde_yaml::from_reader(reader)?)
    }
}
