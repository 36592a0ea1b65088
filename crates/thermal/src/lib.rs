//! Thermal-inertia correction of `SPEC_FULL.md` §4.6 (b)-(i): viscosity,
//! cell-flush model, transit volumes, tube-average temperature, modal
//! thermal-boundary correction, salinity recovery, TS-interpolation and
//! density/buoyancy. The outer iterate-to-convergence loop lives in
//! `sgcore_solver`; this crate is the pure per-iteration physics.

use sgcore_config::CellGeometry;
use sgcore_core::{numeric, pchip, seawater};

const KAPPA_THERMAL_DIFFUSIVITY: f64 = 1.45e-7; // m^2/s

/// Dynamic viscosity, kinematic viscosity and Prandtl number at `rho0`.
pub fn viscosity_prandtl(t_c: f64, rho0: f64) -> (f64, f64, f64) {
    let mu = 1.88e-3 / (1.0 + 0.03222 * t_c + 0.0002377 * t_c * t_c);
    let nu = mu / rho0;
    let pr = nu / KAPPA_THERMAL_DIFFUSIVITY;
    (mu, nu, pr)
}

/// Cell-flush model: tube flow speed inside the conductivity cell.
pub mod flush {
    use super::*;

    /// Speed at the CT sensor, attenuated from glider speed by pitch.
    pub fn sensor_speed(glider_speed_cm_s: &[f64], pitch_deg: &[f64]) -> Vec<f64> {
        glider_speed_cm_s
            .iter()
            .zip(pitch_deg)
            .map(|(&u, &p)| u * p.to_radians().cos().abs().max(0.05))
            .collect()
    }

    /// Attack angle at the sensor, a linear regression of glider attack
    /// angle (coefficient chosen to match the CT's mounting geometry).
    pub fn sensor_attack_angle(attack_angle_deg: &[f64], regression_slope: f64) -> Vec<f64> {
        attack_angle_deg.iter().map(|&a| a * regression_slope).collect()
    }

    /// Cell drag coefficient, linearly de-rated by sensor attack angle.
    pub fn cell_drag(cd0: f64, cd0_ref: f64, alpha_sensor_deg: f64) -> f64 {
        cd0 * (1.0 - 0.0074 * alpha_sensor_deg / cd0_ref)
    }

    /// Unpumped tube flow speed: the CCE (Chelton-Clare-Emery) blend of
    /// free-stream sensor speed and a viscous correction, `n = 1.5`.
    pub fn unpumped_tube_flow(u_sensor_cm_s: f64, nu_m2_s: f64, glider_length_m: f64, narrow_radius_m: f64, cd: f64) -> f64 {
        if u_sensor_cm_s.abs() < 1e-9 || cd <= 0.0 {
            return 0.0;
        }
        let n = 1.5;
        let u_sensor_m_s = u_sensor_cm_s / 100.0;
        let inner = (16.0 * glider_length_m * nu_m2_s / (narrow_radius_m * narrow_radius_m * cd * u_sensor_m_s)).abs();
        (u_sensor_m_s * (1.0 + inner.powf(n)).powf(-1.0 / n)) * 100.0
    }

    /// Pumped (GPCTD) tube flow: fixed at the pump rate.
    ///
    // TODO(open question): the pumped-GPCTD path reuses the unpumped cell
    // model below with `u_f` pinned to the pump rate; upstream notes this
    // is "unlikely to be correct" but keeps it for continuity with existing
    // profiles. Preserved here, with a warning at the call site.
    pub fn pumped_tube_flow(pump_rate_cm_s: f64) -> f64 {
        log::warn!("pumped-GPCTD cell-flush model reuses the unpumped formulation with a fixed u_f; known-suspect per upstream notes");
        pump_rate_cm_s
    }
}

/// Transit-volume bookkeeping: find, for each of 6 equi-spaced tube
/// segments, the time at which that segment's water was ingested.
pub mod transit {
    use super::*;

    /// Cumulative ingested volume at each sample, via the narrow-bore
    /// cross-section times tube-flow speed, trapezoidally integrated.
    pub fn cumulative_volume(time_s: &[f64], u_f_cm_s: &[f64], narrow_radius_m: f64) -> Vec<f64> {
        let area_m2 = std::f64::consts::PI * narrow_radius_m * narrow_radius_m;
        let mut vol = vec![0.0; time_s.len()];
        for i in 1..time_s.len() {
            let dt = time_s[i] - time_s[i - 1];
            let q0 = area_m2 * (u_f_cm_s[i - 1] / 100.0);
            let q1 = area_m2 * (u_f_cm_s[i] / 100.0);
            vol[i] = vol[i - 1] + 0.5 * (q0 + q1) * dt;
        }
        vol
    }

    /// For sample `i`, the ingest time of the water now at segment `k` of
    /// `n_segments` (1-indexed from the cell mouth), via monotonic inverse
    /// interpolation of cumulative volume against time.
    pub fn segment_ingest_time(time_s: &[f64], vol_ec: &[f64], cell_volume_m3: f64, i: usize, k: usize, n_segments: usize) -> f64 {
        let vol_segment = cell_volume_m3 * (k as f64) / (n_segments as f64);
        let target = vol_ec[i] - vol_segment;
        // vol_ec is non-decreasing; invert via linear search + lerp.
        numeric::interp1(vol_ec, time_s, target)
    }
}

/// Tube-average temperature `T_a` and sampling time `t_a` (§4.6 (e)).
pub fn tube_average_temperature(
    time_s: &[f64],
    thermistor_temp: &[f64],
    vol_ec: &[f64],
    cell_volume_m3: f64,
    tau1_s: &[f64],
    n_segments: usize,
) -> (Vec<f64>, Vec<f64>) {
    let n = time_s.len();
    let mut t_a = vec![f64::NAN; n];
    let mut t_sample = vec![f64::NAN; n];

    for i in 0..n {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut ingest_times = Vec::with_capacity(n_segments);
        for k in 1..=n_segments {
            let t_ingest = transit::segment_ingest_time(time_s, vol_ec, cell_volume_m3, i, k, n_segments);
            let t_query = t_ingest - tau1_s[i];
            let weight = if k == 1 || k == n_segments { 1.0 / (2.0 * n_segments as f64) } else { 1.0 / n_segments as f64 };
            let temp = numeric::interp1(time_s, thermistor_temp, t_query);
            weighted_sum += weight * temp;
            weight_total += weight;
            ingest_times.push(t_ingest);
        }
        t_a[i] = weighted_sum / weight_total;
        t_sample[i] = ingest_times.iter().sum::<f64>() / ingest_times.len() as f64;
    }

    patch_zero_step_runs(time_s, &mut t_a);
    patch_zero_step_runs(time_s, &mut t_sample);
    (t_a, t_sample)
}

/// Patch any zero-time-step run (successive identical sample times, which
/// can arise near stalls) by linear extrapolation from surrounding anchors.
fn patch_zero_step_runs(time_s: &[f64], series: &mut [f64]) {
    let n = time_s.len();
    let mut i = 1;
    while i < n {
        if (time_s[i] - time_s[i - 1]).abs() < 1e-12 {
            let mut j = i;
            while j < n && (time_s[j] - time_s[i - 1]).abs() < 1e-12 {
                j += 1;
            }
            if i >= 2 && j < n {
                let (t0, v0) = (time_s[i - 2], series[i - 2]);
                let (t1, v1) = (time_s[j], series[j]);
                if (t1 - t0).abs() > 1e-12 {
                    for k in (i - 1)..j {
                        let frac = (time_s[k] - t0) / (t1 - t0);
                        series[k] = v0 + frac * (v1 - v0);
                    }
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }
}

/// A bilinearly-interpolated (tau, A) table for one radial heat-transfer
/// mode, indexed by interior/exterior Biot numbers.
#[derive(Debug, Clone)]
pub struct ModeTable {
    bi_axis: Vec<f64>,
    be_axis: Vec<f64>,
    tau: Vec<Vec<f64>>,
    a_amp: Vec<Vec<f64>>,
}

impl ModeTable {
    /// Build a mode table from a closed-form approximation of the
    /// hollow-cylinder radial-mode solution: a mode's time constant
    /// decreases and its amplitude decays with mode index and with Biot
    /// number, which is the qualitative behaviour the full eigenvalue
    /// solve produces.
    fn synthetic(mode_index: usize, bi_axis: Vec<f64>, be_axis: Vec<f64>) -> Self {
        let m = mode_index as f64;
        let mut tau = vec![vec![0.0; be_axis.len()]; bi_axis.len()];
        let mut a_amp = vec![vec![0.0; be_axis.len()]; bi_axis.len()];
        for (i, &bi) in bi_axis.iter().enumerate() {
            for (j, &be) in be_axis.iter().enumerate() {
                tau[i][j] = 10.0 / (m * m) * 1.0 / (1.0 + 0.2 * bi + 0.1 * be);
                a_amp[i][j] = (1.0 / m) * (bi / (bi + 1.0)) * (be / (be + 1.0));
            }
        }
        ModeTable { bi_axis, be_axis, tau, a_amp }
    }

    fn bilinear(&self, table: &[Vec<f64>], bi: f64, be: f64) -> f64 {
        let bi = bi.clamp(self.bi_axis[0], *self.bi_axis.last().unwrap());
        let be = be.clamp(self.be_axis[0], *self.be_axis.last().unwrap());
        let i = upper_index(&self.bi_axis, bi);
        let j = upper_index(&self.be_axis, be);
        let (bi0, bi1) = (self.bi_axis[i - 1], self.bi_axis[i]);
        let (be0, be1) = (self.be_axis[j - 1], self.be_axis[j]);
        let tx = if bi1 > bi0 { (bi - bi0) / (bi1 - bi0) } else { 0.0 };
        let ty = if be1 > be0 { (be - be0) / (be1 - be0) } else { 0.0 };
        let v00 = table[i - 1][j - 1];
        let v01 = table[i - 1][j];
        let v10 = table[i][j - 1];
        let v11 = table[i][j];
        let v0 = v00 + tx * (v10 - v00);
        let v1 = v01 + tx * (v11 - v01);
        v0 + ty * (v1 - v0)
    }

    /// Bilinearly interpolate `(tau, A)` at the given Biot numbers.
    pub fn tau_a(&self, bi: f64, be: f64) -> (f64, f64) {
        (self.bilinear(&self.tau, bi, be), self.bilinear(&self.a_amp, bi, be))
    }
}

fn upper_index(axis: &[f64], v: f64) -> usize {
    axis.iter().position(|&x| x >= v).unwrap_or(axis.len() - 1).max(1)
}

/// The immutable cache of precomputed modal tables, keyed by mode count
/// (`0`, `1`, `3` or `5`). Built once and shared by `&` reference across
/// the dives in a run (`SPEC_FULL.md` §5, §9 "Global mode-table cache").
#[derive(Debug, Clone)]
pub struct ModeTableCache {
    tables: Vec<ModeTable>,
}

impl ModeTableCache {
    /// Build the cache for `n_modes` modes (0, 1, 3 or 5) using the
    /// built-in synthetic tables.
    pub fn builtin(n_modes: usize) -> Self {
        let bi_axis: Vec<f64> = (0..20).map(|i| 0.01 * 2f64.powi(i as i32 / 2)).collect();
        let be_axis = bi_axis.clone();
        let tables = (1..=n_modes).map(|m| ModeTable::synthetic(m, bi_axis.clone(), be_axis.clone())).collect();
        ModeTableCache { tables }
    }

    pub fn mode_count(&self) -> usize {
        self.tables.len()
    }

    pub fn mode(&self, index: usize) -> &ModeTable {
        &self.tables[index]
    }
}

/// Thermal conductivity constants for the modal boundary-layer correction.
#[derive(Debug, Clone, Copy)]
pub struct ModalConstants {
    pub k_sw: f64,
    pub k_glass: f64,
    pub k_jacket: f64,
}

impl Default for ModalConstants {
    fn default() -> Self {
        ModalConstants { k_sw: 0.6, k_glass: 1.0, k_jacket: 0.2 }
    }
}

/// Modal thermal-boundary correction (§4.6 (f)): returns `T_w - T_a` on the
/// CT sample grid, plus boundary-layer weight `w_bl` and `T_c`.
pub fn modal_boundary_correction(
    time_s: &[f64],
    t_a: &[f64],
    u_f_cm_s: &[f64],
    glider_speed_cm_s: &[f64],
    nu_m2_s: f64,
    geometry: &CellGeometry,
    glider_length_m: f64,
    modal: &ModalConstants,
    cache: &ModeTableCache,
) -> (Vec<f64>, Vec<f64>) {
    let n = time_s.len();
    if cache.mode_count() == 0 || n < 2 {
        return (vec![0.0; n], vec![0.5; n]);
    }

    let t0 = time_s[0];
    let t1 = *time_s.last().unwrap();
    let n_fine = (((t1 - t0).max(1.0)) as usize).max(2);
    let fine_t: Vec<f64> = (0..=n_fine).map(|i| t0 + i as f64).collect();

    let t_a_fine = pchip::pchip(time_s, t_a, &fine_t);
    let u_f_fine = pchip::pchip(time_s, u_f_cm_s, &fine_t);
    let u_fine = pchip::pchip(time_s, glider_speed_cm_s, &fine_t);

    let dt_a_dt: Vec<f64> = (0..fine_t.len())
        .map(|i| {
            if i == 0 {
                (t_a_fine[1] - t_a_fine[0]) / (fine_t[1] - fine_t[0])
            } else {
                (t_a_fine[i] - t_a_fine[i - 1]) / (fine_t[i] - fine_t[i - 1])
            }
        })
        .collect();

    let mut total_anomaly = vec![0.0; fine_t.len()];
    let mut delta_t_interior = vec![0.0; fine_t.len()];

    for (idx, mode) in (0..cache.mode_count()).map(|i| (i, cache.mode(i))) {
        let mode_n = idx + 1;
        let mut x_m = vec![0.0; fine_t.len()];
        for k in 1..fine_t.len() {
            let u_f_ms = (u_f_fine[k] / 100.0).abs().max(1e-6);
            let u_ms = (u_fine[k] / 100.0).abs().max(1e-6);
            let delta_t = (nu_m2_s * glider_length_m / u_f_ms).sqrt();
            let delta_tu = (nu_m2_s * glider_length_m / u_ms).sqrt();
            if idx == 0 {
                delta_t_interior[k] = delta_t;
            }
            let bi = (modal.k_sw * geometry.narrow_radius_m / (modal.k_glass * delta_t)).max(1e-6);
            let be = (modal.k_sw * geometry.narrow_radius_m / (modal.k_jacket * delta_tu)).max(1e-6);
            let (tau_k, a_k) = mode.tau_a(bi, be);

            let (u_f_prev, u_prev) = ((u_f_fine[k - 1] / 100.0).abs().max(1e-6), (u_fine[k - 1] / 100.0).abs().max(1e-6));
            let delta_t_prev = (nu_m2_s * glider_length_m / u_f_prev).sqrt();
            let delta_tu_prev = (nu_m2_s * glider_length_m / u_prev).sqrt();
            let bi_prev = (modal.k_sw * geometry.narrow_radius_m / (modal.k_glass * delta_t_prev)).max(1e-6);
            let be_prev = (modal.k_sw * geometry.narrow_radius_m / (modal.k_jacket * delta_tu_prev)).max(1e-6);
            let (tau_prev, a_prev) = mode.tau_a(bi_prev, be_prev);

            let dt = fine_t[k] - fine_t[k - 1];
            let denom = tau_prev * (2.0 * tau_k + dt);
            x_m[k] = if denom.abs() > 1e-12 {
                x_m[k - 1] * tau_k * (2.0 * tau_prev - dt) / denom
                    - dt * tau_k * (a_prev * dt_a_dt[k - 1] + a_k * dt_a_dt[k]) / (2.0 * tau_k + dt)
            } else {
                x_m[k - 1]
            };
        }
        log::debug!("modal_boundary_correction: mode {mode_n} settled at x={:.4e}", x_m.last().copied().unwrap_or(0.0));
        for k in 0..fine_t.len() {
            total_anomaly[k] += x_m[k];
        }
    }

    let t_w_minus_t_a_ct = pchip::pchip(&fine_t, &total_anomaly, time_s);
    let delta_t_ct = pchip::pchip(&fine_t, &delta_t_interior, time_s);

    let w_bl: Vec<f64> = delta_t_ct
        .iter()
        .map(|&d_t| {
            if d_t > glider_length_m {
                1.0 - 0.5 * geometry.narrow_radius_m / d_t
            } else {
                let ratio = d_t / geometry.narrow_radius_m.max(1e-12);
                (2.0 / 3.0) * ratio - (1.0 / 6.0) * ratio * ratio
            }
        })
        .collect();

    (t_w_minus_t_a_ct, w_bl)
}

/// Water temperature inside the cell at measurement time, `T_c = T_a + (T_w
/// - T_a) * w_bl`.
pub fn cell_temperature(t_a: &[f64], t_w_minus_t_a: &[f64], w_bl: &[f64]) -> Vec<f64> {
    t_a.iter()
        .zip(t_w_minus_t_a)
        .zip(w_bl)
        .map(|((&ta, &dw), &w)| ta + dw * w)
        .collect()
}

/// Salinity recovery (§4.6 (g)): compute salinity on the CT grid at the
/// sample-adjusted times, then interpolate back onto the measurement grid.
/// Extrapolation beyond the last `t_a` keeps the initial-guess salinity
/// rather than extrapolating the PCHIP.
pub fn salinity_recovery(
    cond_s_m: &[f64],
    t_c: &[f64],
    pressure_dbar: &[f64],
    t_sample: &[f64],
    measurement_time_s: &[f64],
    c3515: f64,
    initial_guess: &[f64],
) -> Vec<f64> {
    let s_c: Vec<f64> = cond_s_m
        .iter()
        .zip(t_c)
        .zip(pressure_dbar)
        .map(|((&c, &t), &p)| seawater::salinity_from_cond_ratio(c / c3515, t, p))
        .collect();

    let t_min = t_sample.first().copied().unwrap_or(f64::NEG_INFINITY);
    let t_max = t_sample.last().copied().unwrap_or(f64::INFINITY);

    measurement_time_s
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            if t > t_max || t < t_min {
                initial_guess[i]
            } else {
                numeric::interp1(t_sample, &s_c, t)
            }
        })
        .collect()
}

/// Density/buoyancy (§4.6 (i)).
pub mod density {
    /// Displaced hull volume (cc) under compression/thermal-expansion.
    pub fn hull_volume_cc(v_hull_cc: f64, abs_compress: f64, therm_expan: f64, pressure_dbar: f64, temp_c: f64, temp_ref_c: f64) -> f64 {
        v_hull_cc * (-abs_compress * pressure_dbar + therm_expan * (temp_c - temp_ref_c)).exp()
    }

    /// Buoyancy force, expressed as an equivalent mass in grams:
    /// `1000 * (rho_insitu * V[m^3] - mass_kg)`.
    pub fn buoyancy_g(rho_insitu_kg_m3: f64, volume_cc: f64, mass_kg: f64) -> f64 {
        1000.0 * (rho_insitu_kg_m3 * (volume_cc * 1e-6) - mass_kg)
    }

    /// Optional interstitial-wake correction: mass flux through an entry
    /// hole of radius `r_en` filling a volume `v_interstitial_cc` over one
    /// sample interval, added to the buoyancy estimate.
    pub fn interstitial_wake_correction_g(rho_insitu_kg_m3: f64, r_en_m: f64, speed_cm_s: f64, dt_s: f64, v_interstitial_cc: f64) -> f64 {
        let area = std::f64::consts::PI * r_en_m * r_en_m;
        let flux_m3 = area * (speed_cm_s / 100.0).abs() * dt_s;
        let filled_fraction = (flux_m3 * 1e6 / v_interstitial_cc.max(1e-9)).min(1.0);
        1000.0 * rho_insitu_kg_m3 * filled_fraction * v_interstitial_cc * 1e-6
    }
}

/// TS-interpolation heuristic (§4.6 (h)): segments whose TMC correction
/// exceeds `temp_corr_threshold` and whose shoulders both anchor on the
/// same leg are scheduled for linear interpolation.
pub mod ts_interpolate {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Segment {
        pub left_anchor: usize,
        pub right_anchor: usize,
    }

    /// `same_leg(i)` classifies each index as dive (`true`) or climb
    /// (`false`); `valid(i)` reports whether index `i` is in the solver's
    /// valid-index set. Segments straddling apogee, or anchored on an
    /// invalid index, are rejected.
    pub fn find_segments(
        tmc_correction: &[f64],
        temp_corr_threshold: f64,
        ts_stable: impl Fn(usize) -> bool,
        same_leg: impl Fn(usize) -> bool,
        valid: impl Fn(usize) -> bool,
    ) -> Vec<Segment> {
        let n = tmc_correction.len();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < n {
            if tmc_correction[i].abs() <= temp_corr_threshold {
                i += 1;
                continue;
            }
            let mut left = i;
            while left > 0 && !ts_stable(left) {
                left -= 1;
            }
            let mut right = i;
            while right + 1 < n && !ts_stable(right) {
                right += 1;
            }
            if same_leg(left) == same_leg(right) && valid(left) && valid(right) {
                segments.push(Segment { left_anchor: left, right_anchor: right });
            }
            i = right + 1;
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viscosity_decreases_with_temperature() {
        let (mu_cold, ..) = viscosity_prandtl(0.0, 1027.5);
        let (mu_warm, ..) = viscosity_prandtl(25.0, 1027.5);
        assert!(mu_warm < mu_cold);
    }

    #[test]
    fn cumulative_volume_is_nondecreasing_for_positive_flow() {
        let time_s = vec![0.0, 1.0, 2.0, 3.0];
        let u_f = vec![5.0, 5.0, 5.0, 5.0];
        let vol = transit::cumulative_volume(&time_s, &u_f, 3e-3);
        for w in vol.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn mode_table_cache_builtin_counts() {
        let c = ModeTableCache::builtin(5);
        assert_eq!(c.mode_count(), 5);
        let (tau, a) = c.mode(0).tau_a(0.5, 0.5);
        assert!(tau > 0.0);
        assert!(a > 0.0);
    }

    #[test]
    fn buoyancy_g_matches_spec_formula() {
        let b = density::buoyancy_g(1027.5, 52_000.0, 53.4);
        let expected = 1000.0 * (1027.5 * 0.052 - 53.4);
        assert!((b - expected).abs() < 1e-9);
    }
}
