//! Glide-slope model (GSM), hydrodynamic model (HDM) and unsteady-flight
//! smoothing (`SPEC_FULL.md` §4.4/§4.5).

use sgcore_core::constants::{G2KG, GRAVITY, M2CM};

/// Hydrodynamic drag/lift constants shared by GSM and HDM.
#[derive(Debug, Clone, Copy)]
pub struct FlightConstants {
    pub hd_a: f64,
    pub hd_b: f64,
    pub hd_c: f64,
    pub hd_s: f64,
    pub rho0: f64,
    pub glider_length: f64,
}

/// Stall classification thresholds.
#[derive(Debug, Clone, Copy)]
pub struct StallConfig {
    pub min_stall_speed_cm_s: f64,
    pub max_stall_speed_cm_s: f64,
    pub min_stall_angle_deg: f64,
}

/// Mark samples as stalled: speed outside `[min, max]` while pitch is
/// below `min_stall_angle`.
pub fn find_stalled(speed_cm_s: &[f64], pitch_deg: &[f64], cfg: &StallConfig) -> Vec<bool> {
    speed_cm_s
        .iter()
        .zip(pitch_deg)
        .map(|(&u, &p)| {
            p.abs() < cfg.min_stall_angle_deg
                && (u < cfg.min_stall_speed_cm_s || u > cfg.max_stall_speed_cm_s)
        })
        .collect()
}

/// Glide-Slope Model: solves Eriksen Eq. 8 for attack angle, given vertical
/// velocity and pitch, assuming buoyancy is constant at `rho0`.
pub mod gsm {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct GsmResult {
        pub speed_cm_s: Vec<f64>,
        pub theta_rad: Vec<f64>,
        pub stalled: Vec<bool>,
    }

    /// `w_cm_s`: vertical velocity (positive down), `pitch_deg`: vehicle
    /// pitch. Both on the same sample grid.
    pub fn solve(w_cm_s: &[f64], pitch_deg: &[f64], hd: &FlightConstants, stall: &StallConfig) -> GsmResult {
        let cx = 4.0 * hd.hd_b * hd.hd_c;
        let cy = hd.hd_a.powi(2) * (hd.rho0 / 2.0).powf(-hd.hd_s);

        let n = w_cm_s.len();
        let mut speed = vec![0.0; n];
        let mut theta_out = vec![0.0; n];
        let mut stalled = vec![false; n];

        for i in 0..n {
            let pitch_rad = pitch_deg[i].to_radians();
            let w = w_cm_s[i];
            if pitch_rad == 0.0 {
                stalled[i] = true;
                continue;
            }
            if w * pitch_rad.sin() < 0.0 {
                stalled[i] = true;
                continue;
            }

            let mut theta = pitch_rad;
            let mut any_stall = false;
            for _ in 0..41 {
                let tan2 = theta.tan().powi(2);
                let inner = (0.01 * w / theta.sin()).abs().sqrt();
                if tan2 * inner == 0.0 {
                    any_stall = true;
                    break;
                }
                let factor = (cx / cy) * 1.0 / (tan2 * inner);
                if factor > 1.0 {
                    any_stall = true;
                    break;
                }
                let alpha_deg = -(hd.hd_a * theta.tan() / (2.0 * hd.hd_c)) * (1.0 - (1.0 - factor).sqrt());
                let new_theta = pitch_rad - alpha_deg.to_radians();
                let delta = (new_theta - theta).abs();
                theta = new_theta;
                if delta < 1e-4 {
                    break;
                }
            }

            if any_stall {
                stalled[i] = true;
                continue;
            }

            theta_out[i] = theta;
            let u = w / theta.sin();
            speed[i] = u;
            if (u < stall.min_stall_speed_cm_s || u > stall.max_stall_speed_cm_s)
                && pitch_deg[i].abs() < stall.min_stall_angle_deg
            {
                stalled[i] = true;
            }
        }

        GsmResult { speed_cm_s: speed, theta_rad: theta_out, stalled }
    }
}

/// Hydrodynamic Model: solves the buoyancy-driven flight equations for
/// total speed and glide angle given buoyancy and pitch.
pub mod hdm {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct HdmResult {
        pub speed_cm_s: Vec<f64>,
        pub theta_rad: Vec<f64>,
        pub stalled: Vec<bool>,
        pub iterations: usize,
    }

    /// `buoyancy_g`: buoyancy mass in grams (signed), `pitch_deg`: vehicle
    /// pitch in degrees.
    pub fn solve(buoyancy_g: &[f64], pitch_deg: &[f64], hd: &FlightConstants) -> HdmResult {
        let l2 = hd.glider_length.powi(2);
        let l2_hd_b2 = 2.0 * l2 * hd.hd_b;
        let hd_bc4 = 4.0 * hd.hd_b * hd.hd_c;

        let n = buoyancy_g.len();
        let mut speed = vec![0.0; n];
        let mut theta_out = vec![0.0; n];
        let mut stalled = vec![false; n];
        let mut max_iters_used = 0;

        for i in 0..n {
            let b_kg = buoyancy_g[i] * G2KG;
            let b = GRAVITY * b_kg;
            let pitch = pitch_deg[i];

            if b == 0.0 || pitch == 0.0 || b.signum() != pitch.signum() {
                stalled[i] = true;
                continue;
            }

            let mut theta = b.signum() * std::f64::consts::FRAC_PI_4;
            let mut q = (b.abs() / (l2 * hd.hd_b)).powf(1.0 / (1.0 + hd.hd_s));
            let mut sample_stalled = false;

            let mut iter = 0;
            loop {
                iter += 1;
                let scaled_drag = q.powf(-hd.hd_s);
                let disc_inv = hd.hd_a.powi(2) * theta.tan().powi(2) * scaled_drag / hd_bc4;
                let sign_ok = b.signum() == pitch.signum();
                if !(sign_ok && disc_inv > 1.0) {
                    sample_stalled = true;
                    break;
                }
                let root = (1.0 - 1.0 / disc_inv).sqrt();
                let q_new = b * theta.sin() * scaled_drag / l2_hd_b2 * (1.0 + root);
                let alpha_deg = (-hd.hd_a * theta.tan() / (2.0 * hd.hd_c)) * (1.0 - root);
                let new_theta = (pitch - alpha_deg).to_radians();

                let rel = if q_new.abs() > 0.0 { ((q_new - q) / q_new).abs() } else { f64::INFINITY };
                q = q_new;
                theta = new_theta;

                if iter >= 2 && rel < 0.001 {
                    break;
                }
                if iter >= 41 {
                    break;
                }
            }
            max_iters_used = max_iters_used.max(iter);

            if sample_stalled || q < 0.0 {
                stalled[i] = true;
                continue;
            }

            theta_out[i] = theta;
            speed[i] = M2CM * (2.0 * q / hd.rho0).sqrt();
        }

        HdmResult { speed_cm_s: speed, theta_rad: theta_out, stalled, iterations: max_iters_used }
    }
}

/// Piecewise-cubic-Hermite + triangular-filter smoothing of unsteady-flight
/// speed/angle onto a uniform time grid and back (§4.5).
pub mod smoothing {
    use sgcore_core::{filters, pchip};

    #[derive(Debug, Clone)]
    pub struct SmoothedFlight {
        pub speed_cm_s: Vec<f64>,
        pub theta_rad: Vec<f64>,
    }

    /// `r_dt`: resampling step (seconds); `tau_s`: filter half-width
    /// (seconds), default ~20s per §4.5.
    pub fn filter_unsteady(time_s: &[f64], speed_cm_s: &[f64], theta_rad: &[f64], r_dt: f64, tau_s: f64) -> SmoothedFlight {
        if time_s.len() < 2 {
            return SmoothedFlight { speed_cm_s: speed_cm_s.to_vec(), theta_rad: theta_rad.to_vec() };
        }
        let horizontal: Vec<f64> = speed_cm_s.iter().zip(theta_rad).map(|(&u, &t)| u * t.cos()).collect();
        let vertical: Vec<f64> = speed_cm_s.iter().zip(theta_rad).map(|(&u, &t)| u * t.sin()).collect();

        let t0 = time_s[0];
        let t1 = *time_s.last().unwrap();
        let n_u = (((t1 - t0) / r_dt).round() as usize).max(1) + 1;
        let uniform_t: Vec<f64> = (0..n_u).map(|i| t0 + i as f64 * r_dt).collect();

        let h_u = pchip::pchip(time_s, &horizontal, &uniform_t);
        let v_u = pchip::pchip(time_s, &vertical, &uniform_t);

        let half = ((tau_s / r_dt).round() as usize).max(1);
        let h_f = filters::trifilt(&h_u, half);
        let v_f = filters::trifilt(&v_u, half);

        let h_back = pchip::pchip(&uniform_t, &h_f, time_s);
        let v_back = pchip::pchip(&uniform_t, &v_f, time_s);

        let speed = h_back.iter().zip(&v_back).map(|(h, v)| (h * h + v * v).sqrt()).collect();
        let theta = h_back.iter().zip(&v_back).map(|(h, v)| v.atan2(*h)).collect();

        SmoothedFlight { speed_cm_s: speed, theta_rad: theta }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants() -> FlightConstants {
        FlightConstants { hd_a: 3.8, hd_b: 0.00655, hd_c: 9e-5, hd_s: 0.25, rho0: 1027.5, glider_length: 1.8 }
    }

    #[test]
    fn hdm_converges_and_gives_positive_speed_when_flying() {
        let hd = constants();
        let buoyancy_g = vec![200.0; 5];
        let pitch_deg = vec![20.0; 5];
        let out = hdm::solve(&buoyancy_g, &pitch_deg, &hd);
        for (i, &s) in out.stalled.iter().enumerate() {
            assert!(!s, "sample {i} unexpectedly stalled");
        }
        for &u in &out.speed_cm_s {
            assert!(u > 0.0);
        }
        assert!(out.iterations <= 41);
    }

    #[test]
    fn hdm_stalls_on_sign_mismatch() {
        let hd = constants();
        let out = hdm::solve(&[200.0], &[-20.0], &hd);
        assert!(out.stalled[0]);
    }

    #[test]
    fn gsm_stalls_on_zero_pitch() {
        let hd = constants();
        let stall = StallConfig { min_stall_speed_cm_s: 1.0, max_stall_speed_cm_s: 60.0, min_stall_angle_deg: 5.0 };
        let out = gsm::solve(&[10.0], &[0.0], &hd, &stall);
        assert!(out.stalled[0]);
    }

    #[test]
    fn filter_unsteady_preserves_constant_flight() {
        let time_s: Vec<f64> = (0..20).map(|i| i as f64 * 2.0).collect();
        let speed = vec![25.0; 20];
        let theta = vec![-0.4; 20];
        let out = smoothing::filter_unsteady(&time_s, &speed, &theta, 1.0, 20.0);
        for &s in &out.speed_cm_s {
            assert!((s - 25.0).abs() < 1e-3, "got {s}");
        }
    }
}
