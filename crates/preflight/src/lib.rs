//! Pre-flight conditioning and event extraction (`SPEC_FULL.md` §4.1): raw
//! pressure from depth counts, latitude-corrected depth, thermistor-location
//! depth offset, GC-scan event anchors, VBD reconstruction, and GPS triple
//! validation.

/// A single GPS fix, with the validity inputs needed by §4.1 step 6.
#[derive(Debug, Clone, Copy)]
pub struct GpsFix {
    pub time_s: f64,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub hdop: f64,
    pub error_m: f64,
    /// Set by an operator directive (`bad_gps1`/`bad_gps2`/`bad_gps3`).
    pub directive_bad: bool,
}

/// The three fixes that bound a dive: before submergence, at the start of
/// the dive proper, and at the end of the climb.
#[derive(Debug, Clone, Copy)]
pub struct GpsTriple {
    pub gps1: GpsFix,
    pub gps2: GpsFix,
    pub gpse: GpsFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsValidity {
    pub gps1_ok: bool,
    pub gps2_ok: bool,
    pub gpse_ok: bool,
}

impl GpsValidity {
    pub fn all_ok(self) -> bool {
        self.gps1_ok && self.gps2_ok && self.gpse_ok
    }
}

impl GpsTriple {
    /// Validate each fix (`hdop < threshold`, `error <= max_error`, not
    /// directive-flagged bad) and that times strictly increase across the
    /// triple.
    pub fn validate(&self, hdop_threshold: f64, max_error_m: f64) -> GpsValidity {
        let times_increasing =
            self.gps1.time_s < self.gps2.time_s && self.gps2.time_s < self.gpse.time_s;
        let check = |f: &GpsFix| f.hdop < hdop_threshold && f.error_m <= max_error_m && !f.directive_bad;
        GpsValidity {
            gps1_ok: times_increasing && check(&self.gps1),
            gps2_ok: times_increasing && check(&self.gps2),
            gpse_ok: times_increasing && check(&self.gpse),
        }
    }

    /// Mean latitude and longitude of the dive, per §4.1 step 7: mean of
    /// GPS2 and GPSE, with 180 degree wrap-aware longitude averaging.
    pub fn mean_lat_lon(&self) -> (f64, f64) {
        let lat = sgcore_geo::mean_lat(&[self.gps2.lat_deg, self.gpse.lat_deg]).unwrap();
        let lon = sgcore_geo::mean_lon(&[self.gps2.lon_deg, self.gpse.lon_deg]).unwrap();
        (lat, lon)
    }
}

/// Optional quadratic-in-temperature (Kistler) pressure fit coefficients,
/// applied as an additive correction to the linear slope/intercept fit.
#[derive(Debug, Clone, Copy)]
pub struct KistlerFit {
    pub a_t: f64,
    pub b_t2: f64,
}

/// Raw pressure (dbar) from depth-counter readings, §4.1 step 1.
pub fn pressure_from_depth_counts(
    counts: &[f64],
    slope: f64,
    intercept: f64,
    temp_c: Option<&[f64]>,
    kistler: Option<KistlerFit>,
) -> Vec<f64> {
    let mut p: Vec<f64> = counts.iter().map(|&c| slope * c + intercept).collect();
    if let (Some(fit), Some(temp)) = (kistler, temp_c) {
        for (pi, &t) in p.iter_mut().zip(temp) {
            *pi += fit.a_t * t + fit.b_t2 * t * t;
        }
    }
    p
}

/// Depth (metres) from pressure (dbar) and latitude (degrees), via the
/// Saunders & Fofonoff (UNESCO) formula -- the "legacy seawater routine"
/// fallback of §4.1 step 2 used when a TEOS-10 implementation is not
/// available.
// TODO(open question): prefer a TEOS-10 depth calculation when one is wired
// in; `SPEC_FULL.md` leaves the EOS choice to the caller via a future
// `DensityModel` seam, not yet implemented here.
pub fn depth_from_pressure(pressure_dbar: &[f64], lat_deg: f64) -> Vec<f64> {
    let x = (lat_deg.to_radians()).sin().powi(2);
    let gr = 9.780318 * (1.0 + (5.2788e-3 + 2.36e-5 * x) * x);
    pressure_dbar
        .iter()
        .map(|&p| {
            let gr_p = gr + 1.092e-6 * p;
            let depth = (((-1.82e-15 * p + 2.279e-10) * p - 2.2512e-5) * p + 9.72659) * p;
            depth / gr_p
        })
        .collect()
}

/// Adjust pressure-sensor depth to the thermistor location, projecting the
/// body-frame offset `(dx, dz)` through pitch (§4.1 step 3).
pub fn thermistor_depth_offset(depth_p_m: &[f64], pitch_deg: &[f64], dx_m: f64, dz_m: f64) -> Vec<f64> {
    depth_p_m
        .iter()
        .zip(pitch_deg)
        .map(|(&d, &pitch)| {
            let r = pitch.to_radians();
            d - (dx_m * r.sin() + dz_m * r.cos())
        })
        .collect()
}

/// One glide-control (GC) record from the engineering log.
#[derive(Debug, Clone, Copy)]
pub struct GcRecord {
    pub pitch_motor_start_s: f64,
    pub pitch_motor_seconds: f64,
    pub vbd_motor_start_s: f64,
    pub vbd_motor_seconds: f64,
    pub vbd_pos_start_cc: f64,
    pub vbd_pos_end_cc: f64,
}

impl GcRecord {
    fn vbd_move_window(&self) -> (f64, f64) {
        let start = self.vbd_motor_start_s.max(self.pitch_motor_start_s);
        (start, self.vbd_motor_start_s + self.vbd_motor_seconds)
    }
}

/// Index anchors for flare, apogee pump, start of climb and climb pump end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiveEvents {
    pub flare_i: usize,
    pub apogee_pump_start_i: usize,
    pub start_of_climb_i: usize,
    pub apogee_climb_pump_end_i: usize,
}

fn nearest_index(time_s: &[f64], t: f64) -> usize {
    time_s
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (**a - t).abs().partial_cmp(&(**b - t).abs()).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Extract the four event anchors of §4.1 step 4 by scanning GC records for
/// the apogee and climb pumps, then locating flare and apogee pitch-sign
/// transitions relative to them.
pub fn extract_events(gcs: &[GcRecord], time_s: &[f64], pitch_deg: &[f64]) -> Option<DiveEvents> {
    let mut pump_gcs = gcs
        .iter()
        .filter(|g| g.pitch_motor_seconds > 0.0 && g.vbd_motor_seconds > 0.0);
    let apogee_pump = pump_gcs.next()?;
    let climb_pump = pump_gcs.next().unwrap_or(apogee_pump);

    let apogee_pump_start_i = nearest_index(time_s, apogee_pump.vbd_move_window().0);
    let apogee_climb_pump_end_i = nearest_index(time_s, climb_pump.vbd_move_window().1);

    let dive_sign = pitch_deg.get(apogee_pump_start_i).copied().unwrap_or(-1.0).signum();
    let start_of_climb_i = ((apogee_climb_pump_end_i)..pitch_deg.len())
        .find(|&i| pitch_deg[i].signum() != dive_sign && pitch_deg[i] != 0.0)
        .unwrap_or(apogee_climb_pump_end_i);

    let flare_i = (0..apogee_pump_start_i)
        .find(|&i| pitch_deg[i].signum() == dive_sign)
        .unwrap_or(0);

    Some(DiveEvents { flare_i, apogee_pump_start_i, start_of_climb_i, apogee_climb_pump_end_i })
}

/// Reconstruct `vbd_cc` when not directly sampled: piecewise-linear
/// interpolation of VBD pot positions over each GC's move window, held
/// flat between moves and extended by the last value (§4.1 step 5).
pub fn reconstruct_vbd(gcs: &[GcRecord], time_s: &[f64]) -> Vec<f64> {
    if gcs.is_empty() {
        return vec![0.0; time_s.len()];
    }
    let mut t_ctrl = Vec::new();
    let mut v_ctrl = Vec::new();
    for (i, gc) in gcs.iter().enumerate() {
        let (start, end) = gc.vbd_move_window();
        t_ctrl.push(start);
        v_ctrl.push(gc.vbd_pos_start_cc);
        t_ctrl.push(end);
        v_ctrl.push(gc.vbd_pos_end_cc);
        if let Some(next) = gcs.get(i + 1) {
            let next_start = next.vbd_move_window().0;
            if next_start > end {
                t_ctrl.push(next_start - 1e-6);
                v_ctrl.push(gc.vbd_pos_end_cc);
            }
        }
    }
    time_s
        .iter()
        .map(|&t| sgcore_core::numeric::interp1(&t_ctrl, &v_ctrl, t))
        .collect()
}

/// Flag a suspected VBD bleed: a gap between one GC move's commanded end
/// position and the next move's start position larger than `tolerance_cc`,
/// meaning oil or air left the bladder between pumps rather than through a
/// commanded move. Gated by the `detect_vbd_bleed` directive predicate.
pub fn vbd_bleed_suspected(gcs: &[GcRecord], tolerance_cc: f64) -> bool {
    gcs.windows(2).any(|w| (w[1].vbd_pos_start_cc - w[0].vbd_pos_end_cc).abs() > tolerance_cc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_from_pressure_is_monotone_in_pressure() {
        let p = vec![0.0, 100.0, 200.0, 500.0];
        let d = depth_from_pressure(&p, 45.0);
        for w in d.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn gps_validate_flags_high_hdop() {
        let triple = GpsTriple {
            gps1: GpsFix { time_s: 0.0, lat_deg: 10.0, lon_deg: 20.0, hdop: 1.0, error_m: 5.0, directive_bad: false },
            gps2: GpsFix { time_s: 10.0, lat_deg: 10.01, lon_deg: 20.01, hdop: 99.0, error_m: 5.0, directive_bad: false },
            gpse: GpsFix { time_s: 100.0, lat_deg: 10.02, lon_deg: 20.02, hdop: 1.0, error_m: 5.0, directive_bad: false },
        };
        let v = triple.validate(20.0, 50.0);
        assert!(v.gps1_ok);
        assert!(!v.gps2_ok);
        assert!(v.gpse_ok);
    }

    #[test]
    fn reconstruct_vbd_holds_flat_between_moves() {
        let gcs = vec![
            GcRecord {
                pitch_motor_start_s: 0.0,
                vbd_motor_start_s: 0.0,
                vbd_motor_seconds: 10.0,
                vbd_pos_start_cc: 0.0,
                vbd_pos_end_cc: 100.0,
                pitch_motor_seconds: 5.0,
            },
            GcRecord {
                pitch_motor_start_s: 500.0,
                vbd_motor_start_s: 500.0,
                vbd_motor_seconds: 10.0,
                vbd_pos_start_cc: 100.0,
                vbd_pos_end_cc: 0.0,
                pitch_motor_seconds: 5.0,
            },
        ];
        let time_s = vec![0.0, 5.0, 10.0, 250.0, 499.0, 505.0, 510.0];
        let vbd = reconstruct_vbd(&gcs, &time_s);
        assert!((vbd[3] - 100.0).abs() < 1e-6, "should hold at 100cc mid-dive: {:?}", vbd);
    }

    #[test]
    fn vbd_bleed_flags_a_gap_between_moves() {
        let gcs = vec![
            GcRecord { pitch_motor_start_s: 0.0, pitch_motor_seconds: 5.0, vbd_motor_start_s: 0.0, vbd_motor_seconds: 10.0, vbd_pos_start_cc: 0.0, vbd_pos_end_cc: 100.0 },
            GcRecord { pitch_motor_start_s: 500.0, pitch_motor_seconds: 5.0, vbd_motor_start_s: 500.0, vbd_motor_seconds: 10.0, vbd_pos_start_cc: 70.0, vbd_pos_end_cc: 0.0 },
        ];
        assert!(vbd_bleed_suspected(&gcs, 15.0), "a 30cc gap should trip a 15cc tolerance");
        assert!(!vbd_bleed_suspected(&gcs, 40.0), "a 40cc tolerance should absorb a 30cc gap");
    }
}
