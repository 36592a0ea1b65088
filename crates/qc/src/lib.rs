//! QC flag lattice, raw-data bound/spike/noise checks, cross-channel
//! inheritance, and the conductivity-anomaly ("bubble"/"snot") scanner.

use sgcore_config::{AnomalyThresholds, ChannelThresholds, QcFlagConfig};
use sgcore_core::qcflag::{QcFlag, QcVector};

/// A value vector paired with its QC flags, kept in lock-step so mutation
/// never desynchronises the two (Design Note: "Mutation-by-side-effect on
/// shared arrays").
#[derive(Debug, Clone)]
pub struct QcSeries {
    values: Vec<f64>,
    qc: QcVector,
}

impl QcSeries {
    pub fn new(values: Vec<f64>) -> Self {
        let qc = QcVector::new(values.len());
        QcSeries { values, qc }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn qc(&self) -> &QcVector {
        &self.qc
    }

    pub fn qc_mut(&mut self) -> &mut QcVector {
        &mut self.qc
    }

    pub fn value_at(&self, i: usize) -> f64 {
        self.values[i]
    }

    pub fn set_value(&mut self, i: usize, v: f64) {
        self.values[i] = v;
    }

    /// Indices that are not terminally bad per `QcFlag::is_terminal_bad`.
    pub fn good_indices(&self) -> Vec<usize> {
        self.qc.good_indices()
    }

    /// Apply invariant 3 ("Bad => NaN"): after final reconciliation, set
    /// every terminally-bad sample's value to NaN. Returns the finalised
    /// value vector, leaving `self` untouched.
    pub fn finalized_values(&self) -> Vec<f64> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &v)| if self.qc.get(i).is_terminal_bad() { f64::NAN } else { v })
            .collect()
    }
}

/// Raw-data bound/spike/noise checks of `SPEC_FULL.md` §4.2.
pub mod checks {
    use super::*;

    /// Mark samples outside `[min, max]` with `bound_action`.
    pub fn bounds(series: &mut QcSeries, thresholds: &ChannelThresholds, bound_action: QcFlagConfig) {
        let flag: QcFlag = bound_action.into();
        let bad: Vec<usize> = series
            .values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v.is_nan() || v < thresholds.min || v > thresholds.max)
            .map(|(i, _)| i)
            .collect();
        series.qc.assert_at(flag, bad);
    }

    /// Triple-point spike estimator of §4.2, restricted to the non-bad
    /// subset so a confirmed-bad neighbour cannot poison its neighbours'
    /// spike scores.
    pub fn spike(series: &mut QcSeries, depth_m: &[f64], thresholds: &ChannelThresholds, spike_action: QcFlagConfig) {
        let flag: QcFlag = spike_action.into();
        let good = series.good_indices();
        if good.len() < 3 {
            return;
        }
        let mut flagged = Vec::new();
        for w in good.windows(3) {
            let (im, ic, ip) = (w[0], w[1], w[2]);
            let (xm, xc, xp) = (series.values[im], series.values[ic], series.values[ip]);
            let denom = (depth_m[ip] - depth_m[im]).abs() / 2.0;
            if denom <= 0.0 {
                continue;
            }
            let s = ((xc - (xp + xm) / 2.0).abs() - (xp - xm).abs() / 2.0) / denom;
            let limit = if depth_m[ic] <= thresholds.spike_depth_m {
                thresholds.spike_shallow
            } else {
                thresholds.spike_deep
            };
            if s > limit {
                flagged.push(ic);
            }
        }
        series.qc.assert_at(flag, flagged);
    }

    /// Optional noise check for oversampled sensors: detrend with a
    /// centred median filter, flag residuals beyond `sigma * noise_sigma`.
    pub fn noise(series: &mut QcSeries, thresholds: &ChannelThresholds, action: QcFlagConfig) {
        let Some(half) = thresholds.noise_window else {
            return;
        };
        if thresholds.noise_sigma <= 0.0 {
            return;
        }
        let flag: QcFlag = action.into();
        let trend = sgcore_core::numeric::median_filter(&series.values, half);
        let residual: Vec<f64> = series.values.iter().zip(&trend).map(|(v, t)| v - t).collect();
        let mean = residual.iter().sum::<f64>() / residual.len().max(1) as f64;
        let var = residual.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / residual.len().max(1) as f64;
        let sigma = var.sqrt();
        if sigma <= 0.0 {
            return;
        }
        let bad: Vec<usize> = residual
            .iter()
            .enumerate()
            .filter(|(_, r)| (*r - mean).abs() > thresholds.noise_sigma * sigma)
            .map(|(i, _)| i)
            .collect();
        series.qc.assert_at(flag, bad);
    }
}

/// Cross-channel inheritance rules of §4.2/§8 invariant 4.
pub mod reconcile {
    use super::*;

    /// Bad T or bad C implies bad S; bad S with good T implies bad C.
    /// Applied until a fixed point since the second rule can in turn worsen
    /// T's dependents in a larger pipeline, but within this pair it
    /// converges in one pass.
    pub fn inherit_ctd(temp: &mut QcSeries, cond: &mut QcSeries, salin: &mut QcSeries) {
        salin.qc.inherit_from(&temp.qc);
        salin.qc.inherit_from(&cond.qc);
        let n = salin.len();
        let mut bad_cond_from_salin = Vec::new();
        for i in 0..n {
            if salin.qc.get(i).is_terminal_bad() && !temp.qc.get(i).is_terminal_bad() {
                bad_cond_from_salin.push(i);
            }
        }
        cond.qc.assert_at(QcFlag::Bad, bad_cond_from_salin);
    }
}

/// Conductivity-anomaly ("bubble"/"snot") scanner of §4.3.
pub mod anomaly {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Resolution {
        Bubble,
        SnotResolved,
        SnotUnresolved,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Leg {
        Dive,
        Climb,
    }

    #[derive(Debug, Clone)]
    pub struct Anomaly {
        pub first_point: usize,
        pub last_point: usize,
        pub negative_sum: f64,
        pub positive_sum: f64,
        pub vertical_extent_m: f64,
        pub resolution: Resolution,
        pub leg: Leg,
        pub verdict: QcFlag,
        /// True when the peak excursion only reached "suspect" severity and
        /// should be surfaced via the directive suggestion channel instead
        /// of auto-applied.
        pub suspect_only: bool,
    }

    impl Anomaly {
        pub fn point_count(&self) -> usize {
            self.last_point - self.first_point + 1
        }
    }

    /// Scale factor `s(T)` converting a conductivity change into a
    /// temperature-equivalent change, as a dense array indexed by
    /// `round(T).clamp(-5, 37) + 5` (Design Note: dictionary-keyed lookup
    /// table -> dense array plus clamp).
    fn cond_temp_scale_table() -> [f64; 43] {
        let mut table = [0.0; 43];
        for (i, slot) in table.iter_mut().enumerate() {
            let t = i as f64 - 5.0;
            *slot = 0.09 + 0.002 * t;
        }
        table
    }

    fn scale_at(table: &[f64; 43], t: f64) -> f64 {
        let idx = (t.round().clamp(-5.0, 37.0) as i32 + 5) as usize;
        table[idx]
    }

    /// Scan temperature/conductivity/depth series for bubble and snot
    /// excursions. `climb_start_i` is the first index of the climb leg.
    /// `d_flare_m`/`d_surf_m` are reference depths used by the near-surface
    /// bubble gate. Returns the applied anomalies (to be asserted into
    /// `cond_qc`) separately from anomalies whose peak excursion only
    /// reached "suspect" severity.
    pub fn cond_anomaly(
        temp: &[f64],
        cond: &[f64],
        depth_m: &[f64],
        climb_start_i: usize,
        d_flare_m: f64,
        d_surf_m: f64,
        thresholds: &AnomalyThresholds,
    ) -> (Vec<Anomaly>, Vec<Anomaly>) {
        let n = temp.len();
        let table = cond_temp_scale_table();
        let mut applied = Vec::new();
        let mut suspect = Vec::new();
        let surface_gate = thresholds.surface_bubble_factor * d_flare_m.max(d_surf_m);

        let mut open: Option<(usize, f64, f64)> = None; // (first_point, neg_sum, pos_sum)

        for i in 1..n {
            let dc = cond[i] - cond[i - 1];
            let dt = temp[i] - temp[i - 1];
            if dc.abs() <= dt.abs() {
                continue;
            }
            let ca_diff = scale_at(&table, temp[i - 1]) * dc - dt;
            let leg = if i < climb_start_i { Leg::Dive } else { Leg::Climb };

            if ca_diff.abs() > thresholds.air_bubble_threshold && depth_m[i] < surface_gate {
                applied.push(Anomaly {
                    first_point: i.saturating_sub(1),
                    last_point: i,
                    negative_sum: ca_diff.min(0.0),
                    positive_sum: ca_diff.max(0.0),
                    vertical_extent_m: (depth_m[i] - depth_m[i - 1]).abs(),
                    resolution: Resolution::Bubble,
                    leg,
                    verdict: QcFlag::Bad,
                    suspect_only: false,
                });
                continue;
            }

            if ca_diff.abs() > thresholds.anomaly_diff_factor && dt.abs() < thresholds.thermocline_temp_diff {
                match open {
                    None => {
                        open = Some((i - 1, ca_diff.min(0.0), ca_diff.max(0.0)));
                    }
                    Some((first, neg, pos)) => {
                        let neg2 = neg + ca_diff.min(0.0);
                        let pos2 = pos + ca_diff.max(0.0);
                        if pos2 > neg2.abs() {
                            close_snot(
                                &mut applied,
                                &mut suspect,
                                first,
                                i,
                                neg2,
                                pos2,
                                depth_m,
                                leg,
                                thresholds,
                                Resolution::SnotResolved,
                            );
                            open = None;
                        } else {
                            open = Some((first, neg2, pos2));
                        }
                    }
                }
            }
        }

        if let Some((first, neg, pos)) = open {
            let last = n - 1;
            let leg = if last < climb_start_i { Leg::Dive } else { Leg::Climb };
            close_snot(
                &mut applied,
                &mut suspect,
                first,
                last,
                neg,
                pos,
                depth_m,
                leg,
                thresholds,
                Resolution::SnotUnresolved,
            );
        }

        (applied, suspect)
    }

    #[allow(clippy::too_many_arguments)]
    fn close_snot(
        applied: &mut Vec<Anomaly>,
        suspect: &mut Vec<Anomaly>,
        first: usize,
        last: usize,
        neg: f64,
        pos: f64,
        depth_m: &[f64],
        leg: Leg,
        thresholds: &AnomalyThresholds,
        resolution: Resolution,
    ) {
        let extent = (depth_m[last] - depth_m[first]).abs();
        let verdict = if extent <= thresholds.allowable_cond_anomaly_distance_m {
            QcFlag::Interpolated
        } else {
            QcFlag::Bad
        };
        let peak = neg.abs().max(pos);
        let suspect_only =
            peak > thresholds.acceptable_anomaly_threshold && peak < thresholds.suspect_snot;
        let a = Anomaly {
            first_point: first,
            last_point: last,
            negative_sum: neg,
            positive_sum: pos,
            vertical_extent_m: extent,
            resolution,
            leg,
            verdict,
            suspect_only,
        };
        if suspect_only {
            suspect.push(a);
        } else {
            applied.push(a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgcore_config::ChannelThresholds;

    fn thresholds() -> ChannelThresholds {
        ChannelThresholds {
            min: -5.0,
            max: 40.0,
            spike_shallow: 0.05,
            spike_deep: 0.02,
            spike_depth_m: 100.0,
            noise_window: None,
            noise_sigma: 0.0,
        }
    }

    #[test]
    fn bounds_flags_out_of_range_samples() {
        let mut s = QcSeries::new(vec![10.0, 999.0, 12.0]);
        checks::bounds(&mut s, &thresholds(), QcFlagConfig::Bad);
        assert_eq!(s.qc().get(1), QcFlag::Bad);
        assert_eq!(s.qc().get(0), QcFlag::NoChange);
    }

    #[test]
    fn spike_flags_triple_point_outlier() {
        let mut s = QcSeries::new(vec![10.0, 10.0, 10.0, 15.0, 10.0, 10.0]);
        let depth = vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0];
        checks::spike(&mut s, &depth, &thresholds(), QcFlagConfig::ProbablyBad);
        assert_eq!(s.qc().get(3), QcFlag::ProbablyBad);
    }

    #[test]
    fn inherit_ctd_marks_salinity_bad_from_bad_temperature() {
        let mut temp = QcSeries::new(vec![10.0, 10.0]);
        let mut cond = QcSeries::new(vec![3.0, 3.0]);
        let mut salin = QcSeries::new(vec![35.0, 35.0]);
        temp.qc_mut().assert_at(QcFlag::Bad, [0]);
        reconcile::inherit_ctd(&mut temp, &mut cond, &mut salin);
        assert_eq!(salin.qc().get(0), QcFlag::Bad);
        assert_eq!(salin.qc().get(1), QcFlag::NoChange);
    }

    #[test]
    fn finalized_values_nan_out_terminal_bad_samples() {
        let mut s = QcSeries::new(vec![1.0, 2.0, 3.0]);
        s.qc_mut().assert_at(QcFlag::Bad, [1]);
        let out = s.finalized_values();
        assert_eq!(out[0], 1.0);
        assert!(out[1].is_nan());
        assert_eq!(out[2], 3.0);
    }

    #[test]
    fn anomaly_bookkeeping_respects_sign_and_length_invariant() {
        let temp = vec![10.0, 10.0, 10.0, 10.0, 10.0];
        let cond = vec![3.0, 1.0, 1.0, 3.0, 3.0];
        let depth = vec![1.0, 1.2, 1.4, 1.6, 1.8];
        let cfg = AnomalyThresholds::default();
        let (applied, suspect) = anomaly::cond_anomaly(&temp, &cond, &depth, 100, 2.0, 1.0, &cfg);
        for a in applied.iter().chain(suspect.iter()) {
            assert!(a.negative_sum <= 0.0);
            assert!(a.positive_sum >= 0.0);
            assert_eq!(a.point_count(), a.last_point - a.first_point + 1);
        }
    }
}
