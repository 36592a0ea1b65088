//! Shared numeric primitives for the Seaglider dive-processing workspace:
//! constants, monotone interpolation, triangular smoothing, run-length
//! compression, and a minimal seawater equation-of-state shim.

/// Physical constants used across the flight, thermal and QC crates.
pub mod constants {
    /// Gravitational acceleration used by the flight model (m/s^2).
    pub const GRAVITY: f64 = 9.82;
    /// Reference seawater density (kg/m^3) used where a local EOS value is
    /// not yet available.
    pub const RHO0_REF: f64 = 1027.5;
    /// Grams to kilograms.
    pub const G2KG: f64 = 0.001;
    /// Metres to centimetres.
    pub const M2CM: f64 = 100.0;
    /// Centimetres to metres.
    pub const CM2M: f64 = 0.01;
}

/// The QC flag lattice and its trump (priority) ordering.
///
/// Flags are never "set"; they are *asserted*, and an assertion only takes
/// effect if it is worse (in trump order) than whatever is already there.
/// This makes QC history commutative and associative: the final flag at an
/// index is independent of assertion order, which is what invariant 1 of
/// the processing log relies on.
pub mod qcflag {
    /// One QC verdict on a single sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum QcFlag {
        NoChange = 0,
        Good = 1,
        ProbablyGood = 2,
        ProbablyBad = 3,
        Bad = 4,
        Changed = 5,
        Unsampled = 6,
        Interpolated = 8,
        Missing = 9,
    }

    impl QcFlag {
        /// All flag variants, used to build lookup tables without repeating
        /// the enum elsewhere.
        pub const ALL: [QcFlag; 9] = [
            QcFlag::NoChange,
            QcFlag::Good,
            QcFlag::ProbablyGood,
            QcFlag::ProbablyBad,
            QcFlag::Bad,
            QcFlag::Changed,
            QcFlag::Unsampled,
            QcFlag::Interpolated,
            QcFlag::Missing,
        ];

        /// Trump rank: higher always wins when asserted over a lower rank.
        /// The terminal-bad tier (`UNSAMPLED`/`BAD`/`PROBABLY_BAD`) outranks
        /// everything else and is never downgraded, matching `trump_qc` in
        /// the original `QC.py`: `INTERPOLATED` overrides the good tier but
        /// never `PROBABLY_BAD`/`BAD`/`UNSAMPLED`, and among the bad tier
        /// itself `PROBABLY_BAD` outranks `BAD` outranks `UNSAMPLED`.
        fn rank(self) -> u8 {
            match self {
                QcFlag::NoChange => 0,
                QcFlag::Good => 1,
                QcFlag::ProbablyGood => 1,
                QcFlag::Changed => 1,
                QcFlag::Missing => 1,
                QcFlag::Interpolated => 2,
                QcFlag::Unsampled => 3,
                QcFlag::Bad => 4,
                QcFlag::ProbablyBad => 5,
            }
        }

        /// Numeric code used by the presentation-only integer encoding.
        pub fn as_u8(self) -> u8 {
            self as u8
        }

        /// One-character code used by the presentation-only string encoding
        /// (`'0' + flag`).
        pub fn as_nc_char(self) -> char {
            (b'0' + self.as_u8()) as char
        }

        /// Does this flag mean "discard the value" after final reconciliation?
        pub fn is_terminal_bad(self) -> bool {
            matches!(self, QcFlag::Bad | QcFlag::ProbablyBad | QcFlag::Unsampled)
        }

        /// Does this flag mean the value is usable (not merely "not yet bad")?
        pub fn is_good(self) -> bool {
            matches!(self, QcFlag::Good | QcFlag::ProbablyGood | QcFlag::Changed)
        }

        /// Trump-join of two flags: the one that wins when both are asserted
        /// at the same index, irrespective of order.
        pub fn trump(self, other: QcFlag) -> QcFlag {
            if other.rank() >= self.rank() {
                other
            } else {
                self
            }
        }
    }

    impl Default for QcFlag {
        fn default() -> Self {
            QcFlag::NoChange
        }
    }

    /// An owned, length-`n` QC flag vector with `assert`/`inherit` operations
    /// that enforce the trump ordering; paired value vectors are the
    /// caller's responsibility to keep the same length (see `sgcore_qc`).
    #[derive(Debug, Clone)]
    pub struct QcVector {
        flags: Vec<QcFlag>,
    }

    impl QcVector {
        pub fn new(len: usize) -> Self {
            QcVector { flags: vec![QcFlag::NoChange; len] }
        }

        pub fn len(&self) -> usize {
            self.flags.len()
        }

        pub fn is_empty(&self) -> bool {
            self.flags.is_empty()
        }

        pub fn get(&self, i: usize) -> QcFlag {
            self.flags[i]
        }

        pub fn as_slice(&self) -> &[QcFlag] {
            &self.flags
        }

        /// Assert `flag` at every index in `indices`; a no-op at any index
        /// where the existing flag already trumps `flag`.
        pub fn assert_at(&mut self, flag: QcFlag, indices: impl IntoIterator<Item = usize>) {
            for i in indices {
                self.flags[i] = self.flags[i].trump(flag);
            }
        }

        /// Assert `flag` at every index, unconditionally scanning the whole
        /// vector (convenience for whole-series checks).
        pub fn assert_all(&mut self, flag: QcFlag) {
            for f in self.flags.iter_mut() {
                *f = f.trump(flag);
            }
        }

        /// Inherit the worse of `self` and `other` at every index,
        /// element-wise; used for the T/C -> S cross-inheritance rule.
        pub fn inherit_from(&mut self, other: &QcVector) {
            assert_eq!(self.len(), other.len(), "inherit_from: length mismatch");
            for (f, &o) in self.flags.iter_mut().zip(other.flags.iter()) {
                *f = f.trump(o);
            }
        }

        /// Indices that are not terminally bad.
        pub fn good_indices(&self) -> Vec<usize> {
            self.flags
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.is_terminal_bad())
                .map(|(i, _)| i)
                .collect()
        }
    }
}

/// Monotone cubic Hermite interpolation (Fritsch-Carlson).
///
/// Preserves monotonicity of the input data within each interval, unlike a
/// plain cubic spline, which is why the upstream dive processor uses it for
/// resampling speed and flight-angle series onto a uniform time grid.
pub mod pchip {
    /// Compute Fritsch-Carlson derivative estimates at each knot.
    fn slopes(x: &[f64], y: &[f64]) -> Vec<f64> {
        let n = x.len();
        let mut d = vec![0.0; n];
        if n < 2 {
            return d;
        }
        let mut delta = vec![0.0; n - 1];
        for k in 0..n - 1 {
            delta[k] = (y[k + 1] - y[k]) / (x[k + 1] - x[k]);
        }
        if n == 2 {
            d[0] = delta[0];
            d[1] = delta[0];
            return d;
        }
        for k in 1..n - 1 {
            if delta[k - 1] * delta[k] <= 0.0 {
                d[k] = 0.0;
            } else {
                let h0 = x[k] - x[k - 1];
                let h1 = x[k + 1] - x[k];
                let w0 = 2.0 * h1 + h0;
                let w1 = h1 + 2.0 * h0;
                d[k] = (w0 + w1) / (w0 / delta[k - 1] + w1 / delta[k]);
            }
        }
        d[0] = end_slope(delta[0], delta.get(1).copied(), x[1] - x[0], x.get(2).map(|_| x[2] - x[1]));
        d[n - 1] = end_slope(
            delta[n - 2],
            if n >= 3 { Some(delta[n - 3]) } else { None },
            x[n - 1] - x[n - 2],
            if n >= 3 { Some(x[n - 2] - x[n - 3]) } else { None },
        );
        d
    }

    fn end_slope(d0: f64, d1: Option<f64>, h0: f64, h1: Option<f64>) -> f64 {
        let (Some(d1), Some(h1)) = (d1, h1) else {
            return d0;
        };
        let mut m = ((2.0 * h0 + h1) * d0 - h0 * d1) / (h0 + h1);
        if m * d0 <= 0.0 {
            m = 0.0;
        } else if d0 * d1 <= 0.0 && m.abs() > 3.0 * d0.abs() {
            m = 3.0 * d0;
        }
        m
    }

    /// Evaluate the monotone cubic Hermite interpolant of `(x, y)` at `xi`.
    ///
    /// `x` must be strictly increasing. Query points outside `[x[0], x[n-1]]`
    /// are clamped to the nearest endpoint value (flat extrapolation).
    pub fn pchip(x: &[f64], y: &[f64], xi: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), y.len(), "pchip: x and y must be the same length");
        if x.len() < 2 {
            return xi.iter().map(|_| y.first().copied().unwrap_or(0.0)).collect();
        }
        let d = slopes(x, y);
        let n = x.len();
        xi.iter()
            .map(|&q| {
                if q <= x[0] {
                    return y[0];
                }
                if q >= x[n - 1] {
                    return y[n - 1];
                }
                let k = match x.binary_search_by(|v| v.partial_cmp(&q).unwrap()) {
                    Ok(i) => i.min(n - 2),
                    Err(i) => i.saturating_sub(1).min(n - 2),
                };
                let h = x[k + 1] - x[k];
                let t = (q - x[k]) / h;
                let t2 = t * t;
                let t3 = t2 * t;
                let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
                let h10 = t3 - 2.0 * t2 + t;
                let h01 = -2.0 * t3 + 3.0 * t2;
                let h11 = t3 - t2;
                h00 * y[k] + h10 * h * d[k] + h01 * y[k + 1] + h11 * h * d[k + 1]
            })
            .collect()
    }
}

/// Triangular-window smoothing used by the unsteady-flight filter.
pub mod filters {
    /// Build a symmetric triangular window of half-width `half` samples,
    /// normalised so the weights sum to one.
    pub fn triang(half: usize) -> Vec<f64> {
        let len = 2 * half + 1;
        let mut w: Vec<f64> = (0..len)
            .map(|i| {
                let d = (i as f64 - half as f64).abs();
                1.0 - d / (half as f64 + 1.0)
            })
            .collect();
        let sum: f64 = w.iter().sum();
        if sum > 0.0 {
            for v in w.iter_mut() {
                *v /= sum;
            }
        }
        w
    }

    /// Apply a triangular filter of half-width `half` to `y`, re-normalising
    /// the window at the series' edges so the truncated weights still sum to
    /// one (rather than tapering the result toward zero at the boundary).
    pub fn trifilt(y: &[f64], half: usize) -> Vec<f64> {
        if half == 0 || y.is_empty() {
            return y.to_vec();
        }
        let w = triang(half);
        let n = y.len();
        let mut out = vec![0.0; n];
        for i in 0..n {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n - 1);
            let mut acc = 0.0;
            let mut wsum = 0.0;
            for j in lo..=hi {
                let wi = w[(j as isize - i as isize + half as isize) as usize];
                acc += wi * y[j];
                wsum += wi;
            }
            out[i] = if wsum > 0.0 { acc / wsum } else { y[i] };
        }
        out
    }
}

/// Compress boolean or small-integer-valued runs, used by the processing log
/// to report QC flag ranges instead of one line per sample.
pub mod runlength {
    /// A maximal run of equal values, `[start, end]` inclusive indices.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Run<T> {
        pub start: usize,
        pub end: usize,
        pub value: T,
    }

    /// Compress a slice into maximal runs of equal, consecutive values.
    pub fn compress<T: PartialEq + Copy>(values: &[T]) -> Vec<Run<T>> {
        let mut runs = Vec::new();
        let mut iter = values.iter().enumerate();
        let Some((_, &first)) = iter.next() else {
            return runs;
        };
        let mut start = 0;
        let mut current = first;
        for (i, &v) in iter {
            if v != current {
                runs.push(Run { start, end: i - 1, value: current });
                start = i;
                current = v;
            }
        }
        runs.push(Run { start, end: values.len() - 1, value: current });
        runs
    }
}

/// Minimal seawater equation-of-state helpers.
///
/// These are a pragmatic stand-in for the full UNESCO/TEOS-10 density
/// calculation: accurate enough for the buoyancy terms the flight model
/// needs, not a substitute for a proper oceanographic EOS library.
pub mod seawater {
    /// Density of seawater (kg/m^3) from practical salinity, in-situ
    /// temperature (degC) and pressure (dbar), using the UNESCO 1980
    /// (Millero & Poisson) formulation restricted to its linear pressure term.
    pub fn density(s: f64, t: f64, p: f64) -> f64 {
        let t2 = t * t;
        let t3 = t2 * t;
        let t4 = t3 * t;
        let rho_sw = 999.842_594 + 6.793_952e-2 * t - 9.095_290e-3 * t2 + 1.001_685e-4 * t3
            - 1.120_083e-6 * t4
            + 6.536_332e-9 * t4 * t;
        let a = 8.24493e-1 - 4.0899e-3 * t + 7.6438e-5 * t2 - 8.2467e-7 * t3 + 5.3875e-9 * t4;
        let b = -5.72466e-3 + 1.0227e-4 * t - 1.6546e-6 * t2;
        let c = 4.8314e-4;
        let rho0 = rho_sw + a * s + b * s.powf(1.5) + c * s * s;
        // first-order in-situ pressure correction; good to a few parts per
        // thousand over the operating pressure range of a glider.
        rho0 * (1.0 + 4.5e-6 * p)
    }

    /// Dynamic viscosity of seawater (Pa*s), after Sharqawy et al., good to a
    /// few percent over the glider's temperature/salinity operating range.
    pub fn viscosity(s: f64, t: f64) -> f64 {
        let mu_w = 4.2844e-5 + 1.0 / (0.157 * (t + 64.993).powi(2) - 91.296);
        let a = 1.541 + 1.998e-2 * t - 9.52e-5 * t * t;
        let b = 7.974 - 7.561e-2 * t + 4.724e-4 * t * t;
        mu_w * (1.0 + a * (s / 1000.0) + b * (s / 1000.0).powi(2))
    }

    const PSS78_A: [f64; 6] = [0.0080, -0.1692, 25.3851, 14.0941, -7.0261, 2.7081];
    const PSS78_B: [f64; 6] = [0.0005, -0.0056, -0.0066, -0.0375, 0.0636, -0.0144];
    const PSS78_C: [f64; 5] = [0.6766097, 2.00564e-2, 1.104259e-4, -6.9698e-7, 1.0031e-9];
    const PSS78_D: [f64; 4] = [3.426e-2, 4.464e-4, 4.215e-3, -3.107e-3];
    const PSS78_E: [f64; 3] = [2.070e-5, -6.370e-10, 3.989e-15];
    const PSS78_K: f64 = 0.0162;

    fn pss78_rt(t: f64) -> f64 {
        PSS78_C[0] + t * (PSS78_C[1] + t * (PSS78_C[2] + t * (PSS78_C[3] + t * PSS78_C[4])))
    }

    fn pss78_rp(p: f64, t: f64, r: f64) -> f64 {
        let num = p * (PSS78_E[0] + p * (PSS78_E[1] + p * PSS78_E[2]));
        let den = 1.0 + PSS78_D[0] * t + PSS78_D[1] * t * t + (PSS78_D[2] + PSS78_D[3] * t) * r;
        1.0 + num / den
    }

    /// Practical salinity (PSS-78) from conductivity ratio `r = C /
    /// C(35,15,0)`, in-situ temperature (degC, IPTS-68) and pressure
    /// (dbar). This is the formula used by the CTD community (e.g. the GSW
    /// toolbox's `gsw_sp_from_c`), reproduced here rather than pulled in as
    /// a dependency since it is a handful of polynomial terms.
    pub fn salinity_from_cond_ratio(r: f64, t: f64, p: f64) -> f64 {
        let rt = pss78_rt(t);
        let rp = pss78_rp(p, t, r);
        let rtotal = r / (rt * rp);
        let sqrt_r = rtotal.max(0.0).sqrt();
        let poly = |c: &[f64; 6]| c[0] + sqrt_r * (c[1] + sqrt_r * (c[2] + sqrt_r * (c[3] + sqrt_r * (c[4] + sqrt_r * c[5]))));
        let ds = ((t - 15.0) / (1.0 + PSS78_K * (t - 15.0))) * poly(&PSS78_B);
        poly(&PSS78_A) + ds
    }

    /// Inverse of [`salinity_from_cond_ratio`]: conductivity ratio that
    /// reproduces a target practical salinity at the given temperature and
    /// pressure, by Newton iteration (the forward map is smooth and
    /// monotone over the oceanographic range).
    pub fn cond_ratio_from_salinity(s: f64, t: f64, p: f64) -> f64 {
        let mut r = (s / 35.0).max(1e-6);
        for _ in 0..30 {
            let f = salinity_from_cond_ratio(r, t, p) - s;
            let eps = 1e-6;
            let df = (salinity_from_cond_ratio(r + eps, t, p) - salinity_from_cond_ratio(r, t, p)) / eps;
            if df.abs() < 1e-12 {
                break;
            }
            let step = f / df;
            r -= step;
            if step.abs() < 1e-10 {
                break;
            }
        }
        r
    }
}

/// Small numeric helpers used throughout the solver and preflight crates.
pub mod numeric {
    /// Clamp `v` into `[lo, hi]`.
    #[inline]
    pub fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
        v.max(lo).min(hi)
    }

    /// Linear interpolation of `(x, y)` at a single query point `xi`, with
    /// flat extrapolation outside the domain. `x` must be sorted ascending.
    pub fn interp1(x: &[f64], y: &[f64], xi: f64) -> f64 {
        let n = x.len();
        if n == 0 {
            return f64::NAN;
        }
        if n == 1 || xi <= x[0] {
            return y[0];
        }
        if xi >= x[n - 1] {
            return y[n - 1];
        }
        let k = match x.binary_search_by(|v| v.partial_cmp(&xi).unwrap()) {
            Ok(i) => return y[i],
            Err(i) => i - 1,
        };
        let t = (xi - x[k]) / (x[k + 1] - x[k]);
        y[k] + t * (y[k + 1] - y[k])
    }

    /// Simple moving median over a centred window of `half*2+1` samples,
    /// used by the raw-data noise check to detrend before thresholding.
    pub fn median_filter(y: &[f64], half: usize) -> Vec<f64> {
        let n = y.len();
        let mut out = vec![0.0; n];
        for i in 0..n {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n.saturating_sub(1));
            let mut window: Vec<f64> = y[lo..=hi].to_vec();
            window.sort_by(|a, b| a.partial_cmp(b).unwrap());
            out[i] = window[window.len() / 2];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pchip_reproduces_linear_data_exactly() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [0.0, 1.0, 2.0, 3.0];
        let xi = [0.5, 1.5, 2.5];
        let yi = pchip::pchip(&x, &y, &xi);
        for (a, b) in yi.iter().zip(&xi) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn pchip_is_monotone_on_monotone_data() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [0.0, 0.1, 5.0, 5.1, 10.0];
        let xi: Vec<f64> = (0..=40).map(|i| i as f64 * 0.1).collect();
        let yi = pchip::pchip(&x, &y, &xi);
        for w in yi.windows(2) {
            assert!(w[1] >= w[0] - 1e-9);
        }
    }

    #[test]
    fn trifilt_preserves_constant_series() {
        let y = vec![2.0; 10];
        let out = filters::trifilt(&y, 3);
        for v in out {
            assert!((v - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn runlength_compresses_repeated_values() {
        let v = [0u8, 0, 0, 1, 1, 0, 2];
        let runs = runlength::compress(&v);
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0], runlength::Run { start: 0, end: 2, value: 0 });
        assert_eq!(runs[3], runlength::Run { start: 6, end: 6, value: 2 });
    }

    #[test]
    fn qcflag_trump_never_downgrades() {
        use qcflag::QcFlag::*;
        assert_eq!(Bad.trump(Good), Bad);
        assert_eq!(Good.trump(Bad), Bad);
        assert_eq!(ProbablyBad.trump(Bad), ProbablyBad);
        assert_eq!(Unsampled.trump(NoChange), Unsampled);
    }

    #[test]
    fn qcvector_assert_is_order_independent() {
        use qcflag::QcFlag::*;
        let mut a = qcflag::QcVector::new(3);
        a.assert_at(Bad, [0]);
        a.assert_at(ProbablyBad, [0]);
        let mut b = qcflag::QcVector::new(3);
        b.assert_at(ProbablyBad, [0]);
        b.assert_at(Bad, [0]);
        assert_eq!(a.get(0), b.get(0));
    }

    #[test]
    fn salinity_cond_ratio_round_trips() {
        for &(s, t, p) in &[(35.0, 10.0, 0.0), (33.5, 2.0, 500.0), (36.2, 25.0, 100.0)] {
            let r = seawater::cond_ratio_from_salinity(s, t, p);
            let s2 = seawater::salinity_from_cond_ratio(r, t, p);
            assert!((s2 - s).abs() < 1e-6, "round trip failed: s={s} t={t} p={p} -> s2={s2}");
        }
    }

    #[test]
    fn seawater_density_increases_with_salinity() {
        let low = seawater::density(30.0, 10.0, 0.0);
        let high = seawater::density(36.0, 10.0, 0.0);
        assert!(high > low);
    }
}
