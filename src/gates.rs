use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;
use crate::feature_set::{HFA_POINTS, RATING_DIFF, RATING_DIFF_SQ};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GateBound {
    AtLeast(f64),
    AtMost(f64),
    Between(f64, f64),
    /// Strictly greater than.
    Above(f64),
}

impl GateBound {
    /// Distance inside the bound (positive) or outside it (negative).
    fn margin(&self, observed: f64) -> f64 {
        match *self {
            GateBound::AtLeast(t) | GateBound::Above(t) => observed - t,
            GateBound::AtMost(t) => t - observed,
            GateBound::Between(lo, hi) => (observed - lo).min(hi - observed),
        }
    }

    fn holds(&self, observed: f64) -> bool {
        match *self {
            GateBound::AtLeast(t) => observed >= t,
            GateBound::AtMost(t) => observed <= t,
            GateBound::Between(lo, hi) => observed >= lo && observed <= hi,
            GateBound::Above(t) => observed > t,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub observed: Option<f64>,
    pub threshold: GateBound,
    pub margin: Option<f64>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GateResult {
    fn evaluate(name: impl Into<String>, observed: Option<f64>, threshold: GateBound) -> Self {
        let observed = observed.filter(|v| v.is_finite());
        Self {
            name: name.into(),
            observed,
            threshold,
            margin: observed.map(|v| threshold.margin(v)),
            passed: observed.is_some_and(|v| threshold.holds(v)),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub gates_passed: bool,
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn failed(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn get(&self, name: &str) -> Option<&GateResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

pub struct GateInputs<'a> {
    /// Walk-forward predictions and the matching market spreads.
    pub predictions: &'a [f64],
    pub actuals: &'a [f64],
    pub walk_forward_rmse: f64,
    /// Fitted coefficients by feature name (any scale with positive factors).
    pub coefficients: &'a [(String, f64)],
    /// Walk-forward RMSE without the quadratic term minus with it.
    pub quadratic_rmse_gain: Option<f64>,
}

/// OLS slope of `y` on `x`.
pub fn slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..n {
        sxy += (x[i] - mx) * (y[i] - my);
        sxx += (x[i] - mx) * (x[i] - mx);
    }
    (sxx > 0.0).then(|| sxy / sxx)
}

pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let (dx, dy) = (x[i] - mx, y[i] - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let denom = (sxx * syy).sqrt();
    (denom > 0.0).then(|| sxy / denom)
}

/// Ranks starting at 1; ties share the average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && values[idx[j + 1]] == values[idx[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &idx[i..=j] {
            out[k] = avg;
        }
        i = j + 1;
    }
    out
}

pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    pearson(&ranks(&x[..n]), &ranks(&y[..n]))
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Share of games where prediction and market pick the same side (a pick'em counts as its own side).
pub fn sign_agreement(pred: &[f64], actual: &[f64]) -> Option<f64> {
    let n = pred.len().min(actual.len());
    if n == 0 {
        return None;
    }
    let agree = pred
        .iter()
        .zip(actual)
        .filter(|(p, a)| sign(**p) == sign(**a))
        .count();
    Some(agree as f64 / n as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketResidual {
    pub label: String,
    pub rows: usize,
    pub mean_abs_residual: Option<f64>,
}

fn bucket_labels(edges: &[f64]) -> Vec<String> {
    let mut labels = Vec::with_capacity(edges.len() + 1);
    let mut lo = 0.0;
    for e in edges {
        labels.push(format!("{lo}-{e}"));
        lo = *e;
    }
    labels.push(format!(">{lo}"));
    labels
}

/// Mean absolute residual grouped by |actual spread| bucket.
pub fn bucket_residuals(pred: &[f64], actual: &[f64], edges: &[f64]) -> Vec<BucketResidual> {
    let mut sums = vec![0.0; edges.len() + 1];
    let mut counts = vec![0usize; edges.len() + 1];
    for (p, a) in pred.iter().zip(actual) {
        let b = edges.iter().position(|e| a.abs() < *e).unwrap_or(edges.len());
        sums[b] += (p - a).abs();
        counts[b] += 1;
    }
    bucket_labels(edges)
        .into_iter()
        .enumerate()
        .map(|(i, label)| BucketResidual {
            label,
            rows: counts[i],
            mean_abs_residual: (counts[i] > 0).then(|| sums[i] / counts[i] as f64),
        })
        .collect()
}

fn coefficient(coefs: &[(String, f64)], name: &str) -> Option<f64> {
    coefs.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
}

/// Evaluates every gate. `gates_passed` is the conjunction of all results.
pub fn check_gates(inputs: &GateInputs<'_>, t: &GateThresholds) -> GateReport {
    let pred = inputs.predictions;
    let actual = inputs.actuals;
    let mut results = vec![
        GateResult::evaluate(
            "calibration_slope",
            slope(pred, actual),
            GateBound::Between(t.slope_min, t.slope_max),
        ),
        GateResult::evaluate(
            "walk_forward_rmse",
            Some(inputs.walk_forward_rmse),
            GateBound::AtMost(t.rmse_ceiling),
        ),
        GateResult::evaluate(
            "sign_agreement",
            sign_agreement(pred, actual),
            GateBound::AtLeast(t.sign_agreement_min),
        ),
        GateResult::evaluate("pearson", pearson(pred, actual), GateBound::AtLeast(t.pearson_min)),
        GateResult::evaluate("spearman", spearman(pred, actual), GateBound::AtLeast(t.spearman_min)),
    ];

    for name in [RATING_DIFF, HFA_POINTS] {
        let coef = coefficient(inputs.coefficients, name);
        let mut r = GateResult::evaluate(format!("coef_{name}_positive"), coef, GateBound::Above(0.0));
        if coef.is_none() {
            r = r.with_detail("feature absent from the fitted model");
        }
        results.push(r);
    }

    if let Some(q) = coefficient(inputs.coefficients, RATING_DIFF_SQ)
        && q < 0.0
    {
        let r = GateResult::evaluate(
            "quadratic_term_justified",
            inputs.quadratic_rmse_gain,
            GateBound::Above(0.0),
        )
        .with_detail(format!("{RATING_DIFF_SQ} coefficient {q:.4} is negative"));
        results.push(r);
    }

    for (bucket, ceiling) in bucket_residuals(pred, actual, &t.bucket_edges)
        .into_iter()
        .zip(&t.bucket_mae_ceilings)
    {
        if bucket.rows < t.min_bucket_rows {
            continue;
        }
        let r = GateResult::evaluate(
            format!("bucket_mae_{}", bucket.label),
            bucket.mean_abs_residual,
            GateBound::AtMost(*ceiling),
        )
        .with_detail(format!("{} rows", bucket.rows));
        results.push(r);
    }

    GateReport {
        gates_passed: results.iter().all(|r| r.passed),
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn spearman_handles_ties() {
        let x = [1.0, 2.0, 2.0, 3.0];
        assert_eq!(ranks(&x), vec![1.0, 2.5, 2.5, 4.0]);
        assert_relative_eq!(spearman(&x, &x).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn slope_of_identity_is_one() {
        let x = [1.0, -2.0, 5.0, 7.0];
        assert_relative_eq!(slope(&x, &x).unwrap(), 1.0, epsilon = 1e-12);
        assert_eq!(slope(&[1.0, 1.0], &[2.0, 3.0]), None);
    }

    #[test]
    fn zero_spread_counts_as_its_own_side() {
        let agree = sign_agreement(&[0.0, 1.0, -1.0, 2.0], &[0.0, 3.0, 1.0, -2.0]).unwrap();
        assert_relative_eq!(agree, 0.5);
    }

    #[test]
    fn buckets_split_on_absolute_actual() {
        let b = bucket_residuals(&[1.0, -8.0, 20.0, 35.0], &[0.0, -10.0, 15.0, 30.0], &[7.0, 14.0, 28.0]);
        assert_eq!(b.iter().map(|r| r.rows).collect::<Vec<_>>(), vec![1, 1, 1, 1]);
        assert_eq!(b[1].mean_abs_residual, Some(2.0));
        assert_eq!(b[3].label, ">28");
    }

    #[test]
    fn margin_is_signed_distance() {
        assert_relative_eq!(GateBound::Between(0.9, 1.1).margin(1.0), 0.1, epsilon = 1e-12);
        assert!(GateBound::AtMost(7.5).margin(8.0) < 0.0);
        assert!(!GateBound::Above(0.0).holds(0.0));
    }

    #[test]
    fn missing_core_coefficient_fails_its_gate() {
        let pred = [1.0, 2.0, 3.0];
        let coefs = vec![(HFA_POINTS.to_string(), 1.0)];
        let report = check_gates(
            &GateInputs {
                predictions: &pred,
                actuals: &pred,
                walk_forward_rmse: 0.0,
                coefficients: &coefs,
                quadratic_rmse_gain: None,
            },
            &GateThresholds::high_quality(),
        );
        let g = report.get("coef_rating_diff_positive").unwrap();
        assert!(!g.passed);
        assert!(g.observed.is_none());
        assert!(!report.gates_passed);
    }
}
