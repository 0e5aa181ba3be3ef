use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::HygieneConfig;
use crate::error::{ModelError, ModelResult};
use crate::feature_set::{DesignMatrix, FeatureKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WinsorBounds {
    pub lo: f64,
    pub hi: f64,
}

impl WinsorBounds {
    pub fn clip(&self, v: f64) -> f64 {
        v.clamp(self.lo, self.hi)
    }
}

/// Nearest-rank tail bounds: with sorted `s`, `k = floor(tail * (n - 1))`, bounds are
/// `s[k]` and `s[n-1-k]`. Clipping to these leaves the order statistics at `k` and
/// `n-1-k` unchanged, so a second pass is a no-op.
pub fn winsor_bounds(values: &[f64], tail: f64) -> Option<WinsorBounds> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let k = ((tail * (n - 1) as f64) + 1e-9).floor() as usize;
    let k = k.min((n - 1) / 2);
    Some(WinsorBounds {
        lo: sorted[k],
        hi: sorted[n - 1 - k],
    })
}

/// Clips in place and returns the indices of the rows that moved.
pub fn winsorize_column(values: &mut [f64], bounds: WinsorBounds) -> Vec<usize> {
    let mut clipped = Vec::new();
    for (i, v) in values.iter_mut().enumerate() {
        let c = bounds.clip(*v);
        if c != *v {
            *v = c;
            clipped.push(i);
        }
    }
    clipped
}

/// Same as [`winsor_bounds`] + [`winsorize_column`], ignoring nulls.
pub fn winsorize_optional(
    values: &mut [Option<f64>],
    tail: f64,
) -> (Option<WinsorBounds>, Vec<usize>) {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let Some(bounds) = winsor_bounds(&present, tail) else {
        return (None, Vec::new());
    };
    let mut clipped = Vec::new();
    for (i, v) in values.iter_mut().enumerate() {
        if let Some(x) = v {
            let c = bounds.clip(*x);
            if c != *x {
                *x = c;
                clipped.push(i);
            }
        }
    }
    (Some(bounds), clipped)
}

/// Unweighted mean and population standard deviation.
pub fn column_stats(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.max(0.0).sqrt())
}

pub fn standardize_column(values: &mut [f64], mean: f64, std: f64) {
    for v in values.iter_mut() {
        *v = (*v - mean) / std;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnHygiene {
    pub name: String,
    pub kind: FeatureKind,
    pub bounds: Option<WinsorBounds>,
    pub clipped_rows: usize,
    /// Statistics after clipping; identity (0, 1) for binary columns.
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HygieneReport {
    pub columns: Vec<ColumnHygiene>,
    pub dropped: Vec<String>,
}

impl HygieneReport {
    pub fn column(&self, name: &str) -> Option<&ColumnHygiene> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Winsorizes then standardizes continuous columns and drops zero-variance columns.
/// Binary columns are only checked for variance.
pub fn apply_hygiene(design: &mut DesignMatrix, cfg: &HygieneConfig) -> ModelResult<HygieneReport> {
    let mut report = HygieneReport::default();
    let mut keep = Vec::with_capacity(design.n_features());

    for j in 0..design.n_features() {
        let name = design.names[j].clone();
        let kind = design.kinds[j];
        let col = &mut design.columns[j];

        let (bounds, clipped_rows) = match kind {
            FeatureKind::Continuous => match winsor_bounds(col, cfg.tail_fraction) {
                Some(b) => (Some(b), winsorize_column(col, b).len()),
                None => (None, 0),
            },
            FeatureKind::Binary => (None, 0),
        };
        let (mean, std) = column_stats(col);
        if std < cfg.zero_variance_std {
            warn!(feature = %name, std, "dropping zero-variance feature");
            report.dropped.push(name);
            keep.push(false);
            continue;
        }
        let (mean, std) = match kind {
            FeatureKind::Continuous => {
                standardize_column(col, mean, std);
                (mean, std)
            }
            FeatureKind::Binary => (0.0, 1.0),
        };
        if clipped_rows > 0 {
            debug!(feature = %name, clipped_rows, "winsorized");
        }
        report.columns.push(ColumnHygiene {
            name,
            kind,
            bounds,
            clipped_rows,
            mean,
            std,
        });
        keep.push(true);
    }

    for j in (0..keep.len()).rev() {
        if !keep[j] {
            design.drop_column(j);
        }
    }
    if design.n_features() == 0 {
        return Err(ModelError::NoUsableFeatures);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn nearest_rank_bounds_clip_extremes() {
        let mut v: Vec<f64> = (0..201).map(|i| i as f64).collect();
        v[0] = -1000.0;
        v[200] = 5000.0;
        let b = winsor_bounds(&v, 0.01).unwrap();
        // k = floor(0.01 * 200) = 2
        assert_eq!(b.lo, 2.0);
        assert_eq!(b.hi, 198.0);
        let clipped = winsorize_column(&mut v, b);
        assert_eq!(clipped, vec![0, 1, 199, 200]);
    }

    #[test]
    fn winsorize_is_idempotent() {
        let mut v = vec![-50.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 90.0];
        let b1 = winsor_bounds(&v, 0.2).unwrap();
        winsorize_column(&mut v, b1);
        let before = v.clone();
        let b2 = winsor_bounds(&v, 0.2).unwrap();
        assert_eq!(b1, b2);
        assert!(winsorize_column(&mut v, b2).is_empty());
        assert_eq!(v, before);
    }

    #[test]
    fn optional_values_keep_nulls() {
        let mut v = vec![Some(1.0), None, Some(2.0), Some(3.0)];
        let (b, clipped) = winsorize_optional(&mut v, 0.5);
        assert!(b.is_some());
        assert_eq!(v[1], None);
        assert_eq!(clipped.len(), 2);
        let (b, clipped) = winsorize_optional(&mut [None, None], 0.01);
        assert!(b.is_none() && clipped.is_empty());
    }

    #[test]
    fn standardized_column_has_zero_mean_unit_std() {
        let mut v = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let (m, s) = column_stats(&v);
        assert_relative_eq!(m, 5.0);
        assert_relative_eq!(s, 2.0);
        standardize_column(&mut v, m, s);
        let (m2, s2) = column_stats(&v);
        assert_relative_eq!(m2, 0.0, epsilon = 1e-12);
        assert_relative_eq!(s2, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_column_is_dropped() {
        let mut x = DesignMatrix::from_columns(
            vec!["a".into(), "flat".into()],
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0; 4]],
            vec![0.0; 4],
            vec![1.0; 4],
        )
        .unwrap();
        let report = apply_hygiene(&mut x, &HygieneConfig::default()).unwrap();
        assert_eq!(report.dropped, vec!["flat".to_string()]);
        assert_eq!(x.names, vec!["a".to_string()]);
        assert!(report.column("flat").is_none());
    }

    #[test]
    fn all_constant_is_an_error() {
        let mut x = DesignMatrix::from_columns(
            vec!["flat".into()],
            vec![vec![1.0; 3]],
            vec![0.0; 3],
            vec![1.0; 3],
        )
        .unwrap();
        assert!(matches!(
            apply_hygiene(&mut x, &HygieneConfig::default()),
            Err(ModelError::NoUsableFeatures)
        ));
    }
}
