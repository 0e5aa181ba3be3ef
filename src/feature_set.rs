use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::records::{CalibrationRow, MatchupTier};

pub const RATING_DIFF: &str = "rating_diff";
pub const HFA_POINTS: &str = "hfa_points";
pub const RATING_DIFF_SQ: &str = "rating_diff_sq";
pub const TALENT_DIFF: &str = "talent_diff";
pub const EPA_EDGE_DIFF_3G: &str = "epa_edge_diff_3g";
pub const SUCCESS_EDGE_DIFF_3G: &str = "success_edge_diff_3g";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitLabel {
    Core,
    Extended,
}

impl FitLabel {
    pub fn key(self) -> &'static str {
        match self {
            FitLabel::Core => "core",
            FitLabel::Extended => "extended",
        }
    }
}

impl FromStr for FitLabel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "core" => Ok(FitLabel::Core),
            "extended" => Ok(FitLabel::Extended),
            other => Err(format!("unknown fit label '{other}' (expected core|extended)")),
        }
    }
}

impl fmt::Display for FitLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Continuous,
    /// 0/1 flag: neither winsorized nor standardized.
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureSpec {
    pub fn continuous(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Continuous,
        }
    }

    pub fn binary(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FeatureKind::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub label: String,
    pub specs: Vec<FeatureSpec>,
}

impl FeatureSet {
    pub fn for_label(label: FitLabel) -> Self {
        let mut specs = vec![
            FeatureSpec::continuous(RATING_DIFF),
            FeatureSpec::continuous(HFA_POINTS),
        ];
        if label == FitLabel::Extended {
            specs.push(FeatureSpec::continuous(RATING_DIFF_SQ));
            specs.push(FeatureSpec::continuous(TALENT_DIFF));
            specs.extend(
                MatchupTier::DUMMIES
                    .iter()
                    .map(|t| FeatureSpec::binary(t.dummy_name())),
            );
            specs.push(FeatureSpec::continuous(EPA_EDGE_DIFF_3G));
            specs.push(FeatureSpec::continuous(SUCCESS_EDGE_DIFF_3G));
        }
        Self {
            label: label.key().to_string(),
            specs,
        }
    }

    pub fn custom(label: &str, specs: Vec<FeatureSpec>) -> Self {
        Self {
            label: label.to_string(),
            specs,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.iter().any(|s| s.name == name)
    }

    pub fn without(&self, name: &str) -> Self {
        Self {
            label: self.label.clone(),
            specs: self.specs.iter().filter(|s| s.name != name).cloned().collect(),
        }
    }
}

/// Column-major design matrix with its target, weights and row keys.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    pub names: Vec<String>,
    pub kinds: Vec<FeatureKind>,
    pub columns: Vec<Vec<f64>>,
    pub target: Vec<f64>,
    pub weights: Vec<f64>,
    pub weeks: Vec<u32>,
    pub game_ids: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesignBuild {
    pub used: usize,
    /// Rows missing at least one feature of the set.
    pub excluded_missing: usize,
    pub excluded_bad_weight: usize,
}

impl DesignMatrix {
    /// Rows with a missing feature or a non-positive weight are excluded and counted.
    /// The target is clipped to `[-spread_clip, spread_clip]`.
    pub fn from_rows(
        rows: &[CalibrationRow],
        set: &FeatureSet,
        spread_clip: f64,
    ) -> (DesignMatrix, DesignBuild) {
        let p = set.specs.len();
        let mut out = DesignMatrix {
            names: set.specs.iter().map(|s| s.name.clone()).collect(),
            kinds: set.specs.iter().map(|s| s.kind).collect(),
            columns: vec![Vec::with_capacity(rows.len()); p],
            target: Vec::with_capacity(rows.len()),
            weights: Vec::with_capacity(rows.len()),
            weeks: Vec::with_capacity(rows.len()),
            game_ids: Vec::with_capacity(rows.len()),
        };
        let mut build = DesignBuild::default();

        for row in rows {
            if !(row.weight.is_finite() && row.weight > 0.0) || !row.market_spread.is_finite() {
                build.excluded_bad_weight += 1;
                continue;
            }
            let values: Option<Vec<f64>> =
                set.specs.iter().map(|s| row.feature_value(&s.name)).collect();
            let Some(values) = values else {
                build.excluded_missing += 1;
                continue;
            };
            for (col, v) in out.columns.iter_mut().zip(values) {
                col.push(v);
            }
            out.target
                .push(row.market_spread.clamp(-spread_clip, spread_clip));
            out.weights.push(row.weight);
            out.weeks.push(row.week);
            out.game_ids.push(row.game_id);
            build.used += 1;
        }
        (out, build)
    }

    pub fn from_columns(
        names: Vec<String>,
        columns: Vec<Vec<f64>>,
        target: Vec<f64>,
        weights: Vec<f64>,
    ) -> ModelResult<DesignMatrix> {
        let n = target.len();
        if names.len() != columns.len() {
            return Err(ModelError::DimensionMismatch {
                context: "design column names",
                expected: columns.len(),
                actual: names.len(),
            });
        }
        if weights.len() != n {
            return Err(ModelError::DimensionMismatch {
                context: "design weights",
                expected: n,
                actual: weights.len(),
            });
        }
        if let Some(col) = columns.iter().find(|c| c.len() != n) {
            return Err(ModelError::DimensionMismatch {
                context: "design column length",
                expected: n,
                actual: col.len(),
            });
        }
        let kinds = vec![FeatureKind::Continuous; names.len()];
        Ok(DesignMatrix {
            names,
            kinds,
            columns,
            target,
            weights,
            weeks: vec![1; n],
            game_ids: (0..n as u64).collect(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.target.len()
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, i: usize) -> Vec<f64> {
        self.columns.iter().map(|c| c[i]).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn subset(&self, idx: &[usize]) -> DesignMatrix {
        let pick = |v: &Vec<f64>| idx.iter().map(|&i| v[i]).collect::<Vec<f64>>();
        DesignMatrix {
            names: self.names.clone(),
            kinds: self.kinds.clone(),
            columns: self.columns.iter().map(pick).collect(),
            target: pick(&self.target),
            weights: pick(&self.weights),
            weeks: idx.iter().map(|&i| self.weeks[i]).collect(),
            game_ids: idx.iter().map(|&i| self.game_ids[i]).collect(),
        }
    }

    pub fn drop_column(&mut self, j: usize) {
        self.names.remove(j);
        self.kinds.remove(j);
        self.columns.remove(j);
    }

    pub fn without_column(&self, name: &str) -> DesignMatrix {
        let mut out = self.clone();
        if let Some(j) = out.column_index(name) {
            out.drop_column(j);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataQuality;
    use std::collections::BTreeMap;

    fn row(game_id: u64, talent: Option<f64>, spread: f64) -> CalibrationRow {
        CalibrationRow {
            game_id,
            season: 2024,
            week: 2,
            home_team: "h".into(),
            away_team: "a".into(),
            rating_diff: 4.0,
            hfa_points: 2.0,
            matchup_tier: MatchupTier::P5G5,
            talent_diff: talent,
            extras: BTreeMap::new(),
            market_spread: spread,
            quality: DataQuality::High,
            low_sample: false,
            weight: 1.0,
        }
    }

    #[test]
    fn extended_set_lists_core_first() {
        let set = FeatureSet::for_label(FitLabel::Extended);
        assert_eq!(set.specs[0].name, RATING_DIFF);
        assert_eq!(set.specs[1].name, HFA_POINTS);
        assert!(set.contains("tier_g5_fcs"));
        assert!(!set.contains("tier_p5_p5"));
        assert_eq!(FeatureSet::for_label(FitLabel::Core).specs.len(), 2);
    }

    #[test]
    fn rows_missing_a_feature_are_excluded_and_counted() {
        let rows = vec![row(1, Some(10.0), 3.0), row(2, None, 70.0)];
        let set = FeatureSet::custom(
            "t",
            vec![FeatureSpec::continuous(RATING_DIFF), FeatureSpec::continuous(TALENT_DIFF)],
        );
        let (x, build) = DesignMatrix::from_rows(&rows, &set, 45.0);
        assert_eq!(build.used, 1);
        assert_eq!(build.excluded_missing, 1);
        assert_eq!(x.row(0), vec![4.0, 10.0]);

        let (x, _) = DesignMatrix::from_rows(&rows, &FeatureSet::for_label(FitLabel::Core), 45.0);
        assert_eq!(x.target, vec![3.0, 45.0]);
    }

    #[test]
    fn subset_keeps_keys_aligned() {
        let rows: Vec<_> = (0..5).map(|i| row(i, None, i as f64)).collect();
        let (x, _) = DesignMatrix::from_rows(&rows, &FeatureSet::for_label(FitLabel::Core), 45.0);
        let s = x.subset(&[4, 1]);
        assert_eq!(s.game_ids, vec![4, 1]);
        assert_eq!(s.target, vec![4.0, 1.0]);
    }
}
