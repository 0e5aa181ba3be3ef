use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calibration::{FittedCoefficient, FittedModel};
use crate::config::{BlendConfig, HfaConfig};
use crate::error::ModelResult;
use crate::feature_set::{FeatureKind, HFA_POINTS, RATING_DIFF, RATING_DIFF_SQ};
use crate::records::{CalibrationRow, finite_opt};
use crate::stats_loader::normalize_team;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub primary: f64,
    pub secondary: Option<f64>,
}

/// Blends a primary and a secondary power rating on the z-score scale and maps the
/// result back onto the primary scale.
#[derive(Debug, Clone)]
pub struct RatingBlender {
    cfg: BlendConfig,
}

impl RatingBlender {
    pub fn new(cfg: BlendConfig) -> ModelResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &BlendConfig {
        &self.cfg
    }

    pub fn blend(&self, rating: &TeamRating) -> f64 {
        let c = &self.cfg;
        let Some(secondary) = finite_opt(rating.secondary) else {
            return rating.primary;
        };
        let z_primary = (rating.primary - c.primary_mean) / c.primary_std;
        let mut z_secondary = (secondary - c.secondary_mean) / c.secondary_std;
        if !c.secondary_higher_is_better {
            z_secondary = -z_secondary;
        }
        let z = c.weight * z_primary + (1.0 - c.weight) * z_secondary;
        c.primary_mean + z * c.primary_std
    }

    pub fn rating_diff(&self, home: &TeamRating, away: &TeamRating) -> f64 {
        self.blend(home) - self.blend(away)
    }
}

/// Zero at neutral sites, otherwise `clip(base + team adjustment, clip_min, clip_max)`.
/// Adjustment keys match on normalized team names.
pub fn hfa_points(cfg: &HfaConfig, home_team: &str, neutral_site: bool) -> f64 {
    if neutral_site {
        return 0.0;
    }
    let key = normalize_team(home_team);
    let adj = cfg
        .team_adjustments
        .iter()
        .find(|(team, _)| normalize_team(team) == key)
        .map_or(0.0, |(_, v)| *v);
    (cfg.base_points + adj).clamp(cfg.clip_min, cfg.clip_max)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionInput {
    pub features: BTreeMap<String, f64>,
    /// Home minus away.
    pub market_spread: Option<f64>,
}

impl PredictionInput {
    pub fn core(rating_diff: f64, hfa_points: f64) -> Self {
        let mut features = BTreeMap::new();
        features.insert(RATING_DIFF.to_string(), rating_diff);
        features.insert(HFA_POINTS.to_string(), hfa_points);
        features.insert(RATING_DIFF_SQ.to_string(), rating_diff * rating_diff);
        Self {
            features,
            market_spread: None,
        }
    }

    pub fn with_feature(mut self, name: &str, value: f64) -> Self {
        self.features.insert(name.to_string(), value);
        self
    }

    pub fn with_market(mut self, market_spread: f64) -> Self {
        self.market_spread = Some(market_spread);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Home minus away.
    pub spread: f64,
    pub edge: Option<f64>,
}

pub fn edge(predicted: f64, market: f64) -> f64 {
    predicted - market
}

#[derive(Debug, Clone)]
pub struct SpreadPredictor {
    intercept: f64,
    terms: Vec<FittedCoefficient>,
}

impl SpreadPredictor {
    pub fn from_model(model: &FittedModel) -> Self {
        Self {
            intercept: model.intercept,
            terms: model.coefficients.clone(),
        }
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|t| t.name.as_str())
    }

    /// `None` if any fitted feature is missing from `lookup`. Continuous inputs are
    /// clipped to the training bounds first.
    pub fn predict_with(&self, lookup: impl Fn(&str) -> Option<f64>) -> Option<f64> {
        let mut spread = self.intercept;
        for t in &self.terms {
            let mut v = finite_opt(lookup(&t.name))?;
            if t.kind == FeatureKind::Continuous
                && let Some(b) = t.clip
            {
                v = b.clip(v);
            }
            spread += t.coefficient * v;
        }
        finite_opt(Some(spread))
    }

    pub fn predict_row(&self, row: &CalibrationRow) -> Option<f64> {
        self.predict_with(|name| row.feature_value(name))
    }

    pub fn predict(&self, input: &PredictionInput) -> Option<Prediction> {
        let spread = self.predict_with(|name| input.features.get(name).copied())?;
        Some(Prediction {
            spread,
            edge: input.market_spread.map(|m| edge(spread, m)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Metrics, ModelKeys};
    use crate::gates::GateReport;
    use crate::hygiene::WinsorBounds;
    use crate::records::DataQuality;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn blend_cfg() -> BlendConfig {
        BlendConfig {
            weight: 0.7,
            primary_mean: 0.0,
            primary_std: 10.0,
            secondary_mean: 1500.0,
            secondary_std: 200.0,
            secondary_higher_is_better: true,
        }
    }

    fn core_model() -> FittedModel {
        let term = |name: &str, coefficient: f64, clip: Option<WinsorBounds>| FittedCoefficient {
            name: name.into(),
            kind: FeatureKind::Continuous,
            standardized: coefficient,
            coefficient,
            mean: 0.0,
            std: 1.0,
            clip,
        };
        FittedModel {
            keys: ModelKeys {
                model_version: "m".into(),
                fit_label: "core".into(),
                season: 2024,
                feature_version: "f".into(),
            },
            created_at: String::new(),
            subset: DataQuality::High,
            alpha: 0.1,
            l1_ratio: 0.0,
            intercept: 0.5,
            standardized_intercept: 0.5,
            coefficients: vec![
                term(RATING_DIFF, 0.8, Some(WinsorBounds { lo: -30.0, hi: 30.0 })),
                term(HFA_POINTS, 1.0, None),
            ],
            dropped_features: Vec::new(),
            metrics: Metrics {
                train_rows: 0,
                excluded_rows: 0,
                walk_forward_rmse: 0.0,
                walk_forward_weeks: 0,
                walk_forward_samples: 0,
                kfold_rmse: 0.0,
                in_sample_rmse: 0.0,
                slope: None,
                sign_agreement: None,
                pearson: None,
                spearman: None,
            },
            gate_report: GateReport::default(),
        }
    }

    #[test]
    fn missing_secondary_uses_primary_alone() {
        let b = RatingBlender::new(blend_cfg()).unwrap();
        let r = TeamRating {
            primary: 12.0,
            secondary: None,
        };
        assert_eq!(b.blend(&r), 12.0);
    }

    #[test]
    fn blend_mixes_z_scores() {
        let b = RatingBlender::new(blend_cfg()).unwrap();
        let r = TeamRating {
            primary: 10.0,
            secondary: Some(1900.0),
        };
        // z_p = 1, z_s = 2 -> 0.7 + 0.6 = 1.3 -> 13
        assert_relative_eq!(b.blend(&r), 13.0, epsilon = 1e-12);
    }

    #[test]
    fn hfa_is_zero_on_neutral_and_clipped_otherwise() {
        let mut cfg = HfaConfig {
            base_points: 2.5,
            team_adjustments: HashMap::new(),
            clip_min: 1.0,
            clip_max: 4.0,
        };
        cfg.team_adjustments.insert("Loud".into(), 3.0);
        assert_eq!(hfa_points(&cfg, "Loud", true), 0.0);
        assert_eq!(hfa_points(&cfg, "Loud", false), 4.0);
        assert_eq!(hfa_points(&cfg, "Quiet", false), 2.5);
        assert_eq!(hfa_points(&cfg, " loud ", false), 4.0);
    }

    #[test]
    fn prediction_clips_inputs_and_reports_edge() {
        let p = SpreadPredictor::from_model(&core_model());
        let out = p
            .predict(&PredictionInput::core(10.0, 2.0).with_market(7.0))
            .unwrap();
        assert_relative_eq!(out.spread, 0.5 + 8.0 + 2.0, epsilon = 1e-12);
        assert_relative_eq!(out.edge.unwrap(), 3.5, epsilon = 1e-12);

        let clipped = p.predict(&PredictionInput::core(80.0, 0.0)).unwrap();
        assert_relative_eq!(clipped.spread, 0.5 + 0.8 * 30.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_feature_yields_none() {
        let p = SpreadPredictor::from_model(&core_model());
        let mut input = PredictionInput::default();
        input.features.insert(RATING_DIFF.into(), 1.0);
        assert!(p.predict(&input).is_none());
    }
}
