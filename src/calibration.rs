use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::elastic_net::{ElasticNetParams, fit_elastic_net};
use crate::error::{ModelError, ModelResult};
use crate::feature_set::{DesignBuild, DesignMatrix, FeatureKind, FeatureSet, RATING_DIFF_SQ};
use crate::gates::{GateInputs, GateReport, check_gates, pearson, sign_agreement, slope, spearman};
use crate::hygiene::{HygieneReport, WinsorBounds, apply_hygiene};
use crate::model_select::{Selection, rmse, select_hyperparameters, walk_forward};
use crate::records::{CalibrationRow, DataQuality};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKeys {
    pub model_version: String,
    pub fit_label: String,
    pub season: i32,
    pub feature_version: String,
}

impl ModelKeys {
    pub fn artifact_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.model_version, self.fit_label, self.season, self.feature_version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedCoefficient {
    pub name: String,
    pub kind: FeatureKind,
    /// Coefficient on the standardized column.
    pub standardized: f64,
    /// Coefficient on the raw (clipped) input.
    pub coefficient: f64,
    pub mean: f64,
    pub std: f64,
    pub clip: Option<WinsorBounds>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub train_rows: usize,
    pub excluded_rows: usize,
    pub walk_forward_rmse: f64,
    pub walk_forward_weeks: usize,
    pub walk_forward_samples: usize,
    pub kfold_rmse: f64,
    pub in_sample_rmse: f64,
    pub slope: Option<f64>,
    pub sign_agreement: Option<f64>,
    pub pearson: Option<f64>,
    pub spearman: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub keys: ModelKeys,
    pub created_at: String,
    pub subset: DataQuality,
    pub alpha: f64,
    pub l1_ratio: f64,
    pub intercept: f64,
    pub standardized_intercept: f64,
    pub coefficients: Vec<FittedCoefficient>,
    pub dropped_features: Vec<String>,
    pub metrics: Metrics,
    pub gate_report: GateReport,
}

impl FittedModel {
    pub fn gates_passed(&self) -> bool {
        self.gate_report.gates_passed
    }

    pub fn coefficient(&self, name: &str) -> Option<&FittedCoefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.coefficients.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub model: FittedModel,
    pub hygiene: HygieneReport,
    pub selection: Selection,
    pub build: DesignBuild,
}

/// Maps standardized coefficients back to raw input units.
fn denormalize(
    names: &[String],
    kinds: &[FeatureKind],
    beta: &[f64],
    intercept: f64,
    hygiene: &HygieneReport,
) -> (Vec<FittedCoefficient>, f64) {
    let mut raw_intercept = intercept;
    let mut out = Vec::with_capacity(names.len());
    for ((name, kind), b) in names.iter().zip(kinds).zip(beta) {
        let (mean, std, clip) = hygiene
            .column(name)
            .map(|c| (c.mean, c.std, c.bounds))
            .unwrap_or((0.0, 1.0, None));
        let coefficient = match kind {
            FeatureKind::Continuous => {
                raw_intercept -= b * mean / std;
                b / std
            }
            FeatureKind::Binary => *b,
        };
        out.push(FittedCoefficient {
            name: name.clone(),
            kind: *kind,
            standardized: *b,
            coefficient,
            mean,
            std,
            clip,
        });
    }
    (out, raw_intercept)
}

/// Design → hygiene → selection → refit → gates.
pub fn run_calibration(
    rows: &[CalibrationRow],
    features: &FeatureSet,
    cfg: &CalibrationConfig,
    keys: ModelKeys,
) -> ModelResult<CalibrationOutcome> {
    cfg.validate()?;
    if features.specs.is_empty() {
        return Err(ModelError::NoUsableFeatures);
    }

    let subset_rows: Vec<CalibrationRow> = rows
        .iter()
        .filter(|r| cfg.subset == DataQuality::Broad || r.quality == DataQuality::High)
        .cloned()
        .collect();
    let (mut design, build) = DesignMatrix::from_rows(&subset_rows, features, cfg.market.spread_clip);
    let excluded = build.excluded_missing + build.excluded_bad_weight;
    if excluded > 0 {
        info!(excluded, used = build.used, "rows excluded from design matrix");
    }
    if design.n_rows() < cfg.selector.min_rows {
        return Err(ModelError::InsufficientRows {
            needed: cfg.selector.min_rows,
            got: design.n_rows(),
        });
    }

    let hygiene = apply_hygiene(&mut design, &cfg.hygiene)?;
    let selection = select_hyperparameters(&design, &cfg.grid, &cfg.selector, &cfg.solver)?;
    let best: ElasticNetParams = selection.best;

    let fit = fit_elastic_net(&design.columns, &design.target, &design.weights, best, &cfg.solver)?;
    let in_sample = rmse(&fit.predict_columns(&design.columns), &design.target);

    let quadratic_rmse_gain = match design.column_index(RATING_DIFF_SQ) {
        Some(j) if fit.coefficients[j] < 0.0 => {
            let reduced = design.without_column(RATING_DIFF_SQ);
            match walk_forward(&reduced, best, cfg.selector.min_train_rows, &cfg.solver) {
                Ok(wf) => Some(wf.rmse - selection.walk_forward.rmse),
                Err(e) => {
                    warn!(error = %e, "could not evaluate model without quadratic term");
                    None
                }
            }
        }
        _ => None,
    };

    let (coefficients, intercept) =
        denormalize(&design.names, &design.kinds, &fit.coefficients, fit.intercept, &hygiene);
    let named: Vec<(String, f64)> = coefficients
        .iter()
        .map(|c| (c.name.clone(), c.coefficient))
        .collect();

    let wf = &selection.walk_forward;
    let gate_report = check_gates(
        &GateInputs {
            predictions: &wf.predictions,
            actuals: &wf.actuals,
            walk_forward_rmse: wf.rmse,
            coefficients: &named,
            quadratic_rmse_gain,
        },
        &cfg.gates,
    );

    let metrics = Metrics {
        train_rows: design.n_rows(),
        excluded_rows: excluded,
        walk_forward_rmse: wf.rmse,
        walk_forward_weeks: wf.weeks.len(),
        walk_forward_samples: wf.predictions.len(),
        kfold_rmse: selection.kfold_rmse,
        in_sample_rmse: in_sample,
        slope: slope(&wf.predictions, &wf.actuals),
        sign_agreement: sign_agreement(&wf.predictions, &wf.actuals),
        pearson: pearson(&wf.predictions, &wf.actuals),
        spearman: spearman(&wf.predictions, &wf.actuals),
    };

    if gate_report.gates_passed {
        info!(model = %keys.artifact_stem(), "all gates passed");
    } else {
        let failed: Vec<&str> = gate_report.failed().map(|g| g.name.as_str()).collect();
        warn!(model = %keys.artifact_stem(), ?failed, "gates failed");
    }

    let model = FittedModel {
        keys,
        created_at: Utc::now().to_rfc3339(),
        subset: cfg.subset,
        alpha: best.alpha,
        l1_ratio: best.l1_ratio,
        intercept,
        standardized_intercept: fit.intercept,
        coefficients,
        dropped_features: hygiene.dropped.clone(),
        metrics,
        gate_report,
    };
    Ok(CalibrationOutcome {
        model,
        hygiene,
        selection,
        build,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hygiene::ColumnHygiene;
    use approx::assert_relative_eq;

    #[test]
    fn denormalized_prediction_matches_standardized() {
        let hygiene = HygieneReport {
            columns: vec![ColumnHygiene {
                name: "x".into(),
                kind: FeatureKind::Continuous,
                bounds: None,
                clipped_rows: 0,
                mean: 3.0,
                std: 2.0,
            }],
            dropped: Vec::new(),
        };
        let names = vec!["x".to_string(), "flag".to_string()];
        let kinds = vec![FeatureKind::Continuous, FeatureKind::Binary];
        let (coefs, b0) = denormalize(&names, &kinds, &[4.0, 1.5], 10.0, &hygiene);
        // raw x = 7, flag = 1 -> z = 2
        let standardized = 10.0 + 4.0 * 2.0 + 1.5;
        let raw = b0 + coefs[0].coefficient * 7.0 + coefs[1].coefficient * 1.0;
        assert_relative_eq!(raw, standardized, epsilon = 1e-12);
        assert_relative_eq!(coefs[0].coefficient, 2.0);
    }

    #[test]
    fn empty_feature_set_is_rejected() {
        let keys = ModelKeys {
            model_version: "m".into(),
            fit_label: "core".into(),
            season: 2024,
            feature_version: "f".into(),
        };
        let set = FeatureSet::custom("none", Vec::new());
        assert!(matches!(
            run_calibration(&[], &set, &CalibrationConfig::default(), keys),
            Err(ModelError::NoUsableFeatures)
        ));
    }
}
