use spread_calibration::calibration::{ModelKeys, run_calibration};
use spread_calibration::config::CalibrationConfig;
use spread_calibration::feature_set::{FeatureSet, FitLabel, HFA_POINTS, RATING_DIFF};
use spread_calibration::synthetic::synthetic_calibration_rows;

fn keys() -> ModelKeys {
    ModelKeys {
        model_version: "gate_test".into(),
        fit_label: FitLabel::Core.key().into(),
        season: 2024,
        feature_version: "fe_test".into(),
    }
}

#[test]
fn well_specified_market_passes_every_gate() {
    let rows = synthetic_calibration_rows(240, 17, 2.5);
    let outcome = run_calibration(
        &rows,
        &FeatureSet::for_label(FitLabel::Core),
        &CalibrationConfig::default(),
        keys(),
    )
    .unwrap();
    let report = &outcome.model.gate_report;
    let failed: Vec<&str> = report.failed().map(|g| g.name.as_str()).collect();
    assert!(report.gates_passed, "failed gates: {failed:?}");
    assert!(outcome.model.coefficient(RATING_DIFF).unwrap().coefficient > 0.6);
    assert!(outcome.model.coefficient(HFA_POINTS).unwrap().coefficient > 0.0);
    assert!(report.get("calibration_slope").is_some());
    assert!(report.get("bucket_mae_0-7").is_some());
}

#[test]
fn sign_flipped_market_fails() {
    let mut rows = synthetic_calibration_rows(240, 17, 2.5);
    for r in rows.iter_mut() {
        r.market_spread = -r.market_spread;
    }
    let outcome = run_calibration(
        &rows,
        &FeatureSet::for_label(FitLabel::Core),
        &CalibrationConfig::default(),
        keys(),
    )
    .unwrap();
    let report = &outcome.model.gate_report;
    assert!(!report.gates_passed);
    let rd = report.get("coef_rating_diff_positive").unwrap();
    assert!(!rd.passed);
    assert!(rd.margin.unwrap() < 0.0);
}

#[test]
fn pure_noise_fails_correlation_gates() {
    let mut rows = synthetic_calibration_rows(240, 23, 2.5);
    let mut flip = false;
    for r in rows.iter_mut() {
        flip = !flip;
        r.market_spread = if flip { 10.0 } else { -10.0 };
    }
    let outcome = run_calibration(
        &rows,
        &FeatureSet::for_label(FitLabel::Core),
        &CalibrationConfig::default(),
        keys(),
    )
    .unwrap();
    assert!(!outcome.model.gates_passed());
    assert!(outcome.model.metrics.walk_forward_rmse > 7.5);
}
