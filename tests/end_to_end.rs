use std::fs;

use approx::assert_relative_eq;
use rusqlite::Connection;

use spread_calibration::calibration::{ModelKeys, run_calibration};
use spread_calibration::calibration_rows::build_calibration_rows;
use spread_calibration::config::{BlendConfig, CalibrationConfig, HfaConfig, WeekRange};
use spread_calibration::feature_set::{FeatureSet, FeatureSpec, FitLabel};
use spread_calibration::features::build_engineered_rows;
use spread_calibration::persist;
use spread_calibration::predictor::{RatingBlender, SpreadPredictor};
use spread_calibration::records::DataQuality;
use spread_calibration::stats_loader::load_team_games;
use spread_calibration::stats_store::{self, SqliteStatsStore};
use spread_calibration::synthetic::{synthetic_calibration_rows, synthetic_snapshot};

const CONSTANT: &str = "constant_feature";

fn keys(version: &str) -> ModelKeys {
    ModelKeys {
        model_version: version.into(),
        fit_label: "core_plus_constant".into(),
        season: 2024,
        feature_version: "fe_test".into(),
    }
}

#[test]
fn two_hundred_rows_fit_persist_and_reload() {
    let mut rows = synthetic_calibration_rows(200, 31, 3.0);
    for r in rows.iter_mut() {
        r.extras.insert(CONSTANT.to_string(), Some(5.0));
    }
    let mut specs = FeatureSet::for_label(FitLabel::Core).specs;
    specs.push(FeatureSpec::continuous(CONSTANT));
    let set = FeatureSet::custom("core_plus_constant", specs);

    let outcome = run_calibration(&rows, &set, &CalibrationConfig::default(), keys("e2e")).unwrap();
    let model = &outcome.model;
    assert_eq!(model.metrics.train_rows, 200);
    assert_eq!(model.dropped_features, vec![CONSTANT.to_string()]);
    assert!(model.coefficient(CONSTANT).is_none());
    assert_eq!(model.feature_names(), vec!["rating_diff", "hfa_points"]);
    assert!(model.metrics.walk_forward_weeks > 0);
    assert!(model.alpha > 0.0);
    assert!(
        model.metrics.walk_forward_rmse <= 6.0,
        "walk-forward rmse {}",
        model.metrics.walk_forward_rmse
    );
    let rd = model.coefficient("rating_diff").unwrap().coefficient;
    assert!((0.5..=1.1).contains(&rd), "rating_diff coefficient {rd}");
    for gate in [
        "calibration_slope",
        "sign_agreement",
        "coef_rating_diff_positive",
        "coef_hfa_points_positive",
    ] {
        assert!(model.gate_report.get(gate).unwrap().passed, "{gate} failed");
    }

    let mut conn = Connection::open_in_memory().unwrap();
    stats_store::init_schema(&conn).unwrap();
    persist::upsert_fitted_model(&mut conn, model).unwrap();
    // Upserting again replaces rather than duplicates.
    persist::upsert_fitted_model(&mut conn, model).unwrap();
    let loaded = persist::load_fitted_model(&conn, &model.keys).unwrap().unwrap();
    assert_eq!(loaded.keys, model.keys);
    assert_eq!(loaded.coefficients, model.coefficients);
    assert!(loaded.coefficient(CONSTANT).is_none());
    assert_eq!(loaded.gates_passed(), model.gates_passed());
    assert!(persist::load_fitted_model(&conn, &keys("missing")).unwrap().is_none());

    let dir = std::env::temp_dir().join(format!("spread_calibration_e2e_{}", std::process::id()));
    let path = persist::write_model_artifact(&dir, model).unwrap();
    assert!(path.ends_with("e2e_core_plus_constant_2024_fe_test.json"));
    let reread = persist::read_model_artifact(&path).unwrap();
    assert_eq!(reread.feature_names(), model.feature_names());
    assert_relative_eq!(reread.intercept, model.intercept, epsilon = 1e-9);

    let predictor = SpreadPredictor::from_model(&reread);
    for r in rows.iter().take(10) {
        let from_artifact = predictor.predict_row(r).unwrap();
        let from_memory = SpreadPredictor::from_model(model).predict_row(r).unwrap();
        assert_relative_eq!(from_artifact, from_memory, epsilon = 1e-6);
    }
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn store_to_model_pipeline() {
    let snapshot = synthetic_snapshot(2024, 40, 12, 77);
    let mut store = SqliteStatsStore::open_in_memory().unwrap();
    store.write_snapshot(&snapshot).unwrap();

    let weeks = WeekRange::new(1, 12);
    let loaded = store.load_snapshot(2024, weeks).unwrap();
    assert_eq!(loaded.schedule.len(), snapshot.schedule.len());

    let report = load_team_games(&loaded, weeks).unwrap();
    assert_eq!(report.records.len(), 2 * snapshot.schedule.len());
    let cfg = CalibrationConfig::default();
    let engineered = build_engineered_rows(&report.records, &cfg.recency, "fe_test").unwrap();
    assert_eq!(store.save_engineered_rows(&engineered).unwrap(), engineered.len());
    assert_eq!(store.save_engineered_rows(&engineered).unwrap(), 0);

    let blender = RatingBlender::new(BlendConfig::primary_only()).unwrap();
    let built = build_calibration_rows(
        &loaded,
        &report.records,
        &engineered,
        &blender,
        &HfaConfig::default(),
        &cfg.market,
        &cfg.weights,
    );
    assert_eq!(built.rows.len(), snapshot.schedule.len());
    assert!(built.rows.iter().any(|r| r.quality == DataQuality::Broad));

    let outcome = run_calibration(
        &built.rows,
        &FeatureSet::for_label(FitLabel::Core),
        &cfg,
        keys("pipeline"),
    )
    .unwrap();
    let high = built
        .rows
        .iter()
        .filter(|r| r.quality == DataQuality::High)
        .count();
    assert_eq!(outcome.model.metrics.train_rows, high);
    assert!(outcome.model.coefficient("rating_diff").unwrap().coefficient > 0.0);
}
