use std::path::Path;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spread_calibration::calibration::{ModelKeys, run_calibration};
use spread_calibration::calibration_rows::build_calibration_rows;
use spread_calibration::config::{
    BlendConfig, CalibrateArgs, CalibrationConfig, Cli, Command, HfaConfig, PredictArgs, RunArgs,
    SeedArgs,
};
use spread_calibration::diagnostics::{self, Diagnostics};
use spread_calibration::feature_set::FeatureSet;
use spread_calibration::features::build_engineered_rows;
use spread_calibration::persist;
use spread_calibration::predictor::{
    PredictionInput, RatingBlender, SpreadPredictor, TeamRating, hfa_points,
};
use spread_calibration::records::{EngineeredFeatureRow, TeamGameRecord};
use spread_calibration::stats_loader::{StatsSnapshot, load_team_games};
use spread_calibration::stats_store::SqliteStatsStore;
use spread_calibration::synthetic::synthetic_snapshot;

const SIGN_SAMPLE_ROWS: usize = 200;

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::SeedDemo(args) => seed_demo(&cli.db, &args),
        Command::Features(args) => {
            let mut store = SqliteStatsStore::open(&cli.db)?;
            let cfg = CalibrationConfig::default();
            let (_, _, rows) = engineer(&mut store, &args, &cfg)?;
            let path = args
                .out_dir
                .join(format!("features_{}_{}.xlsx", args.season, args.feature_version));
            diagnostics::write_workbook(
                &path,
                &Diagnostics {
                    completeness: diagnostics::feature_completeness(&rows),
                    distribution: diagnostics::distribution_stats(&rows),
                    ..Diagnostics::default()
                },
            )?;
            println!("Engineered rows: {}", rows.len());
            println!("Workbook: {}", path.display());
            Ok(())
        }
        Command::Calibrate(args) => calibrate(&cli.db, &args),
        Command::Predict(args) => predict(&args),
    }
}

fn seed_demo(db: &Path, args: &SeedArgs) -> Result<()> {
    let mut store = SqliteStatsStore::open(db)?;
    let snapshot = synthetic_snapshot(args.season, args.teams, args.weeks, args.seed);
    store.write_snapshot(&snapshot)?;
    println!("DB: {}", db.display());
    println!(
        "Seeded season {}: {} teams, {} games over {} weeks",
        args.season,
        snapshot.teams.len(),
        snapshot.schedule.len(),
        args.weeks
    );
    Ok(())
}

/// Loads the season, engineers and stores feature rows, and returns the stored
/// (write-once) rows for the requested weeks.
fn engineer(
    store: &mut SqliteStatsStore,
    run: &RunArgs,
    cfg: &CalibrationConfig,
) -> Result<(StatsSnapshot, Vec<TeamGameRecord>, Vec<EngineeredFeatureRow>)> {
    let snapshot = store.load_snapshot(run.season, run.weeks)?;
    let report = load_team_games(&snapshot, run.weeks)?;
    if !report.unmatched_games.is_empty() {
        warn!(
            count = report.unmatched_games.len(),
            "completed games without external stats"
        );
    }

    // Rows are stored unclipped; outliers are handled per fit on the design matrix.
    let rows = build_engineered_rows(&report.records, &cfg.recency, &run.feature_version)?;
    let inserted = store.save_engineered_rows(&rows)?;
    info!(built = rows.len(), inserted, "engineered features stored");

    let stored: Vec<EngineeredFeatureRow> = store
        .load_engineered_rows(run.season, &run.feature_version)?
        .into_iter()
        .filter(|r| run.weeks.contains(r.week))
        .collect();
    Ok((snapshot, report.records, stored))
}

fn load_blend(path: Option<&Path>) -> Result<BlendConfig> {
    match path {
        Some(p) => BlendConfig::load(p),
        None => {
            warn!("no blend config given; using the primary rating only");
            Ok(BlendConfig::primary_only())
        }
    }
}

fn load_hfa(path: Option<&Path>) -> Result<HfaConfig> {
    path.map_or_else(|| Ok(HfaConfig::default()), HfaConfig::load)
}

fn calibrate(db: &Path, args: &CalibrateArgs) -> Result<()> {
    let run = &args.run;
    let cfg = CalibrationConfig::for_subset(args.subset);
    let mut store = SqliteStatsStore::open(db)?;
    let (snapshot, records, engineered) = engineer(&mut store, run, &cfg)?;

    let blender = RatingBlender::new(load_blend(args.blend_config.as_deref())?)?;
    let hfa = load_hfa(args.hfa_config.as_deref())?;
    let built = build_calibration_rows(
        &snapshot,
        &records,
        &engineered,
        &blender,
        &hfa,
        &cfg.market,
        &cfg.weights,
    );

    let features = FeatureSet::for_label(args.fit_label);
    let keys = ModelKeys {
        model_version: args.model_version.clone(),
        fit_label: args.fit_label.key().to_string(),
        season: run.season,
        feature_version: run.feature_version.clone(),
    };
    let outcome = run_calibration(&built.rows, &features, &cfg, keys)?;
    let model = &outcome.model;

    persist::upsert_fitted_model(store.connection_mut(), model)?;
    let artifact = persist::write_model_artifact(&run.out_dir, model)?;

    let mut completeness = diagnostics::calibration_completeness(&built.rows, &features);
    completeness.extend(diagnostics::feature_completeness(&engineered));
    let workbook = run
        .out_dir
        .join(format!("{}_diagnostics.xlsx", model.keys.artifact_stem()));
    diagnostics::write_workbook(
        &workbook,
        &Diagnostics {
            completeness,
            distribution: diagnostics::distribution_stats(&engineered),
            sign_sample: diagnostics::sign_sample(&outcome.selection.walk_forward, SIGN_SAMPLE_ROWS),
            gates: Some(&model.gate_report),
        },
    )?;

    println!("DB: {}", db.display());
    println!("Artifact: {}", artifact.display());
    println!("Workbook: {}", workbook.display());
    println!();
    diagnostics::print_summary(&outcome);

    if args.require_gates && !model.gates_passed() {
        let failed: Vec<&str> = model.gate_report.failed().map(|g| g.name.as_str()).collect();
        bail!("gates failed: {}", failed.join(", "));
    }
    Ok(())
}

fn predict(args: &PredictArgs) -> Result<()> {
    let model = persist::read_model_artifact(&args.model)?;
    let blender = RatingBlender::new(load_blend(args.blend_config.as_deref())?)?;
    let hfa = load_hfa(args.hfa_config.as_deref())?;

    let home = TeamRating {
        primary: args.home_primary,
        secondary: args.home_secondary,
    };
    let away = TeamRating {
        primary: args.away_primary,
        secondary: args.away_secondary,
    };
    let mut input = PredictionInput::core(
        blender.rating_diff(&home, &away),
        hfa_points(&hfa, &args.home, args.neutral),
    );
    for (name, value) in &args.features {
        input = input.with_feature(name, *value);
    }
    if let Some(m) = args.market {
        input = input.with_market(m);
    }

    let predictor = SpreadPredictor::from_model(&model);
    let Some(prediction) = predictor.predict(&input) else {
        let missing: Vec<&str> = predictor
            .feature_names()
            .filter(|n| !input.features.contains_key(*n))
            .collect();
        if missing.is_empty() {
            bail!("prediction is not finite");
        }
        bail!("model {} needs inputs: {}", model.keys.artifact_stem(), missing.join(", "));
    };

    println!(
        "{} vs {} ({})",
        args.home,
        args.away,
        model.keys.artifact_stem()
    );
    println!("Predicted spread (home minus away): {:+.2}", prediction.spread);
    if let Some(edge) = prediction.edge {
        println!("Edge vs market: {edge:+.2}");
    }
    if !model.gates_passed() {
        println!("warning: this model did not pass its gates");
    }
    Ok(())
}
