use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::info;

use crate::calibration::{FittedCoefficient, FittedModel, ModelKeys};
use crate::feature_set::FeatureKind;
use crate::hygiene::WinsorBounds;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS fitted_models (
            model_version TEXT NOT NULL,
            fit_label TEXT NOT NULL,
            season INTEGER NOT NULL,
            feature_version TEXT NOT NULL,
            created_at TEXT NOT NULL,
            subset TEXT NOT NULL,
            alpha REAL NOT NULL,
            l1_ratio REAL NOT NULL,
            intercept REAL NOT NULL,
            walk_forward_rmse REAL NOT NULL,
            train_rows INTEGER NOT NULL,
            gates_passed INTEGER NOT NULL,
            gate_report_json TEXT NOT NULL,
            model_json TEXT NOT NULL,
            PRIMARY KEY (model_version, fit_label, season, feature_version)
        );
        CREATE INDEX IF NOT EXISTS idx_fitted_models_season ON fitted_models(season);

        CREATE TABLE IF NOT EXISTS fitted_coefficients (
            model_version TEXT NOT NULL,
            fit_label TEXT NOT NULL,
            season INTEGER NOT NULL,
            feature_version TEXT NOT NULL,
            feature TEXT NOT NULL,
            kind TEXT NOT NULL,
            standardized REAL NOT NULL,
            coefficient REAL NOT NULL,
            mean REAL NOT NULL,
            std REAL NOT NULL,
            clip_lo REAL NULL,
            clip_hi REAL NULL,
            PRIMARY KEY (model_version, fit_label, season, feature_version, feature)
        );
        "#,
    )
    .context("init model schema")?;
    Ok(())
}

fn kind_key(kind: FeatureKind) -> &'static str {
    match kind {
        FeatureKind::Continuous => "continuous",
        FeatureKind::Binary => "binary",
    }
}

fn kind_from_key(raw: &str) -> FeatureKind {
    if raw == "binary" {
        FeatureKind::Binary
    } else {
        FeatureKind::Continuous
    }
}

fn write_model(tx: &Transaction<'_>, model: &FittedModel) -> Result<()> {
    let k = &model.keys;
    let gate_json = serde_json::to_string(&model.gate_report).context("serialize gate report")?;
    let model_json = serde_json::to_string(model).context("serialize fitted model")?;
    tx.execute(
        r#"
        INSERT INTO fitted_models (
            model_version, fit_label, season, feature_version, created_at, subset,
            alpha, l1_ratio, intercept, walk_forward_rmse, train_rows, gates_passed,
            gate_report_json, model_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(model_version, fit_label, season, feature_version) DO UPDATE SET
            created_at = excluded.created_at,
            subset = excluded.subset,
            alpha = excluded.alpha,
            l1_ratio = excluded.l1_ratio,
            intercept = excluded.intercept,
            walk_forward_rmse = excluded.walk_forward_rmse,
            train_rows = excluded.train_rows,
            gates_passed = excluded.gates_passed,
            gate_report_json = excluded.gate_report_json,
            model_json = excluded.model_json
        "#,
        params![
            k.model_version,
            k.fit_label,
            k.season,
            k.feature_version,
            model.created_at,
            model.subset.key(),
            model.alpha,
            model.l1_ratio,
            model.intercept,
            model.metrics.walk_forward_rmse,
            model.metrics.train_rows as i64,
            model.gates_passed() as i64,
            gate_json,
            model_json,
        ],
    )
    .context("upsert fitted model")?;

    tx.execute(
        "DELETE FROM fitted_coefficients
         WHERE model_version = ?1 AND fit_label = ?2 AND season = ?3 AND feature_version = ?4",
        params![k.model_version, k.fit_label, k.season, k.feature_version],
    )
    .context("clear fitted coefficients")?;

    let mut stmt = tx
        .prepare(
            r#"
            INSERT INTO fitted_coefficients (
                model_version, fit_label, season, feature_version, feature, kind,
                standardized, coefficient, mean, std, clip_lo, clip_hi
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .context("prepare coefficient insert")?;
    for c in &model.coefficients {
        stmt.execute(params![
            k.model_version,
            k.fit_label,
            k.season,
            k.feature_version,
            c.name,
            kind_key(c.kind),
            c.standardized,
            c.coefficient,
            c.mean,
            c.std,
            c.clip.map(|b| b.lo),
            c.clip.map(|b| b.hi),
        ])
        .with_context(|| format!("insert coefficient {}", c.name))?;
    }
    Ok(())
}

/// Replaces the model row and its coefficient rows in one transaction.
pub fn upsert_fitted_model(conn: &mut Connection, model: &FittedModel) -> Result<()> {
    let tx = conn.transaction().context("begin model transaction")?;
    write_model(&tx, model)?;
    tx.commit().context("commit model transaction")?;
    info!(
        model = %model.keys.artifact_stem(),
        coefficients = model.coefficients.len(),
        gates_passed = model.gates_passed(),
        "persisted fitted model"
    );
    Ok(())
}

fn load_coefficients(conn: &Connection, k: &ModelKeys) -> Result<Vec<FittedCoefficient>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT feature, kind, standardized, coefficient, mean, std, clip_lo, clip_hi
            FROM fitted_coefficients
            WHERE model_version = ?1 AND fit_label = ?2 AND season = ?3 AND feature_version = ?4
            ORDER BY rowid ASC
            "#,
        )
        .context("prepare coefficient query")?;
    let rows = stmt
        .query_map(
            params![k.model_version, k.fit_label, k.season, k.feature_version],
            |row| {
                let lo: Option<f64> = row.get(6)?;
                let hi: Option<f64> = row.get(7)?;
                Ok(FittedCoefficient {
                    name: row.get(0)?,
                    kind: kind_from_key(&row.get::<_, String>(1)?),
                    standardized: row.get(2)?,
                    coefficient: row.get(3)?,
                    mean: row.get(4)?,
                    std: row.get(5)?,
                    clip: lo.zip(hi).map(|(lo, hi)| WinsorBounds { lo, hi }),
                })
            },
        )
        .context("query coefficients")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode coefficient row")?);
    }
    Ok(out)
}

pub fn load_fitted_model(conn: &Connection, keys: &ModelKeys) -> Result<Option<FittedModel>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT model_json FROM fitted_models
             WHERE model_version = ?1 AND fit_label = ?2 AND season = ?3 AND feature_version = ?4",
            params![keys.model_version, keys.fit_label, keys.season, keys.feature_version],
            |row| row.get(0),
        )
        .optional()
        .context("query fitted model")?;
    let Some(json) = json else {
        return Ok(None);
    };
    let mut model: FittedModel = serde_json::from_str(&json).context("parse stored model")?;
    model.coefficients = load_coefficients(conn, keys)?;
    Ok(Some(model))
}

/// Writes `<dir>/<stem>.json` through a temp file and rename.
pub fn write_model_artifact(dir: &Path, model: &FittedModel) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(format!("{}.json", model.keys.artifact_stem()));
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(model).context("serialize model artifact")?;
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("swap {}", path.display()))?;
    Ok(path)
}

pub fn read_model_artifact(path: &Path) -> Result<FittedModel> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse model artifact {}", path.display()))
}
