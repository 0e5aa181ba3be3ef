use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::calibration::CalibrationOutcome;
use crate::feature_set::FeatureSet;
use crate::gates::{GateBound, GateReport};
use crate::hygiene::column_stats;
use crate::model_select::WalkForward;
use crate::records::{CalibrationRow, EngineeredFeatureRow};

#[derive(Debug, Clone, PartialEq)]
pub struct CompletenessRow {
    pub feature: String,
    pub non_null: usize,
    pub total: usize,
}

impl CompletenessRow {
    pub fn pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.non_null as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistributionRow {
    pub feature: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub p01: f64,
    pub p50: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignSampleRow {
    pub game_id: u64,
    pub predicted: f64,
    pub market: f64,
    pub agree: bool,
}

fn columns_of(rows: &[EngineeredFeatureRow]) -> Vec<(String, Vec<Option<f64>>)> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut cols: Vec<(String, Vec<Option<f64>>)> = first
        .numeric_columns()
        .into_iter()
        .map(|(name, _)| (name, Vec::with_capacity(rows.len())))
        .collect();
    for r in rows {
        for (col, (_, v)) in cols.iter_mut().zip(r.numeric_columns()) {
            col.1.push(v);
        }
    }
    cols
}

pub fn feature_completeness(rows: &[EngineeredFeatureRow]) -> Vec<CompletenessRow> {
    columns_of(rows)
        .into_iter()
        .map(|(feature, values)| CompletenessRow {
            feature,
            non_null: values.iter().filter(|v| v.is_some()).count(),
            total: values.len(),
        })
        .collect()
}

pub fn calibration_completeness(rows: &[CalibrationRow], set: &FeatureSet) -> Vec<CompletenessRow> {
    set.specs
        .iter()
        .map(|s| CompletenessRow {
            feature: s.name.clone(),
            non_null: rows.iter().filter(|r| r.feature_value(&s.name).is_some()).count(),
            total: rows.len(),
        })
        .collect()
}

fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    let k = (q * (sorted.len() - 1) as f64).floor() as usize;
    sorted[k.min(sorted.len() - 1)]
}

pub fn distribution_stats(rows: &[EngineeredFeatureRow]) -> Vec<DistributionRow> {
    let mut out = Vec::new();
    for (feature, values) in columns_of(rows) {
        let mut present: Vec<f64> = values.into_iter().flatten().collect();
        if present.is_empty() {
            continue;
        }
        present.sort_by(f64::total_cmp);
        let (mean, std) = column_stats(&present);
        out.push(DistributionRow {
            feature,
            count: present.len(),
            mean,
            std,
            min: present[0],
            p01: nearest_rank(&present, 0.01),
            p50: nearest_rank(&present, 0.50),
            p99: nearest_rank(&present, 0.99),
            max: present[present.len() - 1],
        });
    }
    out
}

pub fn sign_sample(wf: &WalkForward, limit: usize) -> Vec<SignSampleRow> {
    wf.game_ids
        .iter()
        .zip(wf.predictions.iter().zip(&wf.actuals))
        .take(limit)
        .map(|(&game_id, (&predicted, &market))| SignSampleRow {
            game_id,
            predicted,
            market,
            agree: (predicted > 0.0) == (market > 0.0) && (predicted == 0.0) == (market == 0.0),
        })
        .collect()
}

enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        if v.is_finite() { Cell::Number(v) } else { Cell::Empty }
    }
}

impl From<usize> for Cell {
    fn from(v: usize) -> Self {
        Cell::Number(v as f64)
    }
}

impl From<Option<f64>> for Cell {
    fn from(v: Option<f64>) -> Self {
        v.map_or(Cell::Empty, Cell::from)
    }
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<Cell>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            let (r, c) = (row_idx as u32, col_idx as u16);
            let written = match value {
                Cell::Text(s) => worksheet.write_string(r, c, s),
                Cell::Number(n) => worksheet.write_number(r, c, *n),
                Cell::Empty => continue,
            };
            written.with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}

fn header(names: &[&str]) -> Vec<Cell> {
    names.iter().map(|n| Cell::from(*n)).collect()
}

fn bound_text(b: &GateBound) -> String {
    match b {
        GateBound::AtLeast(t) => format!(">= {t}"),
        GateBound::AtMost(t) => format!("<= {t}"),
        GateBound::Between(lo, hi) => format!("[{lo}, {hi}]"),
        GateBound::Above(t) => format!("> {t}"),
    }
}

/// Inputs for the human-review workbook. Empty sections are written as header-only sheets.
#[derive(Debug, Default)]
pub struct Diagnostics<'a> {
    pub completeness: Vec<CompletenessRow>,
    pub distribution: Vec<DistributionRow>,
    pub sign_sample: Vec<SignSampleRow>,
    pub gates: Option<&'a GateReport>,
}

pub fn write_workbook(path: &Path, d: &Diagnostics<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let mut completeness = vec![header(&["feature", "non_null", "total", "pct"])];
    for r in &d.completeness {
        completeness.push(vec![
            r.feature.clone().into(),
            r.non_null.into(),
            r.total.into(),
            r.pct().into(),
        ]);
    }

    let mut distribution = vec![header(&[
        "feature", "count", "mean", "std", "min", "p01", "p50", "p99", "max",
    ])];
    for r in &d.distribution {
        distribution.push(vec![
            r.feature.clone().into(),
            r.count.into(),
            r.mean.into(),
            r.std.into(),
            r.min.into(),
            r.p01.into(),
            r.p50.into(),
            r.p99.into(),
            r.max.into(),
        ]);
    }

    let mut signs = vec![header(&["game_id", "predicted", "market", "agree"])];
    for r in &d.sign_sample {
        signs.push(vec![
            r.game_id.to_string().into(),
            r.predicted.into(),
            r.market.into(),
            (if r.agree { "yes" } else { "no" }).into(),
        ]);
    }

    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Completeness")?;
        write_rows(sheet, &completeness)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Distribution")?;
        write_rows(sheet, &distribution)?;
    }
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("SignSample")?;
        write_rows(sheet, &signs)?;
    }
    if let Some(report) = d.gates {
        let mut gates = vec![header(&["gate", "observed", "threshold", "margin", "passed"])];
        for g in &report.results {
            gates.push(vec![
                g.name.clone().into(),
                g.observed.into(),
                bound_text(&g.threshold).into(),
                g.margin.into(),
                (if g.passed { "PASS" } else { "FAIL" }).into(),
            ]);
        }
        let sheet = workbook.add_worksheet();
        sheet.set_name("Gates")?;
        write_rows(sheet, &gates)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;
    Ok(())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |x| format!("{x:.3}"))
}

pub fn print_summary(outcome: &CalibrationOutcome) {
    let m = &outcome.model;
    println!("Spread calibration {}", m.keys.artifact_stem());
    println!(
        "Rows: {} used, {} excluded (subset {})",
        m.metrics.train_rows,
        m.metrics.excluded_rows,
        m.subset.key()
    );
    if !m.dropped_features.is_empty() {
        println!("Dropped (zero variance): {}", m.dropped_features.join(", "));
    }
    println!("alpha={} l1_ratio={}", m.alpha, m.l1_ratio);
    println!();
    println!("{:<22} {:>10} {:>12}", "feature", "coef", "coef_std");
    for c in &m.coefficients {
        println!("{:<22} {:>10.4} {:>12.4}", c.name, c.coefficient, c.standardized);
    }
    println!("{:<22} {:>10.4}", "intercept", m.intercept);
    println!();
    println!(
        "walk-forward RMSE {:.3} over {} weeks ({} games), k-fold RMSE {:.3}, in-sample {:.3}",
        m.metrics.walk_forward_rmse,
        m.metrics.walk_forward_weeks,
        m.metrics.walk_forward_samples,
        m.metrics.kfold_rmse,
        m.metrics.in_sample_rmse
    );
    println!(
        "slope {}  sign {}  pearson {}  spearman {}",
        fmt_opt(m.metrics.slope),
        fmt_opt(m.metrics.sign_agreement),
        fmt_opt(m.metrics.pearson),
        fmt_opt(m.metrics.spearman)
    );
    println!();
    for g in &m.gate_report.results {
        println!(
            "[{}] {:<28} observed={:<10} threshold={:<14} margin={}",
            if g.passed { "PASS" } else { "FAIL" },
            g.name,
            fmt_opt(g.observed),
            bound_text(&g.threshold),
            fmt_opt(g.margin)
        );
    }
    println!(
        "gates_passed = {}",
        if m.gates_passed() { "true" } else { "false" }
    );
}
