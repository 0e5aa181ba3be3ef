use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::elastic_net::ElasticNetParams;
use crate::error::{ModelError, ModelResult};
use crate::feature_set::FitLabel;
use crate::recency::RecencyConfig;
use crate::records::DataQuality;

#[derive(Debug, Parser)]
#[command(name = "spread_calibration", about = "Point-spread feature engineering and calibration")]
pub struct Cli {
    /// SQLite statistics/market store
    #[arg(long, env = "SPREAD_DB_PATH", default_value = "spread_model.sqlite", global = true)]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a synthetic season into the store
    SeedDemo(SeedArgs),
    /// Build and persist engineered feature rows
    Features(RunArgs),
    /// Fit, validate and gate a spread model
    Calibrate(CalibrateArgs),
    /// Predict a single game's spread from a model artifact
    Predict(PredictArgs),
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    #[arg(long, default_value_t = 2024)]
    pub season: i32,
    #[arg(long, default_value_t = 48)]
    pub teams: usize,
    #[arg(long, default_value_t = 12)]
    pub weeks: u32,
    #[arg(long, env = "SPREAD_SEED", default_value_t = 7)]
    pub seed: u64,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long, env = "SPREAD_SEASON")]
    pub season: i32,
    /// Inclusive week range, e.g. `1-15` or `6`
    #[arg(long, default_value = "1-15")]
    pub weeks: WeekRange,
    #[arg(long, env = "SPREAD_FEATURE_VERSION", default_value = "fe_v1")]
    pub feature_version: String,
    /// Directory for diagnostics and model artifacts
    #[arg(long, env = "SPREAD_OUT_DIR", default_value = "artifacts")]
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct CalibrateArgs {
    #[command(flatten)]
    pub run: RunArgs,
    #[arg(long, default_value = "core")]
    pub fit_label: FitLabel,
    #[arg(long, default_value = "high")]
    pub subset: DataQuality,
    #[arg(long, env = "SPREAD_MODEL_VERSION", default_value = "model_v1")]
    pub model_version: String,
    #[arg(long, env = "SPREAD_BLEND_CONFIG")]
    pub blend_config: Option<PathBuf>,
    #[arg(long, env = "SPREAD_HFA_CONFIG")]
    pub hfa_config: Option<PathBuf>,
    /// Exit non-zero when any gate fails
    #[arg(long)]
    pub require_gates: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PredictArgs {
    /// JSON model artifact written by `calibrate`
    #[arg(long)]
    pub model: PathBuf,
    #[arg(long, env = "SPREAD_BLEND_CONFIG")]
    pub blend_config: Option<PathBuf>,
    #[arg(long, env = "SPREAD_HFA_CONFIG")]
    pub hfa_config: Option<PathBuf>,
    #[arg(long)]
    pub home: String,
    #[arg(long)]
    pub away: String,
    #[arg(long, allow_hyphen_values = true)]
    pub home_primary: f64,
    #[arg(long, allow_hyphen_values = true)]
    pub home_secondary: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    pub away_primary: f64,
    #[arg(long, allow_hyphen_values = true)]
    pub away_secondary: Option<f64>,
    #[arg(long)]
    pub neutral: bool,
    /// Market spread, home minus away
    #[arg(long, allow_hyphen_values = true)]
    pub market: Option<f64>,
    /// Extra model inputs as `name=value`, repeatable
    #[arg(long = "feature", value_parser = parse_feature, allow_hyphen_values = true)]
    pub features: Vec<(String, f64)>,
}

fn parse_feature(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("feature '{name}': {e}"))?;
    Ok((name.trim().to_string(), value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekRange {
    pub start: u32,
    pub end: u32,
}

impl WeekRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, week: u32) -> bool {
        week >= self.start && week <= self.end
    }
}

impl FromStr for WeekRange {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (a, b) = match raw.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (raw, raw),
        };
        let start: u32 = a.parse().map_err(|_| format!("invalid week '{a}'"))?;
        let end: u32 = b.parse().map_err(|_| format!("invalid week '{b}'"))?;
        if start > end {
            return Err(format!("week range {start}-{end} is reversed"));
        }
        Ok(WeekRange { start, end })
    }
}

impl fmt::Display for WeekRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

fn invalid(msg: impl Into<String>) -> ModelError {
    ModelError::InvalidConfig(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub max_iter: usize,
    pub tolerance: f64,
    /// Diagonal entries of the centered Gram matrix at or below this are treated as zero.
    pub zero_diagonal_eps: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter: 10_000,
            tolerance: 1e-8,
            zero_diagonal_eps: 1e-12,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.max_iter == 0 {
            return Err(invalid("solver max_iter must be positive"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(invalid("solver tolerance must be finite and > 0"));
        }
        if !(self.zero_diagonal_eps.is_finite() && self.zero_diagonal_eps >= 0.0) {
            return Err(invalid("zero_diagonal_eps must be finite and >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub alphas: Vec<f64>,
    pub l1_ratios: Vec<f64>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            alphas: vec![0.01, 0.1, 1.0, 10.0, 100.0],
            l1_ratios: vec![0.0, 0.25, 0.5, 0.75, 1.0],
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.alphas.is_empty() || self.l1_ratios.is_empty() {
            return Err(invalid("hyperparameter grid is empty"));
        }
        if let Some(a) = self.alphas.iter().find(|a| !(a.is_finite() && **a > 0.0)) {
            return Err(invalid(format!("grid alpha {a} must be finite and > 0")));
        }
        if let Some(r) = self
            .l1_ratios
            .iter()
            .find(|r| !(r.is_finite() && (0.0..=1.0).contains(*r)))
        {
            return Err(invalid(format!("grid l1_ratio {r} must be in [0, 1]")));
        }
        Ok(())
    }

    pub fn candidates(&self) -> Vec<ElasticNetParams> {
        let mut out = Vec::with_capacity(self.alphas.len() * self.l1_ratios.len());
        for &alpha in &self.alphas {
            for &l1_ratio in &self.l1_ratios {
                out.push(ElasticNetParams { alpha, l1_ratio });
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub k_folds: usize,
    pub screen_keep: usize,
    pub min_train_rows: usize,
    pub tie_epsilon: f64,
    /// Minimum usable rows for a calibration run.
    pub min_rows: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            k_folds: 5,
            screen_keep: 8,
            min_train_rows: 20,
            tie_epsilon: 0.01,
            min_rows: 40,
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.k_folds < 2 {
            return Err(invalid("k_folds must be at least 2"));
        }
        if self.screen_keep == 0 {
            return Err(invalid("screen_keep must be positive"));
        }
        if self.min_train_rows == 0 {
            return Err(invalid("min_train_rows must be positive"));
        }
        if !(self.tie_epsilon.is_finite() && self.tie_epsilon >= 0.0) {
            return Err(invalid("tie_epsilon must be finite and >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HygieneConfig {
    /// Fraction clipped in each tail.
    pub tail_fraction: f64,
    pub zero_variance_std: f64,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            tail_fraction: 0.01,
            zero_variance_std: 1e-9,
        }
    }
}

impl HygieneConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.tail_fraction.is_finite() && (0.0..0.5).contains(&self.tail_fraction)) {
            return Err(invalid("tail_fraction must be in [0, 0.5)"));
        }
        if !(self.zero_variance_std.is_finite() && self.zero_variance_std > 0.0) {
            return Err(invalid("zero_variance_std must be finite and > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationWeights {
    pub high_quality: f64,
    pub broad: f64,
    /// Multiplier for games where either team is below the 3-game window.
    pub low_sample: f64,
}

impl Default for ObservationWeights {
    fn default() -> Self {
        Self {
            high_quality: 1.0,
            broad: 0.6,
            low_sample: 0.75,
        }
    }
}

impl ObservationWeights {
    pub fn for_quality(&self, quality: DataQuality) -> f64 {
        match quality {
            DataQuality::High => self.high_quality,
            DataQuality::Broad => self.broad,
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        for (name, w) in [
            ("high_quality", self.high_quality),
            ("broad", self.broad),
            ("low_sample", self.low_sample),
        ] {
            if !(w.is_finite() && w > 0.0 && w <= 1.0) {
                return Err(invalid(format!("observation weight {name}={w} must be in (0, 1]")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Symmetric winsor bound on the market spread.
    pub spread_clip: f64,
    pub min_books_high_quality: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            spread_clip: 45.0,
            min_books_high_quality: 3,
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.spread_clip.is_finite() && self.spread_clip > 0.0) {
            return Err(invalid("spread_clip must be finite and > 0"));
        }
        if self.min_books_high_quality == 0 {
            return Err(invalid("min_books_high_quality must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub slope_min: f64,
    pub slope_max: f64,
    pub rmse_ceiling: f64,
    pub sign_agreement_min: f64,
    pub pearson_min: f64,
    pub spearman_min: f64,
    /// Upper edges of the |spread| buckets; one more bucket than edges.
    pub bucket_edges: Vec<f64>,
    pub bucket_mae_ceilings: Vec<f64>,
    pub min_bucket_rows: usize,
}

impl GateThresholds {
    pub fn high_quality() -> Self {
        Self {
            slope_min: 0.90,
            slope_max: 1.10,
            rmse_ceiling: 7.5,
            sign_agreement_min: 0.70,
            pearson_min: 0.30,
            spearman_min: 0.30,
            bucket_edges: vec![7.0, 14.0, 28.0],
            bucket_mae_ceilings: vec![6.0, 8.0, 10.0, 13.0],
            min_bucket_rows: 5,
        }
    }

    pub fn broad() -> Self {
        Self {
            rmse_ceiling: 9.0,
            bucket_mae_ceilings: vec![7.0, 9.5, 12.0, 15.0],
            ..Self::high_quality()
        }
    }

    pub fn for_subset(subset: DataQuality) -> Self {
        match subset {
            DataQuality::High => Self::high_quality(),
            DataQuality::Broad => Self::broad(),
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        if !(self.slope_min <= self.slope_max) {
            return Err(invalid("slope_min must not exceed slope_max"));
        }
        if !(self.rmse_ceiling.is_finite() && self.rmse_ceiling > 0.0) {
            return Err(invalid("rmse_ceiling must be finite and > 0"));
        }
        if self.bucket_mae_ceilings.len() != self.bucket_edges.len() + 1 {
            return Err(invalid(format!(
                "expected {} bucket ceilings for {} edges, got {}",
                self.bucket_edges.len() + 1,
                self.bucket_edges.len(),
                self.bucket_mae_ceilings.len()
            )));
        }
        if self.bucket_edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("bucket edges must be strictly increasing"));
        }
        Ok(())
    }
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self::high_quality()
    }
}

/// Everything a calibration run needs besides its input rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub subset: DataQuality,
    pub solver: SolverConfig,
    pub grid: GridConfig,
    pub selector: SelectorConfig,
    pub hygiene: HygieneConfig,
    pub recency: RecencyConfig,
    pub weights: ObservationWeights,
    pub market: MarketConfig,
    pub gates: GateThresholds,
}

impl CalibrationConfig {
    pub fn for_subset(subset: DataQuality) -> Self {
        Self {
            subset,
            solver: SolverConfig::default(),
            grid: GridConfig::default(),
            selector: SelectorConfig::default(),
            hygiene: HygieneConfig::default(),
            recency: RecencyConfig::default(),
            weights: ObservationWeights::default(),
            market: MarketConfig::default(),
            gates: GateThresholds::for_subset(subset),
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        self.solver.validate()?;
        self.grid.validate()?;
        self.selector.validate()?;
        self.hygiene.validate()?;
        self.recency.validate()?;
        self.weights.validate()?;
        self.market.validate()?;
        self.gates.validate()
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self::for_subset(DataQuality::High)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendConfig {
    /// Weight on the primary rating's z-score.
    pub weight: f64,
    pub primary_mean: f64,
    pub primary_std: f64,
    pub secondary_mean: f64,
    pub secondary_std: f64,
    #[serde(default = "default_true")]
    pub secondary_higher_is_better: bool,
}

fn default_true() -> bool {
    true
}

impl BlendConfig {
    pub fn primary_only() -> Self {
        Self {
            weight: 1.0,
            primary_mean: 0.0,
            primary_std: 1.0,
            secondary_mean: 0.0,
            secondary_std: 1.0,
            secondary_higher_is_better: true,
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        if !(self.weight.is_finite() && (0.0..=1.0).contains(&self.weight)) {
            return Err(invalid(format!("blend weight {} must be in [0, 1]", self.weight)));
        }
        for (name, v) in [("primary_std", self.primary_std), ("secondary_std", self.secondary_std)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(invalid(format!("blend {name} must be finite and > 0")));
            }
        }
        if !(self.primary_mean.is_finite() && self.secondary_mean.is_finite()) {
            return Err(invalid("blend means must be finite"));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let cfg: BlendConfig = read_json(path)?;
        cfg.validate()
            .with_context(|| format!("invalid blend config {}", path.display()))?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HfaConfig {
    pub base_points: f64,
    #[serde(default)]
    pub team_adjustments: HashMap<String, f64>,
    pub clip_min: f64,
    pub clip_max: f64,
}

impl Default for HfaConfig {
    fn default() -> Self {
        Self {
            base_points: 2.5,
            team_adjustments: HashMap::new(),
            clip_min: 0.0,
            clip_max: 5.0,
        }
    }
}

impl HfaConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.base_points.is_finite() && self.clip_min.is_finite() && self.clip_max.is_finite())
        {
            return Err(invalid("hfa values must be finite"));
        }
        if self.clip_min > self.clip_max {
            return Err(invalid(format!(
                "hfa clip_min {} exceeds clip_max {}",
                self.clip_min, self.clip_max
            )));
        }
        if let Some((team, _)) = self.team_adjustments.iter().find(|(_, v)| !v.is_finite()) {
            return Err(invalid(format!("hfa adjustment for {team} is not finite")));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let cfg: HfaConfig = read_json(path)?;
        cfg.validate()
            .with_context(|| format!("invalid hfa config {}", path.display()))?;
        Ok(cfg)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
