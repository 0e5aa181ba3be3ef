use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const METRIC_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    EpaPerPlay,
    SuccessRate,
    Explosiveness,
    PointsPerOpportunity,
    RushingEpa,
    PassingEpa,
}

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::EpaPerPlay,
        Metric::SuccessRate,
        Metric::Explosiveness,
        Metric::PointsPerOpportunity,
        Metric::RushingEpa,
        Metric::PassingEpa,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn key(self) -> &'static str {
        match self {
            Metric::EpaPerPlay => "epa_per_play",
            Metric::SuccessRate => "success_rate",
            Metric::Explosiveness => "explosiveness",
            Metric::PointsPerOpportunity => "points_per_opportunity",
            Metric::RushingEpa => "rushing_epa",
            Metric::PassingEpa => "passing_epa",
        }
    }

    pub fn from_key(raw: &str) -> Option<Metric> {
        let k = raw.trim().to_ascii_lowercase();
        Metric::ALL.into_iter().find(|m| m.key() == k)
    }
}

/// Converts anything non-finite to `None`. NaN and infinities never leave this crate.
pub fn finite_or_none(value: f64) -> Option<f64> {
    if value.is_finite() { Some(value) } else { None }
}

pub fn finite_opt(value: Option<f64>) -> Option<f64> {
    value.and_then(finite_or_none)
}

/// One nullable value per [`Metric`], indexed by `Metric::index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues(pub [Option<f64>; METRIC_COUNT]);

impl MetricValues {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        self.0[metric.index()] = finite_opt(value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Per-metric fallback: keeps our value where present, otherwise takes `fallback`'s.
    pub fn or_fallback(&self, fallback: &MetricValues) -> MetricValues {
        let mut out = *self;
        for m in Metric::ALL {
            if out.get(m).is_none() {
                out.set(m, fallback.get(m));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TeamTier {
    P5,
    G5,
    Fcs,
}

impl TeamTier {
    pub fn key(self) -> &'static str {
        match self {
            TeamTier::P5 => "P5",
            TeamTier::G5 => "G5",
            TeamTier::Fcs => "FCS",
        }
    }
}

impl FromStr for TeamTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "P5" | "POWER5" | "POWER 5" => Ok(TeamTier::P5),
            "G5" | "GROUP5" | "GROUP OF 5" => Ok(TeamTier::G5),
            "FCS" => Ok(TeamTier::Fcs),
            other => Err(format!("unknown team tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchupTier {
    P5P5,
    P5G5,
    P5Fcs,
    G5G5,
    G5Fcs,
}

impl MatchupTier {
    /// Non-baseline tiers, in dummy-column order. P5-P5 is the baseline.
    pub const DUMMIES: [MatchupTier; 4] = [
        MatchupTier::P5G5,
        MatchupTier::P5Fcs,
        MatchupTier::G5G5,
        MatchupTier::G5Fcs,
    ];

    /// Order-insensitive. FCS-FCS games are outside the closed set and yield `None`.
    pub fn from_tiers(a: TeamTier, b: TeamTier) -> Option<MatchupTier> {
        let (hi, lo) = if a <= b { (a, b) } else { (b, a) };
        match (hi, lo) {
            (TeamTier::P5, TeamTier::P5) => Some(MatchupTier::P5P5),
            (TeamTier::P5, TeamTier::G5) => Some(MatchupTier::P5G5),
            (TeamTier::P5, TeamTier::Fcs) => Some(MatchupTier::P5Fcs),
            (TeamTier::G5, TeamTier::G5) => Some(MatchupTier::G5G5),
            (TeamTier::G5, TeamTier::Fcs) => Some(MatchupTier::G5Fcs),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MatchupTier::P5P5 => "P5-P5",
            MatchupTier::P5G5 => "P5-G5",
            MatchupTier::P5Fcs => "P5-FCS",
            MatchupTier::G5G5 => "G5-G5",
            MatchupTier::G5Fcs => "G5-FCS",
        }
    }

    pub fn dummy_name(self) -> &'static str {
        match self {
            MatchupTier::P5P5 => "tier_p5_p5",
            MatchupTier::P5G5 => "tier_p5_g5",
            MatchupTier::P5Fcs => "tier_p5_fcs",
            MatchupTier::G5G5 => "tier_g5_g5",
            MatchupTier::G5Fcs => "tier_g5_fcs",
        }
    }
}

impl fmt::Display for MatchupTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataQuality {
    High,
    Broad,
}

impl DataQuality {
    pub fn key(self) -> &'static str {
        match self {
            DataQuality::High => "high",
            DataQuality::Broad => "broad",
        }
    }
}

impl FromStr for DataQuality {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" | "high_quality" | "hq" => Ok(DataQuality::High),
            "broad" | "all" => Ok(DataQuality::Broad),
            other => Err(format!("unknown data subset '{other}' (expected high|broad)")),
        }
    }
}

/// One team's participation in one completed game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamGameRecord {
    pub game_id: u64,
    pub season: i32,
    pub week: u32,
    pub game_date: NaiveDate,
    pub team: String,
    pub opponent: String,
    pub is_home: bool,
    pub neutral_site: bool,
    pub conference_game: bool,
    pub team_tier: TeamTier,
    pub opponent_tier: TeamTier,
    pub offense: MetricValues,
    pub defense: MetricValues,
    /// Opponent's complementary numbers (their season-level offense/defense).
    pub opp_offense: MetricValues,
    pub opp_defense: MetricValues,
    pub talent: Option<f64>,
    pub returning_production: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricFeatures {
    pub off_adj: Option<f64>,
    pub def_adj: Option<f64>,
    pub edge: Option<f64>,
    pub off_ewma_3g: Option<f64>,
    pub def_ewma_3g: Option<f64>,
    pub edge_ewma_3g: Option<f64>,
    pub off_ewma_5g: Option<f64>,
    pub def_ewma_5g: Option<f64>,
    pub edge_ewma_5g: Option<f64>,
}

impl MetricFeatures {
    const FIELD_NAMES: [&'static str; 9] = [
        "off_adj",
        "def_adj",
        "edge",
        "off_ewma_3g",
        "def_ewma_3g",
        "edge_ewma_3g",
        "off_ewma_5g",
        "def_ewma_5g",
        "edge_ewma_5g",
    ];

    fn fields(&self) -> [Option<f64>; 9] {
        [
            self.off_adj,
            self.def_adj,
            self.edge,
            self.off_ewma_3g,
            self.def_ewma_3g,
            self.edge_ewma_3g,
            self.off_ewma_5g,
            self.def_ewma_5g,
            self.edge_ewma_5g,
        ]
    }

    fn fields_mut(&mut self) -> [&mut Option<f64>; 9] {
        [
            &mut self.off_adj,
            &mut self.def_adj,
            &mut self.edge,
            &mut self.off_ewma_3g,
            &mut self.def_ewma_3g,
            &mut self.edge_ewma_3g,
            &mut self.off_ewma_5g,
            &mut self.def_ewma_5g,
            &mut self.edge_ewma_5g,
        ]
    }
}

/// A [`TeamGameRecord`] after opponent adjustment and recency weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineeredFeatureRow {
    pub game_id: u64,
    pub season: i32,
    pub week: u32,
    pub game_date: NaiveDate,
    pub team: String,
    pub opponent: String,
    pub is_home: bool,
    pub metrics: [MetricFeatures; METRIC_COUNT],
    pub prior_games: usize,
    pub low_sample_3g: bool,
    pub low_sample_5g: bool,
    pub rest_days: Option<f64>,
    pub rest_days_delta: Option<f64>,
    pub bye_week: bool,
    pub feature_version: String,
}

impl EngineeredFeatureRow {
    pub fn metric(&self, metric: Metric) -> &MetricFeatures {
        &self.metrics[metric.index()]
    }

    /// Flattened `(column name, value)` pairs, in a stable order.
    pub fn numeric_columns(&self) -> Vec<(String, Option<f64>)> {
        let mut out = Vec::with_capacity(METRIC_COUNT * 9 + 2);
        for m in Metric::ALL {
            let fields = self.metrics[m.index()].fields();
            for (name, value) in MetricFeatures::FIELD_NAMES.iter().zip(fields) {
                out.push((format!("{}_{}", m.key(), name), value));
            }
        }
        out.push(("rest_days".to_string(), self.rest_days));
        out.push(("rest_days_delta".to_string(), self.rest_days_delta));
        out
    }

    /// Mutable view in the same order as [`Self::numeric_columns`].
    pub fn numeric_values_mut(&mut self) -> Vec<&mut Option<f64>> {
        let mut out: Vec<&mut Option<f64>> = Vec::with_capacity(METRIC_COUNT * 9 + 2);
        for features in self.metrics.iter_mut() {
            out.extend(features.fields_mut());
        }
        out.push(&mut self.rest_days);
        out.push(&mut self.rest_days_delta);
        out
    }

    pub fn sanitize(&mut self) {
        for value in self.numeric_values_mut() {
            *value = finite_opt(*value);
        }
    }
}

/// One graded game, the regression's unit of observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRow {
    pub game_id: u64,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    pub rating_diff: f64,
    pub hfa_points: f64,
    pub matchup_tier: MatchupTier,
    pub talent_diff: Option<f64>,
    #[serde(default)]
    pub extras: BTreeMap<String, Option<f64>>,
    /// Consensus market spread, home minus away.
    pub market_spread: f64,
    pub quality: DataQuality,
    #[serde(default)]
    pub low_sample: bool,
    pub weight: f64,
}

impl CalibrationRow {
    pub fn feature_value(&self, name: &str) -> Option<f64> {
        let raw = match name {
            "rating_diff" => Some(self.rating_diff),
            "hfa_points" => Some(self.hfa_points),
            "rating_diff_sq" => Some(self.rating_diff * self.rating_diff),
            "talent_diff" => self.talent_diff,
            _ => {
                if let Some(tier) = MatchupTier::DUMMIES
                    .into_iter()
                    .chain([MatchupTier::P5P5])
                    .find(|t| t.dummy_name() == name)
                {
                    Some(if self.matchup_tier == tier { 1.0 } else { 0.0 })
                } else {
                    self.extras.get(name).copied().flatten()
                }
            }
        };
        finite_opt(raw)
    }
}
