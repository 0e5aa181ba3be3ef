use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::opponent_adjust::AdjustedNets;
use crate::records::{METRIC_COUNT, Metric, finite_opt};

/// Most-recent-first.
pub const WEIGHTS_3G: [f64; 3] = [0.5, 0.3, 0.2];
pub const WEIGHTS_5G: [f64; 5] = [0.35, 0.25, 0.18, 0.13, 0.09];

/// League-typical level and spread of the adjusted nets for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub off_mean: f64,
    pub off_std: f64,
    pub def_mean: f64,
    pub def_std: f64,
}

impl MetricBaseline {
    const fn new(league_mean: f64, std: f64) -> Self {
        // def_adj = -(team_def + opp_off) centres near -2x the league mean.
        Self {
            off_mean: 0.0,
            off_std: std,
            def_mean: -2.0 * league_mean,
            def_std: std,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecencyConfig {
    pub talent_mean: f64,
    pub talent_std: f64,
    /// Fraction of a talent z-score carried into the prior, in baseline std units.
    pub prior_shrink: f64,
    pub baselines: [MetricBaseline; METRIC_COUNT],
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            talent_mean: 650.0,
            talent_std: 180.0,
            prior_shrink: 0.5,
            baselines: [
                MetricBaseline::new(0.05, 0.12),
                MetricBaseline::new(0.42, 0.05),
                MetricBaseline::new(1.25, 0.15),
                MetricBaseline::new(4.0, 0.8),
                MetricBaseline::new(0.02, 0.12),
                MetricBaseline::new(0.10, 0.15),
            ],
        }
    }
}

impl RecencyConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.talent_std.is_finite() && self.talent_std > 0.0 && self.talent_mean.is_finite()) {
            return Err(ModelError::InvalidConfig(
                "talent_mean must be finite and talent_std > 0".into(),
            ));
        }
        if !(self.prior_shrink.is_finite() && (0.0..=1.0).contains(&self.prior_shrink)) {
            return Err(ModelError::InvalidConfig("prior_shrink must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Preseason expectation for a team's adjusted nets. Built from talent and fixed
/// baselines only, so it never sees in-season results.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreseasonPrior {
    pub off: [Option<f64>; METRIC_COUNT],
    pub def: [Option<f64>; METRIC_COUNT],
}

impl PreseasonPrior {
    pub fn from_talent(cfg: &RecencyConfig, talent: Option<f64>) -> Self {
        let Some(talent) = finite_opt(talent) else {
            return Self::default();
        };
        let z = (talent - cfg.talent_mean) / cfg.talent_std;
        let mut out = Self::default();
        for m in Metric::ALL {
            let b = cfg.baselines[m.index()];
            out.off[m.index()] = finite_opt(Some(b.off_mean + cfg.prior_shrink * z * b.off_std));
            // Better talent means a higher (less negative) defensive net.
            out.def[m.index()] = finite_opt(Some(b.def_mean + cfg.prior_shrink * z * b.def_std));
        }
        out
    }

    pub fn edge(&self, metric: Metric) -> Option<f64> {
        match (self.off[metric.index()], self.def[metric.index()]) {
            (Some(o), Some(d)) => finite_opt(Some(o - d)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowValue {
    pub value: Option<f64>,
    /// Non-null games that entered the average.
    pub available: usize,
}

/// Weighted recency average over `history`, which must hold only games strictly
/// before the one being featurized, oldest first. Missing values are skipped; the
/// shortfall below the window is filled from `prior`.
pub fn ewma_window(history: &[Option<f64>], weights: &[f64], prior: Option<f64>) -> WindowValue {
    let window = weights.len();
    let picks: Vec<f64> = history
        .iter()
        .rev()
        .filter_map(|v| finite_opt(*v))
        .take(window)
        .collect();
    let available = picks.len();
    if available == 0 {
        return WindowValue {
            value: finite_opt(prior),
            available,
        };
    }

    let (num, den) = picks
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(n, d), (v, w)| (n + v * w, d + w));
    let partial = num / den;
    let shortfall = (window - available) as f64 / window as f64;
    let value = match prior {
        Some(p) if shortfall > 0.0 => (1.0 - shortfall) * partial + shortfall * p,
        _ => partial,
    };
    WindowValue {
        value: finite_opt(Some(value)),
        available,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecencyValues {
    pub off_3g: Option<f64>,
    pub def_3g: Option<f64>,
    pub edge_3g: Option<f64>,
    pub off_5g: Option<f64>,
    pub def_5g: Option<f64>,
    pub edge_5g: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TeamRecency {
    pub metrics: [RecencyValues; METRIC_COUNT],
    pub prior_games: usize,
    pub low_sample_3g: bool,
    pub low_sample_5g: bool,
}

/// EWMAs for each game of one team's chronologically ordered season.
/// Entry `i` is computed from `series[..i]` alone.
pub fn compute_team_recency(
    series: &[[AdjustedNets; METRIC_COUNT]],
    priors: &[PreseasonPrior],
) -> ModelResult<Vec<TeamRecency>> {
    if series.len() != priors.len() {
        return Err(ModelError::DimensionMismatch {
            context: "recency priors",
            expected: series.len(),
            actual: priors.len(),
        });
    }

    let mut out = Vec::with_capacity(series.len());
    for (i, prior) in priors.iter().enumerate() {
        let history = &series[..i];
        let mut entry = TeamRecency {
            prior_games: i,
            low_sample_3g: i < WEIGHTS_3G.len(),
            low_sample_5g: i < WEIGHTS_5G.len(),
            ..TeamRecency::default()
        };
        for m in Metric::ALL {
            let idx = m.index();
            let off: Vec<Option<f64>> = history.iter().map(|g| g[idx].off_adj).collect();
            let def: Vec<Option<f64>> = history.iter().map(|g| g[idx].def_adj).collect();
            let edge: Vec<Option<f64>> = history.iter().map(|g| g[idx].edge).collect();
            let (p_off, p_def, p_edge) = (prior.off[idx], prior.def[idx], prior.edge(m));

            entry.metrics[idx] = RecencyValues {
                off_3g: ewma_window(&off, &WEIGHTS_3G, p_off).value,
                def_3g: ewma_window(&def, &WEIGHTS_3G, p_def).value,
                edge_3g: ewma_window(&edge, &WEIGHTS_3G, p_edge).value,
                off_5g: ewma_window(&off, &WEIGHTS_5G, p_off).value,
                def_5g: ewma_window(&def, &WEIGHTS_5G, p_def).value,
                edge_5g: ewma_window(&edge, &WEIGHTS_5G, p_edge).value,
            };
        }
        out.push(entry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn weights_sum_to_one() {
        assert_relative_eq!(WEIGHTS_3G.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(WEIGHTS_5G.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn full_window_ignores_prior() {
        let history = [Some(1.0), Some(2.0), Some(3.0), Some(4.0)];
        let v = ewma_window(&history, &WEIGHTS_3G, Some(100.0));
        // most recent first: 4, 3, 2
        assert_relative_eq!(v.value.unwrap(), 0.5 * 4.0 + 0.3 * 3.0 + 0.2 * 2.0, epsilon = 1e-12);
        assert_eq!(v.available, 3);
    }

    #[test]
    fn partial_window_blends_with_prior() {
        let history = [Some(2.0)];
        let v = ewma_window(&history, &WEIGHTS_3G, Some(-1.0));
        let shortfall = 2.0 / 3.0;
        assert_relative_eq!(
            v.value.unwrap(),
            (1.0 - shortfall) * 2.0 + shortfall * -1.0,
            epsilon = 1e-12
        );
        assert_eq!(v.available, 1);
    }

    #[test]
    fn nulls_are_skipped_and_weights_renormalized() {
        let history = [Some(1.0), None, Some(3.0)];
        let v = ewma_window(&history, &WEIGHTS_3G, None);
        let expected = (0.5 * 3.0 + 0.3 * 1.0) / 0.8;
        assert_relative_eq!(v.value.unwrap(), expected, epsilon = 1e-12);
        assert_eq!(v.available, 2);
    }

    #[test]
    fn no_history_returns_prior_or_none() {
        assert_eq!(ewma_window(&[], &WEIGHTS_5G, Some(0.3)).value, Some(0.3));
        assert_eq!(ewma_window(&[None, None], &WEIGHTS_5G, None).value, None);
    }

    #[test]
    fn talent_prior_is_centred_on_baseline() {
        let cfg = RecencyConfig::default();
        let avg = PreseasonPrior::from_talent(&cfg, Some(cfg.talent_mean));
        let b = cfg.baselines[Metric::EpaPerPlay.index()];
        assert_relative_eq!(avg.off[0].unwrap(), b.off_mean, epsilon = 1e-12);
        let strong = PreseasonPrior::from_talent(&cfg, Some(cfg.talent_mean + cfg.talent_std));
        assert!(strong.off[0].unwrap() > avg.off[0].unwrap());
        assert_eq!(PreseasonPrior::from_talent(&cfg, None), PreseasonPrior::default());
    }

    #[test]
    fn first_game_is_flagged_low_sample() {
        let series = vec![[AdjustedNets::default(); METRIC_COUNT]; 4];
        let priors = vec![PreseasonPrior::default(); 4];
        let out = compute_team_recency(&series, &priors).unwrap();
        assert!(out[0].low_sample_3g && out[0].low_sample_5g);
        assert!(!out[3].low_sample_3g && out[3].low_sample_5g);
        assert!(compute_team_recency(&series, &priors[..2]).is_err());
    }
}
