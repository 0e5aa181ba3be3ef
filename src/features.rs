use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::info;

use crate::error::ModelResult;
use crate::opponent_adjust::{AdjustedNets, adjust_record};
use crate::recency::{PreseasonPrior, RecencyConfig, compute_team_recency};
use crate::records::{
    EngineeredFeatureRow, METRIC_COUNT, Metric, MetricFeatures, TeamGameRecord,
};

/// A rest of this many days or more marks the previous week as a bye.
pub const BYE_REST_DAYS: f64 = 13.0;

/// Days since the previous game, `None` for the first game of the series.
pub fn rest_days(dates: &[NaiveDate]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(dates.len());
    for (i, d) in dates.iter().enumerate() {
        out.push(i.checked_sub(1).map(|p| (*d - dates[p]).num_days() as f64));
    }
    out
}

/// Indices of `records` grouped per team, each group in chronological order
/// (date, then week, then game id).
fn team_series(records: &[TeamGameRecord]) -> BTreeMap<&str, Vec<usize>> {
    let mut by_team: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, r) in records.iter().enumerate() {
        by_team.entry(r.team.as_str()).or_default().push(i);
    }
    for idx in by_team.values_mut() {
        idx.sort_by_key(|&i| (records[i].game_date, records[i].week, records[i].game_id));
    }
    by_team
}

/// Opponent adjustment, recency EWMAs and rest features for every record. Output rows
/// follow the order of `records`.
pub fn build_engineered_rows(
    records: &[TeamGameRecord],
    cfg: &RecencyConfig,
    feature_version: &str,
) -> ModelResult<Vec<EngineeredFeatureRow>> {
    let adjusted: Vec<[AdjustedNets; METRIC_COUNT]> = records.iter().map(adjust_record).collect();

    let mut rows: Vec<Option<EngineeredFeatureRow>> = vec![None; records.len()];
    let mut rest_by_game: HashMap<(u64, &str), Option<f64>> = HashMap::new();

    for (team, idx) in team_series(records) {
        let series: Vec<[AdjustedNets; METRIC_COUNT]> = idx.iter().map(|&i| adjusted[i]).collect();
        let priors: Vec<PreseasonPrior> = idx
            .iter()
            .map(|&i| PreseasonPrior::from_talent(cfg, records[i].talent))
            .collect();
        let recency = compute_team_recency(&series, &priors)?;
        let dates: Vec<NaiveDate> = idx.iter().map(|&i| records[i].game_date).collect();
        let rest = rest_days(&dates);

        for (k, &i) in idx.iter().enumerate() {
            let r = &records[i];
            rest_by_game.insert((r.game_id, team), rest[k]);
            let mut metrics = [MetricFeatures::default(); METRIC_COUNT];
            for m in Metric::ALL {
                let a = series[k][m.index()];
                let e = recency[k].metrics[m.index()];
                metrics[m.index()] = MetricFeatures {
                    off_adj: a.off_adj,
                    def_adj: a.def_adj,
                    edge: a.edge,
                    off_ewma_3g: e.off_3g,
                    def_ewma_3g: e.def_3g,
                    edge_ewma_3g: e.edge_3g,
                    off_ewma_5g: e.off_5g,
                    def_ewma_5g: e.def_5g,
                    edge_ewma_5g: e.edge_5g,
                };
            }
            rows[i] = Some(EngineeredFeatureRow {
                game_id: r.game_id,
                season: r.season,
                week: r.week,
                game_date: r.game_date,
                team: r.team.clone(),
                opponent: r.opponent.clone(),
                is_home: r.is_home,
                metrics,
                prior_games: recency[k].prior_games,
                low_sample_3g: recency[k].low_sample_3g,
                low_sample_5g: recency[k].low_sample_5g,
                rest_days: rest[k],
                rest_days_delta: None,
                bye_week: rest[k].is_some_and(|d| d >= BYE_REST_DAYS),
                feature_version: feature_version.to_string(),
            });
        }
    }

    let mut out: Vec<EngineeredFeatureRow> = rows.into_iter().flatten().collect();
    for row in out.iter_mut() {
        let opp_rest = rest_by_game
            .get(&(row.game_id, row.opponent.as_str()))
            .copied()
            .flatten();
        row.rest_days_delta = match (row.rest_days, opp_rest) {
            (Some(a), Some(b)) => Some(a - b),
            _ => None,
        };
        row.sanitize();
    }

    info!(
        rows = out.len(),
        low_sample_3g = out.iter().filter(|r| r.low_sample_3g).count(),
        feature_version,
        "built engineered feature rows"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_days_count_calendar_days() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        let rest = rest_days(&[d(9, 1), d(9, 7), d(9, 21)]);
        assert_eq!(rest, vec![None, Some(6.0), Some(14.0)]);
        assert!(rest[2].unwrap() >= BYE_REST_DAYS);
    }
}
