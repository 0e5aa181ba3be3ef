use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::config::{HfaConfig, MarketConfig, ObservationWeights};
use crate::feature_set::{EPA_EDGE_DIFF_3G, SUCCESS_EDGE_DIFF_3G};
use crate::predictor::{RatingBlender, hfa_points};
use crate::records::{
    CalibrationRow, DataQuality, EngineeredFeatureRow, MatchupTier, Metric, TeamGameRecord,
    finite_opt,
};
use crate::stats_loader::{MarketLine, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consensus {
    /// Home minus away, i.e. the negated median quoted home spread.
    pub home_margin: f64,
    pub books: usize,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let n = values.len();
    Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    })
}

/// Median across books of each book's latest line observed on or before game day.
pub fn market_consensus(lines: &[MarketLine], game_date: NaiveDate) -> Option<Consensus> {
    let mut latest: HashMap<(&str, &str), &MarketLine> = HashMap::new();
    for line in lines {
        if line.observed_at.date() > game_date || !line.home_spread.is_finite() {
            continue;
        }
        let key = (line.source.as_str(), line.book.as_str());
        match latest.get(&key) {
            Some(prev) if prev.observed_at >= line.observed_at => {}
            _ => {
                latest.insert(key, line);
            }
        }
    }
    let mut quotes: Vec<f64> = latest.values().map(|l| l.home_spread).collect();
    let books = quotes.len();
    let quoted = median(&mut quotes)?;
    Some(Consensus {
        home_margin: -quoted,
        books,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBuildReport {
    pub rows: Vec<CalibrationRow>,
    pub skipped_no_market: usize,
    pub skipped_no_rating: usize,
    pub skipped_incomplete: usize,
}

fn edge_diff(home: Option<&EngineeredFeatureRow>, away: Option<&EngineeredFeatureRow>, m: Metric) -> Option<f64> {
    let h = home?.metric(m).edge_ewma_3g?;
    let a = away?.metric(m).edge_ewma_3g?;
    finite_opt(Some(h - a))
}

/// One row per game with both team records, a rating for each side and a market line.
pub fn build_calibration_rows(
    snapshot: &StatsSnapshot,
    records: &[TeamGameRecord],
    engineered: &[EngineeredFeatureRow],
    blender: &RatingBlender,
    hfa: &HfaConfig,
    market: &MarketConfig,
    weights: &ObservationWeights,
) -> RowBuildReport {
    let mut report = RowBuildReport::default();
    let features: HashMap<(u64, &str), &EngineeredFeatureRow> = engineered
        .iter()
        .map(|r| ((r.game_id, r.team.as_str()), r))
        .collect();

    let mut games: BTreeMap<u64, (Option<&TeamGameRecord>, Option<&TeamGameRecord>)> =
        BTreeMap::new();
    for r in records {
        let slot = games.entry(r.game_id).or_default();
        if r.is_home {
            slot.0 = Some(r);
        } else {
            slot.1 = Some(r);
        }
    }

    for (game_id, pair) in games {
        let (Some(home), Some(away)) = pair else {
            report.skipped_incomplete += 1;
            continue;
        };
        let Some(tier) = MatchupTier::from_tiers(home.team_tier, away.team_tier) else {
            report.skipped_incomplete += 1;
            continue;
        };
        let (Some(home_rating), Some(away_rating)) = (
            snapshot.rating_before(&home.team, home.week),
            snapshot.rating_before(&away.team, away.week),
        ) else {
            debug!(game_id, "missing rating; skipping");
            report.skipped_no_rating += 1;
            continue;
        };
        let Some(consensus) = market_consensus(snapshot.lines_for(game_id), home.game_date) else {
            report.skipped_no_market += 1;
            continue;
        };

        let home_feat = features.get(&(game_id, home.team.as_str())).copied();
        let away_feat = features.get(&(game_id, away.team.as_str())).copied();
        let low_sample = home_feat.is_some_and(|f| f.low_sample_3g)
            || away_feat.is_some_and(|f| f.low_sample_3g);

        let quality = if consensus.books >= market.min_books_high_quality {
            DataQuality::High
        } else {
            DataQuality::Broad
        };
        let mut weight = weights.for_quality(quality);
        if low_sample {
            weight *= weights.low_sample;
        }

        let mut extras = BTreeMap::new();
        extras.insert(
            EPA_EDGE_DIFF_3G.to_string(),
            edge_diff(home_feat, away_feat, Metric::EpaPerPlay),
        );
        extras.insert(
            SUCCESS_EDGE_DIFF_3G.to_string(),
            edge_diff(home_feat, away_feat, Metric::SuccessRate),
        );
        let talent_diff = match (home.talent, away.talent) {
            (Some(h), Some(a)) => finite_opt(Some(h - a)),
            _ => None,
        };

        report.rows.push(CalibrationRow {
            game_id,
            season: home.season,
            week: home.week,
            home_team: home.team.clone(),
            away_team: away.team.clone(),
            rating_diff: blender.rating_diff(&home_rating, &away_rating),
            hfa_points: hfa_points(hfa, &home.team, home.neutral_site),
            matchup_tier: tier,
            talent_diff,
            extras,
            market_spread: consensus.home_margin.clamp(-market.spread_clip, market.spread_clip),
            quality,
            low_sample,
            weight,
        });
    }

    info!(
        rows = report.rows.len(),
        high_quality = report.rows.iter().filter(|r| r.quality == DataQuality::High).count(),
        no_market = report.skipped_no_market,
        no_rating = report.skipped_no_rating,
        incomplete = report.skipped_incomplete,
        "built calibration rows"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn line(book: &str, at: &str, spread: f64) -> MarketLine {
        MarketLine {
            game_id: 1,
            source: "consensus".into(),
            book: book.into(),
            observed_at: NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M:%S").unwrap(),
            home_spread: spread,
            total: None,
        }
    }

    #[test]
    fn consensus_uses_latest_pre_game_line_per_book() {
        let game_day = NaiveDate::from_ymd_opt(2024, 9, 7).unwrap();
        let lines = vec![
            line("a", "2024-09-01 10:00:00", -3.0),
            line("a", "2024-09-06 10:00:00", -7.0),
            line("b", "2024-09-06 12:00:00", -6.0),
            line("c", "2024-09-05 12:00:00", -6.5),
            // after kickoff day: ignored
            line("c", "2024-09-08 12:00:00", 14.0),
        ];
        let c = market_consensus(&lines, game_day).unwrap();
        assert_eq!(c.books, 3);
        assert_eq!(c.home_margin, 6.5);
    }

    #[test]
    fn no_pre_game_lines_means_no_consensus() {
        let game_day = NaiveDate::from_ymd_opt(2024, 9, 7).unwrap();
        assert!(market_consensus(&[line("a", "2024-09-09 10:00:00", -3.0)], game_day).is_none());
        assert!(market_consensus(&[], game_day).is_none());
    }

    #[test]
    fn even_count_median_averages_middle_pair() {
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }
}
