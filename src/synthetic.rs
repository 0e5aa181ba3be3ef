//! Seeded synthetic seasons for demos, tests and benches.

use std::collections::{BTreeMap, HashMap};

use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::feature_set::{EPA_EDGE_DIFF_3G, SUCCESS_EDGE_DIFF_3G};
use crate::predictor::TeamRating;
use crate::recency::RecencyConfig;
use crate::records::{
    CalibrationRow, DataQuality, METRIC_COUNT, MatchupTier, Metric, MetricValues, TeamTier,
};
use crate::stats_loader::{
    ExternalGameKey, ExternalGameStats, MarketLine, ScheduledGame, SideStats, StatsSnapshot,
    TeamInfo, normalize_team,
};

/// Standard normal draw (Box-Muller).
pub fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Rows whose market spread is `0.8 * rating_diff + 2 * hfa_points` plus N(0, sigma) noise,
/// spread over fourteen weeks.
pub fn synthetic_calibration_rows(n: usize, seed: u64, noise_sigma: f64) -> Vec<CalibrationRow> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let rating_diff = 10.0 * normal(&mut rng);
        let neutral = rng.gen_range(0.0..1.0) < 0.1;
        let hfa_points = if neutral { 0.0 } else { rng.gen_range(1.5..3.5) };
        let market_spread = 0.8 * rating_diff + 2.0 * hfa_points + noise_sigma * normal(&mut rng);
        let matchup_tier = match rng.gen_range(0..10) {
            0..=5 => MatchupTier::P5P5,
            6 | 7 => MatchupTier::P5G5,
            8 => MatchupTier::G5G5,
            _ => MatchupTier::P5Fcs,
        };
        let mut extras = BTreeMap::new();
        extras.insert(
            EPA_EDGE_DIFF_3G.to_string(),
            Some(0.01 * rating_diff + 0.05 * normal(&mut rng)),
        );
        extras.insert(
            SUCCESS_EDGE_DIFF_3G.to_string(),
            Some(0.004 * rating_diff + 0.03 * normal(&mut rng)),
        );
        out.push(CalibrationRow {
            game_id: i as u64 + 1,
            season: 2024,
            week: 1 + (i % 14) as u32,
            home_team: format!("home_{i}"),
            away_team: format!("away_{i}"),
            rating_diff,
            hfa_points,
            matchup_tier,
            talent_diff: Some(150.0 * normal(&mut rng)),
            extras,
            market_spread,
            quality: DataQuality::High,
            low_sample: false,
            weight: 1.0,
        });
    }
    out
}

fn team_name(i: usize) -> String {
    format!("Team {i:02}")
}

fn metric_scale() -> [(f64, f64); METRIC_COUNT] {
    let cfg = RecencyConfig::default();
    let mut out = [(0.0, 0.0); METRIC_COUNT];
    for (slot, b) in out.iter_mut().zip(cfg.baselines.iter()) {
        *slot = (-b.def_mean / 2.0, b.off_std);
    }
    out
}

fn side_values(
    rng: &mut StdRng,
    scale: &[(f64, f64); METRIC_COUNT],
    edge: f64,
    drop_rate: f64,
) -> MetricValues {
    let mut v = MetricValues::default();
    for m in Metric::ALL {
        if rng.gen_range(0.0..1.0) < drop_rate {
            continue;
        }
        let (mean, std) = scale[m.index()];
        v.set(m, Some(mean + std * (0.08 * edge + 0.6 * normal(rng))));
    }
    v
}

fn average(values: &[MetricValues]) -> MetricValues {
    let mut out = MetricValues::default();
    for m in Metric::ALL {
        let present: Vec<f64> = values.iter().filter_map(|v| v.get(m)).collect();
        if !present.is_empty() {
            out.set(m, Some(present.iter().sum::<f64>() / present.len() as f64));
        }
    }
    out
}

/// A full season for `teams` teams over `weeks` weeks: schedule, external stats, season
/// aggregates, team metadata, weekly ratings and market lines from several books.
pub fn synthetic_snapshot(season: i32, teams: usize, weeks: u32, seed: u64) -> StatsSnapshot {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut snapshot = StatsSnapshot::new(season);
    let scale = metric_scale();

    let strength: Vec<f64> = (0..teams).map(|_| 8.0 * normal(&mut rng)).collect();
    let p5_cutoff = teams * 3 / 5;
    for (i, s) in strength.iter().enumerate() {
        let tier = if i < p5_cutoff { TeamTier::P5 } else { TeamTier::G5 };
        snapshot.teams.insert(
            normalize_team(&team_name(i)),
            TeamInfo {
                tier,
                talent: Some(650.0 + 20.0 * s + 30.0 * normal(&mut rng)),
                returning_production: Some(rng.gen_range(0.3..0.9)),
            },
        );
    }

    let opener = NaiveDate::from_ymd_opt(season, 8, 31).unwrap_or_default();
    let books = ["book_a", "book_b", "book_c", "book_d"];
    let mut per_team: HashMap<usize, (Vec<MetricValues>, Vec<MetricValues>)> = HashMap::new();
    let mut game_id = season.unsigned_abs() as u64 * 10_000;
    let mut order: Vec<usize> = (0..teams).collect();

    for week in 1..=weeks {
        for (i, s) in strength.iter().enumerate() {
            let drift = 0.1 * f64::from(week);
            snapshot.push_rating(
                &team_name(i),
                week,
                TeamRating {
                    primary: s + drift + normal(&mut rng),
                    secondary: Some(0.5 * s + 0.8 * normal(&mut rng)),
                },
            );
        }

        order.shuffle(&mut rng);
        let game_date = opener
            .checked_add_days(Days::new(7 * u64::from(week - 1)))
            .unwrap_or(opener);
        for pair in order.chunks_exact(2) {
            let (h, a) = (pair[0], pair[1]);
            game_id += 1;
            let neutral_site = rng.gen_range(0.0..1.0) < 0.05;
            let hfa = if neutral_site { 0.0 } else { 2.5 };
            let expected = strength[h] - strength[a] + hfa;
            let home_tier = if h < p5_cutoff { TeamTier::P5 } else { TeamTier::G5 };
            let away_tier = if a < p5_cutoff { TeamTier::P5 } else { TeamTier::G5 };

            snapshot.schedule.push(ScheduledGame {
                game_id,
                season,
                week,
                game_date,
                home_team: team_name(h),
                away_team: team_name(a),
                neutral_site,
                conference_game: home_tier == away_tier,
                completed: true,
            });

            let edge = expected + 3.0 * normal(&mut rng);
            let home = SideStats {
                offense: side_values(&mut rng, &scale, edge, 0.03),
                defense: side_values(&mut rng, &scale, -edge, 0.03),
            };
            let away = SideStats {
                offense: home.defense,
                defense: home.offense,
            };
            let e = per_team.entry(h).or_default();
            e.0.push(home.offense);
            e.1.push(home.defense);
            let e = per_team.entry(a).or_default();
            e.0.push(away.offense);
            e.1.push(away.defense);
            snapshot.external.insert(
                ExternalGameKey::new(season, week, &team_name(h), &team_name(a)),
                ExternalGameStats { home, away },
            );

            let quoting = if rng.gen_range(0.0..1.0) < 0.15 { 2 } else { books.len() };
            let mut lines = Vec::new();
            for book in &books[..quoting] {
                for days_before in [3u64, 1] {
                    let quote = -expected + 0.75 * normal(&mut rng);
                    let at = game_date
                        .checked_sub_days(Days::new(days_before))
                        .unwrap_or(game_date)
                        .and_hms_opt(12, 0, 0)
                        .unwrap_or_default();
                    lines.push(MarketLine {
                        game_id,
                        source: "synthetic".into(),
                        book: (*book).to_string(),
                        observed_at: at,
                        home_spread: (quote * 2.0).round() / 2.0,
                        total: Some(52.5),
                    });
                }
            }
            snapshot.market_lines.insert(game_id, lines);
        }
    }

    for (i, (off, def)) in per_team {
        snapshot.season_aggregates.insert(
            normalize_team(&team_name(i)),
            SideStats {
                offense: average(&off),
                defense: average(&def),
            },
        );
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeekRange;
    use crate::stats_loader::load_team_games;

    #[test]
    fn same_seed_same_rows() {
        let a = synthetic_calibration_rows(30, 11, 2.0);
        let b = synthetic_calibration_rows(30, 11, 2.0);
        assert_eq!(a, b);
        assert!(a.iter().all(|r| (1..=14).contains(&r.week)));
    }

    #[test]
    fn snapshot_loads_two_records_per_game() {
        let snap = synthetic_snapshot(2024, 10, 4, 3);
        assert_eq!(snap.schedule.len(), 20);
        let report = load_team_games(&snap, WeekRange::new(1, 4)).unwrap();
        assert_eq!(report.records.len(), 40);
        assert!(report.unmatched_games.is_empty());
        assert!(snap.rating_before("team 03", 2).is_some());
    }
}
