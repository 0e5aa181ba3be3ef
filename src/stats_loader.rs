use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WeekRange;
use crate::error::{ModelError, ModelResult};
use crate::predictor::TeamRating;
use crate::records::{MatchupTier, MetricValues, TeamGameRecord, TeamTier};

/// Lowercase ASCII alphanumerics separated by single underscores; `&` becomes `and`.
pub fn normalize_team(input: &str) -> String {
    let lower = input.trim().to_ascii_lowercase().replace('&', " and ");
    let mut out = String::with_capacity(lower.len());
    let mut prev_us = false;
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_us = false;
        } else if !prev_us && !out.is_empty() {
            out.push('_');
            prev_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledGame {
    pub game_id: u64,
    pub season: i32,
    pub week: u32,
    pub game_date: NaiveDate,
    pub home_team: String,
    pub away_team: String,
    pub neutral_site: bool,
    pub conference_game: bool,
    pub completed: bool,
}

/// Join key between the internal schedule and the external stats source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalGameKey {
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
}

impl ExternalGameKey {
    pub fn new(season: i32, week: u32, home_team: &str, away_team: &str) -> Self {
        Self {
            season,
            week,
            home_team: normalize_team(home_team),
            away_team: normalize_team(away_team),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    pub offense: MetricValues,
    pub defense: MetricValues,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalGameStats {
    pub home: SideStats,
    pub away: SideStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub tier: TeamTier,
    pub talent: Option<f64>,
    pub returning_production: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLine {
    pub game_id: u64,
    pub source: String,
    pub book: String,
    pub observed_at: NaiveDateTime,
    /// Quoted spread for the home side (negative when the home team is favoured).
    pub home_spread: f64,
    pub total: Option<f64>,
}

/// Everything the pipeline reads for one season, bulk-loaded once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub season: i32,
    pub schedule: Vec<ScheduledGame>,
    pub external: HashMap<ExternalGameKey, ExternalGameStats>,
    /// Keyed by normalized team name.
    pub season_aggregates: HashMap<String, SideStats>,
    pub teams: HashMap<String, TeamInfo>,
    /// Per normalized team, `(week, rating)` pairs sorted by week.
    pub ratings: HashMap<String, Vec<(u32, TeamRating)>>,
    pub market_lines: HashMap<u64, Vec<MarketLine>>,
}

impl StatsSnapshot {
    pub fn new(season: i32) -> Self {
        Self {
            season,
            ..Self::default()
        }
    }

    pub fn team_info(&self, team: &str) -> Option<&TeamInfo> {
        self.teams.get(&normalize_team(team))
    }

    pub fn season_aggregate(&self, team: &str) -> Option<&SideStats> {
        self.season_aggregates.get(&normalize_team(team))
    }

    /// Latest rating published at or before `week`.
    pub fn rating_before(&self, team: &str, week: u32) -> Option<TeamRating> {
        self.ratings
            .get(&normalize_team(team))?
            .iter()
            .rev()
            .find(|(w, _)| *w <= week)
            .map(|(_, r)| *r)
    }

    pub fn push_rating(&mut self, team: &str, week: u32, rating: TeamRating) {
        let list = self.ratings.entry(normalize_team(team)).or_default();
        list.retain(|(w, _)| *w != week);
        list.push((week, rating));
        list.sort_by_key(|(w, _)| *w);
    }

    pub fn lines_for(&self, game_id: u64) -> &[MarketLine] {
        self.market_lines.get(&game_id).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub records: Vec<TeamGameRecord>,
    /// Completed games with no external equivalent.
    pub unmatched_games: Vec<u64>,
    /// Completed games outside the closed tier set or with unknown teams.
    pub skipped_games: Vec<u64>,
}

fn side_record(
    game: &ScheduledGame,
    is_home: bool,
    own_game: &SideStats,
    own_info: &TeamInfo,
    opp_info: &TeamInfo,
    own_season: Option<&SideStats>,
    opp_season: Option<&SideStats>,
) -> ModelResult<TeamGameRecord> {
    let (team, opponent) = if is_home {
        (&game.home_team, &game.away_team)
    } else {
        (&game.away_team, &game.home_team)
    };
    let empty = SideStats::default();
    let own_season = own_season.unwrap_or(&empty);
    let opp_season = opp_season.unwrap_or(&empty);

    let offense = own_game.offense.or_fallback(&own_season.offense);
    let defense = own_game.defense.or_fallback(&own_season.defense);
    if offense.is_empty() && defense.is_empty() {
        return Err(ModelError::MissingTeamStats {
            team: team.clone(),
            season: game.season,
            game_id: game.game_id,
        });
    }

    Ok(TeamGameRecord {
        game_id: game.game_id,
        season: game.season,
        week: game.week,
        game_date: game.game_date,
        team: team.clone(),
        opponent: opponent.clone(),
        is_home,
        neutral_site: game.neutral_site,
        conference_game: game.conference_game,
        team_tier: own_info.tier,
        opponent_tier: opp_info.tier,
        offense,
        defense,
        opp_offense: opp_season.offense,
        opp_defense: opp_season.defense,
        talent: own_info.talent,
        returning_production: own_info.returning_production,
    })
}

/// One record per team per completed game in `weeks`. Game-level values win; the
/// team's season aggregate fills gaps; anything still missing stays `None`.
pub fn load_team_games(snapshot: &StatsSnapshot, weeks: WeekRange) -> ModelResult<LoadReport> {
    let mut report = LoadReport::default();
    let mut games: Vec<&ScheduledGame> = snapshot
        .schedule
        .iter()
        .filter(|g| g.completed && g.season == snapshot.season && weeks.contains(g.week))
        .collect();
    games.sort_by(|a, b| {
        (a.game_date, a.week, a.game_id).cmp(&(b.game_date, b.week, b.game_id))
    });

    for game in games {
        let key = ExternalGameKey::new(game.season, game.week, &game.home_team, &game.away_team);
        let Some(ext) = snapshot.external.get(&key) else {
            debug!(game_id = game.game_id, ?key, "no external match for game");
            report.unmatched_games.push(game.game_id);
            continue;
        };
        let (Some(home_info), Some(away_info)) = (
            snapshot.team_info(&game.home_team),
            snapshot.team_info(&game.away_team),
        ) else {
            warn!(game_id = game.game_id, "team metadata missing; skipping game");
            report.skipped_games.push(game.game_id);
            continue;
        };
        if MatchupTier::from_tiers(home_info.tier, away_info.tier).is_none() {
            report.skipped_games.push(game.game_id);
            continue;
        }

        let home_season = snapshot.season_aggregate(&game.home_team);
        let away_season = snapshot.season_aggregate(&game.away_team);
        report.records.push(side_record(
            game, true, &ext.home, home_info, away_info, home_season, away_season,
        )?);
        report.records.push(side_record(
            game, false, &ext.away, away_info, home_info, away_season, home_season,
        )?);
    }

    info!(
        season = snapshot.season,
        weeks = %weeks,
        records = report.records.len(),
        unmatched = report.unmatched_games.len(),
        skipped = report.skipped_games.len(),
        "loaded team-game records"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Metric;

    fn values(pairs: &[(Metric, f64)]) -> MetricValues {
        let mut v = MetricValues::default();
        for (m, x) in pairs {
            v.set(*m, Some(*x));
        }
        v
    }

    fn snapshot() -> StatsSnapshot {
        let mut s = StatsSnapshot::new(2024);
        let date = NaiveDate::from_ymd_opt(2024, 9, 7).unwrap();
        for (id, home, away, week) in [(1, "Texas A&M", "Rice", 2), (2, "Ohio State", "Akron", 2)] {
            s.schedule.push(ScheduledGame {
                game_id: id,
                season: 2024,
                week,
                game_date: date,
                home_team: home.into(),
                away_team: away.into(),
                neutral_site: false,
                conference_game: false,
                completed: true,
            });
        }
        for (team, tier) in [
            ("Texas A&M", TeamTier::P5),
            ("Rice", TeamTier::G5),
            ("Ohio State", TeamTier::P5),
            ("Akron", TeamTier::G5),
        ] {
            s.teams.insert(
                normalize_team(team),
                TeamInfo {
                    tier,
                    talent: Some(700.0),
                    returning_production: None,
                },
            );
        }
        s.external.insert(
            ExternalGameKey::new(2024, 2, "texas a & m", "RICE"),
            ExternalGameStats {
                home: SideStats {
                    offense: values(&[(Metric::EpaPerPlay, 0.3)]),
                    defense: values(&[(Metric::EpaPerPlay, 0.05)]),
                },
                away: SideStats {
                    offense: values(&[(Metric::EpaPerPlay, 0.05)]),
                    defense: MetricValues::default(),
                },
            },
        );
        s.season_aggregates.insert(
            normalize_team("Rice"),
            SideStats {
                offense: values(&[(Metric::EpaPerPlay, 0.0), (Metric::SuccessRate, 0.38)]),
                defense: values(&[(Metric::EpaPerPlay, 0.12), (Metric::SuccessRate, 0.45)]),
            },
        );
        s
    }

    #[test]
    fn normalize_team_is_punctuation_insensitive() {
        assert_eq!(normalize_team("Texas A&M"), "texas_a_and_m");
        assert_eq!(normalize_team(" texas a & m "), "texas_a_and_m");
        assert_eq!(normalize_team("Miami (FL)"), "miami_fl");
    }

    #[test]
    fn unmatched_games_are_counted_not_errors() {
        let report = load_team_games(&snapshot(), WeekRange::new(1, 15)).unwrap();
        assert_eq!(report.unmatched_games, vec![2]);
        assert_eq!(report.records.len(), 2);
    }

    #[test]
    fn game_values_win_and_season_fills_gaps() {
        let report = load_team_games(&snapshot(), WeekRange::new(1, 15)).unwrap();
        let rice = report.records.iter().find(|r| r.team == "Rice").unwrap();
        assert_eq!(rice.offense.get(Metric::EpaPerPlay), Some(0.05));
        assert_eq!(rice.offense.get(Metric::SuccessRate), Some(0.38));
        assert_eq!(rice.defense.get(Metric::EpaPerPlay), Some(0.12));
        assert_eq!(rice.offense.get(Metric::Explosiveness), None);
        // Opponent complement comes from the opponent's season aggregate.
        let home = report.records.iter().find(|r| r.is_home).unwrap();
        assert_eq!(home.opp_defense.get(Metric::EpaPerPlay), Some(0.12));
        assert_eq!(home.team_tier, TeamTier::P5);
        assert_eq!(home.opponent_tier, TeamTier::G5);
    }

    #[test]
    fn team_without_any_stats_is_an_error() {
        let mut s = snapshot();
        s.external
            .values_mut()
            .for_each(|e| e.away = SideStats::default());
        s.season_aggregates.clear();
        let err = load_team_games(&s, WeekRange::new(1, 15)).unwrap_err();
        assert!(matches!(err, ModelError::MissingTeamStats { .. }));
    }

    #[test]
    fn rating_before_uses_latest_published_week() {
        let mut s = StatsSnapshot::new(2024);
        s.push_rating("A", 1, TeamRating { primary: 1.0, secondary: None });
        s.push_rating("A", 4, TeamRating { primary: 4.0, secondary: None });
        assert_eq!(s.rating_before("a", 3).unwrap().primary, 1.0);
        assert_eq!(s.rating_before("a", 9).unwrap().primary, 4.0);
        assert!(s.rating_before("a", 0).is_none());
    }
}
