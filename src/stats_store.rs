use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, Transaction, params};
use tracing::info;

use crate::cache::DerivedCache;
use crate::config::WeekRange;
use crate::persist;
use crate::predictor::TeamRating;
use crate::records::{EngineeredFeatureRow, Metric, MetricValues, TeamTier};
use crate::stats_loader::{
    ExternalGameKey, ExternalGameStats, MarketLine, ScheduledGame, SideStats, StatsSnapshot,
    TeamInfo, normalize_team,
};

const DATE_FMT: &str = "%Y-%m-%d";
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";
const SEASON_CACHE_TTL: Duration = Duration::from_secs(600);

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS schedule (
            game_id INTEGER PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            game_date TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            neutral_site INTEGER NOT NULL,
            conference_game INTEGER NOT NULL,
            completed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_season_week ON schedule(season, week);

        CREATE TABLE IF NOT EXISTS external_game_stats (
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            side TEXT NOT NULL,
            metric TEXT NOT NULL,
            offense REAL NULL,
            defense REAL NULL,
            PRIMARY KEY (season, week, home_team, away_team, side, metric)
        );

        CREATE TABLE IF NOT EXISTS season_aggregates (
            season INTEGER NOT NULL,
            team TEXT NOT NULL,
            metric TEXT NOT NULL,
            offense REAL NULL,
            defense REAL NULL,
            PRIMARY KEY (season, team, metric)
        );

        CREATE TABLE IF NOT EXISTS teams (
            season INTEGER NOT NULL,
            team TEXT NOT NULL,
            tier TEXT NOT NULL,
            talent REAL NULL,
            returning_production REAL NULL,
            PRIMARY KEY (season, team)
        );

        CREATE TABLE IF NOT EXISTS ratings (
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            team TEXT NOT NULL,
            primary_rating REAL NOT NULL,
            secondary_rating REAL NULL,
            PRIMARY KEY (season, week, team)
        );

        CREATE TABLE IF NOT EXISTS market_lines (
            game_id INTEGER NOT NULL,
            source TEXT NOT NULL,
            book TEXT NOT NULL,
            observed_at TEXT NOT NULL,
            home_spread REAL NOT NULL,
            total REAL NULL,
            PRIMARY KEY (game_id, source, book, observed_at)
        );

        CREATE TABLE IF NOT EXISTS engineered_features (
            game_id INTEGER NOT NULL,
            team TEXT NOT NULL,
            feature_version TEXT NOT NULL,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            row_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (game_id, team, feature_version)
        );
        CREATE INDEX IF NOT EXISTS idx_engineered_season ON engineered_features(season, feature_version);
        "#,
    )
    .context("init stats schema")?;
    persist::init_schema(conn)
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FMT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_datetime(raw: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FMT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn set_metric(values: &mut MetricValues, metric: &str, v: Option<f64>) {
    if let Some(m) = Metric::from_key(metric) {
        values.set(m, v);
    }
}

fn load_season_aggregates(conn: &Connection, season: i32) -> Result<HashMap<String, SideStats>> {
    let mut stmt = conn
        .prepare("SELECT team, metric, offense, defense FROM season_aggregates WHERE season = ?1")
        .context("prepare season aggregate query")?;
    let rows = stmt
        .query_map(params![season], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })
        .context("query season aggregates")?;
    let mut out: HashMap<String, SideStats> = HashMap::new();
    for row in rows {
        let (team, metric, off, def) = row.context("decode season aggregate row")?;
        let entry = out.entry(team).or_default();
        set_metric(&mut entry.offense, &metric, off);
        set_metric(&mut entry.defense, &metric, def);
    }
    Ok(out)
}

fn load_teams(conn: &Connection, season: i32) -> Result<HashMap<String, TeamInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT team, tier, talent, returning_production FROM teams WHERE season = ?1",
        )
        .context("prepare teams query")?;
    let rows = stmt
        .query_map(params![season], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })
        .context("query teams")?;
    let mut out = HashMap::new();
    for row in rows {
        let (team, tier, talent, returning_production) = row.context("decode team row")?;
        let tier: TeamTier = tier
            .parse()
            .map_err(|e: String| anyhow!("team {team}: {e}"))?;
        out.insert(
            team,
            TeamInfo {
                tier,
                talent,
                returning_production,
            },
        );
    }
    Ok(out)
}

/// SQLite-backed statistics and market store. Season aggregates and team metadata
/// are served from explicit caches that `write_snapshot` and `invalidate_season` reset.
pub struct SqliteStatsStore {
    conn: Connection,
    aggregates: DerivedCache<i32, HashMap<String, SideStats>>,
    teams: DerivedCache<i32, HashMap<String, TeamInfo>>,
}

impl SqliteStatsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn,
            aggregates: DerivedCache::new(Some(SEASON_CACHE_TTL)),
            teams: DerivedCache::new(Some(SEASON_CACHE_TTL)),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn invalidate_season(&mut self, season: i32) {
        self.aggregates.invalidate(&season);
        self.teams.invalidate(&season);
    }

    pub fn load_snapshot(&mut self, season: i32, weeks: WeekRange) -> Result<StatsSnapshot> {
        let mut snapshot = StatsSnapshot::new(season);
        let now = Instant::now();
        let conn = &self.conn;
        snapshot.season_aggregates = self
            .aggregates
            .get_or_compute(season, now, || load_season_aggregates(conn, season))?;
        snapshot.teams = self
            .teams
            .get_or_compute(season, now, || load_teams(conn, season))?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT game_id, season, week, game_date, home_team, away_team,
                       neutral_site, conference_game, completed
                FROM schedule
                WHERE season = ?1 AND week BETWEEN ?2 AND ?3
                ORDER BY game_date ASC, week ASC, game_id ASC
                "#,
            )
            .context("prepare schedule query")?;
        let rows = stmt
            .query_map(params![season, weeks.start, weeks.end], |row| {
                Ok(ScheduledGame {
                    game_id: row.get::<_, i64>(0)? as u64,
                    season: row.get(1)?,
                    week: row.get(2)?,
                    game_date: parse_date(&row.get::<_, String>(3)?)?,
                    home_team: row.get(4)?,
                    away_team: row.get(5)?,
                    neutral_site: row.get::<_, i64>(6)? != 0,
                    conference_game: row.get::<_, i64>(7)? != 0,
                    completed: row.get::<_, i64>(8)? != 0,
                })
            })
            .context("query schedule")?;
        for row in rows {
            snapshot.schedule.push(row.context("decode schedule row")?);
        }

        let mut stmt = conn
            .prepare(
                r#"
                SELECT week, home_team, away_team, side, metric, offense, defense
                FROM external_game_stats
                WHERE season = ?1 AND week BETWEEN ?2 AND ?3
                "#,
            )
            .context("prepare external stats query")?;
        let rows = stmt
            .query_map(params![season, weeks.start, weeks.end], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                ))
            })
            .context("query external stats")?;
        for row in rows {
            let (week, home, away, side, metric, off, def) = row.context("decode external row")?;
            let entry: &mut ExternalGameStats = snapshot
                .external
                .entry(ExternalGameKey::new(season, week, &home, &away))
                .or_default();
            let side = if side == "home" { &mut entry.home } else { &mut entry.away };
            set_metric(&mut side.offense, &metric, off);
            set_metric(&mut side.defense, &metric, def);
        }

        let mut stmt = conn
            .prepare(
                r#"
                SELECT week, team, primary_rating, secondary_rating
                FROM ratings
                WHERE season = ?1 AND week <= ?2
                ORDER BY week ASC
                "#,
            )
            .context("prepare ratings query")?;
        let rows = stmt
            .query_map(params![season, weeks.end], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    TeamRating {
                        primary: row.get(2)?,
                        secondary: row.get(3)?,
                    },
                ))
            })
            .context("query ratings")?;
        for row in rows {
            let (week, team, rating) = row.context("decode rating row")?;
            snapshot.push_rating(&team, week, rating);
        }

        let mut stmt = conn
            .prepare(
                r#"
                SELECT m.game_id, m.source, m.book, m.observed_at, m.home_spread, m.total
                FROM market_lines m
                JOIN schedule s ON s.game_id = m.game_id
                WHERE s.season = ?1 AND s.week BETWEEN ?2 AND ?3
                ORDER BY m.game_id ASC, m.observed_at ASC
                "#,
            )
            .context("prepare market query")?;
        let rows = stmt
            .query_map(params![season, weeks.start, weeks.end], |row| {
                Ok(MarketLine {
                    game_id: row.get::<_, i64>(0)? as u64,
                    source: row.get(1)?,
                    book: row.get(2)?,
                    observed_at: parse_datetime(&row.get::<_, String>(3)?)?,
                    home_spread: row.get(4)?,
                    total: row.get(5)?,
                })
            })
            .context("query market lines")?;
        for row in rows {
            let line = row.context("decode market row")?;
            snapshot.market_lines.entry(line.game_id).or_default().push(line);
        }

        info!(
            season,
            games = snapshot.schedule.len(),
            external = snapshot.external.len(),
            teams = snapshot.teams.len(),
            "loaded stats snapshot"
        );
        Ok(snapshot)
    }

    /// Writes every table of `snapshot` in one transaction, replacing existing keys.
    pub fn write_snapshot(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        let tx = self.conn.transaction().context("begin snapshot transaction")?;
        write_snapshot_tx(&tx, snapshot)?;
        tx.commit().context("commit snapshot transaction")?;
        self.aggregates.bump_generation();
        self.teams.bump_generation();
        Ok(())
    }

    /// Inserts rows not already stored for their (game, team, feature version).
    /// Existing rows are never rewritten. Returns the number of new rows.
    pub fn save_engineered_rows(&mut self, rows: &[EngineeredFeatureRow]) -> Result<usize> {
        let created_at = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().context("begin feature transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR IGNORE INTO engineered_features
                        (game_id, team, feature_version, season, week, row_json, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .context("prepare feature insert")?;
            for row in rows {
                let json = serde_json::to_string(row).context("serialize engineered row")?;
                inserted += stmt
                    .execute(params![
                        row.game_id as i64,
                        row.team,
                        row.feature_version,
                        row.season,
                        row.week,
                        json,
                        created_at,
                    ])
                    .with_context(|| format!("insert features for game {}", row.game_id))?;
            }
        }
        tx.commit().context("commit feature transaction")?;
        Ok(inserted)
    }

    pub fn load_engineered_rows(
        &self,
        season: i32,
        feature_version: &str,
    ) -> Result<Vec<EngineeredFeatureRow>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT row_json FROM engineered_features
                WHERE season = ?1 AND feature_version = ?2
                ORDER BY week ASC, game_id ASC, team ASC
                "#,
            )
            .context("prepare feature query")?;
        let rows = stmt
            .query_map(params![season, feature_version], |row| row.get::<_, String>(0))
            .context("query engineered features")?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.context("decode feature row")?;
            out.push(serde_json::from_str(&json).context("parse engineered row")?);
        }
        Ok(out)
    }
}

fn write_snapshot_tx(tx: &Transaction<'_>, s: &StatsSnapshot) -> Result<()> {
    for g in &s.schedule {
        tx.execute(
            r#"
            INSERT OR REPLACE INTO schedule
                (game_id, season, week, game_date, home_team, away_team,
                 neutral_site, conference_game, completed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                g.game_id as i64,
                g.season,
                g.week,
                g.game_date.format(DATE_FMT).to_string(),
                g.home_team,
                g.away_team,
                g.neutral_site as i64,
                g.conference_game as i64,
                g.completed as i64,
            ],
        )
        .with_context(|| format!("insert game {}", g.game_id))?;
    }

    for (key, stats) in &s.external {
        for (side, side_stats) in [("home", &stats.home), ("away", &stats.away)] {
            for m in Metric::ALL {
                let (off, def) = (side_stats.offense.get(m), side_stats.defense.get(m));
                if off.is_none() && def.is_none() {
                    continue;
                }
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO external_game_stats
                        (season, week, home_team, away_team, side, metric, offense, defense)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![key.season, key.week, key.home_team, key.away_team, side, m.key(), off, def],
                )
                .context("insert external stats")?;
            }
        }
    }

    for (team, stats) in &s.season_aggregates {
        for m in Metric::ALL {
            let (off, def) = (stats.offense.get(m), stats.defense.get(m));
            if off.is_none() && def.is_none() {
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO season_aggregates (season, team, metric, offense, defense)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![s.season, normalize_team(team), m.key(), off, def],
            )
            .context("insert season aggregate")?;
        }
    }

    for (team, info) in &s.teams {
        tx.execute(
            "INSERT OR REPLACE INTO teams (season, team, tier, talent, returning_production)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![s.season, normalize_team(team), info.tier.key(), info.talent, info.returning_production],
        )
        .context("insert team")?;
    }

    for (team, list) in &s.ratings {
        for (week, r) in list {
            tx.execute(
                "INSERT OR REPLACE INTO ratings (season, week, team, primary_rating, secondary_rating)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![s.season, week, team, r.primary, r.secondary],
            )
            .context("insert rating")?;
        }
    }

    for lines in s.market_lines.values() {
        for l in lines {
            tx.execute(
                "INSERT OR REPLACE INTO market_lines (game_id, source, book, observed_at, home_spread, total)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    l.game_id as i64,
                    l.source,
                    l.book,
                    l.observed_at.format(DATETIME_FMT).to_string(),
                    l.home_spread,
                    l.total
                ],
            )
            .context("insert market line")?;
        }
    }
    Ok(())
}
