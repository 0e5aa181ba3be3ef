use spread_calibration::config::WeekRange;
use spread_calibration::features::build_engineered_rows;
use spread_calibration::recency::RecencyConfig;
use spread_calibration::records::{EngineeredFeatureRow, Metric, MetricValues, TeamGameRecord};
use spread_calibration::stats_loader::load_team_games;
use spread_calibration::stats_store::SqliteStatsStore;
use spread_calibration::synthetic::synthetic_snapshot;

#[test]
fn later_games_never_change_earlier_features() {
    let snapshot = synthetic_snapshot(2024, 12, 8, 21);
    let records = load_team_games(&snapshot, WeekRange::new(1, 8))
        .unwrap()
        .records;
    let cfg = RecencyConfig::default();
    let before = build_engineered_rows(&records, &cfg, "fe_test").unwrap();

    let team = records[0].team.clone();
    let mut poisoned = records.clone();
    poison(&mut poisoned, std::slice::from_ref(&team), 5);
    let after = build_engineered_rows(&poisoned, &cfg, "fe_test").unwrap();
    assert_eq!(before.len(), after.len());

    let mut checked = 0;
    for (a, b) in before.iter().zip(&after) {
        assert_eq!((a.game_id, &a.team), (b.game_id, &b.team));
        if a.team != team {
            assert_eq!(a, b, "other teams are untouched");
            continue;
        }
        for m in Metric::ALL {
            let (fa, fb) = (a.metric(m), b.metric(m));
            if a.week <= 5 {
                // A game's window only looks at strictly earlier games.
                assert_eq!(fa.off_ewma_3g, fb.off_ewma_3g);
                assert_eq!(fa.def_ewma_5g, fb.def_ewma_5g);
                assert_eq!(fa.edge_ewma_3g, fb.edge_ewma_3g);
            }
            if a.week < 5 {
                assert_eq!(fa, fb);
            }
        }
        checked += 1;
    }
    assert_eq!(checked, 8);

    let week5 = after.iter().find(|r| r.team == team && r.week == 5).unwrap();
    assert_ne!(
        week5.metric(Metric::EpaPerPlay).off_adj,
        before
            .iter()
            .find(|r| r.team == team && r.week == 5)
            .unwrap()
            .metric(Metric::EpaPerPlay)
            .off_adj
    );
}

fn poison(records: &mut [TeamGameRecord], teams: &[String], from_week: u32) {
    let mut huge = MetricValues::default();
    for m in Metric::ALL {
        huge.set(m, Some(1_000.0));
    }
    for r in records
        .iter_mut()
        .filter(|r| r.week >= from_week && teams.contains(&r.team))
    {
        r.offense = huge;
        r.defense = huge;
    }
}

fn stored_rows(records: &[TeamGameRecord]) -> Vec<EngineeredFeatureRow> {
    let rows = build_engineered_rows(records, &RecencyConfig::default(), "fe_test").unwrap();
    let mut store = SqliteStatsStore::open_in_memory().unwrap();
    assert_eq!(store.save_engineered_rows(&rows).unwrap(), rows.len());
    store.load_engineered_rows(2024, "fe_test").unwrap()
}

#[test]
fn stored_rows_before_a_change_are_untouched() {
    let snapshot = synthetic_snapshot(2024, 48, 12, 9);
    let records = load_team_games(&snapshot, WeekRange::new(1, 12))
        .unwrap()
        .records;
    let before = stored_rows(&records);

    let mut teams: Vec<String> = records.iter().map(|r| r.team.clone()).collect();
    teams.sort();
    teams.dedup();
    teams.truncate(20);
    let mut poisoned = records.clone();
    poison(&mut poisoned, &teams, 9);
    let after = stored_rows(&poisoned);
    assert_eq!(before.len(), after.len());

    let mut earlier = 0;
    let mut later_changed = 0;
    for (a, b) in before.iter().zip(&after) {
        assert_eq!((a.game_id, &a.team), (b.game_id, &b.team));
        if a.week < 9 {
            assert_eq!(a, b, "week {} row for {} changed", a.week, a.team);
            earlier += 1;
        } else if a != b {
            later_changed += 1;
        }
    }
    assert!(earlier > 0);
    assert!(later_changed > 0);
}

#[test]
fn first_game_is_flagged_low_sample_and_has_no_rest() {
    let snapshot = synthetic_snapshot(2024, 8, 6, 5);
    let records = load_team_games(&snapshot, WeekRange::new(1, 6))
        .unwrap()
        .records;
    let rows = build_engineered_rows(&records, &RecencyConfig::default(), "fe_test").unwrap();
    for row in rows.iter().filter(|r| r.week == 1) {
        assert_eq!(row.prior_games, 0);
        assert!(row.low_sample_3g && row.low_sample_5g);
        assert_eq!(row.rest_days, None);
        assert!(!row.bye_week);
    }
    for row in rows.iter().filter(|r| r.week == 5) {
        assert_eq!(row.prior_games, 4);
        assert!(!row.low_sample_3g);
        assert!(row.low_sample_5g);
        assert_eq!(row.rest_days, Some(7.0));
        assert_eq!(row.rest_days_delta, Some(0.0));
    }
}
