use crate::records::{METRIC_COUNT, Metric, TeamGameRecord, finite_opt};

/// Opponent-adjusted nets for one metric of one team-game.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdjustedNets {
    pub off_adj: Option<f64>,
    pub def_adj: Option<f64>,
    pub edge: Option<f64>,
}

/// `off_adj = team_off - opp_def`, `def_adj = -(team_def + opp_off)`, `edge = off_adj - def_adj`.
/// Any missing operand makes the dependent outputs `None`.
pub fn adjust_metric(
    team_off: Option<f64>,
    team_def: Option<f64>,
    opp_off: Option<f64>,
    opp_def: Option<f64>,
) -> AdjustedNets {
    let off_adj = match (team_off, opp_def) {
        (Some(o), Some(d)) => finite_opt(Some(o - d)),
        _ => None,
    };
    let def_adj = match (team_def, opp_off) {
        (Some(d), Some(o)) => finite_opt(Some(-(d + o))),
        _ => None,
    };
    let edge = match (off_adj, def_adj) {
        (Some(o), Some(d)) => finite_opt(Some(o - d)),
        _ => None,
    };
    AdjustedNets {
        off_adj,
        def_adj,
        edge,
    }
}

pub fn adjust_record(record: &TeamGameRecord) -> [AdjustedNets; METRIC_COUNT] {
    let mut out = [AdjustedNets::default(); METRIC_COUNT];
    for m in Metric::ALL {
        out[m.index()] = adjust_metric(
            record.offense.get(m),
            record.defense.get(m),
            record.opp_offense.get(m),
            record.opp_defense.get(m),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn arithmetic_matches_definitions() {
        let nets = adjust_metric(Some(0.25), Some(0.10), Some(0.05), Some(0.15));
        assert_relative_eq!(nets.off_adj.unwrap(), 0.10, epsilon = 1e-12);
        assert_relative_eq!(nets.def_adj.unwrap(), -0.15, epsilon = 1e-12);
        assert_relative_eq!(nets.edge.unwrap(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn null_operand_propagates_to_dependents_only() {
        let nets = adjust_metric(Some(0.25), None, Some(0.05), Some(0.15));
        assert!(nets.off_adj.is_some());
        assert_eq!(nets.def_adj, None);
        assert_eq!(nets.edge, None);

        let nets = adjust_metric(None, Some(0.1), Some(0.05), None);
        assert_eq!(nets.off_adj, None);
        assert!(nets.def_adj.is_some());
        assert_eq!(nets.edge, None);
    }

    #[test]
    fn overflow_becomes_none() {
        let nets = adjust_metric(Some(f64::MAX), Some(0.0), Some(0.0), Some(-f64::MAX));
        assert_eq!(nets.off_adj, None);
        assert_eq!(nets.edge, None);
    }
}
