use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{GridConfig, SelectorConfig, SolverConfig};
use crate::elastic_net::{ElasticNetParams, fit_elastic_net};
use crate::error::{ModelError, ModelResult};
use crate::feature_set::DesignMatrix;

pub fn rmse(pred: &[f64], actual: &[f64]) -> f64 {
    if pred.is_empty() {
        return f64::NAN;
    }
    let sse: f64 = pred.iter().zip(actual).map(|(p, a)| (p - a) * (p - a)).sum();
    (sse / pred.len() as f64).sqrt()
}

fn fit_and_predict(
    x: &DesignMatrix,
    train: &[usize],
    test: &[usize],
    params: ElasticNetParams,
    solver: &SolverConfig,
) -> ModelResult<Vec<f64>> {
    let tr = x.subset(train);
    let te = x.subset(test);
    let fit = fit_elastic_net(&tr.columns, &tr.target, &tr.weights, params, solver)?;
    Ok(fit.predict_columns(&te.columns))
}

/// Pooled out-of-fold RMSE with `fold = game_id mod k`.
pub fn kfold_rmse(
    x: &DesignMatrix,
    params: ElasticNetParams,
    k: usize,
    solver: &SolverConfig,
) -> ModelResult<f64> {
    if k < 2 {
        return Err(ModelError::InvalidConfig("k-fold needs k >= 2".into()));
    }
    let mut sse = 0.0;
    let mut count = 0usize;
    for fold in 0..k as u64 {
        let (test, train): (Vec<usize>, Vec<usize>) =
            (0..x.n_rows()).partition(|&i| x.game_ids[i] % k as u64 == fold);
        if test.is_empty() || train.is_empty() {
            continue;
        }
        let pred = fit_and_predict(x, &train, &test, params, solver)?;
        for (p, &i) in pred.iter().zip(&test) {
            sse += (p - x.target[i]).powi(2);
        }
        count += test.len();
    }
    if count == 0 {
        return Err(ModelError::InsufficientRows {
            needed: 2,
            got: x.n_rows(),
        });
    }
    Ok((sse / count as f64).sqrt())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekSplit {
    pub test_week: u32,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// One split per week after the first: train on strictly earlier weeks, test on the week.
/// Weeks with fewer than `min_train_rows` training rows are skipped.
pub fn week_splits(weeks: &[u32], min_train_rows: usize) -> Vec<WeekSplit> {
    let distinct: BTreeSet<u32> = weeks.iter().copied().collect();
    let mut out = Vec::new();
    for &week in distinct.iter().skip(1) {
        let train: Vec<usize> = (0..weeks.len()).filter(|&i| weeks[i] < week).collect();
        if train.len() < min_train_rows {
            debug!(week, train_rows = train.len(), "skipping walk-forward week");
            continue;
        }
        let test: Vec<usize> = (0..weeks.len()).filter(|&i| weeks[i] == week).collect();
        out.push(WeekSplit {
            test_week: week,
            train,
            test,
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekScore {
    pub week: u32,
    pub train_rows: usize,
    pub test_rows: usize,
    pub rmse: f64,
}

/// Out-of-sample walk-forward predictions, in evaluation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForward {
    /// Mean of per-week RMSE.
    pub rmse: f64,
    pub weeks: Vec<WeekScore>,
    pub predictions: Vec<f64>,
    pub actuals: Vec<f64>,
    pub game_ids: Vec<u64>,
}

pub fn walk_forward(
    x: &DesignMatrix,
    params: ElasticNetParams,
    min_train_rows: usize,
    solver: &SolverConfig,
) -> ModelResult<WalkForward> {
    let splits = week_splits(&x.weeks, min_train_rows);
    if splits.is_empty() {
        return Err(ModelError::NoWalkForwardWeeks { min_train_rows });
    }
    let mut out = WalkForward {
        rmse: 0.0,
        weeks: Vec::with_capacity(splits.len()),
        predictions: Vec::new(),
        actuals: Vec::new(),
        game_ids: Vec::new(),
    };
    for split in &splits {
        let pred = fit_and_predict(x, &split.train, &split.test, params, solver)?;
        let actual: Vec<f64> = split.test.iter().map(|&i| x.target[i]).collect();
        out.weeks.push(WeekScore {
            week: split.test_week,
            train_rows: split.train.len(),
            test_rows: split.test.len(),
            rmse: rmse(&pred, &actual),
        });
        out.game_ids.extend(split.test.iter().map(|&i| x.game_ids[i]));
        out.predictions.extend(pred);
        out.actuals.extend(actual);
    }
    out.rmse = out.weeks.iter().map(|w| w.rmse).sum::<f64>() / out.weeks.len() as f64;
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: ElasticNetParams,
    pub kfold_rmse: f64,
    /// `None` when the candidate did not survive screening.
    pub walk_forward_rmse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub best: ElasticNetParams,
    pub kfold_rmse: f64,
    pub walk_forward: WalkForward,
    pub candidates: Vec<CandidateScore>,
}

/// K-fold screens the grid, walk-forward decides among the survivors.
pub fn select_hyperparameters(
    x: &DesignMatrix,
    grid: &GridConfig,
    selector: &SelectorConfig,
    solver: &SolverConfig,
) -> ModelResult<Selection> {
    grid.validate()?;
    selector.validate()?;
    let grid_points = grid.candidates();

    let kfold: Vec<f64> = grid_points
        .par_iter()
        .map(|p| kfold_rmse(x, *p, selector.k_folds, solver))
        .collect::<ModelResult<Vec<f64>>>()?;

    let mut order: Vec<usize> = (0..grid_points.len()).collect();
    order.sort_by(|&a, &b| kfold[a].total_cmp(&kfold[b]).then(a.cmp(&b)));
    order.truncate(selector.screen_keep);

    let survivors: Vec<(usize, WalkForward)> = order
        .par_iter()
        .map(|&i| walk_forward(x, grid_points[i], selector.min_train_rows, solver).map(|wf| (i, wf)))
        .collect::<ModelResult<Vec<_>>>()?;

    let best_wf = survivors
        .iter()
        .map(|(_, wf)| wf.rmse)
        .fold(f64::INFINITY, f64::min);
    let mut winner: Option<&(usize, WalkForward)> = None;
    for cand in survivors
        .iter()
        .filter(|(_, wf)| wf.rmse <= best_wf + selector.tie_epsilon)
    {
        winner = match winner {
            Some(cur) if kfold[cur.0] < kfold[cand.0] => Some(cur),
            Some(cur) if kfold[cur.0] == kfold[cand.0] && cur.0 < cand.0 => Some(cur),
            _ => Some(cand),
        };
    }
    let Some((best_idx, best_walk)) = winner.cloned() else {
        return Err(ModelError::NoWalkForwardWeeks {
            min_train_rows: selector.min_train_rows,
        });
    };

    let candidates = grid_points
        .iter()
        .enumerate()
        .map(|(i, p)| CandidateScore {
            params: *p,
            kfold_rmse: kfold[i],
            walk_forward_rmse: survivors.iter().find(|(j, _)| *j == i).map(|(_, wf)| wf.rmse),
        })
        .collect();

    info!(
        alpha = grid_points[best_idx].alpha,
        l1_ratio = grid_points[best_idx].l1_ratio,
        walk_forward_rmse = best_walk.rmse,
        kfold_rmse = kfold[best_idx],
        "selected hyperparameters"
    );
    Ok(Selection {
        best: grid_points[best_idx],
        kfold_rmse: kfold[best_idx],
        walk_forward: best_walk,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_week_is_never_a_test_week() {
        let weeks = vec![1, 1, 2, 2, 3];
        let splits = week_splits(&weeks, 1);
        assert_eq!(splits.iter().map(|s| s.test_week).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(splits[0].train, vec![0, 1]);
        assert_eq!(splits[1].test, vec![4]);
    }

    #[test]
    fn weeks_with_thin_training_are_skipped() {
        let weeks = vec![1, 2, 2, 3, 3, 3];
        let splits = week_splits(&weeks, 3);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].test_week, 3);
    }

    #[test]
    fn rmse_of_perfect_predictions_is_zero() {
        assert_eq!(rmse(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert!(rmse(&[], &[]).is_nan());
    }
}
