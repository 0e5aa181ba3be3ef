use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SolverConfig;
use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElasticNetParams {
    pub alpha: f64,
    pub l1_ratio: f64,
}

impl ElasticNetParams {
    /// `alpha = 0` (plain weighted least squares) is accepted here; the search grid
    /// requires `alpha > 0`.
    pub fn validate(&self) -> ModelResult<()> {
        if !(self.alpha.is_finite() && self.alpha >= 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "alpha {} must be finite and >= 0",
                self.alpha
            )));
        }
        if !(self.l1_ratio.is_finite() && (0.0..=1.0).contains(&self.l1_ratio)) {
            return Err(ModelError::InvalidConfig(format!(
                "l1_ratio {} must be in [0, 1]",
                self.l1_ratio
            )));
        }
        Ok(())
    }

    fn l1_penalty(&self) -> f64 {
        self.alpha * self.l1_ratio
    }

    fn l2_penalty(&self) -> f64 {
        self.alpha * (1.0 - self.l1_ratio)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticNetFit {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Columns forced to zero because their centered diagonal vanished.
    pub zeroed: Vec<usize>,
}

impl ElasticNetFit {
    pub fn predict_row(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(b, v)| b * v)
                .sum::<f64>()
    }

    pub fn predict_columns(&self, columns: &[Vec<f64>]) -> Vec<f64> {
        let n = columns.first().map_or(0, Vec::len);
        (0..n)
            .map(|i| {
                self.intercept
                    + self
                        .coefficients
                        .iter()
                        .zip(columns)
                        .map(|(b, c)| b * c[i])
                        .sum::<f64>()
            })
            .collect()
    }
}

/// Weighted-centered normal equations.
#[derive(Debug, Clone)]
struct NormalEquations {
    gram: Vec<Vec<f64>>,
    xty: Vec<f64>,
    x_means: Vec<f64>,
    y_mean: f64,
}

impl NormalEquations {
    fn build(columns: &[Vec<f64>], y: &[f64], w: &[f64]) -> ModelResult<Self> {
        let n = y.len();
        if w.len() != n {
            return Err(ModelError::DimensionMismatch {
                context: "observation weights",
                expected: n,
                actual: w.len(),
            });
        }
        if let Some(col) = columns.iter().find(|c| c.len() != n) {
            return Err(ModelError::DimensionMismatch {
                context: "feature column",
                expected: n,
                actual: col.len(),
            });
        }
        let w_sum: f64 = w.iter().sum();
        if n == 0 || !(w_sum.is_finite() && w_sum > 0.0) || w.iter().any(|v| *v < 0.0) {
            return Err(ModelError::InsufficientRows { needed: 1, got: 0 });
        }

        let p = columns.len();
        let weighted_mean =
            |v: &[f64]| v.iter().zip(w).map(|(a, b)| a * b).sum::<f64>() / w_sum;
        let x_means: Vec<f64> = columns.iter().map(|c| weighted_mean(c)).collect();
        let y_mean = weighted_mean(y);

        let centered: Vec<Vec<f64>> = columns
            .iter()
            .zip(&x_means)
            .map(|(c, m)| c.iter().map(|v| v - m).collect())
            .collect();
        let yc: Vec<f64> = y.iter().map(|v| v - y_mean).collect();

        let mut gram = vec![vec![0.0; p]; p];
        let mut xty = vec![0.0; p];
        for j in 0..p {
            for k in j..p {
                let s: f64 = (0..n).map(|i| w[i] * centered[j][i] * centered[k][i]).sum();
                gram[j][k] = s;
                gram[k][j] = s;
            }
            xty[j] = (0..n).map(|i| w[i] * centered[j][i] * yc[i]).sum();
        }
        Ok(Self {
            gram,
            xty,
            x_means,
            y_mean,
        })
    }

    fn ridge(&self, lambda: f64) -> Option<Vec<f64>> {
        let p = self.xty.len();
        if p == 0 {
            return Some(Vec::new());
        }
        let a = Mat::from_fn(p, p, |i, j| {
            self.gram[i][j] + if i == j { lambda } else { 0.0 }
        });
        let llt = Llt::new(a.as_ref(), Side::Lower).ok()?;
        let rhs = Mat::from_fn(p, 1, |i, _| self.xty[i]);
        let sol = llt.solve(rhs.as_ref());
        let beta: Vec<f64> = (0..p).map(|i| sol[(i, 0)]).collect();
        beta.iter().all(|b| b.is_finite()).then_some(beta)
    }

    fn intercept(&self, beta: &[f64]) -> f64 {
        self.y_mean
            - self
                .x_means
                .iter()
                .zip(beta)
                .map(|(m, b)| m * b)
                .sum::<f64>()
    }
}

pub fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// Closed-form weighted ridge, `(XᵗWX + λI)β = XᵗWy` on centered data.
/// `None` when the system is not positive definite.
pub fn ridge_closed_form(
    columns: &[Vec<f64>],
    y: &[f64],
    w: &[f64],
    lambda: f64,
) -> ModelResult<Option<ElasticNetFit>> {
    let ne = NormalEquations::build(columns, y, w)?;
    Ok(ne.ridge(lambda).map(|beta| ElasticNetFit {
        intercept: ne.intercept(&beta),
        coefficients: beta,
        iterations: 0,
        converged: true,
        zeroed: Vec::new(),
    }))
}

/// Cyclic coordinate descent for
/// `Σ wᵢ(yᵢ − b − xᵢβ)² + α·l1·‖β‖₁ + α·(1−l1)·‖β‖₂²`.
pub fn fit_elastic_net(
    columns: &[Vec<f64>],
    y: &[f64],
    w: &[f64],
    params: ElasticNetParams,
    solver: &SolverConfig,
) -> ModelResult<ElasticNetFit> {
    params.validate()?;
    let ne = NormalEquations::build(columns, y, w)?;
    let p = columns.len();
    let (l1, l2) = (params.l1_penalty(), params.l2_penalty());

    let zeroed: Vec<usize> = (0..p)
        .filter(|&j| ne.gram[j][j] <= solver.zero_diagonal_eps)
        .collect();
    if !zeroed.is_empty() {
        warn!(?zeroed, "zero-variance columns forced to zero coefficient");
    }

    let mut beta = if params.l1_ratio < 1.0 && p > 0 {
        match ne.ridge(l2) {
            Some(b) => b,
            None => {
                warn!(alpha = params.alpha, l1_ratio = params.l1_ratio, "ridge warm start failed; starting from zero");
                vec![0.0; p]
            }
        }
    } else {
        vec![0.0; p]
    };
    for &j in &zeroed {
        beta[j] = 0.0;
    }

    let mut iterations = 0;
    let mut converged = p == 0;
    while !converged && iterations < solver.max_iter {
        iterations += 1;
        let mut max_delta: f64 = 0.0;
        for j in 0..p {
            let ajj = ne.gram[j][j];
            if ajj <= solver.zero_diagonal_eps {
                continue;
            }
            let cross: f64 = (0..p)
                .filter(|&k| k != j)
                .map(|k| ne.gram[j][k] * beta[k])
                .sum();
            let rho = ne.xty[j] - cross;
            let next = soft_threshold(rho, l1 / 2.0) / (ajj + l2);
            max_delta = max_delta.max((next - beta[j]).abs());
            beta[j] = next;
        }
        converged = max_delta < solver.tolerance;
    }
    if !converged {
        warn!(iterations, alpha = params.alpha, l1_ratio = params.l1_ratio, "coordinate descent hit max_iter");
    }

    // Weighted mean residual; equals ȳ − Σ x̄ⱼβⱼ on these normal equations.
    let intercept = ne.intercept(&beta);
    Ok(ElasticNetFit {
        coefficients: beta,
        intercept,
        iterations,
        converged,
        zeroed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy() -> (Vec<Vec<f64>>, Vec<f64>, Vec<f64>) {
        let x1 = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x2 = vec![2.0, 1.0, 4.0, 3.0, 6.0, 5.0];
        let y: Vec<f64> = x1.iter().zip(&x2).map(|(a, b)| 1.0 + 2.0 * a - 0.5 * b).collect();
        (vec![x1, x2], y, vec![1.0; 6])
    }

    #[test]
    fn soft_threshold_shrinks_toward_zero() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }

    #[test]
    fn exact_linear_data_is_recovered_without_penalty() {
        let (x, y, w) = toy();
        let fit = fit_elastic_net(
            &x,
            &y,
            &w,
            ElasticNetParams { alpha: 0.0, l1_ratio: 0.5 },
            &SolverConfig::default(),
        )
        .unwrap();
        assert!(fit.converged);
        assert_relative_eq!(fit.coefficients[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(fit.coefficients[1], -0.5, epsilon = 1e-6);
        assert_relative_eq!(fit.intercept, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn lasso_zeroes_weak_coefficient() {
        let (x, y, w) = toy();
        let fit = fit_elastic_net(
            &x,
            &y,
            &w,
            ElasticNetParams { alpha: 30.0, l1_ratio: 1.0 },
            &SolverConfig::default(),
        )
        .unwrap();
        assert_eq!(fit.coefficients[1], 0.0);
        assert!(fit.coefficients[0] > 0.0);
    }

    #[test]
    fn constant_column_gets_zero_coefficient() {
        let (mut x, y, w) = toy();
        x.push(vec![5.0; 6]);
        let fit = fit_elastic_net(
            &x,
            &y,
            &w,
            ElasticNetParams { alpha: 0.1, l1_ratio: 0.5 },
            &SolverConfig::default(),
        )
        .unwrap();
        assert_eq!(fit.zeroed, vec![2]);
        assert_eq!(fit.coefficients[2], 0.0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let (x, y, _) = toy();
        let err = fit_elastic_net(
            &x,
            &y,
            &[1.0; 3],
            ElasticNetParams { alpha: 1.0, l1_ratio: 0.5 },
            &SolverConfig::default(),
        );
        assert!(matches!(err, Err(ModelError::DimensionMismatch { .. })));
    }

    #[test]
    fn negative_alpha_is_invalid() {
        let (x, y, w) = toy();
        let err = fit_elastic_net(
            &x,
            &y,
            &w,
            ElasticNetParams { alpha: -1.0, l1_ratio: 0.5 },
            &SolverConfig::default(),
        );
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }
}
