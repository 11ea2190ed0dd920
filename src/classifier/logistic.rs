use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix::Matrix;

/// L2-regularised logistic regression fitted by Newton's method (IRLS).
///
/// Minimises `sum_i w_i * log_loss_i + ||coef||^2 / (2C)`; the intercept is
/// not penalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    c: f64,
    max_iter: usize,
    tol: f64,
    coefficients: Vec<f64>,
    intercept: f64,
}

impl LogisticRegression {
    pub fn new(c: f64, max_iter: usize) -> Self {
        Self {
            c,
            max_iter,
            tol: 1e-6,
            coefficients: Vec::new(),
            intercept: 0.0,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn fit(&mut self, x: &Matrix, y: &[usize], class_weights: [f64; 2]) -> Result<()> {
        if self.c <= 0.0 {
            return Err(Error::fit(format!("C must be positive, got {}", self.c)));
        }
        let (n_samples, n_features) = x.shape();
        if n_samples == 0 {
            return Err(Error::fit("cannot fit with zero samples"));
        }

        // index 0 is the intercept
        let dim = n_features + 1;
        let mut beta = vec![0.0; dim];
        let penalty = 1.0 / self.c;

        for _ in 0..self.max_iter.max(1) {
            let mut gradient = vec![0.0; dim];
            let mut hessian = vec![0.0; dim * dim];

            for (row, &label) in x.rows().zip(y) {
                let z = beta[0] + dot(&beta[1..], row);
                let p = sigmoid(z);
                let weight = class_weights[label];
                let residual = weight * (p - label as f64);
                let curvature = weight * p * (1.0 - p);

                gradient[0] += residual;
                for (g, &v) in gradient[1..].iter_mut().zip(row) {
                    *g += residual * v;
                }
                for a in 0..dim {
                    let xa = if a == 0 { 1.0 } else { row[a - 1] };
                    for b in a..dim {
                        let xb = if b == 0 { 1.0 } else { row[b - 1] };
                        hessian[a * dim + b] += curvature * xa * xb;
                    }
                }
            }

            for a in 0..dim {
                for b in 0..a {
                    hessian[a * dim + b] = hessian[b * dim + a];
                }
            }
            for j in 1..dim {
                gradient[j] += penalty * beta[j];
                hessian[j * dim + j] += penalty;
            }
            hessian[0] += 1e-10;

            let step = solve(hessian, gradient, dim)?;

            // halve the Newton step until the objective stops increasing
            let current = objective(&beta, x, y, class_weights, penalty);
            let mut scale = 1.0;
            let mut candidate: Vec<f64>;
            loop {
                candidate = beta.iter().zip(&step).map(|(b, s)| b - scale * s).collect();
                let value = objective(&candidate, x, y, class_weights, penalty);
                if value <= current + 1e-12 || scale < 1e-8 {
                    break;
                }
                scale /= 2.0;
            }

            let largest = step.iter().fold(0.0f64, |m, s| m.max((scale * s).abs()));
            beta = candidate;
            if beta.iter().any(|b| !b.is_finite()) {
                return Err(Error::fit("logistic regression diverged"));
            }
            if largest < self.tol {
                break;
            }
        }

        self.intercept = beta[0];
        self.coefficients = beta[1..].to_vec();
        Ok(())
    }

    /// Probability of label 1.
    pub fn positive_probability(&self, row: &[f64]) -> f64 {
        sigmoid(self.intercept + dot(&self.coefficients, row))
    }
}

fn objective(beta: &[f64], x: &Matrix, y: &[usize], class_weights: [f64; 2], penalty: f64) -> f64 {
    let loss: f64 = x
        .rows()
        .zip(y)
        .map(|(row, &label)| {
            let z = beta[0] + dot(&beta[1..], row);
            class_weights[label] * (softplus(z) - label as f64 * z)
        })
        .sum();
    let norm: f64 = beta[1..].iter().map(|b| b * b).sum();
    loss + 0.5 * penalty * norm
}

/// `ln(1 + e^z)` without overflow.
fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Solves `a * x = b` by Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<f64>, mut b: Vec<f64>, n: usize) -> Result<Vec<f64>> {
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))
            .unwrap_or(col);
        if a[pivot * n + col].abs() < 1e-12 {
            return Err(Error::fit("singular Hessian in logistic regression"));
        }
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[row * n + col] / a[col * n + col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row * n + k] -= factor * a[col * n + k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row * n + k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row * n + row];
    }
    Ok(x)
}
