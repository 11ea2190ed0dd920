//! Binary classifiers used by model selection.
//!
//! Every family fits with balanced class weights, `n / (2 * n_class)`, and
//! exposes per-class probabilities so callers can ask for a specific class
//! instead of relying on column positions.

mod forest;
mod logistic;
mod tree;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix::Matrix;

pub use forest::RandomForest;
pub use logistic::LogisticRegression;
pub use tree::DecisionTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    LogisticRegression,
    DecisionTree,
    RandomForest,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::LogisticRegression => "LogisticRegression",
            ModelFamily::DecisionTree => "DecisionTree",
            ModelFamily::RandomForest => "RandomForest",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point of a hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum ModelParams {
    LogisticRegression {
        c: f64,
        max_iter: usize,
    },
    DecisionTree {
        max_depth: usize,
        min_samples_leaf: usize,
        min_samples_split: usize,
        seed: u64,
    },
    RandomForest {
        n_estimators: usize,
        max_depth: usize,
        min_samples_leaf: usize,
        seed: u64,
    },
}

impl ModelParams {
    pub fn family(&self) -> ModelFamily {
        match self {
            ModelParams::LogisticRegression { .. } => ModelFamily::LogisticRegression,
            ModelParams::DecisionTree { .. } => ModelFamily::DecisionTree,
            ModelParams::RandomForest { .. } => ModelFamily::RandomForest,
        }
    }

    pub fn fit(&self, x: &Matrix, y: &[usize]) -> Result<Model> {
        if x.n_rows() != y.len() {
            return Err(Error::fit(format!(
                "{} rows but {} labels",
                x.n_rows(),
                y.len()
            )));
        }
        let weights = balanced_class_weights(y)?;

        let model = match *self {
            ModelParams::LogisticRegression { c, max_iter } => {
                let mut model = LogisticRegression::new(c, max_iter);
                model.fit(x, y, weights)?;
                Model::LogisticRegression(model)
            }
            ModelParams::DecisionTree {
                max_depth,
                min_samples_leaf,
                min_samples_split,
                seed,
            } => {
                let mut model = DecisionTree::new(max_depth, min_samples_leaf, min_samples_split, seed);
                model.fit(x, y, weights)?;
                Model::DecisionTree(model)
            }
            ModelParams::RandomForest {
                n_estimators,
                max_depth,
                min_samples_leaf,
                seed,
            } => {
                let mut model = RandomForest::new(n_estimators, max_depth, min_samples_leaf, seed);
                model.fit(x, y, weights)?;
                Model::RandomForest(model)
            }
        };
        Ok(model)
    }
}

/// A fitted classifier of any family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", content = "model")]
pub enum Model {
    LogisticRegression(LogisticRegression),
    DecisionTree(DecisionTree),
    RandomForest(RandomForest),
}

impl Model {
    pub fn family(&self) -> ModelFamily {
        match self {
            Model::LogisticRegression(_) => ModelFamily::LogisticRegression,
            Model::DecisionTree(_) => ModelFamily::DecisionTree,
            Model::RandomForest(_) => ModelFamily::RandomForest,
        }
    }

    /// `[P(label 0), P(label 1)]` for one row.
    pub fn predict_proba(&self, row: &[f64]) -> [f64; 2] {
        match self {
            Model::LogisticRegression(m) => {
                let p = m.positive_probability(row);
                [1.0 - p, p]
            }
            Model::DecisionTree(m) => m.predict_proba(row),
            Model::RandomForest(m) => m.predict_proba(row),
        }
    }

    /// The more probable label; an exact tie goes to label 0.
    pub fn predict(&self, row: &[f64]) -> usize {
        let [p0, p1] = self.predict_proba(row);
        usize::from(p1 > p0)
    }

    pub fn predict_all(&self, x: &Matrix) -> Vec<usize> {
        x.rows().map(|row| self.predict(row)).collect()
    }
}

/// `n / (2 * n_class)` per label.
pub fn balanced_class_weights(y: &[usize]) -> Result<[f64; 2]> {
    let mut counts = [0usize; 2];
    for &label in y {
        if label > 1 {
            return Err(Error::fit(format!("label {label} is not binary")));
        }
        counts[label] += 1;
    }
    if counts[0] == 0 || counts[1] == 0 {
        return Err(Error::fit("both classes must be present to fit"));
    }
    let n = y.len() as f64;
    Ok([
        n / (2.0 * counts[0] as f64),
        n / (2.0 * counts[1] as f64),
    ])
}
