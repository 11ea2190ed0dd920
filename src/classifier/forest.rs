use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classifier::DecisionTree;
use crate::error::{Error, Result};
use crate::matrix::Matrix;

/// Bagged decision trees with `sqrt(n_features)` candidates per split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    n_estimators: usize,
    max_depth: usize,
    min_samples_leaf: usize,
    seed: u64,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn new(n_estimators: usize, max_depth: usize, min_samples_leaf: usize, seed: u64) -> Self {
        Self {
            n_estimators,
            max_depth,
            min_samples_leaf,
            seed,
            trees: Vec::new(),
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn fit(&mut self, x: &Matrix, y: &[usize], class_weights: [f64; 2]) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(Error::fit("a forest needs at least one tree"));
        }
        let n = x.n_rows();
        if n == 0 {
            return Err(Error::fit("cannot fit with zero samples"));
        }
        let max_features = ((x.n_cols() as f64).sqrt().floor() as usize).max(1);

        // tree i depends only on seed + i, so the pool size never changes the result
        let trees = (0..self.n_estimators)
            .into_par_iter()
            .map(|i| {
                let tree_seed = self.seed.wrapping_add(i as u64);
                let mut rng = StdRng::seed_from_u64(tree_seed);
                let sample: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
                let mut tree = DecisionTree::new(self.max_depth, self.min_samples_leaf, 2, tree_seed)
                    .with_max_features(max_features);
                tree.fit_rows(x, y, sample, class_weights)?;
                Ok(tree)
            })
            .collect::<Result<Vec<_>>>()?;

        self.trees = trees;
        Ok(())
    }

    /// Mean of the per-tree class probabilities.
    pub fn predict_proba(&self, row: &[f64]) -> [f64; 2] {
        if self.trees.is_empty() {
            return [0.5, 0.5];
        }
        let mut sum = [0.0; 2];
        for tree in &self.trees {
            let [p0, p1] = tree.predict_proba(row);
            sum[0] += p0;
            sum[1] += p1;
        }
        let k = self.trees.len() as f64;
        [sum[0] / k, sum[1] / k]
    }
}
