use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrix::Matrix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        /// Class-weighted share of each label among the samples reaching the leaf.
        proba: [f64; 2],
        samples: usize,
    },
}

impl Node {
    fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

/// CART classification tree with weighted Gini impurity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    max_depth: usize,
    min_samples_leaf: usize,
    min_samples_split: usize,
    /// Features considered per split; all of them when `None`.
    max_features: Option<usize>,
    seed: u64,
    root: Option<Node>,
}

struct Grower<'a> {
    x: &'a Matrix,
    y: &'a [usize],
    weights: [f64; 2],
    tree: &'a DecisionTree,
    rng: StdRng,
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl DecisionTree {
    pub fn new(max_depth: usize, min_samples_leaf: usize, min_samples_split: usize, seed: u64) -> Self {
        Self {
            max_depth,
            min_samples_leaf: min_samples_leaf.max(1),
            min_samples_split: min_samples_split.max(2),
            max_features: None,
            seed,
            root: None,
        }
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = Some(max_features.max(1));
        self
    }

    pub fn depth(&self) -> usize {
        self.root.as_ref().map_or(0, Node::depth)
    }

    pub fn fit(&mut self, x: &Matrix, y: &[usize], class_weights: [f64; 2]) -> Result<()> {
        let indices: Vec<usize> = (0..x.n_rows()).collect();
        self.fit_rows(x, y, indices, class_weights)
    }

    /// Fits on a subset of rows; repeated indices count once per repetition.
    pub fn fit_rows(
        &mut self,
        x: &Matrix,
        y: &[usize],
        indices: Vec<usize>,
        class_weights: [f64; 2],
    ) -> Result<()> {
        if indices.is_empty() {
            return Err(Error::fit("cannot grow a tree on zero samples"));
        }
        let mut grower = Grower {
            x,
            y,
            weights: class_weights,
            tree: self,
            rng: StdRng::seed_from_u64(self.seed),
        };
        let root = grower.grow(indices, 0);
        self.root = Some(root);
        Ok(())
    }

    /// `[P(label 0), P(label 1)]`; an unfitted tree is uninformative.
    pub fn predict_proba(&self, row: &[f64]) -> [f64; 2] {
        let mut node = match &self.root {
            Some(root) => root,
            None => return [0.5, 0.5],
        };
        loop {
            match node {
                Node::Leaf { proba, .. } => return *proba,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }
}

impl Grower<'_> {
    fn class_mass(&self, indices: &[usize]) -> [f64; 2] {
        let mut mass = [0.0; 2];
        for &i in indices {
            mass[self.y[i]] += self.weights[self.y[i]];
        }
        mass
    }

    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> Node {
        let mass = self.class_mass(&indices);
        let n = indices.len();
        let tree = self.tree;

        let pure = mass[0] == 0.0 || mass[1] == 0.0;
        if pure
            || depth >= tree.max_depth
            || n < tree.min_samples_split
            || n < 2 * tree.min_samples_leaf
        {
            return leaf(mass, n);
        }

        let Some(split) = self.best_split(&indices, gini(mass)) else {
            return leaf(mass, n);
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.x.get(i, split.feature) <= split.threshold);

        Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: Box::new(self.grow(left, depth + 1)),
            right: Box::new(self.grow(right, depth + 1)),
        }
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let n_features = self.x.n_cols();
        match self.tree.max_features {
            Some(k) if k < n_features => {
                let mut picked = rand::seq::index::sample(&mut self.rng, n_features, k).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..n_features).collect(),
        }
    }

    /// Lowest weighted child impurity that improves on the parent; the
    /// first candidate wins ties.
    fn best_split(&mut self, indices: &[usize], parent_impurity: f64) -> Option<Split> {
        let min_leaf = self.tree.min_samples_leaf;
        let n = indices.len();
        let total = self.class_mass(indices);
        let mut best: Option<Split> = None;

        for feature in self.candidate_features() {
            let mut column: Vec<(f64, usize)> = indices
                .iter()
                .map(|&i| (self.x.get(i, feature), self.y[i]))
                .collect();
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = [0.0; 2];
            for i in 0..n - 1 {
                let (value, label) = column[i];
                left[label] += self.weights[label];

                let left_count = i + 1;
                if left_count < min_leaf {
                    continue;
                }
                if n - left_count < min_leaf {
                    break;
                }
                let next = column[i + 1].0;
                if value == next {
                    continue;
                }

                let right = [total[0] - left[0], total[1] - left[1]];
                let left_mass = left[0] + left[1];
                let right_mass = right[0] + right[1];
                let impurity =
                    (left_mass * gini(left) + right_mass * gini(right)) / (left_mass + right_mass);

                let improves = match &best {
                    Some(current) => impurity < current.impurity,
                    None => impurity < parent_impurity - 1e-12,
                };
                if improves {
                    let mut threshold = value + (next - value) / 2.0;
                    if threshold >= next {
                        threshold = value;
                    }
                    best = Some(Split {
                        feature,
                        threshold,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

fn gini(mass: [f64; 2]) -> f64 {
    let total = mass[0] + mass[1];
    if total <= 0.0 {
        return 0.0;
    }
    let p0 = mass[0] / total;
    let p1 = mass[1] / total;
    1.0 - p0 * p0 - p1 * p1
}

fn leaf(mass: [f64; 2], samples: usize) -> Node {
    let total = mass[0] + mass[1];
    let proba = if total > 0.0 {
        [mass[0] / total, mass[1] / total]
    } else {
        [0.5, 0.5]
    };
    Node::Leaf { proba, samples }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staircase() -> (Matrix, Vec<usize>) {
        let x = Matrix::from_rows((0..20).map(|i| vec![i as f64, (i % 2) as f64]).collect()).unwrap();
        let y: Vec<usize> = (0..20).map(|i| usize::from(i >= 10)).collect();
        (x, y)
    }

    #[test]
    fn gini_bounds() {
        assert_eq!(gini([4.0, 0.0]), 0.0);
        assert!((gini([2.0, 2.0]) - 0.5).abs() < 1e-12);
        assert_eq!(gini([0.0, 0.0]), 0.0);
    }

    #[test]
    fn splits_at_the_midpoint() {
        let (x, y) = staircase();
        let mut tree = DecisionTree::new(3, 1, 2, 0);
        tree.fit(&x, &y, [1.0, 1.0]).unwrap();

        assert_eq!(tree.depth(), 1);
        match tree.root.as_ref().unwrap() {
            Node::Split { feature, threshold, .. } => {
                assert_eq!(*feature, 0);
                assert!((threshold - 9.5).abs() < 1e-12);
            }
            Node::Leaf { .. } => panic!("expected a split"),
        }
        assert_eq!(tree.predict_proba(&[3.0, 0.0]), [1.0, 0.0]);
        assert_eq!(tree.predict_proba(&[15.0, 1.0]), [0.0, 1.0]);
    }

    #[test]
    fn respects_depth_and_leaf_limits() {
        let (x, y) = staircase();
        let mut stump = DecisionTree::new(0, 1, 2, 0);
        stump.fit(&x, &y, [1.0, 1.0]).unwrap();
        assert_eq!(stump.depth(), 0);
        assert_eq!(stump.predict_proba(&[0.0, 0.0]), [0.5, 0.5]);

        let mut wide_leaves = DecisionTree::new(5, 11, 2, 0);
        wide_leaves.fit(&x, &y, [1.0, 1.0]).unwrap();
        assert_eq!(wide_leaves.depth(), 0);
    }

    #[test]
    fn leaf_probabilities_are_class_weighted() {
        let x = Matrix::from_rows(vec![vec![0.0]; 4]).unwrap();
        let y = vec![0, 0, 0, 1];
        let mut tree = DecisionTree::new(3, 1, 2, 0);
        tree.fit(&x, &y, [1.0, 3.0]).unwrap();
        let [p0, p1] = tree.predict_proba(&[0.0]);
        assert!((p0 - 0.5).abs() < 1e-12);
        assert!((p1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn feature_subsampling_is_seeded() {
        let (x, y) = staircase();
        let mut a = DecisionTree::new(4, 1, 2, 11).with_max_features(1);
        let mut b = DecisionTree::new(4, 1, 2, 11).with_max_features(1);
        a.fit(&x, &y, [1.0, 1.0]).unwrap();
        b.fit(&x, &y, [1.0, 1.0]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unfitted_or_empty_trees() {
        let tree = DecisionTree::new(3, 1, 2, 0);
        assert_eq!(tree.predict_proba(&[1.0]), [0.5, 0.5]);
        let (x, y) = staircase();
        let mut tree = DecisionTree::new(3, 1, 2, 0);
        assert!(tree.fit_rows(&x, &y, Vec::new(), [1.0, 1.0]).is_err());
    }
}
