//! Train/test splitting, stratified cross-validation and the per-family grid
//! search that picks the deployed model.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{error, info};

use crate::classifier::{Model, ModelFamily, ModelParams};
use crate::config::TrainingConfig;
use crate::db::{self, collections, DocumentStore};
use crate::error::{Error, Result};
use crate::features::{EngineeredDataset, TransformBundle};
use crate::matrix::Matrix;
use crate::metrics::{self, ConfusionMatrix};
use crate::models::{EvaluationResult, TrainingRun};
use crate::registry::ArtifactBundle;

/// Row indices of a train/test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffles `0..n` with a seeded RNG; the first `ceil(n * test_size)`
/// indices form the test set.
pub fn train_test_split(n: usize, test_size: f64, seed: u64) -> Result<Split> {
    if !(0.0..1.0).contains(&test_size) || test_size == 0.0 {
        return Err(Error::fit(format!("test size {test_size} must be in (0, 1)")));
    }
    let n_test = (n as f64 * test_size).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(Error::fit(format!("cannot split {n} rows with test size {test_size}")));
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let train = indices.split_off(n_test);
    Ok(Split { train, test: indices })
}

/// Unshuffled stratified k-fold over `y`: each class is cut into `k`
/// contiguous chunks (the first `len % k` chunks one longer) and fold `i`
/// tests on chunk `i` of every class.
pub fn stratified_kfold(y: &[usize], k: usize) -> Result<Vec<Split>> {
    if k < 2 {
        return Err(Error::fit(format!("need at least 2 folds, got {k}")));
    }
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in y.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }
    if let Some((label, members)) = by_class.iter().find(|(_, m)| m.len() < k) {
        return Err(Error::fit(format!(
            "class {label} has {} members, fewer than {k} folds",
            members.len()
        )));
    }

    let mut test_folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    for members in by_class.values() {
        let base = members.len() / k;
        let extra = members.len() % k;
        let mut start = 0;
        for (i, fold) in test_folds.iter_mut().enumerate() {
            let end = start + base + usize::from(i < extra);
            fold.extend_from_slice(&members[start..end]);
            start = end;
        }
    }

    let folds = test_folds
        .iter()
        .enumerate()
        .map(|(i, test)| {
            let mut test = test.clone();
            test.sort_unstable();
            let mut train: Vec<usize> = test_folds
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .flat_map(|(_, fold)| fold.iter().copied())
                .collect();
            train.sort_unstable();
            Split { train, test }
        })
        .collect();
    Ok(folds)
}

fn subset(x: &Matrix, y: &[usize], indices: &[usize]) -> (Matrix, Vec<usize>) {
    (x.select(indices), indices.iter().map(|&i| y[i]).collect())
}

/// Mean validation F1 of one grid point.
fn cross_validate(params: &ModelParams, x: &Matrix, y: &[usize], folds: &[Split]) -> Result<f64> {
    let mut total = 0.0;
    for fold in folds {
        let (x_train, y_train) = subset(x, y, &fold.train);
        let (x_val, y_val) = subset(x, y, &fold.test);
        let model = params.fit(&x_train, &y_train)?;
        total += metrics::f1_score(&y_val, &model.predict_all(&x_val));
    }
    Ok(total / folds.len() as f64)
}

/// Evaluates every grid point in parallel and returns the first one with the
/// highest mean CV F1.
pub fn grid_search(
    grid: &[ModelParams],
    x: &Matrix,
    y: &[usize],
    folds: &[Split],
) -> Result<(ModelParams, f64)> {
    let scores = grid
        .par_iter()
        .map(|params| cross_validate(params, x, y, folds))
        .collect::<Result<Vec<f64>>>()?;

    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, score)| (grid[i].clone(), score))
        .ok_or_else(|| Error::fit("empty hyperparameter grid"))
}

/// Index of the first entry with the strictly highest score after rounding.
fn first_best(scores: &[f64], decimals: u32) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        let rounded = metrics::round_to(score, decimals);
        match best {
            Some((_, current)) if rounded <= current => {}
            _ => best = Some((i, rounded)),
        }
    }
    best.map(|(i, _)| i)
}

pub struct ModelSelector {
    config: TrainingConfig,
}

impl ModelSelector {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Tunes each candidate family, evaluates it on the held-out split and
    /// pairs the winner with the transforms that produced its input.
    pub fn select(
        &self,
        dataset: &EngineeredDataset,
        transforms: TransformBundle,
    ) -> Result<(ArtifactBundle, TrainingRun)> {
        if self.config.candidates.is_empty() {
            return Err(Error::fit("no candidate model families configured"));
        }
        let split = train_test_split(dataset.x.n_rows(), self.config.test_size, self.config.seed)?;
        let (x_train, y_train) = subset(&dataset.x, &dataset.y, &split.train);
        let (x_test, y_test) = subset(&dataset.x, &dataset.y, &split.test);
        info!(train = split.train.len(), test = split.test.len(), "split engineered dataset");

        let folds = stratified_kfold(&y_train, self.config.cv_folds)?;

        let mut evaluated: Vec<(ModelFamily, Model, EvaluationResult)> = Vec::new();
        for candidate in &self.config.candidates {
            info!(family = %candidate.family, grid = candidate.grid.len(), "starting grid search");
            let (best_params, cv_score) = grid_search(&candidate.grid, &x_train, &y_train, &folds)
                .map_err(|e| Error::fit(format!("{} search failed: {e}", candidate.family)))?;

            let model = best_params.fit(&x_train, &y_train)?;
            let cm = ConfusionMatrix::from_predictions(&y_test, &model.predict_all(&x_test));
            let result = EvaluationResult {
                best_params,
                accuracy: cm.accuracy(),
                precision: cm.precision(),
                recall: cm.recall(),
                f1: cm.f1(),
                confusion_matrix: cm.to_array(),
                cv_score,
            };
            info!(
                family = %candidate.family,
                cv_f1 = result.cv_score,
                test_f1 = result.f1,
                accuracy = result.accuracy,
                "evaluated model family"
            );
            evaluated.push((candidate.family, model, result));
        }

        let f1s: Vec<f64> = evaluated.iter().map(|(_, _, r)| r.f1).collect();
        let winner = first_best(&f1s, self.config.f1_decimals)
            .ok_or_else(|| Error::fit("no model family was evaluated"))?;

        let mut results = BTreeMap::new();
        let mut best = None;
        for (i, (family, model, result)) in evaluated.into_iter().enumerate() {
            results.insert(family.as_str().to_string(), result);
            if i == winner {
                best = Some((family, model));
            }
        }
        let (best_family, best_model) = best.ok_or_else(|| Error::fit("winning model missing"))?;
        info!(best = %best_family, "selected model");

        let run = TrainingRun {
            run_id: transforms.run_id,
            results,
            best_model: best_family.as_str().to_string(),
            completed_at: Utc::now(),
        };
        let bundle = ArtifactBundle::new(transforms.run_id, best_model, transforms)?;
        Ok((bundle, run))
    }

    /// Overwrites `model_evaluation` with this run. Failures are logged.
    pub async fn persist(&self, store: &dyn DocumentStore, run: &TrainingRun) {
        let doc = match serde_json::to_value(run) {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "failed to serialize training run");
                return;
            }
        };
        match db::replace_all(store, collections::MODEL_EVALUATION, vec![doc], 1).await {
            Ok(_) => info!(best = %run.best_model, "model evaluation persisted"),
            Err(e) => error!(error = %e, "failed to persist model evaluation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::{Candidate, FeatureConfig};
    use crate::db::MemoryStore;
    use crate::features::tests::sample_records;
    use crate::features::FeatureEngineer;

    fn engineered() -> (EngineeredDataset, TransformBundle) {
        let mut engineer = FeatureEngineer::new(FeatureConfig::default());
        let dataset = engineer.fit_transform(&sample_records(), Uuid::new_v4()).unwrap();
        let transforms = engineer.transforms().unwrap().clone();
        (dataset, transforms)
    }

    #[test]
    fn split_is_seeded_and_sized() {
        let a = train_test_split(36, 0.2, 42).unwrap();
        let b = train_test_split(36, 0.2, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.test.len(), 8);
        assert_eq!(a.train.len(), 28);

        let mut all: Vec<usize> = a.train.iter().chain(&a.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..36).collect::<Vec<_>>());
        assert!(train_test_split(1, 0.2, 42).is_err());
        assert!(train_test_split(10, 0.0, 42).is_err());
    }

    #[test]
    fn folds_are_stratified_and_disjoint() {
        let y: Vec<usize> = (0..20).map(|i| usize::from(i % 4 == 0)).collect();
        let folds = stratified_kfold(&y, 5).unwrap();
        assert_eq!(folds.len(), 5);

        let mut tested = Vec::new();
        for fold in &folds {
            let positives = fold.test.iter().filter(|&&i| y[i] == 1).count();
            assert_eq!(positives, 1);
            assert_eq!(fold.test.len(), 4);
            assert_eq!(fold.train.len() + fold.test.len(), y.len());
            assert!(fold.test.iter().all(|i| !fold.train.contains(i)));
            tested.extend_from_slice(&fold.test);
        }
        tested.sort_unstable();
        assert_eq!(tested, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn too_few_members_for_the_fold_count() {
        let y = vec![0, 0, 0, 0, 1, 1];
        assert!(stratified_kfold(&y, 3).is_err());
        assert!(stratified_kfold(&y, 2).is_ok());
        assert!(stratified_kfold(&y, 1).is_err());
    }

    #[test]
    fn first_family_wins_a_rounded_tie() {
        assert_eq!(first_best(&[0.8, 0.800_000_000_1, 0.7], 6), Some(0));
        assert_eq!(first_best(&[0.7, 0.8, 0.8], 6), Some(1));
        assert_eq!(first_best(&[0.7, 0.71], 1), Some(0));
        assert_eq!(first_best(&[], 6), None);
    }

    #[test]
    fn grid_search_keeps_the_first_of_equal_scores() {
        let (x, y) = crate::classifier::tests::separable(60);
        let folds = stratified_kfold(&y, 3).unwrap();
        let same = ModelParams::LogisticRegression { c: 1.0, max_iter: 50 };
        let grid = vec![same.clone(), same.clone()];
        let (params, score) = grid_search(&grid, &x, &y, &folds).unwrap();
        assert_eq!(params, same);
        assert!(score > 0.9);
        assert!(grid_search(&[], &x, &y, &folds).is_err());
    }

    #[test]
    fn selection_is_deterministic() {
        let (dataset, transforms) = engineered();
        let selector = ModelSelector::new(TrainingConfig::quick());

        let (bundle_a, run_a) = selector.select(&dataset, transforms.clone()).unwrap();
        let (bundle_b, run_b) = selector.select(&dataset, transforms).unwrap();

        assert_eq!(run_a.results, run_b.results);
        assert_eq!(run_a.best_model, run_b.best_model);
        assert_eq!(bundle_a.model, bundle_b.model);
        assert_eq!(run_a.results.len(), 3);
        assert_eq!(bundle_a.family.as_str(), run_a.best_model);
        assert_eq!(bundle_a.run_id, bundle_a.transforms.run_id);
    }

    fn perfect_pair(first: ModelFamily) -> TrainingRun {
        let (x, y) = crate::classifier::tests::separable(90);
        let dataset = EngineeredDataset {
            feature_names: vec!["first".to_string(), "second".to_string()],
            x,
            y,
        };
        let (_, transforms) = engineered();
        let tree = Candidate {
            family: ModelFamily::DecisionTree,
            grid: vec![ModelParams::DecisionTree {
                max_depth: 3,
                min_samples_leaf: 1,
                min_samples_split: 2,
                seed: 1,
            }],
        };
        let logistic = Candidate {
            family: ModelFamily::LogisticRegression,
            grid: vec![ModelParams::LogisticRegression { c: 1.0, max_iter: 100 }],
        };
        let candidates = match first {
            ModelFamily::DecisionTree => vec![tree, logistic],
            _ => vec![logistic, tree],
        };
        let config = TrainingConfig {
            candidates,
            ..TrainingConfig::quick()
        };
        let (_, run) = ModelSelector::new(config).select(&dataset, transforms).unwrap();
        run
    }

    #[test]
    fn tied_families_keep_the_first_listed() {
        let tree_first = perfect_pair(ModelFamily::DecisionTree);
        assert_eq!(tree_first.results["DecisionTree"].f1, 1.0);
        assert_eq!(tree_first.results["LogisticRegression"].f1, 1.0);
        assert_eq!(tree_first.best_model, "DecisionTree");

        let logistic_first = perfect_pair(ModelFamily::LogisticRegression);
        assert_eq!(logistic_first.results["DecisionTree"].f1, 1.0);
        assert_eq!(logistic_first.results["LogisticRegression"].f1, 1.0);
        assert_eq!(logistic_first.best_model, "LogisticRegression");
    }

    #[tokio::test]
    async fn persists_the_run_as_one_document() {
        let (dataset, transforms) = engineered();
        let selector = ModelSelector::new(TrainingConfig::quick());
        let (_, run) = selector.select(&dataset, transforms).unwrap();

        let store = MemoryStore::new();
        selector.persist(&store, &run).await;
        selector.persist(&store, &run).await;
        assert_eq!(store.count(collections::MODEL_EVALUATION), 1);

        let docs = store.find(collections::MODEL_EVALUATION, None).await.unwrap();
        let restored: TrainingRun = serde_json::from_value(docs[0].clone()).unwrap();
        assert_eq!(restored.best_model, run.best_model);
        assert!(restored.results.contains_key("RandomForest"));
    }

    #[tokio::test]
    async fn persist_failures_are_swallowed() {
        let (dataset, transforms) = engineered();
        let selector = ModelSelector::new(TrainingConfig::quick());
        let (_, run) = selector.select(&dataset, transforms).unwrap();
        selector
            .persist(&crate::db::testing::UnavailableStore, &run)
            .await;
    }
}
