use std::path::PathBuf;

use crate::classifier::{ModelFamily, ModelParams};

/// How the cleaner bounds the age column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AgeFilterPolicy {
    /// Keep ages in [0, 120] only.
    HardBoundsOnly,
    /// Keep ages in [0, 120] that also fall inside the IQR fences of the
    /// remaining population. This can drop elderly but valid patients.
    HardBoundsAndIqr { multiplier: f64 },
}

impl Default for AgeFilterPolicy {
    fn default() -> Self {
        AgeFilterPolicy::HardBoundsAndIqr { multiplier: 1.5 }
    }
}

#[derive(Debug, Clone)]
pub struct CleaningConfig {
    pub min_age: i64,
    pub max_age: i64,
    pub age_filter: AgeFilterPolicy,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            min_age: 0,
            max_age: 120,
            age_filter: AgeFilterPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Seed for minority oversampling.
    pub seed: u64,
    /// Rows per insert when persisting the engineered dataset.
    pub persist_batch_size: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            persist_batch_size: 5000,
        }
    }
}

/// One model family and the grid searched for it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub family: ModelFamily,
    pub grid: Vec<ModelParams>,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub test_size: f64,
    pub seed: u64,
    pub cv_folds: usize,
    /// Decimal places test F1 is rounded to before comparing families.
    pub f1_decimals: u32,
    /// Searched in this order; ties keep the earlier family.
    pub candidates: Vec<Candidate>,
}

impl TrainingConfig {
    /// Full grids for production runs.
    pub fn full() -> Self {
        let seed = 42;
        let logistic = [0.1, 1.0, 10.0]
            .into_iter()
            .flat_map(|c| {
                [100, 1000]
                    .into_iter()
                    .map(move |max_iter| ModelParams::LogisticRegression { c, max_iter })
            })
            .collect();

        let mut tree = Vec::new();
        for max_depth in [5, 10] {
            for min_samples_leaf in [10, 20, 50] {
                for min_samples_split in [10, 50] {
                    tree.push(ModelParams::DecisionTree {
                        max_depth,
                        min_samples_leaf,
                        min_samples_split,
                        seed,
                    });
                }
            }
        }

        let mut forest = Vec::new();
        for n_estimators in [50, 100] {
            for max_depth in [5, 10] {
                for min_samples_leaf in [10, 20] {
                    forest.push(ModelParams::RandomForest {
                        n_estimators,
                        max_depth,
                        min_samples_leaf,
                        seed,
                    });
                }
            }
        }

        Self {
            test_size: 0.2,
            seed,
            cv_folds: 5,
            f1_decimals: 6,
            candidates: vec![
                Candidate {
                    family: ModelFamily::LogisticRegression,
                    grid: logistic,
                },
                Candidate {
                    family: ModelFamily::DecisionTree,
                    grid: tree,
                },
                Candidate {
                    family: ModelFamily::RandomForest,
                    grid: forest,
                },
            ],
        }
    }

    /// One small grid point per family, for smoke runs and tests.
    pub fn quick() -> Self {
        let seed = 42;
        Self {
            test_size: 0.2,
            seed,
            cv_folds: 3,
            f1_decimals: 6,
            candidates: vec![
                Candidate {
                    family: ModelFamily::LogisticRegression,
                    grid: vec![ModelParams::LogisticRegression {
                        c: 1.0,
                        max_iter: 100,
                    }],
                },
                Candidate {
                    family: ModelFamily::DecisionTree,
                    grid: vec![ModelParams::DecisionTree {
                        max_depth: 5,
                        min_samples_leaf: 2,
                        min_samples_split: 4,
                        seed,
                    }],
                },
                Candidate {
                    family: ModelFamily::RandomForest,
                    grid: vec![ModelParams::RandomForest {
                        n_estimators: 10,
                        max_depth: 5,
                        min_samples_leaf: 2,
                        seed,
                    }],
                },
            ],
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::full()
    }
}

/// Everything a pipeline run and the serving side need to know.
#[derive(Debug, Clone)]
pub struct Config {
    pub dataset_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub cleaning: CleaningConfig,
    pub features: FeatureConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn new(dataset_path: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            artifact_dir: artifact_dir.into(),
            cleaning: CleaningConfig::default(),
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
        }
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    pub fn with_age_filter(mut self, policy: AgeFilterPolicy) -> Self {
        self.cleaning.age_filter = policy;
        self
    }
}
