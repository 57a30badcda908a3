use super::decision_tree::{Criterion, DecisionTree, TreeConfig};
use super::{Classifier, FeatureImportanceProvider, Regressor};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::FeatureMatrix;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Worker threads used while fitting trees and predicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parallelism {
    AllCores,
    Threads(usize),
}

impl Parallelism {
    pub fn thread_count(&self) -> usize {
        match self {
            Parallelism::AllCores => num_cpus::get().max(1),
            Parallelism::Threads(count) => (*count).max(1),
        }
    }

    /// Runs `op` on a pool of `thread_count()` workers. Work already running
    /// on a rayon worker stays on that pool, and `AllCores` uses the global
    /// pool, so nested calls never multiply threads.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        let count = match self {
            Parallelism::Threads(count) if rayon::current_thread_index().is_none() => *count,
            _ => return op(),
        };
        match rayon::ThreadPoolBuilder::new().num_threads(count.max(1)).build() {
            Ok(pool) => pool.install(op),
            Err(err) => {
                warn!("Failed to build a {count} thread pool, using the current one: {err}");
                op()
            }
        }
    }
}

/// Features considered per split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxFeatures {
    Sqrt,
    All,
    Count(usize),
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let count = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt() as usize,
            MaxFeatures::All => n_features,
            MaxFeatures::Count(count) => (*count).min(n_features),
        };
        count.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub tree_count: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// `None` uses `Sqrt` for classification and `All` for regression.
    pub max_features: Option<MaxFeatures>,
    pub bootstrap: bool,
    pub parallelism: Parallelism,
    pub random_seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            tree_count: 1000,
            max_depth: 10,
            min_samples_split: 10,
            min_samples_leaf: 2,
            max_features: None,
            bootstrap: true,
            parallelism: Parallelism::AllCores,
            random_seed: 1234,
        }
    }
}

impl ForestConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.tree_count == 0 {
            return Err(PipelineError::InvalidHyperparameters(
                "tree_count must be greater than zero".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(PipelineError::InvalidHyperparameters(
                "max_depth must be greater than zero".to_string(),
            ));
        }
        if self.min_samples_split < 2 {
            return Err(PipelineError::InvalidHyperparameters(format!(
                "min_samples_split must be at least 2, got {}",
                self.min_samples_split
            )));
        }
        if self.min_samples_leaf == 0 {
            return Err(PipelineError::InvalidHyperparameters(
                "min_samples_leaf must be greater than zero".to_string(),
            ));
        }
        if self.max_features == Some(MaxFeatures::Count(0)) {
            return Err(PipelineError::InvalidHyperparameters(
                "max_features must be greater than zero".to_string(),
            ));
        }
        if self.parallelism == Parallelism::Threads(0) {
            return Err(PipelineError::InvalidHyperparameters(
                "thread count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Forest {
    trees: Vec<DecisionTree>,
    importances: Vec<f64>,
    feature_names: Vec<String>,
    parallelism: Parallelism,
}

impl Forest {
    fn fit(
        x: &FeatureMatrix,
        y: &[f64],
        config: &ForestConfig,
        criterion: Criterion,
    ) -> PipelineResult<Self> {
        config.validate()?;
        if x.n_rows() != y.len() {
            return Err(PipelineError::LengthMismatch {
                stage: Stage::Fit,
                left: x.n_rows(),
                right: y.len(),
            });
        }
        if x.is_empty() {
            return Err(PipelineError::InsufficientData {
                stage: Stage::Fit,
                required: 1,
                available: 0,
            });
        }
        if x.n_features() == 0 {
            return Err(PipelineError::InvalidHyperparameters(
                "cannot fit a forest without feature columns".to_string(),
            ));
        }

        let default_features = match criterion {
            Criterion::Gini => MaxFeatures::Sqrt,
            Criterion::SquaredError => MaxFeatures::All,
        };
        let tree_config = TreeConfig {
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split,
            min_samples_leaf: config.min_samples_leaf,
            max_features: config
                .max_features
                .unwrap_or(default_features)
                .resolve(x.n_features()),
            criterion,
        };

        let started = Instant::now();
        let n = x.n_rows();
        let (trees, threads): (Vec<DecisionTree>, usize) = config.parallelism.install(|| {
            let trees = (0..config.tree_count)
                .into_par_iter()
                .map(|tree_idx| {
                    let seed = config.random_seed.wrapping_add(tree_idx as u64);
                    let mut rng = StdRng::seed_from_u64(seed);
                    let samples: Vec<usize> = if config.bootstrap {
                        (0..n).map(|_| rng.gen_range(0..n)).collect()
                    } else {
                        (0..n).collect()
                    };
                    DecisionTree::fit(x, y, &samples, &tree_config, &mut rng)
                })
                .collect();
            (trees, rayon::current_num_threads())
        });

        let importances = aggregate_importances(&trees, x.n_features());
        info!(
            "Fitted {} {:?} trees on {} rows x {} features using {} thread(s) in {:.2}s",
            trees.len(),
            criterion,
            n,
            x.n_features(),
            threads,
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            trees,
            importances,
            feature_names: x.columns.clone(),
            parallelism: config.parallelism,
        })
    }

    /// Panics if a row is narrower than the training matrix; evaluation
    /// checks the width first.
    fn mean_prediction(&self, x: &FeatureMatrix) -> Vec<f64> {
        if self.trees.is_empty() {
            return vec![0.0; x.n_rows()];
        }
        let tree_count = self.trees.len() as f64;
        self.parallelism.install(|| {
            x.rows
                .par_iter()
                .map(|row| {
                    self.trees.iter().map(|tree| tree.predict_row(row)).sum::<f64>() / tree_count
                })
                .collect()
        })
    }
}

/// Mean of per-tree normalized impurity decreases over trees that split at
/// least once, renormalized to sum to one.
fn aggregate_importances(trees: &[DecisionTree], n_features: usize) -> Vec<f64> {
    let mut totals = vec![0.0; n_features];
    let mut contributing = 0usize;
    for tree in trees.iter().filter(|tree| tree.node_count() > 1) {
        contributing += 1;
        for (total, value) in totals.iter_mut().zip(tree.importances()) {
            *total += value;
        }
    }
    if contributing == 0 {
        debug!("No tree in the forest produced a split; importances are all zero");
        return totals;
    }

    let sum: f64 = totals.iter().sum();
    if sum > 0.0 {
        for total in &mut totals {
            *total /= sum;
        }
    }
    totals
}

/// Bagged Gini trees predicting the probability of class 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestClassifier {
    forest: Forest,
}

impl ForestClassifier {
    /// Labels above 0.5 are treated as class 1.
    pub fn fit(x: &FeatureMatrix, y: &[f64], config: &ForestConfig) -> PipelineResult<Self> {
        let labels: Vec<f64> = y
            .iter()
            .map(|value| if *value > 0.5 { 1.0 } else { 0.0 })
            .collect();
        let forest = Forest::fit(x, &labels, config, Criterion::Gini)?;
        Ok(Self { forest })
    }

    pub fn tree_count(&self) -> usize {
        self.forest.trees.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.forest.feature_names
    }
}

impl FeatureImportanceProvider for ForestClassifier {
    fn importances(&self) -> &[f64] {
        &self.forest.importances
    }
}

impl Classifier for ForestClassifier {
    fn expected_features(&self) -> Option<usize> {
        Some(self.forest.feature_names.len())
    }

    fn predict(&self, x: &FeatureMatrix) -> Vec<f64> {
        self.predict_probability(x)
            .into_iter()
            .map(|p| if p > 0.5 { 1.0 } else { 0.0 })
            .collect()
    }

    fn predict_probability(&self, x: &FeatureMatrix) -> Vec<f64> {
        self.forest.mean_prediction(x)
    }
}

/// Bagged squared-error trees averaging leaf means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestRegressor {
    forest: Forest,
}

impl ForestRegressor {
    pub fn fit(x: &FeatureMatrix, y: &[f64], config: &ForestConfig) -> PipelineResult<Self> {
        let forest = Forest::fit(x, y, config, Criterion::SquaredError)?;
        Ok(Self { forest })
    }

    pub fn tree_count(&self) -> usize {
        self.forest.trees.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.forest.feature_names
    }
}

impl FeatureImportanceProvider for ForestRegressor {
    fn importances(&self) -> &[f64] {
        &self.forest.importances
    }
}

impl Regressor for ForestRegressor {
    fn expected_features(&self) -> Option<usize> {
        Some(self.forest.feature_names.len())
    }

    fn predict(&self, x: &FeatureMatrix) -> Vec<f64> {
        self.forest.mean_prediction(x)
    }
}
