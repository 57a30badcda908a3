use crate::models::FeatureMatrix;

/// Per-feature importance scores, aligned one-to-one with the training columns.
pub trait FeatureImportanceProvider {
    fn importances(&self) -> &[f64];
}

/// Binary classifier over feature matrices; class 1 is the positive label.
pub trait Classifier: FeatureImportanceProvider {
    /// Predicted class per row as `0.0` or `1.0`.
    fn predict(&self, x: &FeatureMatrix) -> Vec<f64>;
    /// Probability of class 1 per row.
    fn predict_probability(&self, x: &FeatureMatrix) -> Vec<f64>;
    /// Column count the model was fitted on, when it is known.
    fn expected_features(&self) -> Option<usize> {
        None
    }
}

pub trait Regressor: FeatureImportanceProvider {
    fn predict(&self, x: &FeatureMatrix) -> Vec<f64>;
    fn expected_features(&self) -> Option<usize> {
        None
    }
}

#[path = "estimators/decision_tree.rs"]
pub mod decision_tree;

pub use decision_tree::{Criterion, DecisionTree, TreeConfig};

#[path = "estimators/random_forest.rs"]
pub mod random_forest;

pub use random_forest::{ForestClassifier, ForestConfig, ForestRegressor, MaxFeatures, Parallelism};
