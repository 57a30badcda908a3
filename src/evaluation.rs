use crate::correlation::pearson;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::model::{Classifier, FeatureImportanceProvider, Regressor};
use crate::models::{FeatureMatrix, FeatureTable};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 2x2 outcome counts with class 1 as the positive label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: usize,
    pub false_negative: usize,
    pub false_positive: usize,
    pub true_negative: usize,
}

impl ConfusionMatrix {
    pub fn from_labels(actual: &[bool], predicted: &[bool]) -> Self {
        let mut matrix = Self::default();
        for (a, p) in actual.iter().zip(predicted) {
            match (a, p) {
                (true, true) => matrix.true_positive += 1,
                (true, false) => matrix.false_negative += 1,
                (false, true) => matrix.false_positive += 1,
                (false, false) => matrix.true_negative += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_negative + self.false_positive + self.true_negative
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }

    /// True positive rate.
    pub fn sensitivity(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    /// True negative rate.
    pub fn specificity(&self) -> f64 {
        ratio(self.true_negative, self.true_negative + self.false_positive)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        f64::NAN
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    pub false_positive_rate: f64,
    pub true_positive_rate: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub auc_roc: f64,
    pub roc_curve: Vec<RocPoint>,
    pub confusion: ConfusionMatrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub r_squared: f64,
    pub mean_absolute_error: f64,
    /// `(actual, predicted)` per test row.
    pub actual_vs_predicted: Vec<(f64, f64)>,
}

fn check_labels(x: &FeatureMatrix, y: &[f64]) -> PipelineResult<()> {
    if x.n_rows() != y.len() {
        return Err(PipelineError::LengthMismatch {
            stage: Stage::Evaluate,
            left: x.n_rows(),
            right: y.len(),
        });
    }
    if y.is_empty() {
        return Err(PipelineError::InsufficientData {
            stage: Stage::Evaluate,
            required: 1,
            available: 0,
        });
    }
    Ok(())
}

/// A test matrix must have exactly the columns the model was fitted on.
fn check_width(expected: Option<usize>, x: &FeatureMatrix) -> PipelineResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let narrowest = x.rows.iter().map(Vec::len).min().unwrap_or(x.n_features());
    if x.n_features() != expected || narrowest < expected {
        return Err(PipelineError::LengthMismatch {
            stage: Stage::Evaluate,
            left: expected,
            right: x.n_features().min(narrowest),
        });
    }
    Ok(())
}

pub fn evaluate_classifier<M: Classifier + ?Sized>(
    model: &M,
    x_test: &FeatureMatrix,
    y_test: &[f64],
) -> PipelineResult<ClassificationReport> {
    check_labels(x_test, y_test)?;
    check_width(model.expected_features(), x_test)?;
    let actual: Vec<bool> = y_test.iter().map(|value| *value > 0.5).collect();
    let positives = actual.iter().filter(|value| **value).count();
    if positives == 0 || positives == actual.len() {
        return Err(PipelineError::DegenerateLabel {
            class_count: 1,
            rows: actual.len(),
        });
    }

    let predicted: Vec<bool> = model
        .predict(x_test)
        .into_iter()
        .map(|value| value > 0.5)
        .collect();
    let scores = model.predict_probability(x_test);
    if predicted.len() != actual.len() || scores.len() != actual.len() {
        return Err(PipelineError::LengthMismatch {
            stage: Stage::Evaluate,
            left: actual.len(),
            right: predicted.len().min(scores.len()),
        });
    }

    let confusion = ConfusionMatrix::from_labels(&actual, &predicted);
    let roc_curve = roc_curve(&actual, &scores);
    Ok(ClassificationReport {
        accuracy: confusion.accuracy(),
        sensitivity: confusion.sensitivity(),
        specificity: confusion.specificity(),
        auc_roc: trapezoid_area(&roc_curve),
        roc_curve,
        confusion,
    })
}

/// ROC points over distinct score thresholds in descending order, with
/// collinear intermediate points removed and a leading `(0, 0, +inf)` point.
/// Both classes must be present.
pub fn roc_curve(actual: &[bool], scores: &[f64]) -> Vec<RocPoint> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut thresholds = Vec::new();
    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut tp = 0.0;
    let mut fp = 0.0;
    for (pos, &idx) in order.iter().enumerate() {
        if actual[idx] {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        let last_of_value = order
            .get(pos + 1)
            .map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_value {
            thresholds.push(scores[idx]);
            tps.push(tp);
            fps.push(fp);
        }
    }

    let keep: Vec<usize> = if tps.len() > 2 {
        (0..tps.len())
            .filter(|&i| {
                i == 0
                    || i == tps.len() - 1
                    || fps[i + 1] - 2.0 * fps[i] + fps[i - 1] != 0.0
                    || tps[i + 1] - 2.0 * tps[i] + tps[i - 1] != 0.0
            })
            .collect()
    } else {
        (0..tps.len()).collect()
    };

    let total_positive = tp;
    let total_negative = fp;
    let mut curve = Vec::with_capacity(keep.len() + 1);
    curve.push(RocPoint {
        false_positive_rate: 0.0,
        true_positive_rate: 0.0,
        threshold: f64::INFINITY,
    });
    for i in keep {
        curve.push(RocPoint {
            false_positive_rate: fps[i] / total_negative,
            true_positive_rate: tps[i] / total_positive,
            threshold: thresholds[i],
        });
    }
    curve
}

fn trapezoid_area(curve: &[RocPoint]) -> f64 {
    curve
        .windows(2)
        .map(|pair| {
            let width = pair[1].false_positive_rate - pair[0].false_positive_rate;
            width * (pair[1].true_positive_rate + pair[0].true_positive_rate) / 2.0
        })
        .sum()
}

pub fn evaluate_regressor<M: Regressor + ?Sized>(
    model: &M,
    x_test: &FeatureMatrix,
    y_test: &[f64],
) -> PipelineResult<RegressionReport> {
    check_labels(x_test, y_test)?;
    check_width(model.expected_features(), x_test)?;
    let predicted = model.predict(x_test);
    if predicted.len() != y_test.len() {
        return Err(PipelineError::LengthMismatch {
            stage: Stage::Evaluate,
            left: y_test.len(),
            right: predicted.len(),
        });
    }

    let n = y_test.len() as f64;
    let mean = y_test.iter().sum::<f64>() / n;
    let ss_tot: f64 = y_test.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = y_test
        .iter()
        .zip(&predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    let r_squared = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };
    let mean_absolute_error = y_test
        .iter()
        .zip(&predicted)
        .map(|(y, p)| (y - p).abs())
        .sum::<f64>()
        / n;

    Ok(RegressionReport {
        r_squared,
        mean_absolute_error,
        actual_vs_predicted: y_test.iter().copied().zip(predicted).collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceEntry {
    pub feature_name: String,
    pub importance_score: f64,
    /// Absolute correlation with the target over the full engineered table.
    pub target_correlation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportanceSortKey {
    Importance,
    Correlation,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImportanceComparison {
    pub entries: Vec<ImportanceEntry>,
}

impl ImportanceComparison {
    /// Stable descending sort; `NaN` scores go last.
    pub fn sort_by(&mut self, key: ImportanceSortKey) {
        let score = |entry: &ImportanceEntry| match key {
            ImportanceSortKey::Importance => entry.importance_score,
            ImportanceSortKey::Correlation => entry.target_correlation,
        };
        self.entries
            .sort_by(|a, b| descending_nan_last(score(a), score(b)));
    }

    pub fn top(&self, n: usize) -> &[ImportanceEntry] {
        &self.entries[..n.min(self.entries.len())]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn descending_nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Pairs each feature's importance with its absolute correlation to `target`,
/// sorted by importance.
pub fn compare_importance<M: FeatureImportanceProvider + ?Sized>(
    model: &M,
    table: &FeatureTable,
    feature_names: &[String],
    target: &str,
) -> PipelineResult<ImportanceComparison> {
    let importances = model.importances();
    if importances.len() != feature_names.len() {
        return Err(PipelineError::FeatureMismatch {
            features: feature_names.len(),
            importances: importances.len(),
        });
    }

    let target_values = table.column_values_by_name(target)?;
    let mut entries = Vec::with_capacity(feature_names.len());
    for (name, importance) in feature_names.iter().zip(importances) {
        let values = table.column_values_by_name(name)?;
        entries.push(ImportanceEntry {
            feature_name: name.clone(),
            importance_score: *importance,
            target_correlation: pearson(&values, &target_values).abs(),
        });
    }

    let mut comparison = ImportanceComparison { entries };
    comparison.sort_by(ImportanceSortKey::Importance);
    Ok(comparison)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::derive;
    use crate::models::{PriceBar, PriceSeries};
    use chrono::{Duration, NaiveDate};

    struct FixedClassifier {
        labels: Vec<f64>,
        scores: Vec<f64>,
        importances: Vec<f64>,
    }

    impl FeatureImportanceProvider for FixedClassifier {
        fn importances(&self) -> &[f64] {
            &self.importances
        }
    }

    impl Classifier for FixedClassifier {
        fn predict(&self, _x: &FeatureMatrix) -> Vec<f64> {
            self.labels.clone()
        }

        fn predict_probability(&self, _x: &FeatureMatrix) -> Vec<f64> {
            self.scores.clone()
        }
    }

    struct FixedRegressor(Vec<f64>);

    impl FeatureImportanceProvider for FixedRegressor {
        fn importances(&self) -> &[f64] {
            &[]
        }
    }

    impl Regressor for FixedRegressor {
        fn predict(&self, _x: &FeatureMatrix) -> Vec<f64> {
            self.0.clone()
        }
    }

    fn matrix(rows: usize) -> FeatureMatrix {
        FeatureMatrix::new(vec!["f".into()], vec![vec![0.0]; rows])
    }

    #[test]
    fn perfect_classifier_scores_one() {
        let y = vec![1.0, 0.0, 1.0, 0.0, 1.0];
        let model = FixedClassifier {
            labels: y.clone(),
            scores: vec![0.9, 0.2, 0.8, 0.1, 0.7],
            importances: vec![1.0],
        };
        let report = evaluate_classifier(&model, &matrix(5), &y).unwrap();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.sensitivity, 1.0);
        assert_eq!(report.specificity, 1.0);
        assert!((report.auc_roc - 1.0).abs() < 1e-12);
        assert_eq!(report.confusion.true_positive, 3);
        assert_eq!(report.confusion.true_negative, 2);
    }

    #[test]
    fn mixed_predictions_fill_the_confusion_matrix() {
        let y = vec![1.0, 1.0, 0.0, 0.0];
        let model = FixedClassifier {
            labels: vec![1.0, 0.0, 1.0, 0.0],
            scores: vec![0.8, 0.4, 0.6, 0.2],
            importances: vec![1.0],
        };
        let report = evaluate_classifier(&model, &matrix(4), &y).unwrap();
        assert_eq!(
            report.confusion,
            ConfusionMatrix {
                true_positive: 1,
                false_negative: 1,
                false_positive: 1,
                true_negative: 1,
            }
        );
        assert_eq!(report.sensitivity, 0.5);
        assert_eq!(report.specificity, 0.5);
        assert!((report.auc_roc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn roc_curve_runs_from_origin_to_corner() {
        let actual = [true, false, true, true, false, false, true, false];
        let scores = [0.9, 0.8, 0.7, 0.7, 0.6, 0.3, 0.3, 0.1];
        let curve = roc_curve(&actual, &scores);

        let first = curve[0];
        assert_eq!((first.false_positive_rate, first.true_positive_rate), (0.0, 0.0));
        assert!(first.threshold.is_infinite());
        let last = curve[curve.len() - 1];
        assert_eq!((last.false_positive_rate, last.true_positive_rate), (1.0, 1.0));
        for pair in curve.windows(2) {
            assert!(pair[0].threshold > pair[1].threshold);
            assert!(pair[0].false_positive_rate <= pair[1].false_positive_rate);
            assert!(pair[0].true_positive_rate <= pair[1].true_positive_rate);
        }
    }

    #[test]
    fn nan_scores_still_produce_a_complete_curve() {
        let actual = [true, false, true, false, true];
        let scores = [0.9, f64::NAN, 0.4, 0.2, f64::NAN];
        let curve = roc_curve(&actual, &scores);
        let last = curve[curve.len() - 1];
        assert_eq!((last.false_positive_rate, last.true_positive_rate), (1.0, 1.0));
        assert_eq!(curve.len(), 4);
        assert!(curve
            .iter()
            .all(|p| p.false_positive_rate.is_finite() && p.true_positive_rate.is_finite()));
    }

    #[test]
    fn collinear_roc_points_are_dropped() {
        let actual = [true, true, true, false];
        let scores = [0.9, 0.8, 0.7, 0.1];
        let curve = roc_curve(&actual, &scores);
        let thresholds: Vec<f64> = curve.iter().map(|p| p.threshold).collect();
        assert_eq!(thresholds, vec![f64::INFINITY, 0.9, 0.7, 0.1]);
    }

    #[test]
    fn single_class_labels_are_degenerate() {
        let model = FixedClassifier {
            labels: vec![1.0; 3],
            scores: vec![0.9; 3],
            importances: vec![1.0],
        };
        assert_eq!(
            evaluate_classifier(&model, &matrix(3), &[1.0, 1.0, 1.0]),
            Err(PipelineError::DegenerateLabel {
                class_count: 1,
                rows: 3
            })
        );
        assert!(matches!(
            evaluate_classifier(&model, &matrix(0), &[]),
            Err(PipelineError::InsufficientData { stage: Stage::Evaluate, .. })
        ));
        assert!(matches!(
            evaluate_classifier(&model, &matrix(2), &[1.0, 0.0, 1.0]),
            Err(PipelineError::LengthMismatch { stage: Stage::Evaluate, left: 2, right: 3 })
        ));
    }

    #[test]
    fn exact_regression_has_unit_r_squared() {
        let y = vec![10.0, 11.5, 9.25, 12.0];
        let report = evaluate_regressor(&FixedRegressor(y.clone()), &matrix(4), &y).unwrap();
        assert_eq!(report.r_squared, 1.0);
        assert_eq!(report.mean_absolute_error, 0.0);
        assert_eq!(report.actual_vs_predicted[2], (9.25, 9.25));
    }

    #[test]
    fn regression_metrics_match_hand_computation() {
        let y = vec![1.0, 2.0, 3.0, 4.0];
        let predicted = vec![1.5, 2.0, 2.5, 5.0];
        let report = evaluate_regressor(&FixedRegressor(predicted), &matrix(4), &y).unwrap();
        // ss_res = 0.25 + 0 + 0.25 + 1 = 1.5, ss_tot = 5
        assert!((report.r_squared - 0.7).abs() < 1e-12);
        assert!((report.mean_absolute_error - 0.5).abs() < 1e-12);

        let flat = vec![2.0, 2.0];
        let report = evaluate_regressor(&FixedRegressor(vec![2.0, 3.0]), &matrix(2), &flat).unwrap();
        assert_eq!(report.r_squared, 0.0);
    }

    fn engineered_table() -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2020, 3, 2).unwrap();
        let bars = (0..80)
            .map(|idx| {
                let close = 20.0 + (idx as f64 * 0.7).sin() * 2.0 + idx as f64 * 0.05;
                PriceBar {
                    date: start + Duration::days(idx as i64),
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    adjusted_close: close,
                    volume: 1_000.0,
                }
            })
            .collect();
        derive(&PriceSeries::new("CMP", bars).unwrap(), &[2, 3]).unwrap()
    }

    #[test]
    fn importance_comparison_sorts_and_truncates() {
        let table = engineered_table();
        let features = vec![
            "close_ratio_2".to_string(),
            "trend_count_2".to_string(),
            "close_ratio_3".to_string(),
        ];
        let model = FixedClassifier {
            labels: Vec::new(),
            scores: Vec::new(),
            importances: vec![0.2, 0.5, 0.3],
        };

        let mut comparison = compare_importance(&model, &table, &features, "target").unwrap();
        let order: Vec<&str> = comparison
            .entries
            .iter()
            .map(|entry| entry.feature_name.as_str())
            .collect();
        assert_eq!(order, vec!["trend_count_2", "close_ratio_3", "close_ratio_2"]);

        let target = table.column_values_by_name("target").unwrap();
        let ratio = table.column_values_by_name("close_ratio_2").unwrap();
        let expected = pearson(&ratio, &target).abs();
        let entry = &comparison.entries[2];
        assert!((entry.target_correlation - expected).abs() < 1e-12);
        assert!(comparison.entries.iter().all(|entry| entry.target_correlation >= 0.0));

        comparison.sort_by(ImportanceSortKey::Correlation);
        for pair in comparison.entries.windows(2) {
            assert!(pair[0].target_correlation >= pair[1].target_correlation);
        }
        assert_eq!(comparison.top(2).len(), 2);
        assert_eq!(comparison.top(8).len(), 3);
    }

    #[test]
    fn importance_count_must_match_features() {
        let table = engineered_table();
        let model = FixedClassifier {
            labels: Vec::new(),
            scores: Vec::new(),
            importances: vec![1.0],
        };
        let features = vec!["close_ratio_2".to_string(), "close_ratio_3".to_string()];
        assert_eq!(
            compare_importance(&model, &table, &features, "target"),
            Err(PipelineError::FeatureMismatch {
                features: 2,
                importances: 1
            })
        );
    }

    #[test]
    fn nan_scores_sort_last() {
        let mut comparison = ImportanceComparison {
            entries: vec![
                ImportanceEntry {
                    feature_name: "a".into(),
                    importance_score: f64::NAN,
                    target_correlation: 0.1,
                },
                ImportanceEntry {
                    feature_name: "b".into(),
                    importance_score: 0.4,
                    target_correlation: f64::NAN,
                },
            ],
        };
        comparison.sort_by(ImportanceSortKey::Importance);
        assert_eq!(comparison.entries[0].feature_name, "b");
        comparison.sort_by(ImportanceSortKey::Correlation);
        assert_eq!(comparison.entries[0].feature_name, "a");
    }
}
