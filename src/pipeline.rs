use crate::config::AnalysisSettings;
use crate::correlation::CorrelationMatrix;
use crate::error::{PipelineError, Stage};
use crate::evaluation::{
    compare_importance, evaluate_classifier, evaluate_regressor, ClassificationReport,
    ImportanceComparison, RegressionReport,
};
use crate::explainer::ExplainerBundle;
use crate::features::derive_with_policy;
use crate::model::{ForestClassifier, ForestRegressor};
use crate::models::{FeatureMatrix, FeatureTable, PriceSeries, Task};
use crate::selection::select_for_task;
use crate::split::{split, Split};
use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskMetrics {
    Classification(ClassificationReport),
    Regression(RegressionReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task: Task,
    pub target: String,
    pub selected_features: Vec<String>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub metrics: TaskMetrics,
    pub importance: ImportanceComparison,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentReport {
    pub instrument: String,
    pub input_rows: usize,
    pub engineered_rows: usize,
    pub classification: TaskReport,
    pub regression: TaskReport,
}

/// Report plus the fitted classifier and its held-out rows.
#[derive(Debug, Clone)]
pub struct InstrumentAnalysis {
    pub report: InstrumentReport,
    pub classifier: ForestClassifier,
    pub classification_test: (FeatureMatrix, Vec<f64>),
}

impl InstrumentAnalysis {
    pub fn into_explainer_bundle(self) -> ExplainerBundle {
        let (x_test, y_test) = self.classification_test;
        ExplainerBundle::new(self.report.instrument, self.classifier, x_test, y_test)
    }
}

#[derive(Debug)]
pub struct InstrumentOutcome {
    pub instrument: String,
    pub result: Result<InstrumentAnalysis>,
}

/// Wraps a stage failure with the instrument and row count it happened on.
fn stage_context<T>(
    result: Result<T, PipelineError>,
    instrument: &str,
    stage: Stage,
    rows: usize,
) -> Result<T> {
    result.with_context(|| format!("{instrument}: {stage} stage failed on {rows} engineered rows"))
}

/// Derives features for one instrument, then selects, splits, fits and
/// evaluates a classifier on `target` and a regressor on `tomorrow_close`.
pub fn analyze_instrument(
    series: &PriceSeries,
    settings: &AnalysisSettings,
) -> Result<InstrumentAnalysis> {
    let instrument = series.instrument();
    let table = derive_with_policy(series, &settings.horizons, settings.null_drop)
        .with_context(|| {
            format!(
                "{instrument}: derive stage failed on {} input rows",
                series.len()
            )
        })?;
    let rows = table.len();
    info!(
        "{}: {} input rows, {} engineered rows",
        instrument,
        series.len(),
        rows
    );

    let corr = CorrelationMatrix::from_table(&table);

    let (classification, classification_split) =
        prepare_task(&table, &corr, settings, Task::Classification)?;
    let classifier = stage_context(
        ForestClassifier::fit(
            &classification_split.x_train,
            &classification_split.y_train,
            &settings.forest,
        ),
        instrument,
        Stage::Fit,
        rows,
    )?;
    let class_metrics = stage_context(
        evaluate_classifier(
            &classifier,
            &classification_split.x_test,
            &classification_split.y_test,
        ),
        instrument,
        Stage::Evaluate,
        rows,
    )?;
    let class_importance = stage_context(
        compare_importance(&classifier, &table, &classification.features, &classification.target),
        instrument,
        Stage::Evaluate,
        rows,
    )?;

    let (regression, regression_split) = prepare_task(&table, &corr, settings, Task::Regression)?;
    let regressor = stage_context(
        ForestRegressor::fit(
            &regression_split.x_train,
            &regression_split.y_train,
            &settings.forest,
        ),
        instrument,
        Stage::Fit,
        rows,
    )?;
    let reg_metrics = stage_context(
        evaluate_regressor(&regressor, &regression_split.x_test, &regression_split.y_test),
        instrument,
        Stage::Evaluate,
        rows,
    )?;
    let reg_importance = stage_context(
        compare_importance(&regressor, &table, &regression.features, &regression.target),
        instrument,
        Stage::Evaluate,
        rows,
    )?;

    info!(
        "{}: accuracy {:.4}, sensitivity {:.4}, specificity {:.4}, AUC {:.4}",
        instrument,
        class_metrics.accuracy,
        class_metrics.sensitivity,
        class_metrics.specificity,
        class_metrics.auc_roc
    );
    info!(
        "{}: r2 {:.4}, MAE {:.4}",
        instrument, reg_metrics.r_squared, reg_metrics.mean_absolute_error
    );

    let report = InstrumentReport {
        instrument: instrument.to_string(),
        input_rows: series.len(),
        engineered_rows: rows,
        classification: classification.into_report(
            &classification_split,
            TaskMetrics::Classification(class_metrics),
            class_importance,
        ),
        regression: regression.into_report(
            &regression_split,
            TaskMetrics::Regression(reg_metrics),
            reg_importance,
        ),
    };

    Ok(InstrumentAnalysis {
        report,
        classifier,
        classification_test: (classification_split.x_test, classification_split.y_test),
    })
}

struct PreparedTask {
    task: Task,
    target: String,
    features: Vec<String>,
}

impl PreparedTask {
    fn into_report(
        self,
        split: &Split,
        metrics: TaskMetrics,
        importance: ImportanceComparison,
    ) -> TaskReport {
        TaskReport {
            task: self.task,
            target: self.target,
            selected_features: self.features,
            train_rows: split.train_len(),
            test_rows: split.test_len(),
            metrics,
            importance,
        }
    }
}

fn prepare_task(
    table: &FeatureTable,
    corr: &CorrelationMatrix,
    settings: &AnalysisSettings,
    task: Task,
) -> Result<(PreparedTask, Split)> {
    let instrument = table.instrument();
    let rows = table.len();
    let target = task.target_column().name();

    let features = stage_context(
        select_for_task(
            corr,
            settings.selection_lower_bound,
            settings.selection_upper_bound,
            task,
        ),
        instrument,
        Stage::Select,
        rows,
    )?;
    if features.is_empty() {
        warn!(
            "{}: no feature qualified for {} within [{}, {})",
            instrument,
            target,
            settings.selection_lower_bound,
            settings.selection_upper_bound
        );
    }

    let split = stage_context(
        split(table, &features, &target, settings.tail_size),
        instrument,
        Stage::Split,
        rows,
    )?;
    info!(
        "{}: {} features for {} ({} train / {} test rows)",
        instrument,
        features.len(),
        task.as_str(),
        split.train_len(),
        split.test_len()
    );

    Ok((
        PreparedTask {
            task,
            target,
            features,
        },
        split,
    ))
}

/// Analyzes every instrument in parallel; a failing instrument does not
/// affect the others.
pub fn analyze_all(series: &[PriceSeries], settings: &AnalysisSettings) -> Vec<InstrumentOutcome> {
    analyze_all_with(series, settings, |_| {})
}

/// Like [`analyze_all`], calling `on_complete` as each instrument finishes.
/// Instruments and the forests fitted for them share one pool sized by
/// `settings.forest.parallelism`.
pub fn analyze_all_with<F>(
    series: &[PriceSeries],
    settings: &AnalysisSettings,
    on_complete: F,
) -> Vec<InstrumentOutcome>
where
    F: Fn(&InstrumentOutcome) + Sync,
{
    settings.forest.parallelism.install(|| {
        series
            .par_iter()
            .map(|series| {
                let outcome = InstrumentOutcome {
                    instrument: series.instrument().to_string(),
                    result: analyze_instrument(series, settings),
                };
                if let Err(err) = &outcome.result {
                    warn!("{:#}", err);
                }
                on_complete(&outcome);
                outcome
            })
            .collect()
    })
}
