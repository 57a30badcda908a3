use crate::config::AnalysisSettings;
use crate::features::NullDropPolicy;
use crate::market_data::{load_market_data, LoadOptions, LoadSummary};
use crate::model::Parallelism;
use crate::pipeline::{analyze_all_with, InstrumentOutcome, InstrumentReport, TaskMetrics};
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub data: PathBuf,
    pub tickers: Option<Vec<String>>,
    pub settings_path: Option<PathBuf>,
    pub delimiter: Option<u8>,
    pub output: Option<PathBuf>,
    pub explainer_dir: Option<PathBuf>,
    pub trees: Option<usize>,
    pub threads: Option<usize>,
    pub null_drop: Option<NullDropPolicy>,
}

#[derive(Debug, Serialize)]
struct InstrumentSummary {
    instrument: String,
    engineered_rows: usize,
    classification_features: usize,
    regression_features: usize,
    accuracy: f64,
    auc_roc: f64,
    r_squared: f64,
    mean_absolute_error: f64,
}

#[derive(Debug, Serialize)]
struct FailureSummary {
    instrument: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct AnalysisSummary {
    load: LoadSummary,
    instruments_analyzed: usize,
    instruments_failed: usize,
    results: Vec<InstrumentSummary>,
    failures: Vec<FailureSummary>,
}

pub fn run(options: AnalyzeOptions) -> Result<()> {
    let mut settings = AnalysisSettings::load(options.settings_path.as_deref())?;
    apply_overrides(&mut settings, &options)?;
    info!(
        "Analyzing {} with horizons {:?}, {} null drop, tail size {}, {} trees",
        options.data.display(),
        settings.horizons,
        settings.null_drop,
        settings.tail_size,
        settings.forest.tree_count
    );

    let market_data = load_market_data(
        &options.data,
        &LoadOptions {
            delimiter: settings.delimiter,
            tickers: options.tickers.clone(),
        },
    )?;
    if market_data.series.is_empty() {
        return Err(anyhow!(
            "No instruments with usable rows found in {}",
            options.data.display()
        ));
    }

    let pb = ProgressBar::new(market_data.series.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );
    let outcomes = analyze_all_with(&market_data.series, &settings, |outcome| {
        pb.set_message(outcome.instrument.clone());
        pb.inc(1);
    });
    pb.finish_with_message("analysis complete");

    let (reports, failures) = partition_outcomes(outcomes, options.explainer_dir.as_deref());

    if let Some(path) = &options.output {
        write_reports(path, &reports)?;
        info!("Wrote {} instrument report(s) to {}", reports.len(), path.display());
    }

    let summary = AnalysisSummary {
        load: market_data.summary.clone(),
        instruments_analyzed: reports.len(),
        instruments_failed: failures.len(),
        results: reports.iter().map(summarize).collect(),
        failures,
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("STOCKML_ANALYSIS_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize analysis summary: {err}"),
    }

    if reports.is_empty() {
        return Err(anyhow!(
            "Analysis failed for all {} instrument(s)",
            summary.instruments_failed
        ));
    }
    Ok(())
}

fn apply_overrides(settings: &mut AnalysisSettings, options: &AnalyzeOptions) -> Result<()> {
    if let Some(delimiter) = options.delimiter {
        settings.delimiter = delimiter;
    }
    if let Some(trees) = options.trees {
        settings.forest.tree_count = trees;
    }
    if let Some(threads) = options.threads {
        settings.forest.parallelism = if threads == 0 {
            Parallelism::AllCores
        } else {
            Parallelism::Threads(threads)
        };
    }
    if let Some(policy) = options.null_drop {
        settings.null_drop = policy;
    }
    settings
        .forest
        .validate()
        .context("Invalid forest settings")?;
    Ok(())
}

fn partition_outcomes(
    outcomes: Vec<InstrumentOutcome>,
    explainer_dir: Option<&Path>,
) -> (Vec<InstrumentReport>, Vec<FailureSummary>) {
    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(analysis) => {
                let report = analysis.report.clone();
                if let Some(dir) = explainer_dir {
                    let path = dir.join(format!("{}.explainer.bin", outcome.instrument));
                    match analysis.into_explainer_bundle().save(&path) {
                        Ok(()) => info!("Saved explainer bundle to {}", path.display()),
                        Err(err) => warn!(
                            "{}: failed to save explainer bundle: {:#}",
                            outcome.instrument, err
                        ),
                    }
                }
                reports.push(report);
            }
            Err(err) => failures.push(FailureSummary {
                instrument: outcome.instrument,
                error: format!("{:#}", err),
            }),
        }
    }
    (reports, failures)
}

fn summarize(report: &InstrumentReport) -> InstrumentSummary {
    let (accuracy, auc_roc) = match &report.classification.metrics {
        TaskMetrics::Classification(metrics) => (metrics.accuracy, metrics.auc_roc),
        TaskMetrics::Regression(_) => (f64::NAN, f64::NAN),
    };
    let (r_squared, mean_absolute_error) = match &report.regression.metrics {
        TaskMetrics::Regression(metrics) => (metrics.r_squared, metrics.mean_absolute_error),
        TaskMetrics::Classification(_) => (f64::NAN, f64::NAN),
    };
    InstrumentSummary {
        instrument: report.instrument.clone(),
        engineered_rows: report.engineered_rows,
        classification_features: report.classification.selected_features.len(),
        regression_features: report.regression.selected_features.len(),
        accuracy,
        auc_roc,
        r_squared,
        mean_absolute_error,
    }
}

fn write_reports(path: &Path, reports: &[InstrumentReport]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create report directory {}", parent.display())
            })?;
        }
    }
    let file = File::create(path)
        .with_context(|| format!("Unable to create report file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, reports)
        .context("Failed to serialize analysis reports")?;
    writer.flush().context("Failed to flush analysis reports")?;
    Ok(())
}
