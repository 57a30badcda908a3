use crate::correlation::CorrelationMatrix;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Column, Task, RAW_PRICE_COLUMNS};
use log::debug;

/// Lower correlation-magnitude bound used by the reference analysis.
pub const REFERENCE_LOWER_BOUND: f64 = 0.005;
/// Upper (exclusive) correlation-magnitude bound used by the reference analysis.
pub const REFERENCE_UPPER_BOUND: f64 = 0.99;

/// Columns whose absolute correlation with `target` falls in `[low, high)`,
/// in matrix column order, minus raw prices, the target and its complement.
pub fn select(
    corr: &CorrelationMatrix,
    low: f64,
    high: f64,
    target: &str,
) -> PipelineResult<Vec<String>> {
    let row = corr
        .row(target)
        .ok_or_else(|| PipelineError::UnknownTarget(target.to_string()))?;
    let excluded = excluded_columns(target);

    let selected: Vec<String> = corr
        .columns()
        .iter()
        .zip(row.iter())
        .filter(|(_, r)| {
            let magnitude = r.abs();
            low <= magnitude && magnitude < high
        })
        .map(|(name, _)| name)
        .filter(|name| name.as_str() != target && !excluded.contains(name))
        .cloned()
        .collect();

    debug!(
        "Selected {} feature(s) for {} within [{}, {}): {:?}",
        selected.len(),
        target,
        low,
        high,
        selected
    );
    Ok(selected)
}

pub fn select_for_task(
    corr: &CorrelationMatrix,
    low: f64,
    high: f64,
    task: Task,
) -> PipelineResult<Vec<String>> {
    select(corr, low, high, &task.target_column().name())
}

fn excluded_columns(target: &str) -> Vec<String> {
    let mut excluded: Vec<String> = RAW_PRICE_COLUMNS.iter().map(Column::name).collect();
    match target.parse::<Column>() {
        Ok(Column::Target) => excluded.push(Task::Classification.complement_column().name()),
        Ok(Column::TomorrowClose) => excluded.push(Task::Regression.complement_column().name()),
        _ => {}
    }
    excluded
}
