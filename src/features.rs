use crate::error::{PipelineError, PipelineResult};
use crate::indicators::{rolling_count, rolling_mean, shift};
use crate::models::{FeatureRow, FeatureTable, PriceSeries};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_HORIZONS: [usize; 3] = [2, 3, 30];

/// When rows with undefined derived values are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NullDropPolicy {
    /// Every horizon is computed over the full series and rows are dropped once.
    #[default]
    Final,
    /// Rows are dropped after each horizon; later horizons roll over the shortened table.
    PerHorizon,
}

impl FromStr for NullDropPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "final" => Ok(Self::Final),
            "per-horizon" => Ok(Self::PerHorizon),
            other => Err(format!(
                "null drop policy must be final or per-horizon (value: {other})"
            )),
        }
    }
}

impl fmt::Display for NullDropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Final => f.write_str("final"),
            Self::PerHorizon => f.write_str("per-horizon"),
        }
    }
}

pub fn validate_horizons(horizons: &[usize]) -> PipelineResult<()> {
    if horizons.is_empty() {
        return Err(PipelineError::InvalidHorizons(
            "at least one horizon is required".to_string(),
        ));
    }
    if horizons.contains(&0) {
        return Err(PipelineError::InvalidHorizons(
            "horizons must be positive".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for h in horizons {
        if !seen.insert(*h) {
            return Err(PipelineError::InvalidHorizons(format!(
                "horizon {h} is listed more than once"
            )));
        }
    }
    Ok(())
}

/// Derives the feature/label table from a price series using the default policy.
pub fn derive(series: &PriceSeries, horizons: &[usize]) -> PipelineResult<FeatureTable> {
    derive_with_policy(series, horizons, NullDropPolicy::default())
}

pub fn derive_with_policy(
    series: &PriceSeries,
    horizons: &[usize],
    policy: NullDropPolicy,
) -> PipelineResult<FeatureTable> {
    validate_horizons(horizons)?;

    let bars = series.bars();
    let n = bars.len();
    let closes = series.closes();
    let tomorrow: Vec<Option<f64>> = (0..n).map(|i| bars.get(i + 1).map(|b| b.close)).collect();
    let targets: Vec<Option<bool>> = tomorrow
        .iter()
        .zip(closes.iter())
        .map(|(next, close)| next.map(|next| next > *close))
        .collect();

    // Original row indices still in the working table; always a contiguous run.
    let mut alive: Vec<usize> = (0..n).collect();
    let mut ratios: Vec<Vec<Option<f64>>> = vec![vec![None; n]; horizons.len()];
    let mut trends: Vec<Vec<Option<u32>>> = vec![vec![None; n]; horizons.len()];

    for (slot, &h) in horizons.iter().enumerate() {
        let window_closes: Vec<f64> = alive.iter().map(|&i| closes[i]).collect();
        let window_targets: Vec<Option<bool>> = alive.iter().map(|&i| targets[i]).collect();
        let means = rolling_mean(&window_closes, h);
        let counts = rolling_count(&shift(&window_targets, 1), h);

        for (pos, &i) in alive.iter().enumerate() {
            ratios[slot][i] = means[pos]
                .map(|mean| closes[i] / mean)
                .filter(|ratio| !ratio.is_nan());
            trends[slot][i] = counts[pos];
        }

        if policy == NullDropPolicy::PerHorizon {
            let before = alive.len();
            alive.retain(|&i| {
                tomorrow[i].is_some()
                    && (0..=slot).all(|s| ratios[s][i].is_some() && trends[s][i].is_some())
            });
            debug!(
                "{}: horizon {} dropped {} rows ({} remain)",
                series.instrument(),
                h,
                before - alive.len(),
                alive.len()
            );
        }
    }

    let rows: Vec<FeatureRow> = alive
        .into_iter()
        .filter_map(|i| {
            let tomorrow_close = tomorrow[i]?;
            let target = targets[i]?;
            let close_ratios = ratios
                .iter()
                .map(|column| column[i])
                .collect::<Option<Vec<f64>>>()?;
            let trend_counts = trends
                .iter()
                .map(|column| column[i])
                .collect::<Option<Vec<u32>>>()?;
            Some(FeatureRow {
                bar: bars[i].clone(),
                tomorrow_close,
                target,
                close_ratios,
                trend_counts,
            })
        })
        .collect();

    debug!(
        "{}: derived {} of {} rows with horizons {:?} ({} policy)",
        series.instrument(),
        rows.len(),
        n,
        horizons,
        policy
    );

    Ok(FeatureTable::new(
        series.instrument(),
        horizons.to_vec(),
        rows,
    ))
}
