use crate::error::{PipelineError, PipelineResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adjusted_close: f64,
    pub volume: f64,
}

/// Daily bars for one instrument in strictly increasing date order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    instrument: String,
    bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(instrument: impl Into<String>, bars: Vec<PriceBar>) -> PipelineResult<Self> {
        let instrument = instrument.into();
        for pair in bars.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(PipelineError::MalformedSeries {
                    instrument,
                    detail: format!(
                        "dates must be strictly increasing ({} follows {})",
                        pair[1].date, pair[0].date
                    ),
                });
            }
        }
        Ok(Self { instrument, bars })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|bar| bar.close).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Open,
    High,
    Low,
    Close,
    AdjustedClose,
    Volume,
    TomorrowClose,
    Target,
    CloseRatio(usize),
    TrendCount(usize),
}

/// Raw price columns; never usable as predictors because they leak the label.
pub const RAW_PRICE_COLUMNS: [Column; 6] = [
    Column::Open,
    Column::High,
    Column::Low,
    Column::Close,
    Column::AdjustedClose,
    Column::Volume,
];

impl Column {
    pub fn name(&self) -> String {
        match self {
            Column::Open => "open".to_string(),
            Column::High => "high".to_string(),
            Column::Low => "low".to_string(),
            Column::Close => "close".to_string(),
            Column::AdjustedClose => "adjusted_close".to_string(),
            Column::Volume => "volume".to_string(),
            Column::TomorrowClose => "tomorrow_close".to_string(),
            Column::Target => "target".to_string(),
            Column::CloseRatio(h) => format!("close_ratio_{h}"),
            Column::TrendCount(h) => format!("trend_count_{h}"),
        }
    }

    pub fn is_raw_price(&self) -> bool {
        RAW_PRICE_COLUMNS.contains(self)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Column {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let fixed = match raw {
            "open" => Some(Column::Open),
            "high" => Some(Column::High),
            "low" => Some(Column::Low),
            "close" => Some(Column::Close),
            "adjusted_close" => Some(Column::AdjustedClose),
            "volume" => Some(Column::Volume),
            "tomorrow_close" => Some(Column::TomorrowClose),
            "target" => Some(Column::Target),
            _ => None,
        };
        if let Some(column) = fixed {
            return Ok(column);
        }

        let horizon_of = |prefix: &str| {
            raw.strip_prefix(prefix)
                .and_then(|rest| rest.parse::<usize>().ok())
                .filter(|h| *h > 0)
        };
        if let Some(h) = horizon_of("close_ratio_") {
            return Ok(Column::CloseRatio(h));
        }
        if let Some(h) = horizon_of("trend_count_") {
            return Ok(Column::TrendCount(h));
        }
        Err(PipelineError::UnknownColumn(raw.to_string()))
    }
}

/// Supervised task; decides which column is the label and which one is its leaking twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Classification,
    Regression,
}

impl Task {
    pub fn target_column(&self) -> Column {
        match self {
            Task::Classification => Column::Target,
            Task::Regression => Column::TomorrowClose,
        }
    }

    pub fn complement_column(&self) -> Column {
        match self {
            Task::Classification => Column::TomorrowClose,
            Task::Regression => Column::Target,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Classification => "classification",
            Task::Regression => "regression",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub bar: PriceBar,
    pub tomorrow_close: f64,
    pub target: bool,
    /// One entry per table horizon, in table horizon order.
    pub close_ratios: Vec<f64>,
    pub trend_counts: Vec<u32>,
}

/// Engineered table produced by the feature deriver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    instrument: String,
    horizons: Vec<usize>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(instrument: impl Into<String>, horizons: Vec<usize>, rows: Vec<FeatureRow>) -> Self {
        Self {
            instrument: instrument.into(),
            horizons,
            rows,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn horizons(&self) -> &[usize] {
        &self.horizons
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> Vec<Column> {
        let mut columns = RAW_PRICE_COLUMNS.to_vec();
        columns.push(Column::TomorrowClose);
        columns.push(Column::Target);
        for &h in &self.horizons {
            columns.push(Column::CloseRatio(h));
            columns.push(Column::TrendCount(h));
        }
        columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(Column::name).collect()
    }

    pub fn has_column(&self, column: Column) -> bool {
        match column {
            Column::CloseRatio(h) | Column::TrendCount(h) => self.horizon_slot(h).is_some(),
            _ => true,
        }
    }

    fn horizon_slot(&self, horizon: usize) -> Option<usize> {
        self.horizons.iter().position(|&h| h == horizon)
    }

    /// Numeric view of one cell; booleans read as 0/1.
    pub fn value(&self, row: &FeatureRow, column: Column) -> Option<f64> {
        let value = match column {
            Column::Open => row.bar.open,
            Column::High => row.bar.high,
            Column::Low => row.bar.low,
            Column::Close => row.bar.close,
            Column::AdjustedClose => row.bar.adjusted_close,
            Column::Volume => row.bar.volume,
            Column::TomorrowClose => row.tomorrow_close,
            Column::Target => {
                if row.target {
                    1.0
                } else {
                    0.0
                }
            }
            Column::CloseRatio(h) => *row.close_ratios.get(self.horizon_slot(h)?)?,
            Column::TrendCount(h) => *row.trend_counts.get(self.horizon_slot(h)?)? as f64,
        };
        Some(value)
    }

    pub fn column_values(&self, column: Column) -> Option<Vec<f64>> {
        if !self.has_column(column) {
            return None;
        }
        self.rows
            .iter()
            .map(|row| self.value(row, column))
            .collect()
    }

    pub fn column_values_by_name(&self, name: &str) -> PipelineResult<Vec<f64>> {
        let column: Column = name.parse()?;
        self.column_values(column)
            .ok_or_else(|| PipelineError::UnknownColumn(name.to_string()))
    }
}

/// Row-major predictor matrix with named columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        Self { columns, rows }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.rows[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_round_trip_through_from_str() {
        let columns = [
            Column::Open,
            Column::AdjustedClose,
            Column::TomorrowClose,
            Column::Target,
            Column::CloseRatio(30),
            Column::TrendCount(2),
        ];
        for column in columns {
            let parsed: Column = column.name().parse().expect("known column");
            assert_eq!(parsed, column);
        }
        assert!(matches!(
            "close_ratio_0".parse::<Column>(),
            Err(PipelineError::UnknownColumn(_))
        ));
        assert!(matches!(
            "Adj_Close".parse::<Column>(),
            Err(PipelineError::UnknownColumn(_))
        ));
    }

    #[test]
    fn price_series_rejects_duplicate_dates() {
        let date = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        let bar = PriceBar {
            date,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            adjusted_close: 1.0,
            volume: 10.0,
        };
        let result = PriceSeries::new("LYTS", vec![bar.clone(), bar]);
        assert!(matches!(
            result,
            Err(PipelineError::MalformedSeries { ref instrument, .. }) if instrument == "LYTS"
        ));
    }

    #[test]
    fn table_columns_follow_horizon_order() {
        let table = FeatureTable::new("UIS", vec![30, 2], Vec::new());
        let names = table.column_names();
        assert_eq!(names[6], "tomorrow_close");
        assert_eq!(names[7], "target");
        assert_eq!(
            &names[8..],
            &["close_ratio_30", "trend_count_30", "close_ratio_2", "trend_count_2"]
        );
        assert!(table.column_values(Column::CloseRatio(3)).is_none());
    }
}
