use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::{Column, FeatureMatrix, FeatureTable};
use serde::{Deserialize, Serialize};

/// Rows assigned to the "train" partition by the reference analysis.
pub const DEFAULT_TAIL_SIZE: usize = 220;

/// Positional partition of an engineered table.
///
/// `train` holds the most recent `tail_size` rows and `test` holds every row
/// before them, both in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub x_train: FeatureMatrix,
    pub y_train: Vec<f64>,
    pub x_test: FeatureMatrix,
    pub y_test: Vec<f64>,
}

impl Split {
    pub fn train_len(&self) -> usize {
        self.y_train.len()
    }

    pub fn test_len(&self) -> usize {
        self.y_test.len()
    }
}

pub fn split(
    table: &FeatureTable,
    predictors: &[String],
    target: &str,
    tail_size: usize,
) -> PipelineResult<Split> {
    if table.len() < tail_size {
        return Err(PipelineError::InsufficientData {
            stage: Stage::Split,
            required: tail_size,
            available: table.len(),
        });
    }

    let predictor_columns = predictors
        .iter()
        .map(|name| resolve(table, name))
        .collect::<PipelineResult<Vec<Column>>>()?;
    let target_column = resolve(table, target)?;

    let mut features = Vec::with_capacity(table.len());
    let mut labels = Vec::with_capacity(table.len());
    for row in table.rows() {
        let values = predictor_columns
            .iter()
            .map(|column| table.value(row, *column))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| PipelineError::UnknownColumn(predictors.join(",")))?;
        features.push(values);
        labels.push(
            table
                .value(row, target_column)
                .ok_or_else(|| PipelineError::UnknownColumn(target.to_string()))?,
        );
    }

    let cut = table.len() - tail_size;
    let train_rows = features.split_off(cut);
    let y_train = labels.split_off(cut);

    Ok(Split {
        x_train: FeatureMatrix::new(predictors.to_vec(), train_rows),
        y_train,
        x_test: FeatureMatrix::new(predictors.to_vec(), features),
        y_test: labels,
    })
}

fn resolve(table: &FeatureTable, name: &str) -> PipelineResult<Column> {
    let column: Column = name.parse()?;
    if table.has_column(column) {
        Ok(column)
    } else {
        Err(PipelineError::UnknownColumn(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::derive;
    use crate::models::{PriceBar, PriceSeries};
    use chrono::{Duration, NaiveDate};

    fn table(len: usize) -> FeatureTable {
        let start = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        let bars = (0..len)
            .map(|idx| {
                let close = 50.0 + (idx as f64 / 4.0).sin() * 3.0 + idx as f64 * 0.02;
                PriceBar {
                    date: start + Duration::days(idx as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    adjusted_close: close,
                    volume: 500.0,
                }
            })
            .collect();
        derive(&PriceSeries::new("SPLT", bars).unwrap(), &[2, 3]).unwrap()
    }

    #[test]
    fn train_is_the_trailing_window() {
        let table = table(40);
        let predictors = vec!["close_ratio_2".to_string(), "trend_count_3".to_string()];
        let split = split(&table, &predictors, "target", 10).unwrap();

        assert_eq!(split.train_len() + split.test_len(), table.len());
        assert_eq!(split.train_len(), 10);
        assert_eq!(split.x_train.columns, predictors);

        let cut = table.len() - 10;
        for (offset, row) in table.rows()[cut..].iter().enumerate() {
            assert_eq!(split.x_train.row(offset)[0], row.close_ratios[0]);
            assert_eq!(split.y_train[offset], if row.target { 1.0 } else { 0.0 });
        }
        assert_eq!(split.x_test.row(0)[1], table.rows()[0].trend_counts[1] as f64);
    }

    #[test]
    fn exact_fit_leaves_empty_test_partition() {
        let table = table(20);
        let split = split(&table, &["close_ratio_3".to_string()], "tomorrow_close", table.len())
            .unwrap();
        assert_eq!(split.test_len(), 0);
        assert!(split.x_test.is_empty());
    }

    #[test]
    fn short_tables_are_rejected() {
        let table = table(20);
        let err = split(&table, &["close_ratio_2".to_string()], "target", 220).unwrap_err();
        assert_eq!(
            err,
            PipelineError::InsufficientData {
                stage: Stage::Split,
                required: 220,
                available: table.len(),
            }
        );
    }

    #[test]
    fn unknown_predictors_are_rejected() {
        let table = table(20);
        assert!(matches!(
            split(&table, &["close_ratio_30".to_string()], "target", 5),
            Err(PipelineError::UnknownColumn(name)) if name == "close_ratio_30"
        ));
    }
}
