use crate::error::{PipelineError, PipelineResult, Stage};
use crate::models::FeatureTable;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Pearson correlation of two equally long samples. Zero-variance inputs give `NaN`.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 {
        return f64::NAN;
    }
    let sd_x = x.iter().std_dev();
    let sd_y = y.iter().std_dev();
    if !(sd_x > 0.0) || !(sd_y > 0.0) {
        return f64::NAN;
    }
    let covariance = x.iter().covariance(y.iter());
    (covariance / (sd_x * sd_y)).clamp(-1.0, 1.0)
}

/// Square correlation matrix whose rows and columns share one explicit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    columns: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn new(columns: Vec<String>, values: Vec<Vec<f64>>) -> PipelineResult<Self> {
        if let Some(bad) = values.iter().find(|row| row.len() != columns.len()) {
            return Err(PipelineError::LengthMismatch {
                stage: Stage::Select,
                left: columns.len(),
                right: bad.len(),
            });
        }
        if values.len() != columns.len() {
            return Err(PipelineError::LengthMismatch {
                stage: Stage::Select,
                left: columns.len(),
                right: values.len(),
            });
        }
        Ok(Self { columns, values })
    }

    /// Correlates every column of the table against every other one.
    pub fn from_table(table: &FeatureTable) -> Self {
        let columns = table.columns();
        let series: Vec<Vec<f64>> = columns
            .iter()
            .map(|column| table.column_values(*column).unwrap_or_default())
            .collect();

        let k = columns.len();
        let mut values = vec![vec![f64::NAN; k]; k];
        for i in 0..k {
            for j in i..k {
                let r = pearson(&series[i], &series[j]);
                values[i][j] = r;
                values[j][i] = r;
            }
        }

        Self {
            columns: columns.iter().map(|c| c.name()).collect(),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    /// Correlations of `column` with every matrix column, in matrix order.
    pub fn row(&self, column: &str) -> Option<&[f64]> {
        self.index_of(column).map(|idx| self.values[idx].as_slice())
    }

    pub fn get(&self, row: &str, column: &str) -> Option<f64> {
        let i = self.index_of(row)?;
        let j = self.index_of(column)?;
        Some(self.values[i][j])
    }
}
