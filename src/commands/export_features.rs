use crate::config::AnalysisSettings;
use crate::features::derive_with_policy;
use crate::market_data::{load_market_data, LoadOptions};
use crate::models::FeatureTable;
use anyhow::{anyhow, Context, Result};
use log::info;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct ExportFeaturesOptions {
    pub data: PathBuf,
    pub ticker: String,
    pub settings_path: Option<PathBuf>,
    pub delimiter: Option<u8>,
    /// Writes to stdout when unset.
    pub output: Option<PathBuf>,
}

pub fn run(options: ExportFeaturesOptions) -> Result<()> {
    let mut settings = AnalysisSettings::load(options.settings_path.as_deref())?;
    if let Some(delimiter) = options.delimiter {
        settings.delimiter = delimiter;
    }

    let market_data = load_market_data(
        &options.data,
        &LoadOptions {
            delimiter: settings.delimiter,
            tickers: Some(vec![options.ticker.clone()]),
        },
    )?;
    let series = market_data
        .instrument(&options.ticker)
        .ok_or_else(|| anyhow!("No rows for {} in {}", options.ticker, options.data.display()))?;

    let table = derive_with_policy(series, &settings.horizons, settings.null_drop)
        .with_context(|| format!("Failed to derive features for {}", series.instrument()))?;

    match &options.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create output directory {}", parent.display())
                    })?;
                }
            }
            write_table_to_path(&table, path)?;
            info!(
                "Wrote {} engineered rows for {} to {}",
                table.len(),
                table.instrument(),
                path.display()
            );
        }
        None => write_table(&table, io::stdout().lock())?,
    }
    Ok(())
}

pub fn write_table_to_path(table: &FeatureTable, path: &Path) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("Unable to create feature file {}", path.display()))?;
    write_table(table, file)
}

/// Writes `date` followed by every table column, one row per engineered record.
pub fn write_table<W: Write>(table: &FeatureTable, writer: W) -> Result<()> {
    let columns = table.columns();
    let mut csv_writer = csv::Writer::from_writer(writer);

    let mut header = vec!["date".to_string()];
    header.extend(columns.iter().map(|column| column.name()));
    csv_writer
        .write_record(&header)
        .context("Failed to write feature header")?;

    for row in table.rows() {
        let mut record = Vec::with_capacity(header.len());
        record.push(row.bar.date.format("%Y-%m-%d").to_string());
        for column in &columns {
            let value = table
                .value(row, *column)
                .ok_or_else(|| anyhow!("Column {} missing from feature row", column))?;
            record.push(value.to_string());
        }
        csv_writer
            .write_record(&record)
            .context("Failed to write feature row")?;
    }
    csv_writer.flush().context("Failed to flush feature file")?;
    Ok(())
}
