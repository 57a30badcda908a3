use crate::models::{PriceBar, PriceSeries};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use csv::StringRecord;
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Ticker,
    Date,
    Open,
    High,
    Low,
    Close,
    AdjustedClose,
    Volume,
}

impl Field {
    const ALL: [Field; 8] = [
        Field::Ticker,
        Field::Date,
        Field::Open,
        Field::High,
        Field::Low,
        Field::Close,
        Field::AdjustedClose,
        Field::Volume,
    ];

    /// Accepted header spellings after normalization.
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Field::Ticker => &["ticker", "symbol"],
            Field::Date => &["date"],
            Field::Open => &["open"],
            Field::High => &["high"],
            Field::Low => &["low"],
            Field::Close => &["close"],
            Field::AdjustedClose => &["adjclose", "adjustedclose"],
            Field::Volume => &["volume"],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Field::Ticker => "ticker",
            Field::Date => "date",
            Field::Open => "open",
            Field::High => "high",
            Field::Low => "low",
            Field::Close => "close",
            Field::AdjustedClose => "adjusted_close",
            Field::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub delimiter: u8,
    /// Restrict loading to these instruments; `None` loads every ticker.
    pub tickers: Option<Vec<String>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            tickers: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub rows_loaded: usize,
    pub malformed_rows: usize,
    pub duplicate_dates: usize,
    pub instruments: usize,
}

#[derive(Debug, Clone)]
pub struct MarketData {
    pub series: Vec<PriceSeries>,
    pub summary: LoadSummary,
}

impl MarketData {
    pub fn instrument(&self, ticker: &str) -> Option<&PriceSeries> {
        let ticker = normalize_ticker_symbol(ticker)?;
        self.series.iter().find(|series| series.instrument() == ticker)
    }
}

pub fn load_market_data<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<MarketData> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open market data at {}", path.display()))?;
    let data = read_market_data(file, options)
        .with_context(|| format!("Failed to load market data from {}", path.display()))?;
    info!(
        "Loaded {} rows for {} instrument(s) from {} ({} malformed, {} duplicate dates skipped)",
        data.summary.rows_loaded,
        data.summary.instruments,
        path.display(),
        data.summary.malformed_rows,
        data.summary.duplicate_dates
    );
    Ok(data)
}

pub fn read_market_data<R: Read>(reader: R, options: &LoadOptions) -> Result<MarketData> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .context("Failed to read market data header")?
        .clone();
    let columns = resolve_columns(&headers)?;

    let wanted: Option<HashSet<String>> = options.tickers.as_ref().map(|tickers| {
        tickers
            .iter()
            .filter_map(|ticker| normalize_ticker_symbol(ticker))
            .collect()
    });

    let mut summary = LoadSummary::default();
    let mut grouped: BTreeMap<String, Vec<PriceBar>> = BTreeMap::new();
    for (idx, result) in reader.records().enumerate() {
        summary.rows_read += 1;
        let line = idx + 2;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                warn!("Skipping line {}: {}", line, err);
                summary.malformed_rows += 1;
                continue;
            }
        };

        let (ticker, bar) = match parse_record(&record, &columns) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Skipping line {}: {}", line, err);
                summary.malformed_rows += 1;
                continue;
            }
        };
        if let Some(wanted) = &wanted {
            if !wanted.contains(&ticker) {
                continue;
            }
        }
        grouped.entry(ticker).or_default().push(bar);
    }

    let mut series = Vec::with_capacity(grouped.len());
    for (ticker, mut bars) in grouped {
        bars.sort_by_key(|bar| bar.date);
        let before = bars.len();
        bars.dedup_by_key(|bar| bar.date);
        let duplicates = before - bars.len();
        if duplicates > 0 {
            warn!("{}: dropped {} duplicate date(s)", ticker, duplicates);
        }
        summary.duplicate_dates += duplicates;
        summary.rows_loaded += bars.len();
        series.push(PriceSeries::new(ticker, bars)?);
    }
    summary.instruments = series.len();

    if let Some(wanted) = &wanted {
        for ticker in wanted {
            if !series.iter().any(|s| s.instrument() == ticker.as_str()) {
                warn!("No market data rows found for requested ticker {}", ticker);
            }
        }
    }

    Ok(MarketData { series, summary })
}

fn resolve_columns(headers: &StringRecord) -> Result<HashMap<Field, usize>> {
    let normalized: Vec<String> = headers.iter().map(normalize_header_name).collect();
    let mut columns = HashMap::new();
    let mut missing = Vec::new();
    for field in Field::ALL {
        match normalized
            .iter()
            .position(|name| field.aliases().contains(&name.as_str()))
        {
            Some(idx) => {
                columns.insert(field, idx);
            }
            None => missing.push(field.label()),
        }
    }
    if !missing.is_empty() {
        return Err(anyhow!(
            "Market data header is missing column(s): {} (found: {})",
            missing.join(", "),
            headers.iter().collect::<Vec<_>>().join(", ")
        ));
    }
    Ok(columns)
}

/// Lowercases and strips everything but letters and digits, so that
/// `Adj. Close`, `adj_close` and `AdjClose` compare equal.
fn normalize_header_name(name: &str) -> String {
    name.trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Normalizes a ticker string by trimming whitespace and uppercasing.
pub fn normalize_ticker_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn parse_record(
    record: &StringRecord,
    columns: &HashMap<Field, usize>,
) -> Result<(String, PriceBar)> {
    let ticker = normalize_ticker_symbol(field(record, columns, Field::Ticker)?)
        .ok_or_else(|| anyhow!("empty ticker"))?;
    let date = parse_date(field(record, columns, Field::Date)?)?;
    let bar = PriceBar {
        date,
        open: number(record, columns, Field::Open)?,
        high: number(record, columns, Field::High)?,
        low: number(record, columns, Field::Low)?,
        close: number(record, columns, Field::Close)?,
        adjusted_close: number(record, columns, Field::AdjustedClose)?,
        volume: number(record, columns, Field::Volume)?,
    };
    Ok((ticker, bar))
}

fn field<'a>(
    record: &'a StringRecord,
    columns: &HashMap<Field, usize>,
    name: Field,
) -> Result<&'a str> {
    columns
        .get(&name)
        .and_then(|idx| record.get(*idx))
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing {}", name.label()))
}

fn number(record: &StringRecord, columns: &HashMap<Field, usize>, name: Field) -> Result<f64> {
    let raw = field(record, columns, name)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("{} is not a number ({})", name.label(), raw))?;
    if !value.is_finite() {
        return Err(anyhow!("{} must be finite ({})", name.label(), raw));
    }
    Ok(value)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .ok_or_else(|| anyhow!("unrecognized date ({})", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SIMFIN: &str = "\
Ticker;SimFinId;Date;Open;Low;High;Close;Adj. Close;Dividend;Volume;Shares Outstanding
msft;59265;2020-01-03;158.32;158.06;159.95;158.62;155.79;;21116200;7.6e9
MSFT;59265;2020-01-02;158.78;156.51;160.73;160.62;157.75;;22622100;7.6e9
MSFT;59265;2020-01-03;1.0;1.0;1.0;1.0;1.0;;1;7.6e9
AAPL;111052;2020-01-02;74.06;73.80;75.15;75.09;73.99;;135480400;1.7e10
AAPL;111052;not-a-date;74.29;73.19;74.99;74.36;73.27;;146322800;1.7e10
AAPL;111052;2020-01-06;73.45;73.19;74.99;74.95;73.85;;118387200;1.7e10
AAPL;111052;2020-01-07;74.96;;75.22;74.60;73.51;;108872000;1.7e10
";

    #[test]
    fn reads_semicolon_exports_with_aliases() {
        let options = LoadOptions {
            delimiter: b';',
            tickers: None,
        };
        let data = read_market_data(SIMFIN.as_bytes(), &options).unwrap();

        assert_eq!(data.summary.rows_read, 7);
        assert_eq!(data.summary.malformed_rows, 2);
        assert_eq!(data.summary.duplicate_dates, 1);
        assert_eq!(data.summary.rows_loaded, 4);
        assert_eq!(data.summary.instruments, 2);

        let msft = data.instrument("msft").unwrap();
        assert_eq!(msft.len(), 2);
        assert_eq!(msft.bars()[0].date, NaiveDate::from_ymd_opt(2020, 1, 2).unwrap());
        assert!((msft.bars()[1].close - 158.62).abs() < 1e-9);
        assert!((msft.bars()[1].adjusted_close - 155.79).abs() < 1e-9);

        let aapl = data.instrument("AAPL").unwrap();
        assert_eq!(aapl.closes().len(), 2);
    }

    #[test]
    fn ticker_filter_limits_instruments() {
        let options = LoadOptions {
            delimiter: b';',
            tickers: Some(vec![" aapl ".to_string()]),
        };
        let data = read_market_data(SIMFIN.as_bytes(), &options).unwrap();
        assert_eq!(data.series.len(), 1);
        assert_eq!(data.series[0].instrument(), "AAPL");
    }

    #[test]
    fn missing_columns_are_reported() {
        let csv = "ticker,date,open,high,low,close,volume\nA,2020-01-01,1,1,1,1,1\n";
        let err = read_market_data(csv.as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("adjusted_close"));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Symbol,Date,Open,High,Low,Close,Adj Close,Volume").unwrap();
        writeln!(file, "spy,2021-03-01,380,385,379,384,380.5,1000").unwrap();
        writeln!(file, "spy,2021-03-02,384,386,381,382,378.6,1200").unwrap();

        let data = load_market_data(file.path(), &LoadOptions::default()).unwrap();
        let spy = data.instrument("SPY").unwrap();
        assert_eq!(spy.len(), 2);
        assert!((spy.bars()[1].volume - 1200.0).abs() < 1e-9);
    }
}
