use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use stockml::commands::analyze::{self, AnalyzeOptions};
use stockml::commands::export_features::{self, ExportFeaturesOptions};
use stockml::config::parse_delimiter;
use stockml::features::NullDropPolicy;

#[derive(Parser)]
#[command(name = "stockml")]
#[command(about = "Per-instrument feature engineering, random forest fitting and evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive features, fit classifier and regressor forests, and evaluate them per instrument
    Analyze {
        /// Delimited price file with ticker, date, OHLC, adjusted close and volume columns
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
        /// Comma separated tickers to analyze (defaults to every ticker in the file)
        #[arg(long, value_delimiter = ',')]
        tickers: Option<Vec<String>>,
        /// KEY=VALUE settings file; STOCKML_* environment variables override it
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
        /// Field delimiter of the price file (e.g. ';' for SimFin exports)
        #[arg(long, value_parser = parse_delimiter)]
        delimiter: Option<u8>,
        /// Write full per-instrument reports as pretty JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Directory for per-instrument classifier explainer bundles
        #[arg(long, value_name = "DIR")]
        explainer_dir: Option<PathBuf>,
        /// Number of trees per forest
        #[arg(long)]
        trees: Option<usize>,
        /// Worker threads for tree fitting (0 uses every core)
        #[arg(long)]
        threads: Option<usize>,
        /// When rows with undefined features are dropped: final or per-horizon
        #[arg(long)]
        null_drop: Option<NullDropPolicy>,
    },
    /// Write the engineered feature table of one instrument as CSV
    Features {
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
        #[arg(long)]
        ticker: String,
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
        #[arg(long, value_parser = parse_delimiter)]
        delimiter: Option<u8>,
        /// Destination CSV (defaults to stdout)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting stockml. Not financial advice.");

    match cli.command {
        Commands::Analyze {
            data,
            tickers,
            settings,
            delimiter,
            output,
            explainer_dir,
            trees,
            threads,
            null_drop,
        } => {
            analyze::run(AnalyzeOptions {
                data,
                tickers,
                settings_path: settings,
                delimiter,
                output,
                explainer_dir,
                trees,
                threads,
                null_drop,
            })?;
        }
        Commands::Features {
            data,
            ticker,
            settings,
            delimiter,
            output,
        } => {
            export_features::run(ExportFeaturesOptions {
                data,
                ticker,
                settings_path: settings,
                delimiter,
                output,
            })?;
        }
    }

    Ok(())
}
