mod analysis;
mod bars;
mod csv_store;
mod download;
mod indicators;
mod report;
mod storage_utils;
mod strategy;
mod tickers;
mod timing;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use storage_utils::{AppConfig, AsyncStorageManager};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opening-bars", version)]
#[command(about = "How often does a stock set its daily high or low in the first N five-minute bars?")]
struct Cli {
    /// Storage directory for config.json and results.json (default: next to the binary)
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct WindowArgs {
    /// Start date (YYYY-MM-DD); overrides --period
    #[arg(long)]
    start: Option<NaiveDate>,

    /// End date (YYYY-MM-DD, exclusive); defaults to today
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Provider period such as 60d (5-minute data only reaches back ~60 days)
    #[arg(long)]
    period: Option<String>,

    /// Directory for the per-ticker CSV files
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download five-minute session bars, one CSV per ticker
    Download {
        /// Ticker symbols (default: config list, else prompt)
        tickers: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Analyze a CSV file or a directory of CSV files
    Analyze {
        /// File or directory (default: the configured data directory)
        path: Option<PathBuf>,

        /// Number of leading bars to check
        #[arg(short, long)]
        bars: Option<usize>,

        /// Count days shorter than --bars instead of skipping them
        #[arg(long)]
        include_short_days: bool,
    },

    /// Download, then analyze what was downloaded
    Run {
        tickers: Vec<String>,

        #[command(flatten)]
        window: WindowArgs,

        /// Number of leading bars to check
        #[arg(short, long)]
        bars: Option<usize>,
    },

    /// Replay the quad-stochastic divergence rules over a CSV file
    Backtest {
        file: PathBuf,

        /// How many of the most recent trades to list
        #[arg(long, default_value = "10")]
        trades: usize,
    },

    /// Print the active configuration and where it lives
    Config,
}

fn apply_window(config: &mut AppConfig, window: &WindowArgs) {
    if let Some(period) = &window.period {
        config.download.period = period.clone();
    }
    if let Some(dir) = &window.data_dir {
        config.download.data_dir = dir.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let storage = match &cli.storage {
        Some(dir) => AsyncStorageManager::at(dir).await?,
        None => AsyncStorageManager::new_relative("storage").await?,
    };
    let mut config = storage.load_config().await?;

    match cli.command {
        Commands::Download { tickers, window } => {
            apply_window(&mut config, &window);
            let fetch = analysis::fetch_window(window.start, window.end, &config.download.period)?;
            let tickers = analysis::resolve_tickers(&tickers, &config)?;
            analysis::download(&tickers, &fetch, &config).await?;
        }
        Commands::Analyze {
            path,
            bars,
            include_short_days,
        } => {
            if let Some(n) = bars {
                config.analysis.bars = n;
            }
            config.analysis.include_short_days |= include_short_days;
            let path = path.unwrap_or_else(|| config.download.data_dir.clone());
            analysis::analyze(&path, &config, &storage).await?;
        }
        Commands::Run {
            tickers,
            window,
            bars,
        } => {
            apply_window(&mut config, &window);
            if let Some(n) = bars {
                config.analysis.bars = n;
            }
            let fetch = analysis::fetch_window(window.start, window.end, &config.download.period)?;
            let tickers = analysis::resolve_tickers(&tickers, &config)?;
            analysis::run_analysis_pipeline(&tickers, &fetch, &config, &storage).await?;
        }
        Commands::Backtest { file, trades } => {
            analysis::backtest(&file, &config, trades)?;
        }
        Commands::Config => {
            println!("{}", storage.base_dir.join("config.json").display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
