//! Orchestration behind the subcommands.

use crate::download::{self, DownloadSummary, FetchWindow};
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use crate::timing::{self, TimingReport};
use crate::{csv_store, report, strategy, tickers};
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use std::path::Path;
use tracing::{info, warn};

/// Picks the request window from optional CLI dates, falling back to a period.
pub fn fetch_window(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    period: &str,
) -> Result<FetchWindow> {
    match (start, end) {
        (None, None) => Ok(FetchWindow::Period(period.to_string())),
        (Some(start), end) => {
            let end = end.unwrap_or_else(|| Utc::now().date_naive() + Duration::days(1));
            if end <= start {
                anyhow::bail!("end date {} must be after start date {}", end, start);
            }
            Ok(FetchWindow::Dates { start, end })
        }
        (None, Some(_)) => anyhow::bail!("--end requires --start"),
    }
}

/// CLI tickers win, then the config list, then an interactive prompt.
pub fn resolve_tickers(cli: &[String], config: &AppConfig) -> Result<Vec<String>> {
    resolve_tickers_with(cli, config, tickers::prompt)
}

fn resolve_tickers_with(
    cli: &[String],
    config: &AppConfig,
    ask: impl FnOnce() -> Result<Vec<String>>,
) -> Result<Vec<String>> {
    let raw = if !cli.is_empty() {
        cli.to_vec()
    } else if !config.download.tickers.is_empty() {
        config.download.tickers.clone()
    } else {
        return ask();
    };

    let (valid, rejected) = tickers::partition(&raw);
    for symbol in &rejected {
        warn!(symbol = %symbol, "ignoring invalid ticker symbol");
    }
    if valid.is_empty() {
        anyhow::bail!("no valid ticker symbols given");
    }
    Ok(valid)
}

pub async fn download(
    tickers: &[String],
    window: &FetchWindow,
    config: &AppConfig,
) -> Result<DownloadSummary> {
    info!(count = tickers.len(), window = ?window, "downloading");
    let summary = download::run(tickers, &config.download, window, &config.session).await?;
    report::print_download(&summary);
    Ok(summary)
}

/// Analyzes a file or every CSV in a directory, prints and persists the report.
pub async fn analyze(
    path: &Path,
    config: &AppConfig,
    storage: &AsyncStorageManager,
) -> Result<TimingReport> {
    let files = csv_store::collect_csv_files(path)?;
    if files.is_empty() {
        anyhow::bail!("no CSV files found in {}", path.display());
    }
    analyze_files(&files, config, storage).await
}

async fn analyze_files(
    files: &[std::path::PathBuf],
    config: &AppConfig,
    storage: &AsyncStorageManager,
) -> Result<TimingReport> {
    let n = config.analysis.bars;
    info!(files = files.len(), bars = n, "analyzing");

    let report = timing::run(files, n, config.analysis.include_short_days)?;
    report::print_timing(&report);
    storage.save("results", &report).await?;
    Ok(report)
}

/// Runs the full pipeline:
/// 1. Resolves and validates the tickers.
/// 2. Downloads session bars, one CSV per ticker.
/// 3. Analyzes the files that were written.
pub async fn run_analysis_pipeline(
    tickers: &[String],
    window: &FetchWindow,
    config: &AppConfig,
    storage: &AsyncStorageManager,
) -> Result<TimingReport> {
    let summary = download(tickers, window, config).await?;
    let files = summary.files();
    if files.is_empty() {
        anyhow::bail!("no ticker downloaded successfully ({} failed)", summary.failed.len());
    }
    analyze_files(&files, config, storage).await
}

pub fn backtest(path: &Path, config: &AppConfig, recent: usize) -> Result<()> {
    let bars = csv_store::read_bars(path)?;
    if bars.is_empty() {
        anyhow::bail!("no data found in {}", path.display());
    }
    let ticker = csv_store::ticker_from_path(path);
    info!(ticker = %ticker, bars = bars.len(), "backtesting");

    let stats = strategy::backtest(&bars, &config.strategy)
        .with_context(|| format!("Backtest failed for {}", path.display()))?;
    report::print_backtest(&ticker, &stats, recent);
    Ok(())
}
