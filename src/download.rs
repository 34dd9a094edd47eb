use crate::bars::{self, Bar, Session};
use crate::csv_store;
use crate::storage_utils::DownloadConfig;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider error {code}: {description}")]
    Provider { code: String, description: String },
    #[error("no data returned for {0}")]
    NoData(String),
    #[error("no bars inside the regular session for {0}")]
    NoSessionData(String),
    #[error("invalid UTC offset {0}s from provider")]
    BadOffset(i32),
    #[error("failed to write {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

// --- Provider response ---

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartData>>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default, rename = "gmtoffset")]
    gmt_offset: i32,
    exchange_timezone_name: Option<String>,
}

/// How provider epoch seconds become exchange-local time.
#[derive(Debug, Clone, Copy)]
enum ExchangeClock {
    /// Named zone: each bar gets the offset in force at its own instant.
    Zone(Tz),
    /// Only the provider's current offset is known.
    Fixed(FixedOffset),
}

impl ExchangeClock {
    fn from_meta(ticker: &str, meta: &ChartMeta) -> Result<Self, FetchError> {
        if let Some(name) = &meta.exchange_timezone_name {
            match name.parse::<Tz>() {
                Ok(tz) => return Ok(Self::Zone(tz)),
                Err(_) => warn!(ticker, zone = %name, "unknown exchange time zone, using gmtoffset"),
            }
        }
        FixedOffset::east_opt(meta.gmt_offset)
            .map(Self::Fixed)
            .ok_or(FetchError::BadOffset(meta.gmt_offset))
    }

    fn local(&self, secs: i64) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Zone(tz) => tz.timestamp_opt(secs, 0).single().map(|t| t.fixed_offset()),
            Self::Fixed(offset) => offset.timestamp_opt(secs, 0).single(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Which slice of history to request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchWindow {
    /// Provider shorthand such as "60d" or "1mo".
    Period(String),
    /// Inclusive start date, exclusive end date.
    Dates { start: NaiveDate, end: NaiveDate },
}

impl FetchWindow {
    fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            FetchWindow::Period(range) => vec![("range", range.clone())],
            FetchWindow::Dates { start, end } => {
                let secs = |d: &NaiveDate| d.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp());
                vec![
                    ("period1", secs(start).unwrap_or_default().to_string()),
                    ("period2", secs(end).unwrap_or_default().to_string()),
                ]
            }
        }
    }
}

/// Turns the provider's column arrays into bars in exchange-local time,
/// dropping any row with a missing field. Bars on either side of a DST
/// change keep their own offset.
fn into_bars(ticker: &str, response: ChartResponse) -> Result<Vec<Bar>, FetchError> {
    if let Some(error) = response.chart.error {
        return Err(FetchError::Provider {
            code: error.code,
            description: error.description,
        });
    }

    let data = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::NoData(ticker.to_string()))?;
    let clock = ExchangeClock::from_meta(ticker, &data.meta)?;
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::NoData(ticker.to_string()))?;

    let field = |col: &[Option<f64>], i: usize| col.get(i).copied().flatten();

    let bars: Vec<Bar> = data
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let timestamp = clock.local(ts)?;
            Some(Bar {
                timestamp,
                open: field(&quote.open, i)?,
                high: field(&quote.high, i)?,
                low: field(&quote.low, i)?,
                close: field(&quote.close, i)?,
                volume: field(&quote.volume, i)?,
            })
        })
        .collect();

    if bars.is_empty() {
        return Err(FetchError::NoData(ticker.to_string()));
    }
    Ok(bars)
}

pub struct YahooClient {
    client: Client,
}

impl YahooClient {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        ticker: &str,
        interval: &str,
        window: &FetchWindow,
    ) -> Result<Vec<Bar>, FetchError> {
        let url = format!("{}/{}", CHART_URL, ticker);
        let mut query = window.query();
        query.push(("interval", interval.to_string()));
        query.push(("includePrePost", "false".to_string()));

        // Provider errors come back as JSON bodies on 4xx, so parse before checking status.
        let response = self.client.get(&url).query(&query).send().await?;
        let status = response.status();
        match response.json::<ChartResponse>().await {
            Ok(body) => into_bars(ticker, body),
            Err(e) if status.is_success() => Err(FetchError::Http(e)),
            Err(_) => Err(FetchError::Provider {
                code: status.as_u16().to_string(),
                description: status.canonical_reason().unwrap_or("unknown").to_string(),
            }),
        }
    }
}

/// Outcome of one ticker's fetch-filter-write pipeline.
#[derive(Debug)]
pub struct TickerOutcome {
    pub ticker: String,
    pub result: Result<(PathBuf, usize), FetchError>,
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub written: Vec<(String, PathBuf, usize)>,
    pub failed: Vec<(String, String)>,
}

impl DownloadSummary {
    pub fn files(&self) -> Vec<PathBuf> {
        self.written.iter().map(|(_, path, _)| path.clone()).collect()
    }
}

async fn store_ticker(
    client: &YahooClient,
    ticker: &str,
    config: &DownloadConfig,
    window: &FetchWindow,
    session: &Session,
) -> Result<(PathBuf, usize), FetchError> {
    let raw = client.fetch(ticker, &config.interval, window).await?;
    let fetched = raw.len();
    let bars = session.filter(bars::normalize(raw));
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return Err(FetchError::NoSessionData(ticker.to_string()));
    };

    let path = csv_store::ticker_file(&config.data_dir, ticker);
    csv_store::write_bars(&path, &bars).map_err(|e| FetchError::Write {
        path: path.clone(),
        message: format!("{:#}", e),
    })?;

    info!(
        ticker,
        fetched,
        kept = bars.len(),
        first = %first.timestamp,
        last = %last.timestamp,
        path = %path.display(),
        "saved session bars"
    );
    Ok((path, bars.len()))
}

async fn fetch_and_store(
    client: &YahooClient,
    ticker: &str,
    config: &DownloadConfig,
    window: &FetchWindow,
    session: &Session,
) -> TickerOutcome {
    TickerOutcome {
        ticker: ticker.to_string(),
        result: store_ticker(client, ticker, config, window, session).await,
    }
}

/// Downloads every ticker in batches, one CSV per ticker. A failing ticker
/// is logged and counted; the run carries on with the rest.
pub async fn run(
    tickers: &[String],
    config: &DownloadConfig,
    window: &FetchWindow,
    session: &Session,
) -> anyhow::Result<DownloadSummary> {
    let client = YahooClient::new()?;
    let batch_size = config.batch_size.max(1);
    let mut summary = DownloadSummary::default();

    for (i, batch) in tickers.chunks(batch_size).enumerate() {
        let start_time = Instant::now();

        let tasks: Vec<_> = batch
            .iter()
            .map(|t| fetch_and_store(&client, t, config, window, session))
            .collect();
        let outcomes = futures::future::join_all(tasks).await;

        for outcome in outcomes {
            match outcome.result {
                Ok((path, rows)) => summary.written.push((outcome.ticker, path, rows)),
                Err(e) => {
                    warn!(ticker = %outcome.ticker, error = %e, "download failed");
                    summary.failed.push((outcome.ticker, e.to_string()));
                }
            }
        }

        if i * batch_size + batch.len() < tickers.len() {
            let pause = Duration::from_millis(config.batch_pause_ms);
            let elapsed = start_time.elapsed();
            if elapsed < pause {
                tokio::time::sleep(pause - elapsed).await;
            }
        }
    }

    info!(
        succeeded = summary.written.len(),
        failed = summary.failed.len(),
        "download finished"
    );
    Ok(summary)
}
