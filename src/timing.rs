//! Where in the session do the day's extremes land?
//!
//! For each trading day we check whether the daily high (and low) is already
//! reached within the first N bars, then turn the counts into percentages per
//! ticker and an average across tickers.

use crate::bars::{self, Bar};
use crate::csv_store;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const EPSILON: f64 = 1e-10;

/// Flags for a single trading day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayTiming {
    pub high_in_first: bool,
    pub low_in_first: bool,
    /// Index of the first bar carrying the day's high.
    pub high_index: usize,
    /// Index of the first bar carrying the day's low.
    pub low_index: usize,
}

impl DayTiming {
    pub fn either(&self) -> bool {
        self.high_in_first || self.low_in_first
    }

    pub fn both(&self) -> bool {
        self.high_in_first && self.low_in_first
    }
}

fn extreme_index(values: impl Iterator<Item = f64>, better: impl Fn(f64, f64) -> bool) -> Option<(usize, f64)> {
    values.enumerate().fold(None, |best, (i, v)| match best {
        Some((_, b)) if !better(v, b) => best,
        _ => Some((i, v)),
    })
}

/// Evaluates one day's bars, which must already be in timestamp order.
/// Returns `None` for an empty day. When `n` covers the whole day both flags
/// are trivially true.
pub fn day_timing(day: &[Bar], n: usize) -> Option<DayTiming> {
    let (high_index, day_high) = extreme_index(day.iter().map(|b| b.high), |v, b| v > b)?;
    let (low_index, day_low) = extreme_index(day.iter().map(|b| b.low), |v, b| v < b)?;

    let lead = &day[..n.min(day.len())];
    let lead_high = lead.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
    let lead_low = lead.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

    Some(DayTiming {
        high_in_first: (lead_high - day_high).abs() < EPSILON,
        low_in_first: (lead_low - day_low).abs() < EPSILON,
        high_index,
        low_index,
    })
}

/// Aggregated counts for one ticker's series.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimingStats {
    pub ticker: String,
    pub bars_checked: usize,
    pub total_days: usize,
    pub skipped_days: usize,
    pub high_count: usize,
    pub low_count: usize,
    pub either_count: usize,
    pub both_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

fn pct(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

impl TimingStats {
    pub fn high_pct(&self) -> f64 {
        pct(self.high_count, self.total_days)
    }

    pub fn low_pct(&self) -> f64 {
        pct(self.low_count, self.total_days)
    }

    pub fn either_pct(&self) -> f64 {
        pct(self.either_count, self.total_days)
    }

    pub fn both_pct(&self) -> f64 {
        pct(self.both_count, self.total_days)
    }

    pub fn interpretation(&self) -> Interpretation {
        Interpretation::from_pct(self.either_pct())
    }
}

/// Scans a series day by day. Days shorter than `n` bars are skipped unless
/// `include_short_days` is set.
pub fn analyze_series(ticker: &str, series: &[Bar], n: usize, include_short_days: bool) -> TimingStats {
    let mut stats = TimingStats {
        ticker: ticker.to_string(),
        bars_checked: n,
        ..TimingStats::default()
    };

    for day in bars::group_by_day(series) {
        if day.bars.len() < n && !include_short_days {
            debug!(ticker, date = %day.date, bars = day.bars.len(), "skipping short day");
            stats.skipped_days += 1;
            continue;
        }
        let Some(timing) = day_timing(&day.bars, n) else {
            continue;
        };
        debug!(
            ticker,
            date = %day.date,
            high_index = timing.high_index,
            low_index = timing.low_index,
            "day extremes"
        );

        stats.total_days += 1;
        stats.first_date.get_or_insert(day.date);
        stats.last_date = Some(day.date);
        stats.high_count += usize::from(timing.high_in_first);
        stats.low_count += usize::from(timing.low_in_first);
        stats.either_count += usize::from(timing.either());
        stats.both_count += usize::from(timing.both());
    }

    stats
}

pub fn analyze_file(path: &Path, n: usize, include_short_days: bool) -> Result<TimingStats> {
    let series = csv_store::read_bars(path)?;
    if series.is_empty() {
        anyhow::bail!("no data found in {}", path.display());
    }
    let ticker = csv_store::ticker_from_path(path);
    Ok(analyze_series(&ticker, &series, n, include_short_days))
}

/// Mean of each ticker's either-percentage.
pub fn average_either(results: &[TimingStats]) -> Option<f64> {
    if results.is_empty() {
        return None;
    }
    let sum: f64 = results.iter().map(TimingStats::either_pct).sum();
    Some(sum / results.len() as f64)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    AboveAverage,
    AroundHalf,
    BelowAverage,
}

impl Interpretation {
    pub fn from_pct(either_pct: f64) -> Self {
        if either_pct > 55.0 {
            Interpretation::AboveAverage
        } else if either_pct < 45.0 {
            Interpretation::BelowAverage
        } else {
            Interpretation::AroundHalf
        }
    }

    /// Whether a "roughly half the days" claim holds.
    pub fn supports_half_claim(either_pct: f64) -> bool {
        (40.0..=60.0).contains(&either_pct)
    }
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Interpretation::AboveAverage => "ABOVE AVERAGE",
            Interpretation::AroundHalf => "AROUND 50%",
            Interpretation::BelowAverage => "BELOW AVERAGE",
        };
        f.write_str(text)
    }
}

/// Everything one `analyze` run produced; persisted as `results.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimingReport {
    pub generated_at: i64,
    pub bars_checked: usize,
    pub results: Vec<TimingStats>,
    pub failures: Vec<(PathBuf, String)>,
    pub average_either_pct: Option<f64>,
}

/// Analyzes each file; unreadable files are logged and listed, not fatal.
pub fn run(files: &[PathBuf], n: usize, include_short_days: bool) -> Result<TimingReport> {
    if n == 0 {
        anyhow::bail!("bar count must be at least 1");
    }
    if files.is_empty() {
        anyhow::bail!("no CSV files found");
    }

    let mut results = Vec::with_capacity(files.len());
    let mut failures = Vec::new();

    for path in files {
        match analyze_file(path, n, include_short_days)
            .with_context(|| format!("Error analyzing {}", path.display()))
        {
            Ok(stats) => {
                info!(
                    ticker = %stats.ticker,
                    days = stats.total_days,
                    either_pct = stats.either_pct(),
                    "analyzed"
                );
                results.push(stats);
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "skipping file");
                failures.push((path.clone(), format!("{:#}", e)));
            }
        }
    }

    let average_either_pct = average_either(&results);
    Ok(TimingReport {
        generated_at: Utc::now().timestamp_millis(),
        bars_checked: n,
        results,
        failures,
        average_either_pct,
    })
}
