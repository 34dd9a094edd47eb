//! Per-ticker bar files on disk.
//!
//! Files are written with the header `timestamp,open,high,low,close,volume`.
//! The reader also understands the two layouts older downloads produced:
//! a `time,open,high,low,close,Volume` file and the three-header-row export
//! whose columns are `Price,High,Low,Open,Volume` (price being the close).

use crate::bars::{self, Bar};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use csv::{ReaderBuilder, StringRecord, Writer};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const HEADER: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

#[derive(Debug, Error)]
pub enum CsvFormatError {
    #[error("unrecognised header: {0}")]
    UnknownHeader(String),
    #[error("row {row}: bad {field} value {value:?}")]
    BadValue {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("row {row}: expected at least {expected} columns, found {found}")]
    ShortRow {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Column positions of the fields inside one detected layout.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    skip_rows: usize,
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
}

impl Layout {
    fn width(&self) -> usize {
        [self.timestamp, self.open, self.high, self.low, self.close, self.volume]
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1
    }
}

fn detect_layout(first: &StringRecord) -> Result<Layout, CsvFormatError> {
    let names: Vec<String> = first.iter().map(|f| f.trim().to_ascii_lowercase()).collect();
    let find = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));

    // Legacy export: "Price,Close,High,..." then a "Ticker" row and a "Datetime" row.
    if names.first().map(String::as_str) == Some("price") {
        return Ok(Layout {
            skip_rows: 3,
            timestamp: 0,
            close: 1,
            high: 2,
            low: 3,
            open: 4,
            volume: 5,
        });
    }

    let columns = (
        find(&["timestamp", "time", "datetime", "date"]),
        find(&["open"]),
        find(&["high"]),
        find(&["low"]),
        find(&["close"]),
        find(&["volume"]),
    );

    match columns {
        (Some(timestamp), Some(open), Some(high), Some(low), Some(close), volume) => Ok(Layout {
            skip_rows: 1,
            timestamp,
            open,
            high,
            low,
            close,
            // Volume is optional in hand-made files; point past the row and treat as 0.
            volume: volume.unwrap_or(usize::MAX),
        }),
        _ => Err(CsvFormatError::UnknownHeader(names.join(","))),
    }
}

/// Accepts RFC 3339, pandas-style `YYYY-MM-DD HH:MM:SS+HH:MM`, or a naive
/// timestamp which is taken as exchange-local.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            let utc = FixedOffset::east_opt(0)?;
            return utc.from_local_datetime(&naive).single();
        }
    }
    None
}

/// Empty or `NaN` price cells mark a bar the exporter had no data for.
fn missing_price(record: &StringRecord, layout: &Layout) -> bool {
    [layout.open, layout.high, layout.low, layout.close].into_iter().any(|idx| {
        record
            .get(idx)
            .map(str::trim)
            .is_some_and(|v| v.is_empty() || v.eq_ignore_ascii_case("nan"))
    })
}

fn parse_row(record: &StringRecord, layout: &Layout, row: usize) -> Result<Bar, CsvFormatError> {
    let needed = if layout.volume == usize::MAX {
        Layout { volume: 0, ..*layout }.width()
    } else {
        layout.width()
    };
    if record.len() < needed {
        return Err(CsvFormatError::ShortRow {
            row,
            expected: needed,
            found: record.len(),
        });
    }

    let number = |idx: usize, field: &'static str| -> Result<f64, CsvFormatError> {
        let value = record.get(idx).unwrap_or("").trim();
        value.parse::<f64>().map_err(|_| CsvFormatError::BadValue {
            row,
            field,
            value: value.to_string(),
        })
    };

    let raw_ts = record.get(layout.timestamp).unwrap_or("");
    let timestamp = parse_timestamp(raw_ts).ok_or_else(|| CsvFormatError::BadValue {
        row,
        field: "timestamp",
        value: raw_ts.to_string(),
    })?;

    let volume = if layout.volume == usize::MAX {
        0.0
    } else {
        number(layout.volume, "volume")?
    };

    Ok(Bar {
        timestamp,
        open: number(layout.open, "open")?,
        high: number(layout.high, "high")?,
        low: number(layout.low, "low")?,
        close: number(layout.close, "close")?,
        volume,
    })
}

/// Reads a bar file in any supported layout, sorted with duplicate timestamps removed.
pub fn read_bars(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut records = reader.records();
    let first = match records.next() {
        Some(record) => record?,
        None => return Ok(Vec::new()),
    };
    let layout = detect_layout(&first)?;

    let mut out = Vec::new();
    let mut gaps = 0;
    // Row numbers are 1-based file lines for error messages.
    for (i, record) in records.enumerate().skip(layout.skip_rows - 1) {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if missing_price(&record, &layout) {
            gaps += 1;
            continue;
        }
        out.push(parse_row(&record, &layout, i + 2)?);
    }
    if gaps > 0 {
        debug!(path = %path.display(), rows = gaps, "skipped rows without prices");
    }

    Ok(bars::normalize(out))
}

/// Writes bars through a `.tmp` sibling and renames it into place.
pub fn write_bars(path: &Path, bars: &[Bar]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("csv.tmp");

    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(HEADER)?;
        for bar in bars {
            writer.write_record([
                bar.timestamp.to_rfc3339(),
                bar.open.to_string(),
                bar.high.to_string(),
                bar.low.to_string(),
                bar.close.to_string(),
                bar.volume.to_string(),
            ])?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn ticker_file(data_dir: &Path, ticker: &str) -> PathBuf {
    data_dir.join(format!("{}_5min.csv", ticker))
}

/// `IVV_5min.csv` -> `IVV`; anything else falls back to the whole stem.
pub fn ticker_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.split_once('_') {
        Some((ticker, _)) if !ticker.is_empty() => ticker.to_string(),
        _ => stem,
    }
}

/// A single file is returned as-is; a directory yields its `*.csv` files, sorted.
pub fn collect_csv_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    Ok(files)
}
