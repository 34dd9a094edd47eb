use crate::download::DownloadSummary;
use crate::strategy::{BacktestStats, Side};
use crate::timing::{Interpretation, TimingReport, TimingStats};
use chrono::DateTime;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

/// Fades rows from full brightness (top ratio) down to 40%.
fn get_visibility_ratio(current_pct: f64, top_pct: f64) -> f64 {
    if top_pct <= 0.0 {
        1.0
    } else {
        (0.4 + 0.6 * (current_pct / top_pct)).clamp(0.4, 1.0)
    }
}

fn format_timestamp(ts_ms: i64) -> String {
    if ts_ms == 0 {
        return "Never".to_string();
    }
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%d-%m-%Y %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown Time".to_string())
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let cell = Cell::new(name).add_attribute(Attribute::Bold);
            if i > 1 {
                cell.set_alignment(CellAlignment::Right)
            } else {
                cell
            }
        })
        .collect()
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn count_cell(count: usize, pct: f64) -> Cell {
    Cell::new(format!("{} ({:.2}%)", count, pct)).set_alignment(CellAlignment::Right)
}

fn period(stats: &TimingStats) -> String {
    match (stats.first_date, stats.last_date) {
        (Some(first), Some(last)) => format!("{} to {}", first, last),
        _ => "N/A".to_string(),
    }
}

/// Builds the per-ticker timing table, best "either" percentage first.
pub fn timing_table(report: &TimingReport) -> Table {
    let n = report.bars_checked;
    let high = format!("High in first {}", n);
    let low = format!("Low in first {}", n);
    let both = format!("Both in first {}", n);

    let mut table = new_table();
    table.set_header(header(&[
        "Rank",
        "Ticker",
        "Period",
        "Days",
        high.as_str(),
        low.as_str(),
        both.as_str(),
        "Either (%)",
        "Verdict",
    ]));

    let mut ranked: Vec<&TimingStats> = report.results.iter().collect();
    ranked.sort_by(|a, b| b.either_pct().total_cmp(&a.either_pct()));

    let top_pct = ranked.first().map_or(1.0, |s| s.either_pct());

    for (i, stats) in ranked.iter().enumerate() {
        let ratio = get_visibility_ratio(stats.either_pct(), top_pct);
        let cyan_val = (255.0 * ratio) as u8;
        let green_val = (255.0 * ratio) as u8;

        table.add_row(vec![
            Cell::new(i + 1).fg(Color::DarkGrey),
            Cell::new(&stats.ticker).fg(Color::Rgb {
                r: 0,
                g: cyan_val,
                b: cyan_val,
            }),
            Cell::new(period(stats)).fg(Color::DarkGrey),
            Cell::new(stats.total_days).set_alignment(CellAlignment::Right),
            count_cell(stats.high_count, stats.high_pct()),
            count_cell(stats.low_count, stats.low_pct()),
            count_cell(stats.both_count, stats.both_pct()),
            Cell::new(format!("{:.2}%", stats.either_pct()))
                .fg(Color::Rgb {
                    r: 0,
                    g: green_val,
                    b: 0,
                })
                .set_alignment(CellAlignment::Right),
            Cell::new(stats.interpretation()).fg(Color::DarkGrey),
        ]);
    }

    table
}

/// Text lines that follow the table: average, interpretation and failures.
pub fn summary_lines(report: &TimingReport) -> Vec<String> {
    let n = report.bars_checked;
    let mut lines = Vec::new();

    if let Some(avg) = report.average_either_pct {
        let verdict = if Interpretation::supports_half_claim(avg) {
            "SUPPORTED"
        } else {
            "NOT SUPPORTED"
        };
        lines.push(format!(
            "Average across {} ticker(s): {:.2}% of days have the high or low in the first {} bars",
            report.results.len(),
            avg,
            n
        ));
        lines.push(format!(
            "Interpretation: {}. The claim of ~50% probability is {} by this analysis.",
            Interpretation::from_pct(avg),
            verdict
        ));
    } else {
        lines.push("No data found.".to_string());
    }

    if !report.failures.is_empty() {
        lines.push(format!("{} file(s) could not be analyzed:", report.failures.len()));
        for (path, reason) in &report.failures {
            lines.push(format!("  {}: {}", path.display(), reason));
        }
    }

    lines
}

pub fn print_timing(report: &TimingReport) {
    let title = format!(
        "(Timing analysis generated at {} UTC)",
        format_timestamp(report.generated_at)
    );
    if report.results.is_empty() {
        println!("\n{}", title);
    } else {
        println!("\n{}\n{}", title, timing_table(report));
    }
    for line in summary_lines(report) {
        println!("{}", line);
    }
}

pub fn print_download(summary: &DownloadSummary) {
    let mut table = new_table();
    table.set_header(header(&["Ticker", "File", "Rows"]));
    for (ticker, path, rows) in &summary.written {
        table.add_row(vec![
            Cell::new(ticker).fg(Color::Cyan),
            Cell::new(path.display()),
            Cell::new(rows).set_alignment(CellAlignment::Right),
        ]);
    }
    for (ticker, reason) in &summary.failed {
        table.add_row(vec![
            Cell::new(ticker).fg(Color::Red),
            Cell::new(reason).fg(Color::DarkGrey),
            Cell::new("-").set_alignment(CellAlignment::Right),
        ]);
    }

    println!("\n{}", table);
    println!(
        "Downloaded {} ticker(s), {} failed.",
        summary.written.len(),
        summary.failed.len()
    );
}

/// Headline numbers of a backtest, then the most recent trades.
pub fn backtest_tables(ticker: &str, stats: &BacktestStats, recent: usize) -> (Table, Table) {
    let slow_ema = match (stats.last_ema_slow, stats.trend()) {
        (Some(ema), Some(Side::Long)) => format!("{:.2} (close above)", ema),
        (Some(ema), _) => format!("{:.2} (close below)", ema),
        (None, _) => "warming up".to_string(),
    };

    let mut summary = new_table();
    summary.set_header(header(&["Metric", ticker]));
    let rows: Vec<(&str, String)> = vec![
        ("Bars", stats.bars.to_string()),
        ("Trades", stats.trades.len().to_string()),
        ("Win rate", format!("{:.2}%", stats.win_rate())),
        ("Start equity", format!("{:.2}", stats.start_equity)),
        ("Final equity", format!("{:.2}", stats.final_equity)),
        ("Return", format!("{:.2}%", stats.total_return_pct)),
        ("Max drawdown", format!("{:.2}%", stats.max_drawdown_pct)),
        ("Bullish divergences", stats.bullish_divergences.to_string()),
        ("Bearish divergences", stats.bearish_divergences.to_string()),
        ("Quad rotation bars", stats.quad_rotation_bars.to_string()),
        ("Embedded bars", stats.embedded_bars.to_string()),
        ("Slow EMA", slow_ema),
    ];
    for (name, value) in rows {
        summary.add_row(vec![
            Cell::new(name).fg(Color::DarkGrey),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    }

    let mut trades = new_table();
    trades.set_header(header(&["Side", "Entry", "Exit", "Entry px", "Exit px", "P&L", "Reason"]));
    let skip = stats.trades.len().saturating_sub(recent);
    for trade in stats.trades.iter().skip(skip) {
        let colour = if trade.pnl > 0.0 { Color::Green } else { Color::Red };
        trades.add_row(vec![
            Cell::new(trade.side),
            Cell::new(trade.entry_time.format("%Y-%m-%d %H:%M")),
            Cell::new(trade.exit_time.format("%Y-%m-%d %H:%M")),
            Cell::new(format!("{:.2}", trade.entry_price)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}", trade.exit_price)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2} ({:.2}%)", trade.pnl, trade.return_pct))
                .fg(colour)
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:?}", trade.exit_reason)).fg(Color::DarkGrey),
        ]);
    }

    (summary, trades)
}

pub fn print_backtest(ticker: &str, stats: &BacktestStats, recent: usize) {
    let (summary, trades) = backtest_tables(ticker, stats, recent);
    println!("\n{}", summary);
    if !stats.trades.is_empty() {
        println!("\nLast {} trade(s):\n{}", recent.min(stats.trades.len()), trades);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn stats(ticker: &str, either_count: usize, total_days: usize) -> TimingStats {
        TimingStats {
            ticker: ticker.to_string(),
            either_count,
            total_days,
            ..TimingStats::default()
        }
    }

    fn report(results: Vec<TimingStats>) -> TimingReport {
        let average_either_pct = crate::timing::average_either(&results);
        TimingReport {
            generated_at: 1_735_828_200_000,
            bars_checked: 6,
            results,
            failures: vec![(PathBuf::from("data/BAD_5min.csv"), "no data".to_string())],
            average_either_pct,
        }
    }

    #[test]
    fn visibility_ratio_is_clamped() {
        assert_eq!(get_visibility_ratio(50.0, 50.0), 1.0);
        assert_eq!(get_visibility_ratio(0.0, 50.0), 0.4);
        assert_eq!(get_visibility_ratio(10.0, 0.0), 1.0);
    }

    #[test]
    fn timestamps_format_in_utc() {
        assert_eq!(format_timestamp(0), "Never");
        assert_eq!(format_timestamp(1_735_828_200_000), "02-01-2025 14:30:00");
    }

    #[test]
    fn table_ranks_by_either_pct() {
        let rendered = timing_table(&report(vec![stats("SPY", 1, 4), stats("IVV", 3, 4)])).to_string();
        let ivv = rendered.find("IVV").unwrap();
        let spy = rendered.find("SPY").unwrap();
        assert!(ivv < spy);
        assert!(rendered.contains("75.00%"));
        assert!(rendered.contains("High in first 6"));
    }

    #[test]
    fn summary_mentions_average_verdict_and_failures() {
        let lines = summary_lines(&report(vec![stats("IVV", 1, 2), stats("SPY", 1, 2)]));
        assert!(lines[0].contains("50.00%"));
        assert!(lines[1].contains("AROUND 50%"));
        assert!(lines[1].contains("is SUPPORTED"));
        assert!(lines[2].starts_with("1 file(s)"));
        assert!(lines[3].contains("BAD_5min.csv"));
    }

    #[test]
    fn backtest_summary_lists_metrics() {
        let stats = BacktestStats {
            bars: 10,
            start_equity: 100.0,
            final_equity: 110.0,
            total_return_pct: 10.0,
            last_close: Some(105.0),
            last_ema_slow: Some(101.5),
            ..BacktestStats::default()
        };
        let (summary, trades) = backtest_tables("IVV", &stats, 5);
        let rendered = summary.to_string();
        assert!(rendered.contains("IVV"));
        assert!(rendered.contains("101.50 (close above)"));
        assert!(rendered.contains("110.00"));
        assert!(rendered.contains("10.00%"));
        assert!(!trades.to_string().contains("LONG"));
    }

    #[test]
    fn empty_report_says_so() {
        let lines = summary_lines(&report(Vec::new()));
        assert_eq!(lines[0], "No data found.");
    }
}
