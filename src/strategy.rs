//! Quad-stochastic divergence study.
//!
//! Four stochastic %K lines (fast to slow) drive entries on divergence or on
//! the triple-stochastic flag, and exits when the fast line reaches the
//! opposite extreme while the slow line is not embedded there.

use crate::bars::Bar;
use crate::indicators;
use crate::storage_utils::StrategyConfig;
use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::fmt;
use tracing::debug;

const OVERSOLD: f64 = 20.0;
const OVERBOUGHT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("LONG"),
            Side::Short => f.write_str("SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotKind {
    Low,
    High,
}

/// Extreme of the trailing `window` values. Equal extremes resolve to the
/// latest index. Needs at least `window + 2` values.
pub fn find_pivot(series: &[f64], kind: PivotKind, window: usize) -> Option<(usize, f64)> {
    if window == 0 || series.len() < window + 2 {
        return None;
    }
    let offset = series.len() - window;
    series[offset..]
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if matches!(kind, PivotKind::Low) && v > b => best,
            Some((_, b)) if matches!(kind, PivotKind::High) && v < b => best,
            _ => Some((offset + i, v)),
        })
}

/// Precomputed indicator columns, aligned with the bars.
pub struct Indicators {
    /// %K lines, fastest first.
    pub k: [Vec<Option<f64>>; 4],
    pub ema_fast: Vec<Option<f64>>,
    pub ema_slow: Vec<Option<f64>>,
    pub body_low: Vec<f64>,
    pub body_high: Vec<f64>,
}

impl Indicators {
    pub fn compute(bars: &[Bar], config: &StrategyConfig) -> Result<Self> {
        let [s1, s2, s3, s4] = config.stochastics;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        Ok(Self {
            k: [
                indicators::stochastic_k(bars, s1.0, s1.1)?,
                indicators::stochastic_k(bars, s2.0, s2.1)?,
                indicators::stochastic_k(bars, s3.0, s3.1)?,
                indicators::stochastic_k(bars, s4.0, s4.1)?,
            ],
            ema_fast: indicators::ema(&closes, config.ema_fast)?,
            ema_slow: indicators::ema(&closes, config.ema_slow)?,
            body_low: bars.iter().map(Bar::body_low).collect(),
            body_high: bars.iter().map(Bar::body_high).collect(),
        })
    }

    fn k_at(&self, line: usize, i: usize) -> Option<f64> {
        self.k[line].get(i).copied().flatten()
    }
}

/// Everything the rules look at for one bar.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BarSignals {
    pub oversold: bool,
    pub overbought: bool,
    pub bullish_divergence: bool,
    pub bearish_divergence: bool,
    pub bull_flag: bool,
    pub bear_flag: bool,
    pub quad_rotation: Option<Side>,
    pub embedded: Option<Side>,
}

impl BarSignals {
    pub fn entry(&self, bar: &Bar) -> Option<Side> {
        if (self.oversold && self.bullish_divergence || self.bull_flag) && bar.is_bullish() {
            Some(Side::Long)
        } else if (self.overbought && self.bearish_divergence || self.bear_flag) && bar.is_bearish() {
            Some(Side::Short)
        } else {
            None
        }
    }
}

fn divergence(ind: &Indicators, i: usize, kind: PivotKind, window: usize) -> bool {
    let series = match kind {
        PivotKind::Low => &ind.body_low,
        PivotKind::High => &ind.body_high,
    };
    let upto = &series[..=i];

    // A pivot that is the current bar itself is not a turn yet.
    match find_pivot(upto, kind, window) {
        Some((idx, _)) if idx < i => {}
        _ => return false,
    }
    let Some((prev_idx, prev_val)) = find_pivot(&upto[..upto.len() - 2], kind, window) else {
        return false;
    };
    let (Some(k_now), Some(k_prev)) = (ind.k_at(0, i), ind.k_at(0, prev_idx)) else {
        return false;
    };

    match kind {
        // Lower (or equal) price low with a higher oscillator low.
        PivotKind::Low => upto[i] <= prev_val && k_now > k_prev && k_prev < 25.0,
        PivotKind::High => upto[i] >= prev_val && k_now < k_prev && k_prev > 75.0,
    }
}

fn embedded(ind: &Indicators, i: usize, run: usize) -> Option<Side> {
    let run = run.max(1);
    if i + 1 < run {
        return None;
    }
    let slow: Option<Vec<f64>> = (i + 1 - run..=i).map(|j| ind.k_at(3, j)).collect();
    let slow = slow?;
    if slow.iter().all(|&v| v > OVERBOUGHT) {
        Some(Side::Long)
    } else if slow.iter().all(|&v| v < OVERSOLD) {
        Some(Side::Short)
    } else {
        None
    }
}

pub fn signals_at(ind: &Indicators, i: usize, config: &StrategyConfig) -> BarSignals {
    let k: [Option<f64>; 4] = std::array::from_fn(|line| ind.k_at(line, i));
    let [Some(k9), Some(k14), _, _] = k else {
        return BarSignals::default();
    };

    let quad_rotation = match k {
        [Some(a), Some(b), Some(c), Some(d)] if [a, b, c, d].iter().all(|&v| v < OVERSOLD) => {
            Some(Side::Long)
        }
        [Some(a), Some(b), Some(c), Some(d)] if [a, b, c, d].iter().all(|&v| v > OVERBOUGHT) => {
            Some(Side::Short)
        }
        _ => None,
    };

    let (bull_flag, bear_flag) = match k[3] {
        Some(k60) => (k14 < 30.0 && k60 > OVERBOUGHT, k14 > 70.0 && k60 < OVERSOLD),
        None => (false, false),
    };

    BarSignals {
        oversold: k9 < OVERSOLD && k14 < OVERSOLD,
        overbought: k9 > OVERBOUGHT && k14 > OVERBOUGHT,
        bullish_divergence: divergence(ind, i, PivotKind::Low, config.pivot_window),
        bearish_divergence: divergence(ind, i, PivotKind::High, config.pivot_window),
        bull_flag,
        bear_flag,
        quad_rotation,
        embedded: embedded(ind, i, config.embedded_bars),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    Stop,
    Signal,
    TrendBreak,
    EndOfData,
}

/// Exit on the bar's close, if any rule fires.
fn exit_signal(ind: &Indicators, bar: &Bar, i: usize, side: Side) -> Option<ExitReason> {
    let k9 = ind.k_at(0, i)?;
    let k60 = ind.k_at(3, i);
    let ema = ind.ema_fast.get(i).copied().flatten();

    // The slow line still beyond the extreme means the move is embedded; hold.
    match side {
        Side::Long if k9 > OVERBOUGHT && k60.is_some_and(|v| v < OVERBOUGHT) => Some(ExitReason::Signal),
        Side::Long if ema.is_some_and(|e| bar.close < e) && k9 > 60.0 => Some(ExitReason::TrendBreak),
        Side::Short if k9 < OVERSOLD && k60.is_some_and(|v| v > OVERSOLD) => Some(ExitReason::Signal),
        Side::Short if ema.is_some_and(|e| bar.close > e) && k9 < 40.0 => Some(ExitReason::TrendBreak),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub side: Side,
    pub entry_time: DateTime<FixedOffset>,
    pub exit_time: DateTime<FixedOffset>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub return_pct: f64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone)]
struct Position {
    side: Side,
    units: f64,
    entry_price: f64,
    entry_time: DateTime<FixedOffset>,
    entry_fee: f64,
    stop: f64,
}

impl Position {
    fn value_at(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => self.units * (price - self.entry_price),
            Side::Short => self.units * (self.entry_price - price),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BacktestStats {
    pub bars: usize,
    pub trades: Vec<Trade>,
    pub wins: usize,
    pub start_equity: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub bullish_divergences: usize,
    pub bearish_divergences: usize,
    pub quad_rotation_bars: usize,
    pub embedded_bars: usize,
    pub last_close: Option<f64>,
    /// Slow EMA on the last bar; `None` while it is still warming up.
    pub last_ema_slow: Option<f64>,
}

impl BacktestStats {
    /// Where the last close sits against the slow EMA.
    pub fn trend(&self) -> Option<Side> {
        match (self.last_close, self.last_ema_slow) {
            (Some(close), Some(ema)) if close >= ema => Some(Side::Long),
            (Some(_), Some(_)) => Some(Side::Short),
            _ => None,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades.is_empty() {
            0.0
        } else {
            self.wins as f64 / self.trades.len() as f64 * 100.0
        }
    }
}

struct Account {
    cash: f64,
    commission: f64,
    position: Option<Position>,
    trades: Vec<Trade>,
    peak: f64,
    max_drawdown: f64,
}

impl Account {
    fn open(&mut self, side: Side, bar: &Bar, stop: f64) {
        let fee = self.cash * self.commission;
        let units = (self.cash - fee) / bar.close;
        self.cash -= fee;
        debug!(%side, price = bar.close, stop, time = %bar.timestamp, "enter");
        self.position = Some(Position {
            side,
            units,
            entry_price: bar.close,
            entry_time: bar.timestamp,
            entry_fee: fee,
            stop,
        });
    }

    fn close(&mut self, price: f64, time: DateTime<FixedOffset>, reason: ExitReason) {
        let Some(pos) = self.position.take() else {
            return;
        };
        let gross = pos.value_at(price);
        let exit_fee = pos.units * price * self.commission;
        // The entry fee already left `cash` in `open`, but it belongs to this trade.
        let pnl = gross - pos.entry_fee - exit_fee;
        let notional = pos.units * pos.entry_price;
        self.cash += gross - exit_fee;
        debug!(side = %pos.side, price, pnl, ?reason, "exit");
        self.trades.push(Trade {
            side: pos.side,
            entry_time: pos.entry_time,
            exit_time: time,
            entry_price: pos.entry_price,
            exit_price: price,
            pnl,
            return_pct: if notional > 0.0 { pnl / notional * 100.0 } else { 0.0 },
            exit_reason: reason,
        });
    }

    fn mark(&mut self, price: f64) {
        let equity = self.cash + self.position.as_ref().map_or(0.0, |p| p.value_at(price));
        self.peak = self.peak.max(equity);
        if self.peak > 0.0 {
            self.max_drawdown = self.max_drawdown.max((self.peak - equity) / self.peak * 100.0);
        }
    }
}

/// Checks a resting stop against this bar. Gaps through the stop fill at the open.
fn stop_fill(pos: &Position, bar: &Bar) -> Option<f64> {
    match pos.side {
        Side::Long if bar.low <= pos.stop => Some(pos.stop.min(bar.open)),
        Side::Short if bar.high >= pos.stop => Some(pos.stop.max(bar.open)),
        _ => None,
    }
}

/// Replays the bars one at a time with at most one open position.
/// Orders fill at the signal bar's close; stops rest from the next bar on.
pub fn backtest(bars: &[Bar], config: &StrategyConfig) -> Result<BacktestStats> {
    let ind = Indicators::compute(bars, config)?;
    let mut account = Account {
        cash: config.cash,
        commission: config.commission,
        position: None,
        trades: Vec::new(),
        peak: config.cash,
        max_drawdown: 0.0,
    };
    let mut stats = BacktestStats {
        bars: bars.len(),
        start_equity: config.cash,
        ..BacktestStats::default()
    };

    for (i, bar) in bars.iter().enumerate() {
        let signals = signals_at(&ind, i, config);
        stats.bullish_divergences += usize::from(signals.bullish_divergence);
        stats.bearish_divergences += usize::from(signals.bearish_divergence);
        stats.quad_rotation_bars += usize::from(signals.quad_rotation.is_some());
        stats.embedded_bars += usize::from(signals.embedded.is_some());

        match account.position.as_ref() {
            Some(pos) => {
                let side = pos.side;
                if let Some(fill) = stop_fill(pos, bar) {
                    account.close(fill, bar.timestamp, ExitReason::Stop);
                } else if let Some(reason) = exit_signal(&ind, bar, i, side) {
                    account.close(bar.close, bar.timestamp, reason);
                }
            }
            None => match signals.entry(bar) {
                Some(Side::Long) => {
                    account.open(Side::Long, bar, bar.low * (1.0 - config.long_stop_pct / 100.0))
                }
                Some(Side::Short) => {
                    account.open(Side::Short, bar, bar.high * (1.0 + config.short_stop_pct / 100.0))
                }
                None => {}
            },
        }

        account.mark(bar.close);
    }

    if let Some(last) = bars.last() {
        account.close(last.close, last.timestamp, ExitReason::EndOfData);
        account.mark(last.close);
    }

    stats.last_close = bars.last().map(|b| b.close);
    stats.last_ema_slow = ind.ema_slow.last().copied().flatten();
    stats.wins = account.trades.iter().filter(|t| t.pnl > 0.0).count();
    stats.trades = account.trades;
    stats.final_equity = account.cash;
    stats.max_drawdown_pct = account.max_drawdown;
    stats.total_return_pct = if config.cash > 0.0 {
        (account.cash / config.cash - 1.0) * 100.0
    } else {
        0.0
    };
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::test_support::*;
    use chrono::{Duration, NaiveDate};

    fn series(closes: &[f64]) -> Vec<Bar> {
        let start = at(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), 9, 30);
        let mut prev = closes[0];
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let open = prev;
                prev = c;
                bar(
                    start + Duration::minutes(5 * i as i64),
                    open,
                    open.max(c) + 0.25,
                    open.min(c) - 0.25,
                    c,
                )
            })
            .collect()
    }

    fn small_config() -> StrategyConfig {
        StrategyConfig {
            stochastics: [(3, 1), (4, 1), (5, 1), (6, 1)],
            ema_fast: 3,
            ema_slow: 10,
            pivot_window: 4,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn pivot_takes_latest_of_equal_extremes() {
        let s = [5.0, 9.0, 1.0, 4.0, 1.0, 3.0, 7.0];
        assert_eq!(find_pivot(&s, PivotKind::Low, 5), Some((4, 1.0)));
        assert_eq!(find_pivot(&s, PivotKind::High, 5), Some((6, 7.0)));
    }

    #[test]
    fn pivot_needs_window_plus_two() {
        assert_eq!(find_pivot(&[1.0, 2.0, 3.0], PivotKind::Low, 2), None);
        assert_eq!(find_pivot(&[1.0, 2.0, 3.0, 4.0], PivotKind::Low, 2), Some((2, 3.0)));
        assert_eq!(find_pivot(&[1.0; 10], PivotKind::Low, 0), None);
    }

    #[test]
    fn entry_needs_a_confirming_candle() {
        let up = series(&[1.0, 2.0])[1].clone();
        let down = series(&[2.0, 1.0])[1].clone();
        let signals = BarSignals {
            oversold: true,
            bullish_divergence: true,
            ..BarSignals::default()
        };
        assert_eq!(signals.entry(&up), Some(Side::Long));
        assert_eq!(signals.entry(&down), None);

        let flag = BarSignals {
            bear_flag: true,
            ..BarSignals::default()
        };
        assert_eq!(flag.entry(&down), Some(Side::Short));
    }

    #[test]
    fn falling_market_reads_as_quad_oversold() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let bars = series(&closes);
        let config = small_config();
        let ind = Indicators::compute(&bars, &config).unwrap();

        let s = signals_at(&ind, 19, &config);
        assert!(s.oversold);
        assert_eq!(s.quad_rotation, Some(Side::Long));
        assert_eq!(s.embedded, Some(Side::Short));
        assert!(!s.overbought);
    }

    #[test]
    fn warmup_bars_carry_no_signals() {
        let bars = series(&[1.0, 2.0, 3.0]);
        let config = StrategyConfig::default();
        let ind = Indicators::compute(&bars, &config).unwrap();
        assert_eq!(signals_at(&ind, 2, &config), BarSignals::default());
    }

    fn handmade(body_low: Vec<f64>, k_fast: Vec<Option<f64>>) -> Indicators {
        let len = body_low.len();
        Indicators {
            k: [k_fast, vec![None; len], vec![None; len], vec![None; len]],
            ema_fast: vec![None; len],
            ema_slow: vec![None; len],
            body_high: body_low.iter().map(|v| v + 1.0).collect(),
            body_low,
        }
    }

    #[test]
    fn bullish_divergence_on_lower_low_with_stronger_oscillator() {
        // Prior pivot 7.0 at index 6 (fast %K 15); now 6.8 at index 9 with %K 30,
        // after a turn at index 8.
        let body_low = vec![10.0, 9.5, 9.0, 8.5, 8.0, 7.5, 7.0, 7.2, 6.5, 6.8];
        let mut k = vec![Some(50.0); 10];
        k[6] = Some(15.0);
        k[9] = Some(30.0);

        let ind = handmade(body_low.clone(), k.clone());
        assert!(divergence(&ind, 9, PivotKind::Low, 4));

        // Oscillator made a lower low too: no divergence.
        k[9] = Some(10.0);
        assert!(!divergence(&handmade(body_low.clone(), k.clone()), 9, PivotKind::Low, 4));

        // Prior oscillator low not deep enough.
        k[9] = Some(30.0);
        k[6] = Some(26.0);
        assert!(!divergence(&handmade(body_low, k), 9, PivotKind::Low, 4));
    }

    #[test]
    fn current_bar_as_pivot_is_not_a_divergence() {
        let body_low = vec![10.0, 9.5, 9.0, 8.5, 8.0, 7.5, 7.0, 7.2, 6.9, 6.5];
        let mut k = vec![Some(50.0); 10];
        k[6] = Some(15.0);
        k[9] = Some(30.0);
        assert!(!divergence(&handmade(body_low, k), 9, PivotKind::Low, 4));
    }

    /// A steady climb, a two-bar dip and a small bounce.
    fn climb_dip_bounce() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..=40).map(|i| 100.0 + i as f64).collect();
        closes.extend([139.0, 138.0, 138.2]);
        closes.extend((1..=20).map(|i| 138.2 + 0.5 * i as f64));
        closes
    }

    fn flag_config() -> StrategyConfig {
        StrategyConfig {
            stochastics: [(3, 1), (3, 1), (5, 1), (30, 1)],
            ema_fast: 5,
            ema_slow: 30,
            pivot_window: 4,
            commission: 0.0,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn bull_flag_enters_on_the_bounce() {
        let bars = series(&climb_dip_bounce());
        let config = flag_config();
        let ind = Indicators::compute(&bars, &config).unwrap();

        let dip = signals_at(&ind, 42, &config);
        assert!(dip.bull_flag);
        assert_eq!(dip.entry(&bars[42]), None);

        let bounce = signals_at(&ind, 43, &config);
        assert!(bounce.bull_flag);
        assert_eq!(bounce.entry(&bars[43]), Some(Side::Long));

        let stats = backtest(&bars, &config).unwrap();
        let first = &stats.trades[0];
        assert_eq!(first.side, Side::Long);
        assert_eq!(first.entry_price, 138.2);
        assert_eq!(first.entry_time, bars[43].timestamp);
    }

    #[test]
    fn stop_fills_at_stop_or_gap_open() {
        let pos = Position {
            side: Side::Long,
            units: 1.0,
            entry_price: 100.0,
            entry_time: at(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), 9, 30),
            entry_fee: 0.0,
            stop: 99.0,
        };
        let mut b = series(&[100.0, 100.0])[1].clone();
        b.low = 98.5;
        assert_eq!(stop_fill(&pos, &b), Some(99.0));
        b.open = 98.0;
        assert_eq!(stop_fill(&pos, &b), Some(98.0));
        b.low = 99.5;
        b.open = 100.0;
        assert_eq!(stop_fill(&pos, &b), None);
    }

    #[test]
    fn backtest_accounts_for_every_trade() {
        let bars = series(&climb_dip_bounce());
        let config = flag_config();

        let stats = backtest(&bars, &config).unwrap();
        assert_eq!(stats.bars, bars.len());
        assert!(!stats.trades.is_empty());

        let pnl: f64 = stats.trades.iter().map(|t| t.pnl).sum();
        assert!((stats.final_equity - (config.cash + pnl)).abs() < 1e-6);
        assert!((0.0..=100.0).contains(&stats.win_rate()));
        assert!(stats.max_drawdown_pct >= 0.0);
        for t in &stats.trades {
            assert!(t.exit_time >= t.entry_time);
        }
    }

    #[test]
    fn trade_pnl_carries_both_commissions() {
        let bars = series(&climb_dip_bounce());
        let config = StrategyConfig {
            commission: 0.001,
            ..flag_config()
        };

        let stats = backtest(&bars, &config).unwrap();
        assert!(!stats.trades.is_empty());
        let pnl: f64 = stats.trades.iter().map(|t| t.pnl).sum();
        assert!((stats.final_equity - (config.cash + pnl)).abs() < 1e-6);

        // Both legs cost money, so net P&L sits below the price move.
        let first = &stats.trades[0];
        let units = config.cash * (1.0 - config.commission) / first.entry_price;
        let gross = units * (first.exit_price - first.entry_price);
        let fees = config.cash * config.commission + units * first.exit_price * config.commission;
        assert!((first.pnl - (gross - fees)).abs() < 1e-6);
    }

    #[test]
    fn commission_can_turn_a_winner_into_a_loss() {
        let mut account = Account {
            cash: 1_000.0,
            commission: 0.01,
            position: None,
            trades: Vec::new(),
            peak: 1_000.0,
            max_drawdown: 0.0,
        };
        let entry = series(&[100.0, 100.0])[1].clone();
        account.open(Side::Long, &entry, 95.0);
        // +0.5% price move, 1% commission on each leg.
        account.close(100.5, entry.timestamp, ExitReason::Signal);

        let trade = &account.trades[0];
        assert!(trade.pnl < 0.0);
        assert!((account.cash - (1_000.0 + trade.pnl)).abs() < 1e-9);
    }

    #[test]
    fn trend_follows_the_slow_ema() {
        let config = flag_config();
        let rising = backtest(&series(&climb_dip_bounce()), &config).unwrap();
        assert!(rising.last_ema_slow.is_some());
        assert_eq!(rising.trend(), Some(Side::Long));

        let falling: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let stats = backtest(&series(&falling), &config).unwrap();
        assert_eq!(stats.trend(), Some(Side::Short));

        // Too short for the slow EMA to warm up.
        let short = backtest(&series(&falling[..10]), &config).unwrap();
        assert_eq!(short.trend(), None);
    }

    #[test]
    fn no_bars_no_trades() {
        let stats = backtest(&[], &StrategyConfig::default()).unwrap();
        assert!(stats.trades.is_empty());
        assert_eq!(stats.final_equity, stats.start_equity);
        assert_eq!(stats.total_return_pct, 0.0);
    }
}
