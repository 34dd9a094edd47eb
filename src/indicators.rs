use crate::bars::Bar;
use anyhow::{Result, anyhow};
use ta::Next;
use ta::indicators::{ExponentialMovingAverage, FastStochastic, SimpleMovingAverage};

/// Stochastic %K over `period` bars, smoothed by an SMA of `smooth` values.
/// Entries stay `None` until both windows are full.
pub fn stochastic_k(bars: &[Bar], period: usize, smooth: usize) -> Result<Vec<Option<f64>>> {
    let mut fast = FastStochastic::new(period)
        .map_err(|e| anyhow!("invalid stochastic period {}: {:?}", period, e))?;
    let mut sma = SimpleMovingAverage::new(smooth)
        .map_err(|e| anyhow!("invalid stochastic smoothing {}: {:?}", smooth, e))?;
    let warmup = period + smooth - 1;

    Ok(bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            let k = sma.next(fast.next(bar));
            (i + 1 >= warmup).then_some(k)
        })
        .collect())
}

/// EMA of `values`; `None` until `period` values have been seen.
pub fn ema(values: &[f64], period: usize) -> Result<Vec<Option<f64>>> {
    let mut indicator = ExponentialMovingAverage::new(period)
        .map_err(|e| anyhow!("invalid EMA period {}: {:?}", period, e))?;

    Ok(values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let value = indicator.next(v);
            (i + 1 >= period).then_some(value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::test_support::*;
    use chrono::{Duration, NaiveDate};

    fn rising(count: usize) -> Vec<Bar> {
        let start = at(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), 9, 30);
        (0..count)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(start + Duration::minutes(5 * i as i64), base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect()
    }

    #[test]
    fn stochastic_warms_up_then_stays_in_range() {
        let bars = rising(30);
        let k = stochastic_k(&bars, 9, 3).unwrap();
        assert_eq!(k.len(), 30);
        assert!(k[..10].iter().all(Option::is_none));
        assert!(k[10..].iter().all(|v| v.is_some_and(|x| (0.0..=100.0).contains(&x))));
    }

    #[test]
    fn stochastic_tracks_close_within_range() {
        // In a steady climb the close sits near the top of the lookback range.
        let bars = rising(20);
        let k = stochastic_k(&bars, 5, 1).unwrap();
        let last = k[19].unwrap();
        assert!(last > 80.0, "got {}", last);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(stochastic_k(&rising(5), 0, 1).is_err());
        assert!(ema(&[1.0, 2.0], 0).is_err());
    }

    #[test]
    fn ema_of_constant_is_constant() {
        let out = ema(&[5.0; 10], 4).unwrap();
        assert!(out[..3].iter().all(Option::is_none));
        assert!(out[3..].iter().all(|v| (v.unwrap() - 5.0).abs() < 1e-12));
    }
}
