use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// One five-minute OHLCV record, timestamped in exchange-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn body_low(&self) -> f64 {
        self.open.min(self.close)
    }

    pub fn body_high(&self) -> f64 {
        self.open.max(self.close)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

// Lets `ta` stochastic indicators consume bars directly.
impl ta::High for Bar {
    fn high(&self) -> f64 {
        self.high
    }
}

impl ta::Low for Bar {
    fn low(&self) -> f64 {
        self.low
    }
}

impl ta::Close for Bar {
    fn close(&self) -> f64 {
        self.close
    }
}

/// Regular trading session bounds, both inclusive, in exchange-local time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Session {
    #[serde(with = "hhmm")]
    pub open: NaiveTime,
    #[serde(with = "hhmm")]
    pub close: NaiveTime,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
        }
    }
}

impl Session {
    pub fn contains(&self, bar: &Bar) -> bool {
        let t = bar.timestamp.time();
        t >= self.open && t <= self.close
    }

    pub fn filter(&self, bars: Vec<Bar>) -> Vec<Bar> {
        bars.into_iter().filter(|b| self.contains(b)).collect()
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(de::Error::custom)
    }
}

/// All session bars of one calendar day, in timestamp order.
#[derive(Debug, Clone)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub bars: Vec<Bar>,
}

/// Sorts by timestamp and drops repeated timestamps, keeping the first seen.
pub fn normalize(mut bars: Vec<Bar>) -> Vec<Bar> {
    // Stable sort so "first seen" survives among equal timestamps.
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    bars
}

/// Splits an ordered series into trading days by local calendar date.
pub fn group_by_day(bars: &[Bar]) -> Vec<TradingDay> {
    let mut days: Vec<TradingDay> = Vec::new();

    for bar in bars {
        let date = bar.timestamp.date_naive();
        match days.last_mut() {
            Some(day) if day.date == date => day.bars.push(bar.clone()),
            _ => days.push(TradingDay {
                date,
                bars: vec![bar.clone()],
            }),
        }
    }

    days
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Bar;
    use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone};

    pub fn eastern() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    pub fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        eastern()
            .from_local_datetime(&date.and_hms_opt(hour, minute, 0).unwrap())
            .unwrap()
    }

    pub fn bar(ts: DateTime<FixedOffset>, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        }
    }

    /// A full session of flat bars from 09:30 with the given count.
    pub fn flat_day(date: NaiveDate, count: usize) -> Vec<Bar> {
        let start = at(date, 9, 30);
        (0..count)
            .map(|i| {
                let ts = start + Duration::minutes(5 * i as i64);
                bar(ts, 100.0, 100.5, 99.5, 100.0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn normalize_sorts_and_keeps_first_duplicate() {
        let a = bar(at(day(3), 9, 35), 1.0, 2.0, 0.5, 1.5);
        let b = bar(at(day(3), 9, 30), 1.0, 2.0, 0.5, 1.5);
        let dup = bar(at(day(3), 9, 35), 9.0, 9.0, 9.0, 9.0);

        let out = normalize(vec![a.clone(), b.clone(), dup]);
        assert_eq!(out, vec![b, a]);
    }

    #[test]
    fn groups_by_local_date() {
        let mut bars = flat_day(day(3), 3);
        bars.extend(flat_day(day(4), 2));

        let days = group_by_day(&bars);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, day(3));
        assert_eq!(days[0].bars.len(), 3);
        assert_eq!(days[1].bars.len(), 2);
    }

    #[test]
    fn session_bounds_are_inclusive() {
        let session = Session::default();
        let bars = vec![
            bar(at(day(3), 9, 25), 1.0, 1.0, 1.0, 1.0),
            bar(at(day(3), 9, 30), 1.0, 1.0, 1.0, 1.0),
            bar(at(day(3), 16, 0), 1.0, 1.0, 1.0, 1.0),
            bar(at(day(3), 16, 5), 1.0, 1.0, 1.0, 1.0),
        ];

        let kept = session.filter(bars);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].timestamp, at(day(3), 9, 30));
        assert_eq!(kept[1].timestamp, at(day(3), 16, 0));
    }

    #[test]
    fn session_roundtrips_as_hhmm() {
        let json = serde_json::to_string(&Session::default()).unwrap();
        assert_eq!(json, r#"{"open":"09:30","close":"16:00"}"#);
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Session::default());
    }
}
