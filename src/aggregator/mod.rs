//! Online rollup of 1-minute candles into the configured higher timeframes.
//!
//! Mirrors the bucket-and-replace pattern used for lower-timeframe
//! candlestick builders, generalized to the full timeframe set and to the
//! ISO-week/calendar-month special cases. One [`CandleAggregator`] instance
//! is owned exclusively by the hub's broker-subscriber coordinator task —
//! see the module doc on `crate::hub`.

use chrono::{Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::model::Candle;

/// The configured set of higher timeframes, in minutes. `10_080` is one ISO
/// week, `43_200` is the nominal 30-day month used only for period-length
/// math elsewhere; actual month buckets use the calendar month boundary.
pub const TIMEFRAMES_MINUTES: [i64; 13] = [
    1, 3, 5, 15, 30, 45, 60, 120, 180, 240, 1440, 10_080, 43_200,
];

const WEEK_MINUTES: i64 = 10_080;
const MONTH_MINUTES: i64 = 43_200;

pub fn is_known_timeframe(minutes: i64) -> bool {
    TIMEFRAMES_MINUTES.contains(&minutes)
}

/// Accepts either a bare minute count (`"5"`, `"1440"`) or an upstream-style
/// suffixed label (`"5m"`, `"1H"`, `"1D"`, `"1W"`, `"1M"`), returning `None`
/// for anything outside [`TIMEFRAMES_MINUTES`]. Suffix case matters the way
/// it does in the upstream kline API: lowercase `m` is minutes, uppercase
/// `M` is months.
pub fn parse_timeframe_minutes(label: &str) -> Option<i64> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return is_known_timeframe(n).then_some(n);
    }
    let last = trimmed.chars().last()?;
    let digits = &trimmed[..trimmed.len() - last.len_utf8()];
    let n: i64 = digits.parse().ok()?;
    let minutes = match last {
        'm' => n,
        'h' | 'H' => n * 60,
        'd' | 'D' => n * 1440,
        'w' | 'W' => n * WEEK_MINUTES,
        'M' => n * MONTH_MINUTES,
        _ => return None,
    };
    is_known_timeframe(minutes).then_some(minutes)
}

/// Largest multiple of `timeframe_minutes` at or before `t_ms`, except for
/// the week/month special cases (ISO week Monday 00:00 UTC; UTC calendar
/// month start).
pub fn period_start_ms(timeframe_minutes: i64, t_ms: i64) -> i64 {
    if timeframe_minutes == MONTH_MINUTES {
        let dt = Utc.timestamp_millis_opt(t_ms).single().expect("valid timestamp");
        Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
            .single()
            .expect("valid month start")
            .timestamp_millis()
    } else if timeframe_minutes == WEEK_MINUTES {
        let dt = Utc.timestamp_millis_opt(t_ms).single().expect("valid timestamp");
        let days_from_monday = dt.weekday().num_days_from_monday() as i64;
        let monday = dt.date_naive() - chrono::Duration::days(days_from_monday);
        monday
            .and_hms_opt(0, 0, 0)
            .expect("valid midnight")
            .and_utc()
            .timestamp_millis()
    } else {
        let period_ms = timeframe_minutes * 60_000;
        t_ms.div_euclid(period_ms) * period_ms
    }
}

/// Exclusive end of the period starting at `period_start_ms`, in ms.
fn period_end_ms(timeframe_minutes: i64, period_start_ms: i64) -> i64 {
    if timeframe_minutes == MONTH_MINUTES {
        let dt = Utc
            .timestamp_millis_opt(period_start_ms)
            .single()
            .expect("valid timestamp");
        let (next_year, next_month) = if dt.month() == 12 {
            (dt.year() + 1, 1)
        } else {
            (dt.year(), dt.month() + 1)
        };
        Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .expect("valid next month start")
            .timestamp_millis()
    } else if timeframe_minutes == WEEK_MINUTES {
        period_start_ms + 7 * 24 * 60 * 60_000
    } else {
        period_start_ms + timeframe_minutes * 60_000
    }
}

#[derive(Debug, Clone)]
struct Partial {
    period_start: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    quote_volume: Decimal,
    trades: i64,
    taker_buy_volume: Decimal,
    taker_buy_quote_volume: Decimal,
}

impl Partial {
    fn from_input(input: &Candle, period_start: i64) -> Self {
        Self {
            period_start,
            open: input.open,
            high: input.high,
            low: input.low,
            close: input.close,
            volume: input.volume,
            quote_volume: input.quote_volume,
            trades: input.trades,
            taker_buy_volume: input.taker_buy_volume,
            taker_buy_quote_volume: input.taker_buy_quote_volume,
        }
    }

    fn fold(&mut self, input: &Candle) {
        self.high = self.high.max(input.high);
        self.low = self.low.min(input.low);
        self.close = input.close;
        self.volume += input.volume;
        self.quote_volume += input.quote_volume;
        self.trades += input.trades;
        self.taker_buy_volume += input.taker_buy_volume;
        self.taker_buy_quote_volume += input.taker_buy_quote_volume;
    }

    fn to_candle(&self, symbol: &str, timeframe_minutes: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            open_time: self.period_start,
            close_time: period_end_ms(timeframe_minutes, self.period_start) - 1,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trades: self.trades,
            taker_buy_volume: self.taker_buy_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            timestamp: self.period_start,
        }
    }
}

#[derive(Default)]
struct Session {
    partial: Option<Partial>,
    high_water_mark: i64,
}

/// Per-(symbol, timeframe) rollup state, idempotent on the 1-minute input's
/// timestamp: inputs at or before the session's high-water mark are ignored.
#[derive(Default)]
pub struct CandleAggregator {
    sessions: HashMap<(String, i64), Session>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a closed 1-minute candle into every configured higher-timeframe
    /// session (the 1-minute timeframe itself needs no rollup: the input
    /// already is the closed 1-minute candle), returning the closed
    /// higher-timeframe candles this input triggered.
    pub fn ingest_one_minute_candle(&mut self, input: &Candle) -> Vec<(i64, Candle)> {
        let mut closed = Vec::new();
        for &timeframe in TIMEFRAMES_MINUTES.iter().filter(|&&t| t > 1) {
            if let Some(candle) = self.fold_into(timeframe, input) {
                closed.push((timeframe, candle));
            }
        }
        closed
    }

    fn fold_into(&mut self, timeframe_minutes: i64, input: &Candle) -> Option<Candle> {
        let session = self
            .sessions
            .entry((input.symbol.clone(), timeframe_minutes))
            .or_default();

        if input.timestamp <= session.high_water_mark && session.partial.is_some() {
            return None;
        }
        session.high_water_mark = session.high_water_mark.max(input.timestamp);

        let period_start = period_start_ms(timeframe_minutes, input.timestamp);

        match &mut session.partial {
            None => {
                session.partial = Some(Partial::from_input(input, period_start));
                None
            }
            Some(partial) if period_start > partial.period_start => {
                let closed = partial.to_candle(&input.symbol, timeframe_minutes);
                session.partial = Some(Partial::from_input(input, period_start));
                Some(closed)
            }
            Some(partial) if period_start == partial.period_start => {
                partial.fold(input);
                None
            }
            Some(_) => None, // late/out-of-order: ignore
        }
    }

    /// Current partial (in-progress) candle for one (symbol, timeframe), if
    /// a session has been started. Used both for the 5s interim broadcast
    /// and the `/price` endpoint's "consult the aggregator" fallback.
    pub fn current_partial(&self, symbol: &str, timeframe_minutes: i64) -> Option<Candle> {
        self.sessions
            .get(&(symbol.to_string(), timeframe_minutes))
            .and_then(|session| session.partial.as_ref())
            .map(|partial| partial.to_candle(symbol, timeframe_minutes))
    }

    /// Every session's current partial, snapshotted for the periodic
    /// interim broadcast.
    pub fn all_current_partials(&self) -> Vec<((String, i64), Candle)> {
        self.sessions
            .iter()
            .filter_map(|(key, session)| {
                session
                    .partial
                    .as_ref()
                    .map(|partial| (key.clone(), partial.to_candle(&key.0, key.1)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_minute_candle(symbol: &str, open_time: i64, close: &str) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            open_time,
            close_time: open_time + 59_999,
            open: close.parse().unwrap(),
            high: close.parse().unwrap(),
            low: close.parse().unwrap(),
            close: close.parse().unwrap(),
            volume: Decimal::ONE,
            quote_volume: Decimal::ONE,
            trades: 1,
            taker_buy_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            timestamp: open_time,
        }
    }

    #[test]
    fn period_start_buckets_by_floor_division_for_ordinary_timeframes() {
        let nine_oh_three = 1_700_000_000_000i64 / 60_000 * 60_000 + 3 * 60_000;
        let start = period_start_ms(5, nine_oh_three);
        assert_eq!(start % (5 * 60_000), 0);
        assert!(start <= nine_oh_three);
    }

    #[test]
    fn five_minute_aggregation_matches_documented_scenario() {
        let base = 9 * 60 * 60_000i64; // 09:00:00 UTC on the epoch day
        let mut aggregator = CandleAggregator::new();
        let closes = ["100", "101", "99", "102", "103"];

        let mut last_closed = None;
        for (i, close) in closes.iter().enumerate() {
            let candle = one_minute_candle("BTCUSDT", base + i as i64 * 60_000, close);
            let closed = aggregator.fold_into(5, &candle);
            assert!(closed.is_none());
            last_closed = Some(candle);
        }
        assert!(last_closed.is_some());

        let sixth = one_minute_candle("BTCUSDT", base + 5 * 60_000, "104");
        let closed = aggregator.fold_into(5, &sixth).expect("period should close");

        assert_eq!(closed.open_time, base);
        assert_eq!(closed.open.to_string(), "100");
        assert_eq!(closed.high.to_string(), "103");
        assert_eq!(closed.low.to_string(), "99");
        assert_eq!(closed.close.to_string(), "103");
    }

    #[test]
    fn late_duplicate_input_is_ignored_after_close() {
        let base = 9 * 60 * 60_000i64;
        let mut aggregator = CandleAggregator::new();
        for (i, close) in ["100", "101", "99", "102", "103"].iter().enumerate() {
            let candle = one_minute_candle("BTCUSDT", base + i as i64 * 60_000, close);
            aggregator.fold_into(5, &candle);
        }
        let sixth = one_minute_candle("BTCUSDT", base + 5 * 60_000, "104");
        aggregator.fold_into(5, &sixth);

        let duplicate = one_minute_candle("BTCUSDT", base + 2 * 60_000, "999");
        let closed = aggregator.fold_into(5, &duplicate);
        assert!(closed.is_none());
    }

    #[test]
    fn idempotent_on_repeated_feed() {
        let base = 0i64;
        let mut a = CandleAggregator::new();
        let mut b = CandleAggregator::new();
        let inputs: Vec<Candle> = (0..7)
            .map(|i| one_minute_candle("ETHUSDT", base + i * 60_000, "10"))
            .collect();

        let closed_a: Vec<Candle> = inputs.iter().filter_map(|c| a.fold_into(5, c)).collect();
        // Feeding with an exact duplicate interleaved must not change the outcome.
        let mut interleaved = inputs.clone();
        interleaved.insert(3, inputs[2].clone());
        let closed_b: Vec<Candle> = interleaved.iter().filter_map(|c| b.fold_into(5, c)).collect();

        assert_eq!(closed_a.len(), closed_b.len());
    }

    #[test]
    fn month_period_start_lands_on_first_of_month() {
        let t = Utc.with_ymd_and_hms(2025, 6, 17, 14, 30, 0).unwrap().timestamp_millis();
        let start = period_start_ms(MONTH_MINUTES, t);
        let dt = Utc.timestamp_millis_opt(start).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2025, 6, 1));
    }

    #[test]
    fn week_period_start_lands_on_monday() {
        let t = Utc.with_ymd_and_hms(2025, 6, 19, 10, 0, 0).unwrap().timestamp_millis(); // Thursday
        let start = period_start_ms(WEEK_MINUTES, t);
        let dt = Utc.timestamp_millis_opt(start).unwrap();
        assert_eq!(dt.weekday(), chrono::Weekday::Mon);
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (0, 0, 0));
    }

    #[test]
    fn parses_bare_minute_counts_and_suffixed_labels() {
        assert_eq!(parse_timeframe_minutes("5"), Some(5));
        assert_eq!(parse_timeframe_minutes("5m"), Some(5));
        assert_eq!(parse_timeframe_minutes("1H"), Some(60));
        assert_eq!(parse_timeframe_minutes("1h"), Some(60));
        assert_eq!(parse_timeframe_minutes("1D"), Some(1440));
        assert_eq!(parse_timeframe_minutes("1W"), Some(10_080));
        assert_eq!(parse_timeframe_minutes("1M"), Some(43_200));
    }

    #[test]
    fn rejects_unknown_timeframe_labels() {
        assert_eq!(parse_timeframe_minutes("7"), None);
        assert_eq!(parse_timeframe_minutes("2H"), None);
        assert_eq!(parse_timeframe_minutes("bogus"), None);
        assert_eq!(parse_timeframe_minutes(""), None);
    }

    #[test]
    fn current_partial_reflects_last_fold() {
        let mut aggregator = CandleAggregator::new();
        let candle = one_minute_candle("BTCUSDT", 0, "50");
        aggregator.fold_into(1, &candle);
        let partial = aggregator.current_partial("BTCUSDT", 1).unwrap();
        assert_eq!(partial.close.to_string(), "50");
    }
}
