//! Shared domain types: the data each component reads or writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. `timestamp == open_time`, kept as a distinct field
/// because persisted rows and wire payloads both carry it by that name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub timestamp: i64,
}

impl Candle {
    /// True iff the OHLC and non-negativity invariants from the data model
    /// hold. Upstream data is trusted to satisfy this; callers that ingest
    /// third-party data may want to check it explicitly.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.low <= self.high
            && self.volume >= Decimal::ZERO
            && self.quote_volume >= Decimal::ZERO
            && self.taker_buy_volume >= Decimal::ZERO
            && self.taker_buy_quote_volume >= Decimal::ZERO
            && self.trades >= 0
    }
}

/// An order-book depth snapshot. Bids are kept sorted descending by price,
/// asks ascending, each truncated to the configured depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: i64,
    pub last_update_id: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// True iff bids descend strictly, asks ascend strictly, and the spread
    /// is non-negative.
    pub fn is_valid(&self) -> bool {
        let bids_sorted = self.bids.windows(2).all(|pair| pair[0].price > pair[1].price);
        let asks_sorted = self.asks.windows(2).all(|pair| pair[0].price < pair[1].price);
        let spread_ok = match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price <= ask.price,
            _ => true,
        };
        let non_negative = self
            .bids
            .iter()
            .chain(self.asks.iter())
            .all(|level| level.price >= Decimal::ZERO && level.quantity >= Decimal::ZERO);
        bids_sorted && asks_sorted && spread_ok && non_negative
    }

    pub fn truncate(mut self, depth: usize) -> Self {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
        self
    }
}

/// Per-symbol ingestion progress, persisted in `collector_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorState {
    pub symbol: String,
    pub last_timestamp: i64,
    pub is_realtime: bool,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: &str, high: &str, low: &str, close: &str) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            open_time: 0,
            close_time: 59_999,
            open: open.parse().unwrap(),
            high: high.parse().unwrap(),
            low: low.parse().unwrap(),
            close: close.parse().unwrap(),
            volume: Decimal::ONE,
            quote_volume: Decimal::ONE,
            trades: 1,
            taker_buy_volume: Decimal::ZERO,
            taker_buy_quote_volume: Decimal::ZERO,
            timestamp: 0,
        }
    }

    #[test]
    fn candle_invariant_holds_for_ordinary_bar() {
        assert!(candle("100", "103", "99", "102").is_valid());
    }

    #[test]
    fn candle_invariant_rejects_high_below_close() {
        assert!(!candle("100", "99", "98", "102").is_valid());
    }

    #[test]
    fn orderbook_invariant_checks_ordering_and_spread() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 0,
            last_update_id: 1,
            bids: vec![
                PriceLevel { price: "100".parse().unwrap(), quantity: "1".parse().unwrap() },
                PriceLevel { price: "99".parse().unwrap(), quantity: "1".parse().unwrap() },
            ],
            asks: vec![
                PriceLevel { price: "101".parse().unwrap(), quantity: "1".parse().unwrap() },
                PriceLevel { price: "102".parse().unwrap(), quantity: "1".parse().unwrap() },
            ],
        };
        assert!(book.is_valid());
    }

    #[test]
    fn orderbook_invariant_rejects_crossed_book() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 0,
            last_update_id: 1,
            bids: vec![PriceLevel { price: "105".parse().unwrap(), quantity: "1".parse().unwrap() }],
            asks: vec![PriceLevel { price: "101".parse().unwrap(), quantity: "1".parse().unwrap() }],
        };
        assert!(!book.is_valid());
    }

    #[test]
    fn truncate_keeps_only_requested_depth() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 0,
            last_update_id: 1,
            bids: vec![
                PriceLevel { price: "100".parse().unwrap(), quantity: "1".parse().unwrap() },
                PriceLevel { price: "99".parse().unwrap(), quantity: "1".parse().unwrap() },
                PriceLevel { price: "98".parse().unwrap(), quantity: "1".parse().unwrap() },
            ],
            asks: vec![],
        }
        .truncate(2);
        assert_eq!(book.bids.len(), 2);
    }
}
