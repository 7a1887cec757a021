//! Postgres-backed time-series store adapter.
//!
//! Pool sized min=2/max=10, 30s acquire timeout, a 300s idle-in-transaction
//! session timeout, and a 30s per-statement timeout, all set on every new
//! connection so a wedged transaction cannot pin a pool slot forever and a
//! query stuck after its connection was already acquired (lock contention,
//! a stalled TCP session) cannot block its caller past the store call's
//! documented 30s ceiling. Schema bootstrap is explicitly out of scope:
//! [`schema::DDL`] documents the tables this module assumes already exist,
//! for an operator's own migration tooling.

pub mod schema;

use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{Candle, CollectorState, OrderBookSnapshot, PriceLevel};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_IN_TRANSACTION_TIMEOUT_MS: i64 = 300_000;
const STATEMENT_TIMEOUT_MS: i64 = 30_000;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let connect_options = PgConnectOptions::from_str(&config.connection_string())
            .map_err(sqlx::Error::Configuration)?;

        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(
                        format!(
                            "SET idle_in_transaction_session_timeout = {IDLE_IN_TRANSACTION_TIMEOUT_MS}; \
                             SET statement_timeout = {STATEMENT_TIMEOUT_MS}"
                        )
                        .as_str(),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Transactional batch insert; rows colliding on (symbol, timestamp) are
    /// silently skipped.
    pub async fn insert_candles(&self, candles: &[Candle]) -> Result<(), StoreError> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                "INSERT INTO candles (
                    symbol, timestamp, open_time, close_time,
                    open, high, low, close,
                    volume, quote_volume, trades,
                    taker_buy_volume, taker_buy_quote_volume
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
                ON CONFLICT (symbol, timestamp) DO NOTHING",
            )
            .bind(&candle.symbol)
            .bind(candle.timestamp)
            .bind(candle.open_time)
            .bind(candle.close_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.quote_volume)
            .bind(candle.trades)
            .bind(candle.taker_buy_volume)
            .bind(candle.taker_buy_quote_volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Duplicates on (symbol, timestamp) are silently skipped, preserving
    /// rows recorded with the same `last_update_id` but a newer wall-clock
    /// timestamp (intentional per the data model's append-only lifecycle).
    pub async fn insert_orderbook(&self, snapshot: &OrderBookSnapshot) -> Result<(), StoreError> {
        let bids = levels_to_json(&snapshot.bids);
        let asks = levels_to_json(&snapshot.asks);

        sqlx::query(
            "INSERT INTO orderbook_data (symbol, timestamp, last_update_id, bids, asks)
             VALUES ($1,$2,$3,$4,$5)
             ON CONFLICT (symbol, timestamp) DO NOTHING",
        )
        .bind(&snapshot.symbol)
        .bind(snapshot.timestamp)
        .bind(snapshot.last_update_id)
        .bind(bids)
        .bind(asks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_state(&self, state: &CollectorState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO collector_state (symbol, last_timestamp, is_realtime, last_updated)
             VALUES ($1,$2,$3,$4)
             ON CONFLICT (symbol) DO UPDATE SET
                last_timestamp = EXCLUDED.last_timestamp,
                is_realtime = EXCLUDED.is_realtime,
                last_updated = EXCLUDED.last_updated",
        )
        .bind(&state.symbol)
        .bind(state.last_timestamp)
        .bind(state.is_realtime)
        .bind(state.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_last_timestamp(&self, symbol: &str) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_timestamp FROM collector_state WHERE symbol = $1")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(ts,)| ts))
    }

    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe_minutes: i64,
        start_ms: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = if timeframe_minutes <= 1 {
            sqlx::query_as::<_, CandleRow>(
                "SELECT symbol, timestamp, open_time, close_time,
                        open, high, low, close, volume, quote_volume,
                        trades, taker_buy_volume, taker_buy_quote_volume
                 FROM candles
                 WHERE symbol = $1 AND ($2::bigint IS NULL OR open_time >= $2)
                 ORDER BY open_time ASC
                 LIMIT $3",
            )
            .bind(symbol)
            .bind(start_ms)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            let period_ms = timeframe_minutes * 60_000;
            sqlx::query_as::<_, CandleRow>(
                "SELECT
                    $1::text AS symbol,
                    (floor(open_time / $4::bigint) * $4::bigint) AS timestamp,
                    (floor(open_time / $4::bigint) * $4::bigint) AS open_time,
                    (floor(open_time / $4::bigint) * $4::bigint) + $4::bigint - 1 AS close_time,
                    (array_agg(open ORDER BY open_time ASC))[1] AS open,
                    max(high) AS high,
                    min(low) AS low,
                    (array_agg(close ORDER BY open_time DESC))[1] AS close,
                    sum(volume) AS volume,
                    sum(quote_volume) AS quote_volume,
                    sum(trades) AS trades,
                    sum(taker_buy_volume) AS taker_buy_volume,
                    sum(taker_buy_quote_volume) AS taker_buy_quote_volume
                 FROM candles
                 WHERE symbol = $1 AND ($2::bigint IS NULL OR open_time >= $2)
                 GROUP BY 2
                 ORDER BY 2 ASC
                 LIMIT $3",
            )
            .bind(symbol)
            .bind(start_ms)
            .bind(limit)
            .bind(period_ms)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(CandleRow::into_candle).collect())
    }

    /// The `n` most recent closed buckets for (symbol, timeframe), ordered
    /// ascending by bucket start. Backs the `/price` endpoint's fallback
    /// when the aggregator has no in-memory partial for that key yet.
    pub async fn get_latest_candles(
        &self,
        symbol: &str,
        timeframe_minutes: i64,
        n: i64,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = if timeframe_minutes <= 1 {
            sqlx::query_as::<_, CandleRow>(
                "SELECT symbol, timestamp, open_time, close_time,
                        open, high, low, close, volume, quote_volume,
                        trades, taker_buy_volume, taker_buy_quote_volume
                 FROM candles
                 WHERE symbol = $1
                 ORDER BY open_time DESC
                 LIMIT $2",
            )
            .bind(symbol)
            .bind(n)
            .fetch_all(&self.pool)
            .await?
        } else {
            let period_ms = timeframe_minutes * 60_000;
            sqlx::query_as::<_, CandleRow>(
                "SELECT
                    $1::text AS symbol,
                    (floor(open_time / $3::bigint) * $3::bigint) AS timestamp,
                    (floor(open_time / $3::bigint) * $3::bigint) AS open_time,
                    (floor(open_time / $3::bigint) * $3::bigint) + $3::bigint - 1 AS close_time,
                    (array_agg(open ORDER BY open_time ASC))[1] AS open,
                    max(high) AS high,
                    min(low) AS low,
                    (array_agg(close ORDER BY open_time DESC))[1] AS close,
                    sum(volume) AS volume,
                    sum(quote_volume) AS quote_volume,
                    sum(trades) AS trades,
                    sum(taker_buy_volume) AS taker_buy_volume,
                    sum(taker_buy_quote_volume) AS taker_buy_quote_volume
                 FROM candles
                 WHERE symbol = $1
                 GROUP BY 2
                 ORDER BY 2 DESC
                 LIMIT $2",
            )
            .bind(symbol)
            .bind(n)
            .bind(period_ms)
            .fetch_all(&self.pool)
            .await?
        };

        let mut candles: Vec<Candle> = rows.into_iter().map(CandleRow::into_candle).collect();
        candles.reverse();
        Ok(candles)
    }

    pub async fn get_orderbook_latest(
        &self,
        symbol: &str,
        levels: usize,
    ) -> Result<Option<OrderBookSnapshot>, StoreError> {
        let row: Option<OrderBookRow> = sqlx::query_as(
            "SELECT symbol, timestamp, last_update_id, bids, asks
             FROM orderbook_data
             WHERE symbol = $1
             ORDER BY timestamp DESC
             LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.into_snapshot().truncate(levels)))
    }

    pub async fn get_symbols(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT symbol FROM candles ORDER BY symbol ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(FromRow)]
struct CandleRow {
    symbol: String,
    timestamp: i64,
    open_time: i64,
    close_time: i64,
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

impl CandleRow {
    fn into_candle(self) -> Candle {
        Candle {
            symbol: self.symbol,
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quote_volume: self.quote_volume,
            trades: self.trades,
            taker_buy_volume: self.taker_buy_volume,
            taker_buy_quote_volume: self.taker_buy_quote_volume,
            timestamp: self.timestamp,
        }
    }
}

#[derive(FromRow)]
struct OrderBookRow {
    symbol: String,
    timestamp: i64,
    last_update_id: i64,
    bids: JsonValue,
    asks: JsonValue,
}

impl OrderBookRow {
    fn into_snapshot(self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: self.symbol,
            timestamp: self.timestamp,
            last_update_id: self.last_update_id,
            bids: json_to_levels(&self.bids),
            asks: json_to_levels(&self.asks),
        }
    }
}

fn levels_to_json(levels: &[PriceLevel]) -> JsonValue {
    JsonValue::Array(
        levels
            .iter()
            .map(|level| serde_json::json!([level.price.to_string(), level.quantity.to_string()]))
            .collect(),
    )
}

fn json_to_levels(value: &JsonValue) -> Vec<PriceLevel> {
    value
        .as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let pair = level.as_array()?;
                    let price = pair.first()?.as_str()?.parse().ok()?;
                    let quantity = pair.get(1)?.as_str()?.parse().ok()?;
                    Some(PriceLevel { price, quantity })
                })
                .collect()
        })
        .unwrap_or_default()
}
