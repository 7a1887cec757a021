//! Per-symbol candle collector: Bootstrap -> Historical -> Transition -> Live.
//!
//! Each symbol runs as an independent task (spawned by [`super::spawn_all`])
//! so a failure on one symbol can never stall another's loop — the only
//! state shared across symbols is the store pool and broker connection,
//! both of which fail per-operation rather than per-task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::broker::Broker;
use crate::model::{Candle, CollectorState};
use crate::store::PgStore;
use crate::upstream::{ParsedKline, UpstreamClient};

const MINUTE_MS: i64 = 60_000;
const LIVE_WINDOW_MS: i64 = 5 * MINUTE_MS;
const EMPTY_REPLY_SLEEP: Duration = Duration::from_secs(60);

pub struct CandleCollectorConfig {
    pub symbol: String,
    pub start_date_ms: i64,
    pub batch_size: u32,
    pub realtime_interval: Duration,
    pub retry_delay: Duration,
}

pub struct CandleCollector {
    config: CandleCollectorConfig,
    upstream: Arc<UpstreamClient>,
    store: Arc<PgStore>,
    broker: Arc<Broker>,
    high_water_mark: i64,
}

impl CandleCollector {
    pub fn new(
        config: CandleCollectorConfig,
        upstream: Arc<UpstreamClient>,
        store: Arc<PgStore>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            config,
            upstream,
            store,
            broker,
            high_water_mark: i64::MIN,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut start = self.bootstrap().await;

        while start + MINUTE_MS <= now_ms() {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(symbol = %self.config.symbol, "candle collector shutting down");
                    return;
                }
                next_start = self.historical_step(start) => {
                    start = next_start;
                }
            }
        }

        self.transition().await;
        self.live_loop(shutdown).await;
    }

    /// Reads `last_timestamp` and computes the historical replay start.
    async fn bootstrap(&self) -> i64 {
        match self.store.get_last_timestamp(&self.config.symbol).await {
            Ok(Some(last_timestamp)) => (last_timestamp + MINUTE_MS).max(self.config.start_date_ms),
            Ok(None) => self.config.start_date_ms,
            Err(err) => {
                tracing::error!(symbol = %self.config.symbol, error = %err, "bootstrap read failed, using configured start date");
                self.config.start_date_ms
            }
        }
    }

    /// Fetches and inserts up to `batch_size` minutes starting at `start`,
    /// returning the next start. On upstream or store failure, logs and
    /// returns `start` unchanged so the caller retries after its own delay.
    async fn historical_step(&mut self, start: i64) -> i64 {
        let end = start + (self.config.batch_size as i64) * MINUTE_MS - 1;

        let klines = match self
            .upstream
            .fetch_klines(&self.config.symbol, start, end, self.config.batch_size)
            .await
        {
            Ok(klines) => klines,
            Err(err) => {
                tracing::warn!(symbol = %self.config.symbol, error = %err, "historical fetch failed, retrying after delay");
                tokio::time::sleep(self.config.retry_delay).await;
                return start;
            }
        };

        if klines.is_empty() {
            tokio::time::sleep(EMPTY_REPLY_SLEEP).await;
            return start;
        }

        let candles: Vec<Candle> = klines.iter().map(|k| self.to_candle(k)).collect();
        let last_timestamp = candles.last().map(|c| c.timestamp).unwrap_or(start);

        if let Err(err) = self.store.insert_candles(&candles).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "historical insert failed, retrying after delay");
            tokio::time::sleep(self.config.retry_delay).await;
            return start;
        }

        self.high_water_mark = self.high_water_mark.max(last_timestamp);
        let state = CollectorState {
            symbol: self.config.symbol.clone(),
            last_timestamp,
            is_realtime: false,
            last_updated: Utc::now(),
        };
        if let Err(err) = self.store.upsert_state(&state).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "state checkpoint failed");
        }

        last_timestamp + MINUTE_MS
    }

    async fn transition(&self) {
        let state = CollectorState {
            symbol: self.config.symbol.clone(),
            last_timestamp: self.high_water_mark.max(self.config.start_date_ms),
            is_realtime: true,
            last_updated: Utc::now(),
        };
        if let Err(err) = self.store.upsert_state(&state).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "realtime transition checkpoint failed");
        }
        tracing::info!(symbol = %self.config.symbol, "candle collector transitioned to live mode");
    }

    async fn live_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.realtime_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(symbol = %self.config.symbol, "candle collector shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.live_step().await;
                }
            }
        }
    }

    async fn live_step(&mut self) {
        let now = now_ms();
        let start = now - LIVE_WINDOW_MS;

        let klines = match self
            .upstream
            .fetch_klines(&self.config.symbol, start, now, 10)
            .await
        {
            Ok(klines) => klines,
            Err(err) => {
                tracing::warn!(symbol = %self.config.symbol, error = %err, "live fetch failed");
                return;
            }
        };

        let candles: Vec<Candle> = klines.iter().map(|k| self.to_candle(k)).collect();
        let new_candles: Vec<&Candle> = candles
            .iter()
            .filter(|c| c.timestamp > self.high_water_mark)
            .collect();

        if new_candles.is_empty() {
            return;
        }

        if let Err(err) = self.store.insert_candles(&candles).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "live insert failed");
            return;
        }

        let last_timestamp = new_candles.iter().map(|c| c.timestamp).max().unwrap();
        self.high_water_mark = last_timestamp;

        let state = CollectorState {
            symbol: self.config.symbol.clone(),
            last_timestamp,
            is_realtime: true,
            last_updated: Utc::now(),
        };
        if let Err(err) = self.store.upsert_state(&state).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "live state checkpoint failed");
        }

        for candle in new_candles {
            if let Err(err) = self.broker.publish_candle(candle).await {
                tracing::warn!(symbol = %self.config.symbol, error = %err, "candle publish dropped");
            }
        }
    }

    fn to_candle(&self, kline: &ParsedKline) -> Candle {
        Candle {
            symbol: self.config.symbol.clone(),
            open_time: kline.open_time,
            close_time: kline.close_time,
            open: kline.open,
            high: kline.high,
            low: kline.low,
            close: kline.close,
            volume: kline.volume,
            quote_volume: kline.quote_volume,
            trades: kline.trades,
            taker_buy_volume: kline.taker_buy_volume,
            taker_buy_quote_volume: kline.taker_buy_quote_volume,
            timestamp: kline.open_time,
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
