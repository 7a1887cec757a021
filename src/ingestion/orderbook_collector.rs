//! Per-symbol order-book collector: periodic depth snapshot -> persist -> publish.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::broker::Broker;
use crate::model::OrderBookSnapshot;
use crate::store::PgStore;
use crate::upstream::UpstreamClient;

pub struct OrderBookCollectorConfig {
    pub symbol: String,
    pub levels: u32,
    pub update_interval: Duration,
}

pub struct OrderBookCollector {
    config: OrderBookCollectorConfig,
    upstream: Arc<UpstreamClient>,
    store: Arc<PgStore>,
    broker: Arc<Broker>,
}

impl OrderBookCollector {
    pub fn new(
        config: OrderBookCollectorConfig,
        upstream: Arc<UpstreamClient>,
        store: Arc<PgStore>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            config,
            upstream,
            store,
            broker,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.update_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(symbol = %self.config.symbol, "orderbook collector shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.step().await;
                }
            }
        }
    }

    /// A new depth snapshot is persisted even when upstream returns the
    /// same `last_update_id` as last call: the wall-clock timestamp differs,
    /// so the row's primary key differs too. Preserved as-is per the data
    /// model's append-only lifecycle.
    async fn step(&self) {
        let (last_update_id, bids, asks) = match self
            .upstream
            .fetch_depth(&self.config.symbol, self.config.levels)
            .await
        {
            Ok(depth) => depth,
            Err(err) => {
                tracing::warn!(symbol = %self.config.symbol, error = %err, "depth fetch failed");
                return;
            }
        };

        let snapshot = OrderBookSnapshot {
            symbol: self.config.symbol.clone(),
            timestamp: Utc::now().timestamp_millis(),
            last_update_id,
            bids,
            asks,
        };

        if let Err(err) = self.store.insert_orderbook(&snapshot).await {
            tracing::error!(symbol = %self.config.symbol, error = %err, "orderbook insert failed");
            return;
        }

        if let Err(err) = self.broker.publish_orderbook(&snapshot).await {
            tracing::warn!(symbol = %self.config.symbol, error = %err, "orderbook publish dropped");
        }
    }
}
