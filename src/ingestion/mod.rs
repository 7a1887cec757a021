//! Spawns the per-symbol candle and order-book collector tasks.

pub mod candle_collector;
pub mod orderbook_collector;

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::store::PgStore;
use crate::upstream::UpstreamClient;

use candle_collector::{CandleCollector, CandleCollectorConfig};
use orderbook_collector::{OrderBookCollector, OrderBookCollectorConfig};

/// Spawns one candle collector and one order-book collector task per
/// configured symbol. Each task is fully independent: a panic or sustained
/// failure on one symbol never stalls another's loop.
pub fn spawn_all(
    config: &AppConfig,
    upstream: Arc<UpstreamClient>,
    store: Arc<PgStore>,
    broker: Arc<Broker>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for symbol in &config.symbols {
        let collector = CandleCollector::new(
            CandleCollectorConfig {
                symbol: symbol.clone(),
                start_date_ms: config.start_date.timestamp_millis(),
                batch_size: config.batch_size,
                realtime_interval: config.realtime_interval,
                retry_delay: std::time::Duration::from_millis(config.retry.retry_delay_ms),
            },
            upstream.clone(),
            store.clone(),
            broker.clone(),
        );
        handles.push(tokio::spawn(collector.run(shutdown.subscribe())));
    }

    for symbol in &config.orderbook_symbols {
        let collector = OrderBookCollector::new(
            OrderBookCollectorConfig {
                symbol: symbol.clone(),
                levels: config.orderbook_levels,
                update_interval: config.orderbook_update_interval,
            },
            upstream.clone(),
            store.clone(),
            broker.clone(),
        );
        handles.push(tokio::spawn(collector.run(shutdown.subscribe())));
    }

    handles
}
