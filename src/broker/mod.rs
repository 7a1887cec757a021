//! Redis-backed pub/sub broker adapter.
//!
//! Publishers fan every event out to both the per-symbol topic and the
//! aggregate `:all` topic; this crate's own hub only ever subscribes to the
//! aggregate topics (the per-symbol ones exist for external collaborators
//! outside this crate's scope). Decimals are always serialized as JSON
//! strings, never exponential notation, because [`Candle`]/[`OrderBookSnapshot`]
//! carry `rust_decimal::Decimal` and `serde` derives its `Display`-based
//! string form.

use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use std::pin::Pin;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::model::{Candle, OrderBookSnapshot};

pub fn candle_topic(symbol: &str) -> String {
    format!("candles:{symbol}")
}

pub const CANDLES_ALL_TOPIC: &str = "candles:all";

pub fn orderbook_topic(symbol: &str) -> String {
    format!("orderbook:{symbol}")
}

pub const ORDERBOOK_ALL_TOPIC: &str = "orderbook:all";

#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl Broker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.connection_string())?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self { client, publisher })
    }

    pub async fn publish_candle(&self, candle: &Candle) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(candle)?;
        self.publish_both(&candle_topic(&candle.symbol), CANDLES_ALL_TOPIC, &payload)
            .await
    }

    pub async fn publish_orderbook(&self, snapshot: &OrderBookSnapshot) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(snapshot)?;
        self.publish_both(
            &orderbook_topic(&snapshot.symbol),
            ORDERBOOK_ALL_TOPIC,
            &payload,
        )
        .await
    }

    async fn publish_both(&self, per_symbol: &str, all: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(per_symbol, payload).await?;
        let _: () = conn.publish(all, payload).await?;
        Ok(())
    }

    pub async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(BrokerSubscription {
            stream: Box::pin(pubsub.into_on_message()),
        })
    }
}

/// A live subscription to one broker channel. Reconnection with exponential
/// backoff (capped at 30 s) is the caller's responsibility, per the
/// `BrokerUnavailable` propagation policy — the hub's subscriber task wraps
/// [`Broker::subscribe`] in that retry loop.
pub struct BrokerSubscription {
    stream: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

impl BrokerSubscription {
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Option<Result<T, BrokerError>> {
        let msg = self.stream.next().await?;
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => return Some(Err(BrokerError::from(err))),
        };
        Some(serde_json::from_str(&payload).map_err(BrokerError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_the_documented_convention() {
        assert_eq!(candle_topic("BTCUSDT"), "candles:BTCUSDT");
        assert_eq!(orderbook_topic("BTCUSDT"), "orderbook:BTCUSDT");
        assert_eq!(CANDLES_ALL_TOPIC, "candles:all");
        assert_eq!(ORDERBOOK_ALL_TOPIC, "orderbook:all");
    }
}
