//! Wire messages the hub sends over a connection. Every shape carries a
//! `type` discriminator since all of them share one WebSocket channel.

use serde::Serialize;

use crate::model::{Candle, OrderBookSnapshot};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage<'a> {
    Heartbeat {
        timestamp: i64,
    },
    Candle {
        symbol: &'a str,
        timeframe: i64,
        closed: bool,
        candle: &'a Candle,
    },
    #[serde(rename = "orderbook")]
    OrderBook {
        symbol: &'a str,
        snapshot: &'a OrderBookSnapshot,
    },
    Error {
        reason: &'a str,
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pong,
    #[serde(other)]
    Unknown,
}
