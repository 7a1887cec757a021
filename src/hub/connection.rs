//! Per-connection plumbing: the bounded drop-oldest outbound queue, the
//! handshake query-param parser, and the reader/writer tasks that bridge an
//! axum `WebSocket` to the coordinator.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{mpsc, Notify};

use super::coordinator::CoordinatorCommand;
use super::Topic;
use crate::aggregator::parse_timeframe_minutes;

pub const POLICY_VIOLATION: u16 = 1008;
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(rename = "type", default = "default_type")]
    pub kind: String,
    pub levels: Option<u32>,
}

fn default_symbol() -> String {
    "all".to_string()
}

fn default_timeframe() -> String {
    "1".to_string()
}

fn default_type() -> String {
    "candles".to_string()
}

/// Resolves handshake query params into a registry key, validating the
/// timeframe and type per the documented policy-violation rule.
pub fn resolve_topic(params: &HandshakeParams) -> Result<(Topic, u32), &'static str> {
    let symbol = params.symbol.to_uppercase();
    let timeframe_minutes = parse_timeframe_minutes(&params.timeframe).ok_or("unknown timeframe")?;

    match params.kind.as_str() {
        "candles" => Ok((
            Topic::Candles {
                symbol,
                timeframe_minutes,
            },
            0,
        )),
        "orderbook" => {
            let levels = params.levels.unwrap_or(20);
            if !matches!(levels, 5 | 10 | 20) {
                return Err("unknown levels");
            }
            Ok((Topic::OrderBook { symbol }, levels))
        }
        _ => Err("unknown type"),
    }
}

/// A bounded mailbox that drops the oldest queued frame instead of blocking
/// the coordinator when a connection falls behind.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, message: Message) {
        let mut queue = self.inner.lock().expect("outbound queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.inner.lock().expect("outbound queue poisoned").pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// Drains `queue` onto the socket's sink half until the socket errors or the
/// connection is torn down. Send errors mark the connection for removal —
/// no retry, per the propagation policy.
pub async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    queue: std::sync::Arc<OutboundQueue>,
) {
    loop {
        let message = queue.pop().await;
        if sink.send(message).await.is_err() {
            return;
        }
    }
}

/// Reads client frames, forwarding `pong` replies to the coordinator and
/// exiting on close or protocol error so the caller can unregister.
pub async fn run_reader(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    connection_id: u64,
    commands: mpsc::Sender<CoordinatorCommand>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => {
                if let Ok(super::protocol::ClientMessage::Pong) =
                    serde_json::from_str::<super::protocol::ClientMessage>(&text)
                {
                    let _ = commands.send(CoordinatorCommand::Pong { connection_id }).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_default_handshake_to_all_symbols_one_minute_candles() {
        let params = HandshakeParams {
            symbol: default_symbol(),
            timeframe: default_timeframe(),
            kind: default_type(),
            levels: None,
        };
        let (topic, levels) = resolve_topic(&params).unwrap();
        assert_eq!(
            topic,
            Topic::Candles {
                symbol: "ALL".to_string(),
                timeframe_minutes: 1,
            }
        );
        assert_eq!(levels, 0);
    }

    #[test]
    fn rejects_unknown_timeframe() {
        let params = HandshakeParams {
            symbol: "BTCUSDT".to_string(),
            timeframe: "7".to_string(),
            kind: "candles".to_string(),
            levels: None,
        };
        assert!(resolve_topic(&params).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let params = HandshakeParams {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1".to_string(),
            kind: "futures".to_string(),
            levels: None,
        };
        assert!(resolve_topic(&params).is_err());
    }

    #[test]
    fn rejects_invalid_orderbook_levels() {
        let params = HandshakeParams {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1".to_string(),
            kind: "orderbook".to_string(),
            levels: Some(7),
        };
        assert!(resolve_topic(&params).is_err());
    }

    #[test]
    fn outbound_queue_drops_oldest_when_full() {
        let queue = OutboundQueue::new(2);
        queue.push(Message::Text("a".to_string().into()));
        queue.push(Message::Text("b".to_string().into()));
        queue.push(Message::Text("c".to_string().into()));
        let remaining: Vec<_> = std::mem::take(&mut *queue.inner.lock().unwrap()).into_iter().collect();
        assert_eq!(remaining.len(), 2);
    }
}
