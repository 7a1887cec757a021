//! The hub's single coordinator task: owns the connection registry and the
//! aggregation sessions, and is the only thing that ever mutates either.
//! Every other task — accept handler, per-connection reader, the cleanup
//! sweep — talks to it over a bounded `mpsc` channel, so no lock guards the
//! registry itself.

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::connection::OutboundQueue;
use super::protocol::HubMessage;
use super::Topic;
use crate::aggregator::CandleAggregator;
use crate::broker::{Broker, BrokerSubscription, CANDLES_ALL_TOPIC, ORDERBOOK_ALL_TOPIC};
use crate::model::{Candle, OrderBookSnapshot};

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Resubscribes with exponential backoff, capped at 30s, per the
/// `BrokerUnavailable` propagation policy for subscribers.
async fn reconnect(broker: &Broker, topic: &'static str) -> BrokerSubscription {
    let mut delay = Duration::from_secs(1);
    loop {
        match broker.subscribe(topic).await {
            Ok(sub) => return sub,
            Err(err) => {
                tracing::warn!(error = %err, topic, "broker resubscribe failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_BACKOFF);
            }
        }
    }
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const POISON_TIMEOUT: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(120);
const INTERIM_INTERVAL: Duration = Duration::from_secs(5);

pub enum CoordinatorCommand {
    Register {
        topic: Topic,
        orderbook_levels: u32,
        queue: Arc<OutboundQueue>,
        reply: oneshot::Sender<u64>,
    },
    Unregister {
        connection_id: u64,
    },
    Pong {
        connection_id: u64,
    },
    /// Consulted by the query layer's `/price` endpoint: the current
    /// in-progress bucket for one (symbol, timeframe), if a session has
    /// started. `None` means the caller should fall back to the store's two
    /// most recent closed candles.
    CurrentPartial {
        symbol: String,
        timeframe_minutes: i64,
        reply: oneshot::Sender<Option<Candle>>,
    },
}

struct ConnectionEntry {
    topic: Topic,
    orderbook_levels: u32,
    queue: Arc<OutboundQueue>,
    last_pong: Instant,
}

/// Runs until the shutdown signal fires, then stops accepting further
/// broadcasts; open connections are left for the caller to close with 1000.
pub async fn run(
    broker: Arc<Broker>,
    mut commands: mpsc::Receiver<CoordinatorCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut registry: HashMap<Topic, HashMap<u64, ConnectionEntry>> = HashMap::new();
    let mut next_id: u64 = 0;
    let mut aggregator = CandleAggregator::new();

    let mut candle_sub = match broker.subscribe(CANDLES_ALL_TOPIC).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "hub failed to subscribe to candle topic, hub disabled");
            return;
        }
    };
    let mut orderbook_sub = match broker.subscribe(ORDERBOOK_ALL_TOPIC).await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "hub failed to subscribe to orderbook topic, hub disabled");
            return;
        }
    };

    let mut heartbeat_ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_ticker = tokio::time::interval(CLEANUP_INTERVAL);
    cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut interim_ticker = tokio::time::interval(INTERIM_INTERVAL);
    interim_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                close_all(&registry);
                tracing::info!("hub coordinator shutting down");
                return;
            }
            command = commands.recv() => {
                match command {
                    Some(CoordinatorCommand::Register { topic, orderbook_levels, queue, reply }) => {
                        let id = next_id;
                        next_id += 1;
                        registry.entry(topic.clone()).or_default().insert(
                            id,
                            ConnectionEntry { topic, orderbook_levels, queue, last_pong: Instant::now() },
                        );
                        let _ = reply.send(id);
                    }
                    Some(CoordinatorCommand::Unregister { connection_id }) => {
                        remove_connection(&mut registry, connection_id);
                    }
                    Some(CoordinatorCommand::Pong { connection_id }) => {
                        if let Some(entry) = find_connection_mut(&mut registry, connection_id) {
                            entry.last_pong = Instant::now();
                        }
                    }
                    Some(CoordinatorCommand::CurrentPartial { symbol, timeframe_minutes, reply }) => {
                        let _ = reply.send(aggregator.current_partial(&symbol, timeframe_minutes));
                    }
                    None => return,
                }
            }
            candle = candle_sub.recv::<Candle>() => {
                match candle {
                    Some(Ok(candle)) => {
                        // The broker only ever carries 1-minute candles; that
                        // timeframe is always "closed" on receipt.
                        broadcast_candle(&registry, &candle.symbol, 1, true, &candle);
                        for (timeframe_minutes, closed) in aggregator.ingest_one_minute_candle(&candle) {
                            broadcast_candle(&registry, &closed.symbol, timeframe_minutes, true, &closed);
                        }
                    }
                    Some(Err(err)) => tracing::warn!(error = %err, "candle broker message dropped"),
                    None => {
                        tracing::warn!("candle subscription ended, reconnecting");
                        candle_sub = reconnect(&broker, CANDLES_ALL_TOPIC).await;
                    }
                }
            }
            snapshot = orderbook_sub.recv::<OrderBookSnapshot>() => {
                match snapshot {
                    Some(Ok(snapshot)) => broadcast_orderbook(&registry, &snapshot),
                    Some(Err(err)) => tracing::warn!(error = %err, "orderbook broker message dropped"),
                    None => {
                        tracing::warn!("orderbook subscription ended, reconnecting");
                        orderbook_sub = reconnect(&broker, ORDERBOOK_ALL_TOPIC).await;
                    }
                }
            }
            _ = heartbeat_ticker.tick() => {
                send_heartbeats(&registry);
            }
            _ = cleanup_ticker.tick() => {
                registry.retain(|_, conns| {
                    conns.retain(|_, entry| entry.last_pong.elapsed() < POISON_TIMEOUT);
                    !conns.is_empty()
                });
            }
            _ = interim_ticker.tick() => {
                for (key, partial) in aggregator.all_current_partials() {
                    let (symbol, timeframe_minutes) = key;
                    broadcast_candle(&registry, &symbol, timeframe_minutes, false, &partial);
                }
            }
        }
    }
}

fn find_connection_mut(
    registry: &mut HashMap<Topic, HashMap<u64, ConnectionEntry>>,
    connection_id: u64,
) -> Option<&mut ConnectionEntry> {
    registry.values_mut().find_map(|conns| conns.get_mut(&connection_id))
}

fn remove_connection(registry: &mut HashMap<Topic, HashMap<u64, ConnectionEntry>>, connection_id: u64) {
    registry.retain(|_, conns| {
        conns.remove(&connection_id);
        !conns.is_empty()
    });
}

fn send_heartbeats(registry: &HashMap<Topic, HashMap<u64, ConnectionEntry>>) {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let payload = serde_json::to_string(&HubMessage::Heartbeat { timestamp }).expect("heartbeat always serializes");
    for conns in registry.values() {
        for entry in conns.values() {
            entry.queue.push(Message::Text(payload.clone().into()));
        }
    }
}

fn close_all(registry: &HashMap<Topic, HashMap<u64, ConnectionEntry>>) {
    for conns in registry.values() {
        for entry in conns.values() {
            entry.queue.push(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: super::connection::NORMAL_CLOSURE,
                reason: "shutting down".into(),
            })));
        }
    }
}

/// Dispatches a candle event to both the exact-symbol subscribers and the
/// `symbol=all` subscribers registered for the same timeframe.
fn broadcast_candle(
    registry: &HashMap<Topic, HashMap<u64, ConnectionEntry>>,
    symbol: &str,
    timeframe_minutes: i64,
    closed: bool,
    candle: &Candle,
) {
    let payload = serde_json::to_string(&HubMessage::Candle {
        symbol,
        timeframe: timeframe_minutes,
        closed,
        candle,
    })
    .expect("candle event always serializes");

    for key in [
        Topic::Candles { symbol: symbol.to_string(), timeframe_minutes },
        Topic::Candles { symbol: "ALL".to_string(), timeframe_minutes },
    ] {
        if let Some(conns) = registry.get(&key) {
            for entry in conns.values() {
                entry.queue.push(Message::Text(payload.clone().into()));
            }
        }
    }
}

fn broadcast_orderbook(registry: &HashMap<Topic, HashMap<u64, ConnectionEntry>>, snapshot: &OrderBookSnapshot) {
    for key in [
        Topic::OrderBook { symbol: snapshot.symbol.clone() },
        Topic::OrderBook { symbol: "ALL".to_string() },
    ] {
        if let Some(conns) = registry.get(&key) {
            for entry in conns.values() {
                let truncated = snapshot.clone().truncate(entry.orderbook_levels as usize);
                let payload = serde_json::to_string(&HubMessage::OrderBook {
                    symbol: &snapshot.symbol,
                    snapshot: &truncated,
                })
                .expect("orderbook event always serializes");
                entry.queue.push(Message::Text(payload.into()));
            }
        }
    }
}
