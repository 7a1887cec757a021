//! WebSocket hub: per-connection subscription handshake, the outbound
//! queue/writer/reader plumbing ([`connection`]), the wire protocol
//! ([`protocol`]), and the single coordinator task that owns the
//! connection registry and the aggregation sessions ([`coordinator`]).
//!
//! The coordinator is the only task that mutates the registry or an
//! aggregation session; every other task — the accept handler below, each
//! connection's reader, the cleanup sweep — talks to it over a bounded
//! `mpsc::Sender<CoordinatorCommand>`, so the event-loop discipline from the
//! design notes holds without a `Mutex` around the registry itself.

pub mod connection;
pub mod coordinator;
pub mod protocol;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use connection::{HandshakeParams, OutboundQueue, POLICY_VIOLATION};
use coordinator::CoordinatorCommand;
use crate::broker::Broker;

const COMMAND_QUEUE_DEPTH: usize = 1024;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Registry key: one entry per distinct (symbol, timeframe, kind) a client
/// can subscribe to. `symbol` is uppercased; `"ALL"` means "every symbol".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Candles { symbol: String, timeframe_minutes: i64 },
    OrderBook { symbol: String },
}

/// Handle the query layer and `main` use to reach the hub: spawning it
/// returns this alongside the coordinator's `JoinHandle`.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<CoordinatorCommand>,
}

impl Hub {
    /// Spawns the coordinator task and returns a cheaply-cloneable handle to
    /// it. The coordinator exits when `shutdown` fires.
    pub fn spawn(broker: Arc<Broker>, shutdown: broadcast::Receiver<()>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = tokio::spawn(coordinator::run(broker, rx, shutdown));
        (Self { commands: tx }, handle)
    }

    pub fn router(self) -> Router {
        Router::new().route("/ws", get(ws_handler)).with_state(Arc::new(self))
    }

    /// The aggregator's current partial for one (symbol, timeframe), used
    /// by the `/price` endpoint. `None` if the hub has shut down or no
    /// session has started yet for that key.
    pub async fn current_partial(&self, symbol: &str, timeframe_minutes: i64) -> Option<crate::model::Candle> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CoordinatorCommand::CurrentPartial {
                symbol: symbol.to_string(),
                timeframe_minutes,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match connection::resolve_topic(&params) {
        Ok((topic, orderbook_levels)) => {
            ws.on_upgrade(move |socket| handle_socket(socket, hub, topic, orderbook_levels))
        }
        Err(reason) => ws.on_upgrade(move |socket| reject_socket(socket, reason)),
    }
}

/// Accepts an otherwise-valid upgrade but the handshake query params were
/// invalid: send one error frame, then close with 1008 per §4.H.
async fn reject_socket(mut socket: axum::extract::ws::WebSocket, reason: &'static str) {
    use futures_util::SinkExt;
    let payload = serde_json::to_string(&protocol::HubMessage::Error { reason })
        .expect("error frame always serializes");
    let _ = socket.send(Message::Text(payload.into())).await;
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(
    socket: axum::extract::ws::WebSocket,
    hub: Arc<Hub>,
    topic: Topic,
    orderbook_levels: u32,
) {
    use futures_util::StreamExt;

    let queue = Arc::new(OutboundQueue::new(OUTBOUND_QUEUE_DEPTH));
    let (reply_tx, reply_rx) = oneshot::channel();
    if hub
        .commands
        .send(CoordinatorCommand::Register {
            topic,
            orderbook_levels,
            queue: queue.clone(),
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return; // hub shut down between upgrade and registration
    }
    let Ok(connection_id) = reply_rx.await else {
        return;
    };

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(connection::run_writer(sink, queue));
    let reader = connection::run_reader(stream, connection_id, hub.commands.clone());

    reader.await;
    writer.abort();
    let _ = hub
        .commands
        .send(CoordinatorCommand::Unregister { connection_id })
        .await;
}
