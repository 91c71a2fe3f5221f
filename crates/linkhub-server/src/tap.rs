//! Bus tap over WebSocket.
//!
//! A tap client sends JSON commands to follow link topics:
//!
//! ```json
//! {"op": "subscribe", "topic": "/link/1/7/recv"}
//! {"op": "unsubscribe", "topic": "/link/1/7/recv"}
//! ```
//!
//! Every command gets a JSON text reply. Publications arrive as binary
//! messages holding the topic, a NUL byte, then the raw payload.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use linkhub_core::{Broker, Publication};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Publications buffered per tap client before forwarders wait.
const TAP_QUEUE: usize = 1024;

static NEXT_TAP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum TapCommand {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// WebSocket upgrade handler.
pub async fn tap_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| handle_tap(socket, broker))
}

async fn handle_tap(socket: WebSocket, broker: Arc<Broker>) {
    let tap_id = format!("tap-{}", NEXT_TAP_ID.fetch_add(1, Ordering::Relaxed));
    metrics::record_tap(true);
    debug!(tap = %tap_id, "Tap connected");

    let (mut sender, mut receiver) = socket.split();
    let (pub_tx, mut pub_rx) = mpsc::channel::<Arc<Publication>>(TAP_QUEUE);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            Some(publication) = pub_rx.recv() => {
                if sender.send(Message::Binary(encode_publication(&publication))).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&broker, &tap_id, &text, &mut forwarders, &pub_tx);
                        if sender.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(tap = %tap_id, error = %e, "Tap socket error");
                        metrics::record_error("tap");
                        break;
                    }
                }
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    broker.unsubscribe_all(&tap_id);
    metrics::record_tap(false);
    debug!(tap = %tap_id, "Tap disconnected");
}

fn handle_command(
    broker: &Broker,
    tap_id: &str,
    text: &str,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    pub_tx: &mpsc::Sender<Arc<Publication>>,
) -> serde_json::Value {
    let command = match serde_json::from_str::<TapCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            return serde_json::json!({ "ok": false, "error": format!("Invalid command: {}", e) });
        }
    };

    match command {
        TapCommand::Subscribe { topic } => match broker.subscribe(tap_id, &topic) {
            Ok(rx) => {
                forwarders.insert(topic.clone(), spawn_forwarder(rx, pub_tx.clone()));
                debug!(tap = %tap_id, topic = %topic, "Tap subscribed");
                serde_json::json!({ "ok": true, "op": "subscribe", "topic": topic })
            }
            Err(e) => {
                serde_json::json!({ "ok": false, "op": "subscribe", "topic": topic, "error": e.to_string() })
            }
        },
        TapCommand::Unsubscribe { topic } => {
            if let Some(forwarder) = forwarders.remove(&topic) {
                forwarder.abort();
            }
            match broker.unsubscribe(tap_id, &topic) {
                Ok(()) => serde_json::json!({ "ok": true, "op": "unsubscribe", "topic": topic }),
                Err(e) => {
                    serde_json::json!({ "ok": false, "op": "unsubscribe", "topic": topic, "error": e.to_string() })
                }
            }
        }
    }
}

/// Move publications of one topic into the tap's outbound queue.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Publication>>,
    tx: mpsc::Sender<Arc<Publication>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(publication) => {
                    if tx.send(publication).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Tap lagging, publications skipped");
                    metrics::record_error("tap_lagged");
                }
            }
        }
    })
}

fn encode_publication(publication: &Publication) -> Vec<u8> {
    let mut frame = Vec::with_capacity(publication.topic.len() + 1 + publication.payload.len());
    frame.extend_from_slice(publication.topic.as_bytes());
    frame.push(0);
    frame.extend_from_slice(&publication.payload);
    frame
}
