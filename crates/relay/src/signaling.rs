// Topic fan-out for the signaling relay.
//
// Each WebSocket connection subscribes to topics (document rooms) and
// publishes opaque frames; every publish is forwarded verbatim to the
// other subscribers of its topic. The relay never inspects payloads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tandem_common::signaling::SignalMessage;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

type Outbound = mpsc::UnboundedSender<SignalMessage>;

/// Subscribers per topic, keyed by connection id.
#[derive(Default)]
pub struct TopicRegistry {
    next_conn_id: AtomicU64,
    topics: RwLock<HashMap<String, HashMap<u64, Outbound>>>,
}

impl TopicRegistry {
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn subscribe(&self, topic: &str, conn_id: u64, outbound: Outbound) {
        let mut topics = self.topics.write().await;
        topics.entry(topic.to_string()).or_default().insert(conn_id, outbound);
    }

    pub async fn unsubscribe(&self, topic: &str, conn_id: u64) {
        let mut topics = self.topics.write().await;
        if let Some(members) = topics.get_mut(topic) {
            members.remove(&conn_id);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Forward `message` to every subscriber of `topic` except `sender`.
    /// Returns how many subscribers it reached.
    pub async fn publish(&self, topic: &str, sender: u64, message: &SignalMessage) -> usize {
        let topics = self.topics.read().await;
        let Some(members) = topics.get(topic) else {
            return 0;
        };
        members
            .iter()
            .filter(|(conn_id, _)| **conn_id != sender)
            .filter(|(_, outbound)| outbound.send(message.clone()).is_ok())
            .count()
    }

    /// Drop a closed connection from all of its topics.
    pub async fn remove_connection(&self, conn_id: u64, subscribed: &HashSet<String>) {
        let mut topics = self.topics.write().await;
        for topic in subscribed {
            if let Some(members) = topics.get_mut(topic) {
                members.remove(&conn_id);
                if members.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map_or(0, HashMap::len)
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

pub fn router(registry: Arc<TopicRegistry>) -> Router {
    Router::new().route("/", get(ws_upgrade)).with_state(registry)
}

async fn ws_upgrade(
    State(registry): State<Arc<TopicRegistry>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(registry, socket))
}

async fn handle_socket(registry: Arc<TopicRegistry>, mut socket: WebSocket) {
    let conn_id = registry.next_conn_id();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<SignalMessage>();
    let mut subscribed: HashSet<String> = HashSet::new();
    debug!(conn_id, "signaling connection opened");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.reset();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > HEARTBEAT_INTERVAL * 2 {
                    warn!(conn_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(outbound) = maybe_outbound else {
                    break;
                };
                if socket.send(Message::Text(outbound.to_json().into())).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                last_seen = Instant::now();

                let raw = match message {
                    Message::Text(raw) => raw,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let inbound = match SignalMessage::from_json(raw.as_str()) {
                    Ok(inbound) => inbound,
                    Err(error) => {
                        debug!(conn_id, %error, "ignoring malformed signaling message");
                        continue;
                    }
                };

                match inbound {
                    SignalMessage::Subscribe { topics } => {
                        for topic in topics {
                            registry.subscribe(&topic, conn_id, outbound_sender.clone()).await;
                            subscribed.insert(topic);
                        }
                    }
                    SignalMessage::Unsubscribe { topics } => {
                        for topic in topics {
                            registry.unsubscribe(&topic, conn_id).await;
                            subscribed.remove(&topic);
                        }
                    }
                    SignalMessage::Publish { ref topic, .. } => {
                        let reached = registry.publish(topic, conn_id, &inbound).await;
                        debug!(conn_id, topic = %topic, reached, "fanned out publish");
                    }
                    SignalMessage::Ping => {
                        if socket.send(Message::Text(SignalMessage::Pong.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    SignalMessage::Pong => {}
                }
            }
        }
    }

    registry.remove_connection(conn_id, &subscribed).await;
    info!(conn_id, topics = subscribed.len(), "signaling connection closed");
}
