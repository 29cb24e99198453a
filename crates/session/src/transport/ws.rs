// WebSocket transport through the signaling relay.
//
// One socket per link: subscribe to the room topic, publish frames as
// base64 payloads, drop our own echoes and keep the socket alive with
// periodic pings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use tandem_common::signaling::SignalMessage;

use super::{validate_signaling_url, FrameSink, LinkEvent, PeerTransport, TransportLink};
use crate::error::SessionError;

const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SignalingTransport {
    keepalive: Duration,
}

impl SignalingTransport {
    pub fn new() -> Self {
        Self { keepalive: DEFAULT_KEEPALIVE }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl Default for SignalingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for SignalingTransport {
    /// Must be called from within a tokio runtime.
    fn open(&self, endpoint: &str, room: &str, replica_id: u64) -> Result<TransportLink, SessionError> {
        let url = validate_signaling_url(endpoint)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| SessionError::Transport(error.to_string()))?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let link = SocketLink {
            url,
            room: room.to_string(),
            replica_id,
            keepalive: self.keepalive,
            events: events_tx,
            opened: Arc::clone(&opened),
        };
        let task = runtime.spawn(link.run(outgoing_rx));

        let sink = SignalingSink { outgoing: outgoing_tx, task, opened };
        Ok(TransportLink { sink: Box::new(sink), events })
    }
}

struct SignalingSink {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    opened: Arc<AtomicBool>,
}

impl FrameSink for SignalingSink {
    fn send(&self, frame: Vec<u8>) {
        let _ = self.outgoing.send(frame);
    }

    fn close(self: Box<Self>) {
        let Self { outgoing, task, opened } = *self;
        if !opened.load(Ordering::Acquire) {
            // Still connecting: nothing to flush, and it must not subscribe later.
            task.abort();
            return;
        }
        // Dropping the sender lets the socket task flush queued frames and
        // say goodbye before it exits.
        drop(outgoing);
        drop(task);
    }
}

struct SocketLink {
    url: Url,
    room: String,
    replica_id: u64,
    keepalive: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
    opened: Arc<AtomicBool>,
}

impl SocketLink {
    async fn run(self, outgoing: mpsc::UnboundedReceiver<Vec<u8>>) {
        let reason = match self.pump(outgoing).await {
            Ok(()) => return,
            Err(reason) => reason,
        };
        debug!(room = %self.room, replica_id = self.replica_id, %reason, "signaling link closed");
        let _ = self.events.send(LinkEvent::Closed { reason });
    }

    /// Returns `Ok` when the local side closed the link.
    async fn pump(&self, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>) -> Result<(), String> {
        let (socket, _response) =
            connect_async(self.url.as_str()).await.map_err(|error| error.to_string())?;
        let (mut write, mut read) = socket.split();

        let subscribe = SignalMessage::Subscribe { topics: vec![self.room.clone()] };
        write.send(Message::Text(subscribe.to_json().into())).await.map_err(|e| e.to_string())?;
        self.opened.store(true, Ordering::Release);
        info!(url = %self.url, room = %self.room, replica_id = self.replica_id, "joined signaling room");
        if self.events.send(LinkEvent::Opened).is_err() {
            return Ok(());
        }

        let mut keepalive = tokio::time::interval(self.keepalive);
        keepalive.tick().await;
        let codec = base64::engine::general_purpose::STANDARD;

        loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let publish = SignalMessage::Publish {
                        topic: self.room.clone(),
                        from: self.replica_id,
                        payload_b64: codec.encode(frame),
                    };
                    write.send(Message::Text(publish.to_json().into())).await.map_err(|e| e.to_string())?;
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if !self.deliver(&text, &codec) {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err("relay closed the connection".into());
                        }
                        Some(Err(error)) => return Err(error.to_string()),
                        Some(Ok(_)) => {}
                    }
                }
                _ = keepalive.tick() => {
                    write.send(Message::Text(SignalMessage::Ping.to_json().into()))
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
        }
    }

    /// Forward one relay message. Returns false once nobody is listening.
    fn deliver(&self, text: &str, codec: &base64::engine::GeneralPurpose) -> bool {
        match SignalMessage::from_json(text) {
            Ok(SignalMessage::Publish { topic, from, payload_b64 }) => {
                if topic != self.room || from == self.replica_id {
                    return true;
                }
                match codec.decode(payload_b64) {
                    Ok(payload) => self.events.send(LinkEvent::Frame { from, payload }).is_ok(),
                    Err(error) => {
                        warn!(room = %self.room, from, %error, "dropping frame with bad base64 payload");
                        true
                    }
                }
            }
            Ok(_) => true,
            Err(error) => {
                debug!(%error, "ignoring unparsable signaling message");
                true
            }
        }
    }
}
