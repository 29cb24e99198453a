// In-process room fan-out.
//
// Replicas that share one `MemoryHub` see each other's frames directly,
// with no network involved. The hub can simulate outages and records
// every published frame for inspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{FrameSink, LinkEvent, PeerTransport, TransportLink};
use crate::error::SessionError;

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

struct HubState {
    reachable: bool,
    constructible: bool,
    next_link: u64,
    rooms: HashMap<String, Vec<Member>>,
    published: HashMap<u64, Vec<Vec<u8>>>,
    opens: HashMap<u64, Vec<Instant>>,
}

struct Member {
    link_id: u64,
    replica_id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                reachable: true,
                constructible: true,
                next_link: 1,
                rooms: HashMap::new(),
                published: HashMap::new(),
                opens: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable, new links close right after being opened.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// While not constructible, `open` fails synchronously.
    pub fn set_constructible(&self, constructible: bool) {
        self.state().constructible = constructible;
    }

    /// Close every link in `room`, as if the network dropped.
    pub fn sever(&self, room: &str) {
        let members = self.state().rooms.remove(room).unwrap_or_default();
        debug!(room, links = members.len(), "severing memory room");
        for member in members {
            let _ = member.events.send(LinkEvent::Closed { reason: "link severed".into() });
        }
    }

    /// Number of open links in `room`.
    pub fn members(&self, room: &str) -> usize {
        self.state().rooms.get(room).map_or(0, Vec::len)
    }

    /// Frames published by `replica_id` so far, oldest first.
    pub fn published_by(&self, replica_id: u64) -> Vec<Vec<u8>> {
        self.state().published.get(&replica_id).cloned().unwrap_or_default()
    }

    /// When `replica_id` tried to open a link, oldest first.
    pub fn open_attempts(&self, replica_id: u64) -> Vec<Instant> {
        self.state().opens.get(&replica_id).cloned().unwrap_or_default()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for MemoryHub {
    fn open(&self, _endpoint: &str, room: &str, replica_id: u64) -> Result<TransportLink, SessionError> {
        let mut state = self.state();
        state.opens.entry(replica_id).or_default().push(Instant::now());
        if !state.constructible {
            return Err(SessionError::Transport("memory hub refused the link".into()));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let link_id = state.next_link;
        state.next_link += 1;

        if state.reachable {
            state.rooms.entry(room.to_string()).or_default().push(Member {
                link_id,
                replica_id,
                events: events_tx.clone(),
            });
            let _ = events_tx.send(LinkEvent::Opened);
        } else {
            let _ = events_tx.send(LinkEvent::Closed { reason: "room unreachable".into() });
        }

        let sink = MemorySink { hub: self.clone(), room: room.to_string(), link_id, replica_id };
        Ok(TransportLink { sink: Box::new(sink), events })
    }
}

struct MemorySink {
    hub: MemoryHub,
    room: String,
    link_id: u64,
    replica_id: u64,
}

impl FrameSink for MemorySink {
    fn send(&self, frame: Vec<u8>) {
        let mut state = self.hub.state();
        let Some(members) = state.rooms.get(&self.room) else {
            return;
        };
        if !members.iter().any(|m| m.link_id == self.link_id) {
            return;
        }
        for member in members.iter().filter(|m| m.link_id != self.link_id) {
            let _ = member
                .events
                .send(LinkEvent::Frame { from: self.replica_id, payload: frame.clone() });
        }
        state.published.entry(self.replica_id).or_default().push(frame);
    }

    fn close(self: Box<Self>) {
        let mut state = self.hub.state();
        if let Some(members) = state.rooms.get_mut(&self.room) {
            members.retain(|m| m.link_id != self.link_id);
            if members.is_empty() {
                state.rooms.remove(&self.room);
            }
        }
    }
}
