// Transport provider: one replicated document, one peer link and the
// connection state machine around them.
//
// disconnected -> connecting -> connected
//      ^              |            |
//      +--- backoff --+------------+  (drop)
//      error once the attempt budget is spent
//
// All bookkeeping sits behind one `std::sync::Mutex` that is never held
// across an await. Link pumps and reconnect timers are spawned tasks that
// hold a `Weak` to the provider and check the link generation before
// touching anything, so nothing fires after `disconnect()` returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use yrs::sync::{Awareness, Message, SyncMessage};

use tandem_common::presence::{CursorRange, PresenceState, PresenceUser, USER_COLORS};

use crate::config::SessionConfig;
use crate::document::SharedDocument;
use crate::error::SessionError;
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::protocol;
use crate::transport::{FrameSink, LinkEvent, PeerTransport};
use crate::undo::UndoScope;

const DEFAULT_UNDO_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// Remote presence changed; carries the full new snapshot.
    Presence(Vec<PresenceEntry>),
    /// The first sync step 2 after connecting was applied.
    Synced,
    Error(SessionError),
}

/// Partial update of the local identity. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub name: Option<String>,
    pub color: Option<String>,
}

impl UserPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), color: None }
    }

    pub fn color(color: impl Into<String>) -> Self {
        Self { name: None, color: Some(color.into()) }
    }
}

/// Handle to a provider. Clones share the same replica and link.
#[derive(Clone)]
pub struct TransportProvider {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn PeerTransport>,
    replica_id: u64,
    synced: watch::Sender<bool>,
    state: Mutex<ProviderState>,
}

struct Replica {
    document: SharedDocument,
    awareness: Awareness,
    undo: UndoScope,
}

struct ProviderState {
    replica_id: u64,
    events: mpsc::UnboundedSender<ProviderEvent>,
    config: Option<SessionConfig>,
    status: ConnectionStatus,
    destroyed: bool,
    replica: Option<Replica>,
    presence: PresenceRegistry,
    local: Option<PresenceState>,
    sink: Option<Box<dyn FrameSink>>,
    link_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    attempts: u32,
    generation: u64,
    synced: bool,
}

impl TransportProvider {
    /// Provider with a random replica id.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Self {
        Self::with_document(transport, SharedDocument::new(), events)
    }

    /// Provider whose replica uses a fixed CRDT client id.
    pub fn with_replica_id(
        transport: Arc<dyn PeerTransport>,
        replica_id: u64,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Self {
        Self::with_document(transport, SharedDocument::with_client_id(replica_id), events)
    }

    fn with_document(
        transport: Arc<dyn PeerTransport>,
        document: SharedDocument,
        events: mpsc::UnboundedSender<ProviderEvent>,
    ) -> Self {
        let replica_id = document.client_id();
        let awareness = Awareness::new(document.doc().clone());
        let undo = UndoScope::new(&document, DEFAULT_UNDO_DEPTH);
        let (synced, _) = watch::channel(false);
        let state = ProviderState {
            replica_id,
            events,
            config: None,
            status: ConnectionStatus::Disconnected,
            destroyed: false,
            replica: Some(Replica { document, awareness, undo }),
            presence: PresenceRegistry::new(replica_id),
            local: None,
            sink: None,
            link_task: None,
            reconnect_timer: None,
            attempts: 0,
            generation: 0,
            synced: false,
        };
        Self { shared: Arc::new(Shared { transport, replica_id, synced, state: Mutex::new(state) }) }
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.shared.lock()
    }

    pub fn replica_id(&self) -> u64 {
        self.shared.replica_id
    }

    /// Join the room for `config.document_id`. Returns once the link is
    /// being opened; completion of the initial exchange is signalled
    /// separately through [`Self::subscribe_synced`].
    pub fn connect(&self, config: SessionConfig) -> Result<(), SessionError> {
        let mut st = self.lock();
        if st.destroyed {
            warn!(document_id = %config.document_id, "connect on a destroyed provider ignored");
            return Ok(());
        }
        if let Some(bound) = &st.config {
            if bound.document_id != config.document_id {
                return Err(SessionError::DocumentMismatch {
                    bound: bound.document_id.clone(),
                    requested: config.document_id,
                });
            }
            if matches!(st.status, ConnectionStatus::Connecting | ConnectionStatus::Connected) {
                debug!(document_id = %config.document_id, status = %st.status, "already connecting");
                return Ok(());
            }
        }

        let color = config.user.color.clone().unwrap_or_else(pick_color);
        let cursor = st.local.as_ref().and_then(|local| local.cursor);
        st.local = Some(PresenceState {
            user: PresenceUser { id: config.user.id.clone(), name: config.user.name.clone(), color },
            cursor,
            last_seen: Some(now_millis()),
        });
        if let Some(replica) = st.replica.as_mut() {
            replica.undo.set_max_depth(config.undo_depth);
        }
        info!(
            document_id = %config.document_id,
            room = %config.room_name(),
            replica_id = st.replica_id,
            "connecting provider"
        );
        st.config = Some(config);
        st.attempts = 0;
        st.cancel_reconnect();
        if let Err(error) = st.store_local_state() {
            st.emit(ProviderEvent::Error(error));
        }
        st.open_link(&self.shared)
    }

    /// Leave the room and cancel every timer. Idempotent.
    pub fn disconnect(&self) {
        let mut st = self.lock();
        if st.destroyed {
            return;
        }
        st.teardown_link(&self.shared);
    }

    /// `disconnect()`, then release the document and undo history. Terminal.
    pub fn destroy(&self) {
        let mut st = self.lock();
        if st.destroyed {
            return;
        }
        st.teardown_link(&self.shared);
        st.destroyed = true;
        st.local = None;
        if let Some(mut replica) = st.replica.take() {
            replica.undo.clear();
        }
        debug!(replica_id = st.replica_id, "provider destroyed");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_synced(&self) -> bool {
        *self.shared.synced.borrow()
    }

    /// Watch channel that flips to `true` when the initial exchange with a
    /// peer completes and back to `false` when the link goes away.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.shared.synced.subscribe()
    }

    /// Document the provider is bound to, once connected at least once.
    pub fn document_id(&self) -> Option<String> {
        self.lock().config.as_ref().map(|config| config.document_id.clone())
    }

    // ── Presence ───────────────────────────────────────────────────

    /// Merge `patch` into the local identity and rebroadcast it.
    pub fn update_local_user(&self, patch: UserPatch) {
        let mut st = self.lock();
        let Some(local) = st.local.as_mut() else {
            debug!("local user update before connect ignored");
            return;
        };
        if let Some(name) = patch.name {
            local.user.name = name;
        }
        if let Some(color) = patch.color {
            local.user.color = color;
        }
        st.publish_local();
    }

    /// Set or clear the local cursor and rebroadcast. Callers rate-limit.
    pub fn update_cursor(&self, cursor: Option<CursorRange>) {
        let mut st = self.lock();
        let Some(local) = st.local.as_mut() else {
            debug!("cursor update before connect ignored");
            return;
        };
        local.cursor = cursor;
        st.publish_local();
    }

    /// Heartbeat: stamp and republish the local entry, then evict remote
    /// entries that stopped refreshing.
    pub fn refresh_presence(&self) {
        let mut st = self.lock();
        let Some(local) = st.local.as_mut() else {
            return;
        };
        local.last_seen = Some(now_millis());
        st.publish_local();

        let Some(stale_after) = st.config.as_ref().map(|config| config.stale_after) else {
            return;
        };
        let evicted = st.presence.evict_stale(Instant::now(), stale_after);
        if evicted.is_empty() {
            return;
        }
        debug!(?evicted, "evicted stale presence");
        // Drop the awareness state too, or the next awareness reply would
        // hand the evicted replica to late joiners.
        if let Some(replica) = st.replica.as_ref() {
            for &replica_id in &evicted {
                replica.awareness.remove_state(replica_id);
            }
        }
        st.emit_presence();
    }

    /// Remote presence entries, local replica excluded.
    pub fn active_presence(&self) -> Vec<PresenceEntry> {
        self.lock().presence.snapshot()
    }

    pub fn local_presence(&self) -> Option<PresenceState> {
        self.lock().local.clone()
    }

    // ── Document ───────────────────────────────────────────────────

    pub fn insert_text(&self, index: u32, text: &str) {
        let mut st = self.lock();
        let Some(replica) = st.replica.as_mut() else {
            warn!("edit on a destroyed provider ignored");
            return;
        };
        replica.undo.begin_edit();
        let update = replica.document.insert(index, text);
        st.broadcast(protocol::update(update));
    }

    pub fn remove_text(&self, index: u32, len: u32) {
        let mut st = self.lock();
        let Some(replica) = st.replica.as_mut() else {
            warn!("edit on a destroyed provider ignored");
            return;
        };
        replica.undo.begin_edit();
        let update = replica.document.remove(index, len);
        st.broadcast(protocol::update(update));
    }

    pub fn content(&self) -> String {
        self.lock().replica.as_ref().map(|r| r.document.content()).unwrap_or_default()
    }

    pub fn text_len(&self) -> u32 {
        self.lock().replica.as_ref().map_or(0, |r| r.document.len())
    }

    // ── Undo ───────────────────────────────────────────────────────

    pub fn undo(&self) -> Result<bool, SessionError> {
        self.step_history(|undo| undo.undo())
    }

    pub fn redo(&self) -> Result<bool, SessionError> {
        self.step_history(|undo| undo.redo())
    }

    pub fn can_undo(&self) -> bool {
        self.lock().replica.as_ref().is_some_and(|r| r.undo.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.lock().replica.as_ref().is_some_and(|r| r.undo.can_redo())
    }

    fn step_history(
        &self,
        step: impl FnOnce(&mut UndoScope) -> Result<bool, SessionError>,
    ) -> Result<bool, SessionError> {
        let mut st = self.lock();
        let Some(replica) = st.replica.as_mut() else {
            return Ok(false);
        };
        let before = replica.document.state_vector();
        if !step(&mut replica.undo)? {
            return Ok(false);
        }
        let diff = replica.document.encode_diff_since(&before);
        st.broadcast(protocol::update(diff));
        Ok(true)
    }

    // ── Link handling ──────────────────────────────────────────────

    fn handle_link_event(&self, generation: u64, event: LinkEvent) -> bool {
        let mut st = self.lock();
        if st.destroyed || st.generation != generation {
            return false;
        }
        match event {
            LinkEvent::Opened => {
                st.on_opened(&self.shared);
                true
            }
            LinkEvent::Frame { from, payload } => {
                st.on_frame(&self.shared, from, &payload);
                true
            }
            LinkEvent::Closed { reason } => {
                st.on_closed(&self.shared, &reason);
                false
            }
        }
    }

    fn reconnect_now(&self, generation: u64) {
        let mut st = self.lock();
        if st.destroyed || st.generation != generation || st.status != ConnectionStatus::Disconnected {
            return;
        }
        st.reconnect_timer = None;
        if let Err(error) = st.open_link(&self.shared) {
            debug!(%error, "reconnect could not construct a link");
        }
    }
}

impl fmt::Debug for TransportProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportProvider").field("replica_id", &self.shared.replica_id).finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        st.cancel_reconnect();
        if let Some(task) = st.link_task.take() {
            task.abort();
        }
        if let Some(sink) = st.sink.take() {
            sink.close();
        }
    }
}

impl ProviderState {
    fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn emit_presence(&self) {
        self.emit(ProviderEvent::Presence(self.presence.snapshot()));
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        debug!(replica_id = self.replica_id, from = %self.status, to = %status, "provider status");
        self.status = status;
        self.emit(ProviderEvent::Status(status));
    }

    fn set_synced(&mut self, shared: &Shared, synced: bool) {
        self.synced = synced;
        shared.synced.send_replace(synced);
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// Send a frame to the room if a link is up. Offline frames are
    /// dropped; the sync handshake covers them after reconnecting.
    fn broadcast(&self, frame: Vec<u8>) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.send(frame);
        }
    }

    fn store_local_state(&self) -> Result<(), SessionError> {
        let (Some(replica), Some(local)) = (&self.replica, &self.local) else {
            return Ok(());
        };
        replica
            .awareness
            .set_local_state(local)
            .map_err(|error| SessionError::Presence(error.to_string()))
    }

    fn local_awareness_frame(&self) -> Result<Vec<u8>, SessionError> {
        let Some(replica) = &self.replica else {
            return Err(SessionError::Presence("replica released".into()));
        };
        let update = replica
            .awareness
            .update_with_clients([self.replica_id])
            .map_err(|error| SessionError::Presence(error.to_string()))?;
        Ok(protocol::awareness(update))
    }

    fn publish_local(&mut self) {
        let result = self.store_local_state().and_then(|()| {
            if self.status == ConnectionStatus::Connected {
                let frame = self.local_awareness_frame()?;
                self.broadcast(frame);
            }
            Ok(())
        });
        if let Err(error) = result {
            warn!(%error, "failed to publish local presence");
            self.emit(ProviderEvent::Error(error));
        }
    }

    fn open_link(&mut self, shared: &Arc<Shared>) -> Result<(), SessionError> {
        let Some(config) = self.config.clone() else {
            return Ok(());
        };
        self.close_link();
        self.generation += 1;
        let generation = self.generation;
        self.set_status(ConnectionStatus::Connecting);

        let room = config.room_name();
        let link = match shared.transport.open(&config.signaling_url, &room, self.replica_id) {
            Ok(link) => link,
            Err(error) => {
                warn!(document_id = %config.document_id, %room, %error, "transport construction failed");
                self.set_status(ConnectionStatus::Error);
                self.emit(ProviderEvent::Error(error.clone()));
                return Err(error);
            }
        };
        self.sink = Some(link.sink);
        self.link_task = Some(tokio::spawn(pump_link(Arc::downgrade(shared), generation, link.events)));
        Ok(())
    }

    fn close_link(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
    }

    fn teardown_link(&mut self, shared: &Shared) {
        self.cancel_reconnect();
        self.generation += 1;
        if self.status == ConnectionStatus::Connected {
            if let Some(replica) = &self.replica {
                replica.awareness.clean_local_state();
            }
            match self.local_awareness_frame() {
                Ok(frame) => self.broadcast(frame),
                Err(error) => debug!(%error, "could not announce departure"),
            }
        }
        self.close_link();
        self.set_synced(shared, false);
        if self.presence.clear() {
            self.emit_presence();
        }
        self.attempts = 0;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn on_opened(&mut self, shared: &Shared) {
        self.attempts = 0;
        self.set_synced(shared, false);
        self.set_status(ConnectionStatus::Connected);
        info!(replica_id = self.replica_id, "provider connected");

        let Some(replica) = &self.replica else {
            return;
        };
        // Hello: our state vector, our presence and a request for theirs.
        let mut hello = protocol::sync_step1(replica.document.state_vector());
        match self.local_awareness_frame() {
            Ok(frame) => hello.extend(frame),
            Err(error) => self.emit(ProviderEvent::Error(error)),
        }
        hello.extend(protocol::awareness_query());
        self.broadcast(hello);
    }

    fn on_frame(&mut self, shared: &Shared, from: u64, payload: &[u8]) {
        let messages = match protocol::decode_frame(payload) {
            Ok(messages) => messages,
            Err(error) => {
                warn!(from, %error, "dropping undecodable frame");
                self.emit(ProviderEvent::Error(error));
                return;
            }
        };
        let is_hello = messages.iter().any(|message| matches!(message, Message::AwarenessQuery));
        for message in messages {
            if let Err(error) = self.on_message(shared, from, message, is_hello) {
                warn!(from, %error, "failed to handle peer message");
                self.emit(ProviderEvent::Error(error));
            }
        }
    }

    fn on_message(
        &mut self,
        shared: &Shared,
        from: u64,
        message: Message,
        is_hello: bool,
    ) -> Result<(), SessionError> {
        let Some(replica) = &self.replica else {
            return Ok(());
        };
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let mut reply = protocol::sync_step2(replica.document.encode_diff_since(&state_vector));
                if is_hello {
                    // A fresh link may be holding edits we have not seen.
                    reply.extend(protocol::sync_step1(replica.document.state_vector()));
                }
                self.broadcast(reply);
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                replica.document.apply_remote_update(&update)?;
                if !self.synced {
                    info!(replica_id = self.replica_id, from, "initial sync complete");
                    self.set_synced(shared, true);
                    self.emit(ProviderEvent::Synced);
                }
            }
            Message::Sync(SyncMessage::Update(update)) => {
                replica.document.apply_remote_update(&update)?;
            }
            Message::Awareness(update) => {
                let clients: Vec<u64> = update.clients.keys().copied().collect();
                replica
                    .awareness
                    .apply_update(update)
                    .map_err(|error| SessionError::Protocol(error.to_string()))?;
                if self.presence.project(&replica.awareness, clients, Instant::now()) {
                    self.emit_presence();
                }
            }
            Message::AwarenessQuery => {
                let update = replica
                    .awareness
                    .update()
                    .map_err(|error| SessionError::Presence(error.to_string()))?;
                self.broadcast(protocol::awareness(update));
            }
            other => debug!(from, ?other, "ignoring unsupported peer message"),
        }
        Ok(())
    }

    fn on_closed(&mut self, shared: &Arc<Shared>, reason: &str) {
        warn!(replica_id = self.replica_id, %reason, "peer link dropped");
        // The pump that delivered this event is the link task itself.
        self.link_task = None;
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
        self.set_synced(shared, false);
        if self.presence.clear() {
            self.emit_presence();
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect(shared);
    }

    fn schedule_reconnect(&mut self, shared: &Arc<Shared>) {
        self.cancel_reconnect();
        let Some(policy) = self.config.as_ref().map(|config| config.reconnect.clone()) else {
            return;
        };
        if !policy.allows(self.attempts) {
            warn!(replica_id = self.replica_id, attempts = self.attempts, "reconnect attempts exhausted");
            self.set_status(ConnectionStatus::Error);
            self.emit(ProviderEvent::Error(SessionError::ReconnectExhausted { attempts: self.attempts }));
            return;
        }
        let delay = policy.delay_for(self.attempts);
        self.attempts += 1;
        info!(
            replica_id = self.replica_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let generation = self.generation;
        let weak = Arc::downgrade(shared);
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                TransportProvider { shared }.reconnect_now(generation);
            }
        }));
    }
}

async fn pump_link(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !(TransportProvider { shared }).handle_link_event(generation, event) {
            return;
        }
    }
    // The link vanished without saying goodbye.
    if let Some(shared) = shared.upgrade() {
        let closed = LinkEvent::Closed { reason: "link ended".into() };
        TransportProvider { shared }.handle_link_event(generation, closed);
    }
}

fn pick_color() -> String {
    USER_COLORS.choose(&mut rand::thread_rng()).copied().unwrap_or(USER_COLORS[0]).to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalUser;
    use crate::transport::MemoryHub;

    fn config(user: &str) -> SessionConfig {
        SessionConfig::new("doc-1", LocalUser::new(user, user.to_uppercase()))
            .with_signaling_url("memory://hub")
    }

    fn provider(hub: &MemoryHub, replica_id: u64) -> (TransportProvider, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportProvider::with_replica_id(Arc::new(hub.clone()), replica_id, tx), rx)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn connect_walks_through_connecting_to_connected() {
        let hub = MemoryHub::new();
        let (a, mut rx) = provider(&hub, 1);
        a.connect(config("u1")).unwrap();
        settle().await;

        assert_eq!(a.status(), ConnectionStatus::Connected);
        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ProviderEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]);
        assert!(!a.is_synced());
    }

    #[tokio::test]
    async fn two_providers_sync_and_see_each_other() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = provider(&hub, 1);
        let (b, mut rx_b) = provider(&hub, 2);
        a.insert_text(0, "hello");

        a.connect(config("u1")).unwrap();
        b.connect(config("u2")).unwrap();
        settle().await;

        assert_eq!(b.content(), "hello");
        assert!(a.is_synced() && b.is_synced());
        assert!(drain(&mut rx_b).contains(&ProviderEvent::Synced));

        let seen_by_b = b.active_presence();
        assert_eq!(seen_by_b.len(), 1);
        assert_eq!(seen_by_b[0].replica_id, 1);
        assert_eq!(seen_by_b[0].state.user.id, "u1");

        b.insert_text(5, " world");
        settle().await;
        assert_eq!(a.content(), "hello world");
    }

    #[tokio::test]
    async fn connect_twice_is_a_no_op() {
        let hub = MemoryHub::new();
        let (a, _rx) = provider(&hub, 1);
        a.connect(config("u1")).unwrap();
        a.connect(config("u1")).unwrap();
        settle().await;
        assert_eq!(hub.open_attempts(1).len(), 1);
    }

    #[tokio::test]
    async fn connect_to_another_document_is_refused() {
        let hub = MemoryHub::new();
        let (a, _rx) = provider(&hub, 1);
        a.connect(config("u1")).unwrap();
        let other = SessionConfig::new("doc-2", LocalUser::new("u1", "U1"));
        assert_eq!(
            a.connect(other),
            Err(SessionError::DocumentMismatch { bound: "doc-1".into(), requested: "doc-2".into() })
        );
    }

    #[tokio::test]
    async fn construction_failure_forces_error_without_retry() {
        let hub = MemoryHub::new();
        hub.set_constructible(false);
        let (a, mut rx) = provider(&hub, 1);

        let result = a.connect(config("u1"));
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert_eq!(a.status(), ConnectionStatus::Error);
        settle().await;
        assert!(drain(&mut rx).iter().any(|e| matches!(e, ProviderEvent::Error(SessionError::Transport(_)))));
        assert_eq!(hub.open_attempts(1).len(), 1);
    }

    #[tokio::test]
    async fn disconnect_announces_departure_and_is_idempotent() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = provider(&hub, 1);
        let (b, _rx_b) = provider(&hub, 2);
        a.connect(config("u1")).unwrap();
        b.connect(config("u2")).unwrap();
        settle().await;
        assert_eq!(b.active_presence().len(), 1);

        a.disconnect();
        a.disconnect();
        settle().await;
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(a.active_presence().is_empty());
        assert!(b.active_presence().is_empty());
        assert_eq!(hub.members("document-doc-1"), 1);
    }

    #[tokio::test]
    async fn cursor_and_name_updates_reach_peers() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = provider(&hub, 1);
        let (b, _rx_b) = provider(&hub, 2);
        a.connect(config("u1")).unwrap();
        b.connect(config("u2")).unwrap();
        settle().await;

        a.update_cursor(Some(CursorRange { anchor: 1, head: 4 }));
        a.update_local_user(UserPatch::name("Ada"));
        settle().await;

        let entry = &b.active_presence()[0];
        assert_eq!(entry.state.cursor, Some(CursorRange { anchor: 1, head: 4 }));
        assert_eq!(entry.state.user.name, "Ada");
    }

    #[tokio::test]
    async fn undo_is_broadcast_as_an_update() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = provider(&hub, 1);
        let (b, _rx_b) = provider(&hub, 2);
        a.connect(config("u1")).unwrap();
        b.connect(config("u2")).unwrap();
        settle().await;

        a.insert_text(0, "draft");
        settle().await;
        assert_eq!(b.content(), "draft");

        assert!(a.can_undo());
        assert!(a.undo().unwrap());
        settle().await;
        assert_eq!(a.content(), "");
        assert_eq!(b.content(), "");
        assert!(!b.can_undo());

        assert!(a.redo().unwrap());
        settle().await;
        assert_eq!(b.content(), "draft");
    }

    #[tokio::test]
    async fn garbage_frame_is_reported_not_fatal() {
        let hub = MemoryHub::new();
        let (a, mut rx) = provider(&hub, 1);
        a.connect(config("u1")).unwrap();
        let mut rogue = hub.open("memory://hub", "document-doc-1", 99).unwrap();
        settle().await;
        let _ = rogue.events.try_recv();

        rogue.sink.send(vec![0, 0, 5]);
        settle().await;
        assert!(drain(&mut rx).iter().any(|e| matches!(e, ProviderEvent::Error(SessionError::Protocol(_)))));
        assert_eq!(a.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn destroyed_provider_ignores_everything() {
        let hub = MemoryHub::new();
        let (a, _rx) = provider(&hub, 1);
        a.insert_text(0, "x");
        a.destroy();

        assert!(a.is_destroyed());
        assert_eq!(a.content(), "");
        a.insert_text(0, "y");
        assert_eq!(a.connect(config("u1")), Ok(()));
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(hub.open_attempts(1).is_empty());
        assert_eq!(a.undo(), Ok(false));
    }
}
