// Session manager: the application-facing facade over one provider.
//
// Turns provider presence snapshots into join/update/leave events, keeps
// the local entry alive with a heartbeat and debounces cursor traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_common::presence::{CursorRange, PresenceUser};

use crate::config::{SessionConfig, MIN_HEARTBEAT_INTERVAL};
use crate::error::SessionError;
use crate::presence::PresenceEntry;
use crate::provider::{ConnectionStatus, ProviderEvent, TransportProvider, UserPatch};
use crate::transport::PeerTransport;

// ── Events ─────────────────────────────────────────────────────────

/// A remote participant as the application sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUser {
    /// Replica the entry was taken from.
    pub replica_id: u64,
    pub id: String,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ActiveUser {
    fn from_entry(entry: &PresenceEntry) -> Self {
        let state = &entry.state;
        Self {
            replica_id: entry.replica_id,
            id: state.user.id.clone(),
            name: state.user.name.clone(),
            color: state.user.color.clone(),
            cursor: state.cursor,
            last_seen: state.last_seen.and_then(DateTime::<Utc>::from_timestamp_millis),
        }
    }

    fn differs_visibly(&self, other: &ActiveUser) -> bool {
        self.name != other.name || self.color != other.color || self.cursor != other.cursor
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    UserJoin(ActiveUser),
    /// Carries the user id.
    UserLeave(String),
    UserUpdate(ActiveUser),
    StatusChange(ConnectionStatus),
    Error(SessionError),
}

/// Point-in-time view of the joined session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSession {
    pub document_id: String,
    pub local_user: Option<PresenceUser>,
    pub status: ConnectionStatus,
    pub active_users: Vec<ActiveUser>,
}

// ── Participant diffing ────────────────────────────────────────────

/// Participants keyed by user id, in first-seen order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ParticipantSet {
    users: Vec<ActiveUser>,
    by_id: HashMap<String, usize>,
}

impl ParticipantSet {
    /// Build from a snapshot ordered by replica id. A user on several
    /// replicas is represented by the highest replica id.
    pub(crate) fn from_presence(entries: &[PresenceEntry]) -> Self {
        let mut set = Self::default();
        for entry in entries {
            if entry.state.user.id.is_empty() {
                continue;
            }
            let user = ActiveUser::from_entry(entry);
            match set.by_id.get(&user.id).copied() {
                Some(slot) if set.users[slot].replica_id < user.replica_id => set.users[slot] = user,
                Some(_) => {}
                None => {
                    set.by_id.insert(user.id.clone(), set.users.len());
                    set.users.push(user);
                }
            }
        }
        set
    }

    fn get(&self, id: &str) -> Option<&ActiveUser> {
        self.by_id.get(id).map(|&slot| &self.users[slot])
    }

    /// Events that turn `self` into `next`: joins, then updates, then leaves.
    pub(crate) fn diff(&self, next: &ParticipantSet) -> Vec<SessionEvent> {
        let mut joins = Vec::new();
        let mut updates = Vec::new();
        for user in &next.users {
            match self.get(&user.id) {
                None => joins.push(SessionEvent::UserJoin(user.clone())),
                Some(before) if before.differs_visibly(user) => {
                    updates.push(SessionEvent::UserUpdate(user.clone()))
                }
                Some(_) => {}
            }
        }
        let leaves = self
            .users
            .iter()
            .filter(|user| next.get(&user.id).is_none())
            .map(|user| SessionEvent::UserLeave(user.id.clone()));

        joins.into_iter().chain(updates).chain(leaves).collect()
    }

    pub(crate) fn into_users(self) -> Vec<ActiveUser> {
        self.users
    }
}

// ── Manager ────────────────────────────────────────────────────────

struct ActiveSession {
    config: SessionConfig,
    provider: TransportProvider,
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    cursor_timer: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn cancel_timers(&mut self) {
        self.heartbeat.abort();
        if let Some(timer) = self.cursor_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.cancel_timers();
        self.pump.abort();
    }
}

pub struct SessionManager {
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveSession>,
    destroyed: bool,
}

impl SessionManager {
    /// Manager plus the receiving end of its event channel.
    pub fn new(transport: Arc<dyn PeerTransport>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { transport, events, active: None, destroyed: false }, rx)
    }

    /// Start a session. Joining while a session is active is a logged no-op.
    /// Must be called from within a tokio runtime.
    pub fn join_session(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if self.destroyed {
            warn!(document_id = %config.document_id, "join on a destroyed session manager ignored");
            return Ok(());
        }
        if let Some(active) = &self.active {
            warn!(
                active = %active.config.document_id,
                requested = %config.document_id,
                "session already active; join ignored"
            );
            return Ok(());
        }

        let (provider_tx, provider_rx) = mpsc::unbounded_channel();
        let transport = Arc::clone(&self.transport);
        let provider = match config.replica_id {
            Some(replica_id) => TransportProvider::with_replica_id(transport, replica_id, provider_tx),
            None => TransportProvider::new(transport, provider_tx),
        };

        if let Err(error) = provider.connect(config.clone()) {
            warn!(document_id = %config.document_id, %error, "join failed");
            provider.destroy();
            return Err(error);
        }

        let pump = tokio::spawn(forward_provider_events(provider_rx, self.events.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(
            provider.clone(),
            config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
        ));
        info!(
            document_id = %config.document_id,
            replica_id = provider.replica_id(),
            user = %config.user.id,
            "session joined"
        );
        self.active = Some(ActiveSession { config, provider, pump, heartbeat, cursor_timer: None });
        Ok(())
    }

    /// Stop the heartbeat, tear down the provider and go inactive.
    pub fn leave_session(&mut self) {
        let Some(mut active) = self.active.take() else {
            debug!("leave without an active session ignored");
            return;
        };
        active.cancel_timers();
        // Stop forwarding first so the provider's own Disconnected is not
        // delivered alongside ours.
        active.pump.abort();
        let last_status = active.provider.status();
        active.provider.disconnect();
        active.provider.destroy();
        if last_status != ConnectionStatus::Disconnected {
            let _ = self.events.send(SessionEvent::StatusChange(ConnectionStatus::Disconnected));
        }
        info!(document_id = %active.config.document_id, "session left");
    }

    /// Leave and refuse further joins.
    pub fn destroy(&mut self) {
        self.leave_session();
        self.destroyed = true;
    }

    pub fn update_user_info(&mut self, patch: UserPatch) {
        match &self.active {
            Some(active) => active.provider.update_local_user(patch),
            None => warn!("user info update without an active session ignored"),
        }
    }

    /// Queue a cursor update. Positions arriving within the debounce window
    /// replace each other; only the last one is published.
    pub fn update_cursor_position(&mut self, cursor: Option<CursorRange>) {
        let Some(active) = self.active.as_mut() else {
            warn!("cursor update without an active session ignored");
            return;
        };
        if let Some(pending) = active.cursor_timer.take() {
            pending.abort();
        }
        let window = active.config.cursor_debounce;
        if window.is_zero() {
            active.provider.update_cursor(cursor);
            return;
        }
        let provider = active.provider.clone();
        active.cursor_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            provider.update_cursor(cursor);
        }));
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.active
            .as_ref()
            .map(|active| ParticipantSet::from_presence(&active.provider.active_presence()).into_users())
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.active.as_ref().map_or(ConnectionStatus::Disconnected, |a| a.provider.status())
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn document_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.config.document_id.as_str())
    }

    /// The identity currently published for the local replica.
    pub fn local_user(&self) -> Option<PresenceUser> {
        self.active.as_ref()?.provider.local_presence().map(|state| state.user)
    }

    pub fn snapshot(&self) -> Option<ConnectionSession> {
        let active = self.active.as_ref()?;
        Some(ConnectionSession {
            document_id: active.config.document_id.clone(),
            local_user: self.local_user(),
            status: active.provider.status(),
            active_users: self.active_users(),
        })
    }

    /// Handle for editing and undo.
    pub fn provider(&self) -> Option<TransportProvider> {
        self.active.as_ref().map(|active| active.provider.clone())
    }

    pub fn synced(&self) -> Option<watch::Receiver<bool>> {
        self.active.as_ref().map(|active| active.provider.subscribe_synced())
    }
}

async fn forward_provider_events(
    mut provider_events: mpsc::UnboundedReceiver<ProviderEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut participants = ParticipantSet::default();
    while let Some(event) = provider_events.recv().await {
        let forwarded = match event {
            ProviderEvent::Status(status) => vec![SessionEvent::StatusChange(status)],
            ProviderEvent::Error(error) => {
                if error.is_recoverable() {
                    debug!(%error, "session error, link unaffected");
                } else {
                    warn!(%error, "session link error");
                }
                vec![SessionEvent::Error(error)]
            }
            ProviderEvent::Synced => {
                debug!("session synced");
                Vec::new()
            }
            ProviderEvent::Presence(entries) => {
                let next = ParticipantSet::from_presence(&entries);
                let changes = participants.diff(&next);
                participants = next;
                changes
            }
        };
        for event in forwarded {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

async fn heartbeat_loop(provider: TransportProvider, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        debug!(replica_id = provider.replica_id(), "presence heartbeat");
        provider.refresh_presence();
    }
}
