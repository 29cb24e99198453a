// Presence (awareness) wire shapes.
//
// Each replica publishes one `PresenceState` as JSON through the awareness
// channel. Unknown fields are ignored and everything except `user.id` is
// optional, so older and newer clients can share a room.

use serde::{Deserialize, Serialize};

/// Identity a replica advertises to its peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PresenceUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Hex color used to render this user's cursor (e.g. `"#30bced"`).
    #[serde(default)]
    pub color: String,
}

/// Selection in the shared text, as character offsets.
///
/// A collapsed caret has `anchor == head`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(offset: u32) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// The full awareness payload of one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceState {
    pub user: PresenceUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
    /// Last heartbeat, UTC millis since epoch.
    #[serde(default, rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

impl PresenceState {
    pub fn new(user: PresenceUser) -> Self {
        Self { user, cursor: None, last_seen: None }
    }

    /// Parse a raw awareness JSON string. Returns `None` for null states and
    /// payloads that do not identify a user.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Whether two states differ in anything a participant list shows
    /// (identity, color, cursor). Heartbeat timestamps are ignored.
    pub fn differs_visibly(&self, other: &PresenceState) -> bool {
        self.user != other.user || self.cursor != other.cursor
    }
}

/// Fixed palette for users that did not choose a color.
pub const USER_COLORS: [&str; 8] = [
    "#30bced", "#6eeb83", "#ffbc42", "#ecd444", "#ee6352", "#9ac2c9", "#8acb88", "#1be7ff",
];
