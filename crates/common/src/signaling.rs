// Signaling relay protocol (JSON text frames).
//
// Clients subscribe to topics (one topic per document room) and publish
// opaque peer frames; the relay fans each publish out to the other
// subscribers of that topic.

use serde::{Deserialize, Serialize};

/// Prefix for the default room of a document: `document-<document_id>`.
pub const ROOM_PREFIX: &str = "document-";

/// Room a document's replicas meet in, unless an explicit name is given.
pub fn room_name(document_id: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(room) if !room.trim().is_empty() => room.to_string(),
        _ => format!("{ROOM_PREFIX}{document_id}"),
    }
}

/// All message types understood by the signaling relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Client -> Relay: join one or more topics.
    Subscribe { topics: Vec<String> },

    /// Client -> Relay: leave topics.
    Unsubscribe { topics: Vec<String> },

    /// Bidirectional: an opaque frame for every other member of `topic`.
    Publish {
        topic: String,
        /// Replica id of the original sender.
        from: u64,
        payload_b64: String,
    },

    /// Client -> Relay: keepalive.
    Ping,

    /// Relay -> Client: keepalive reply.
    Pong,
}

impl SignalMessage {
    pub fn to_json(&self) -> String {
        // Every variant is plain strings and integers, so encoding cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
