// Peer transports.
//
// A transport joins a room and carries opaque frames between the replicas
// in it. The provider only sees a `TransportLink`: a sink for outgoing
// frames and a stream of link events.

pub mod memory;
pub mod ws;

use std::net::IpAddr;

use tokio::sync::mpsc;
use url::Url;

use crate::error::SessionError;

pub use memory::MemoryHub;
pub use ws::SignalingTransport;

/// Something that can open links into rooms.
pub trait PeerTransport: Send + Sync {
    /// Start joining `room` at `endpoint` as `replica_id`.
    ///
    /// An `Err` here means the link could not even be constructed and is
    /// not retried. Later failures arrive as `LinkEvent::Closed`.
    fn open(&self, endpoint: &str, room: &str, replica_id: u64) -> Result<TransportLink, SessionError>;
}

/// Outgoing half of a link.
pub trait FrameSink: Send {
    /// Broadcast a frame to every other member of the room. Frames sent
    /// before the link opens or after it closes are dropped.
    fn send(&self, frame: Vec<u8>);

    /// Leave the room. No further events are delivered.
    fn close(self: Box<Self>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link joined the room and can carry frames.
    Opened,
    /// A frame from another replica.
    Frame { from: u64, payload: Vec<u8> },
    /// The link is gone; the provider may retry.
    Closed { reason: String },
}

pub struct TransportLink {
    pub sink: Box<dyn FrameSink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Accept `wss://` anywhere and `ws://` only on a loopback host.
pub fn validate_signaling_url(value: &str) -> Result<Url, SessionError> {
    let invalid = |reason: String| SessionError::InvalidEndpoint { url: value.to_string(), reason };
    let parsed = Url::parse(value).map_err(|error| invalid(error.to_string()))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        "ws" => Err(invalid("ws is allowed only for localhost; use wss".into())),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_wss_and_loopback_ws() {
        assert!(validate_signaling_url("wss://relay.example.com/signal").is_ok());
        assert!(validate_signaling_url("ws://localhost:4444").is_ok());
        assert!(validate_signaling_url("ws://127.0.0.1:4444").is_ok());
        assert!(validate_signaling_url("ws://[::1]:4444").is_ok());
    }

    #[test]
    fn rejects_plain_ws_to_remote_hosts() {
        let error = validate_signaling_url("ws://relay.example.com").unwrap_err();
        assert!(matches!(error, SessionError::InvalidEndpoint { .. }));
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(matches!(
            validate_signaling_url("https://relay.example.com"),
            Err(SessionError::InvalidEndpoint { reason, .. }) if reason.contains("https")
        ));
        assert!(validate_signaling_url("not a url").is_err());
    }
}
