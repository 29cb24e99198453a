use std::sync::Arc;
use std::time::Duration;

use tandem_session::config::{LocalUser, SessionConfig};
use tandem_session::reconnect::ReconnectPolicy;
use tandem_session::transport::MemoryHub;
use tandem_session::{ConnectionStatus, ProviderEvent, SessionError, TransportProvider};
use tokio::sync::mpsc;

const ROOM: &str = "document-notes";

fn config(user: &str) -> SessionConfig {
    SessionConfig::new("notes", LocalUser::new(user, user.to_uppercase()))
        .with_signaling_url("memory://hub")
}

fn provider(hub: &MemoryHub, replica_id: u64) -> (TransportProvider, mpsc::UnboundedReceiver<ProviderEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransportProvider::with_replica_id(Arc::new(hub.clone()), replica_id, tx), rx)
}

async fn settle() {
    for _ in 0..50 {
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

fn statuses(events: &[ProviderEvent]) -> Vec<ConnectionStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            ProviderEvent::Status(status) => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_the_attempt_cap_then_errors() {
    let hub = MemoryHub::new();
    hub.set_reachable(false);
    let (a, mut rx) = provider(&hub, 1);

    a.connect(config("u1")).expect("construction succeeds even when unreachable");
    tokio::time::sleep(Duration::from_secs(120)).await;

    let opens = hub.open_attempts(1);
    assert_eq!(opens.len(), 6, "initial attempt plus five retries");
    let gaps: Vec<u128> = opens.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    let expected = [1000u128, 2000, 4000, 8000, 16000];
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(*gap >= want && *gap < want + 5, "gap {gap}ms should be ~{want}ms (all: {gaps:?})");
    }

    assert_eq!(a.status(), ConnectionStatus::Error);
    let events = drain(&mut rx);
    assert!(events.contains(&ProviderEvent::Error(SessionError::ReconnectExhausted { attempts: 5 })));
    assert_eq!(statuses(&events).last(), Some(&ConnectionStatus::Error));

    // Terminal: no timer is left behind.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(hub.open_attempts(1).len(), 6);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn successful_connect_resets_the_attempt_counter() {
    let hub = MemoryHub::new();
    hub.set_reachable(false);
    let (a, _rx) = provider(&hub, 1);
    let policy = ReconnectPolicy { max_attempts: 2, ..Default::default() };
    a.connect(config("u1").with_reconnect(policy)).unwrap();

    // First retry fails, second succeeds.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    hub.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Connected);

    // A fresh drop gets the full budget again, starting from the base delay.
    let before = hub.open_attempts(1).len();
    hub.set_reachable(false);
    hub.sever(ROOM);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let opens = hub.open_attempts(1);
    assert_eq!(opens.len() - before, 2);
    assert_eq!(a.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_recovers_from_error() {
    let hub = MemoryHub::new();
    hub.set_reachable(false);
    let (a, _rx) = provider(&hub, 1);
    let policy = ReconnectPolicy { max_attempts: 0, ..Default::default() };
    a.connect(config("u1").with_reconnect(policy.clone())).unwrap();
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Error);

    hub.set_reachable(true);
    a.connect(config("u1").with_reconnect(policy)).unwrap();
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn drop_moves_through_disconnected_and_back() {
    let hub = MemoryHub::new();
    let (a, mut rx) = provider(&hub, 1);
    a.connect(config("u1")).unwrap();
    settle().await;
    drain(&mut rx);

    hub.sever(ROOM);
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    settle().await;
    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![ConnectionStatus::Disconnected, ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_reconnect() {
    let hub = MemoryHub::new();
    let (a, _rx) = provider(&hub, 1);
    a.connect(config("u1")).unwrap();
    settle().await;

    hub.sever(ROOM);
    settle().await;
    a.disconnect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.open_attempts(1).len(), 1);
    assert_eq!(a.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn offline_edits_survive_a_drop_and_converge() {
    let hub = MemoryHub::new();
    let (a, _rx_a) = provider(&hub, 1);
    let (b, _rx_b) = provider(&hub, 2);
    a.connect(config("u1")).unwrap();
    b.connect(config("u2")).unwrap();
    settle().await;

    a.insert_text(0, "shared");
    settle().await;
    assert_eq!(b.content(), "shared");

    hub.set_reachable(false);
    hub.sever(ROOM);
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Disconnected);
    assert!(!a.is_synced() && !b.is_synced());
    assert!(a.active_presence().is_empty());

    a.insert_text(6, " offline-a");
    b.insert_text(0, "b: ");
    assert_eq!(a.content(), "shared offline-a");

    hub.set_reachable(true);
    let mut synced = a.subscribe_synced();
    tokio::time::sleep(Duration::from_millis(1001)).await;
    settle().await;

    assert!(*synced.borrow_and_update());
    assert!(a.is_synced() && b.is_synced());
    assert_eq!(a.content(), b.content());
    assert!(a.content().contains("offline-a"));
    assert!(a.content().starts_with("b: "));
    assert_eq!(b.active_presence().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_joiner_receives_history() {
    let hub = MemoryHub::new();
    let (a, _rx_a) = provider(&hub, 1);
    a.connect(config("u1")).unwrap();
    settle().await;
    a.insert_text(0, "written before anyone else arrived");

    let (b, mut rx_b) = provider(&hub, 2);
    b.connect(config("u2")).unwrap();
    settle().await;

    assert_eq!(b.content(), "written before anyone else arrived");
    assert!(drain(&mut rx_b).contains(&ProviderEvent::Synced));
}

#[tokio::test(start_paused = true)]
async fn lone_peer_never_reports_synced() {
    let hub = MemoryHub::new();
    let (a, _rx) = provider(&hub, 1);
    a.connect(config("u1")).unwrap();
    settle().await;
    assert_eq!(a.status(), ConnectionStatus::Connected);
    assert!(!a.is_synced());
}
