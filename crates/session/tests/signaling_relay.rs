use std::sync::Arc;
use std::time::Duration;

use tandem_session::config::{LocalUser, SessionConfig};
use tandem_session::transport::SignalingTransport;
use tandem_session::{ConnectionStatus, SessionEvent, SessionManager};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const WAIT: Duration = Duration::from_secs(10);

async fn start_relay() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = tandem_relay::serve(listener, async {
            let _ = stop_rx.await;
        })
        .await;
    });
    (format!("ws://{addr}/"), stop_tx)
}

fn config(url: &str, user: &str) -> SessionConfig {
    SessionConfig::new("relay-notes", LocalUser::new(user, user.to_uppercase()))
        .with_signaling_url(url)
}

fn manager() -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
    SessionManager::new(Arc::new(SignalingTransport::new()))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold before the timeout");
}

async fn wait_synced(session: &SessionManager) {
    let mut synced = session.synced().expect("active session");
    tokio::time::timeout(WAIT, synced.wait_for(|synced| *synced))
        .await
        .expect("sync should complete before the timeout")
        .expect("provider alive");
}

#[tokio::test]
async fn two_replicas_converge_through_the_relay() {
    let (url, _stop) = start_relay().await;
    let (mut a, mut rx_a) = manager();
    let (mut b, _rx_b) = manager();

    a.join_session(config(&url, "u-a")).expect("join a");
    wait_until(|| a.status() == ConnectionStatus::Connected).await;
    let pa = a.provider().expect("provider a");
    pa.insert_text(0, "hello from a");

    b.join_session(config(&url, "u-b")).expect("join b");
    wait_synced(&b).await;
    wait_synced(&a).await;
    let pb = b.provider().expect("provider b");
    assert_eq!(pb.content(), "hello from a");

    pb.insert_text(pb.text_len(), ", and b");
    wait_until(|| pa.content() == "hello from a, and b").await;

    wait_until(|| a.active_users().iter().any(|user| user.id == "u-b")).await;
    let mut joined = false;
    while let Ok(event) = rx_a.try_recv() {
        joined |= matches!(event, SessionEvent::UserJoin(ref user) if user.id == "u-b");
    }
    assert!(joined);

    b.leave_session();
    wait_until(|| a.active_users().is_empty()).await;
}
