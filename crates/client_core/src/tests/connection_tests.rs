use super::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use shared::error::TransportError;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::UnboundedReceiverStream;

const RETRY: Duration = Duration::from_millis(30);
const WAIT: Duration = Duration::from_secs(3);

type FrameSender = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

struct FakeLink {
    server_tx: Option<FrameSender>,
    client_rx: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct FakeConnector {
    handshakes: StdMutex<Vec<HandshakeRequest>>,
    links: StdMutex<Vec<FakeLink>>,
    failures_remaining: AtomicUsize,
    // When set, each handshake blocks until `release` hands out a permit.
    gate: Option<Semaphore>,
}

impl FakeConnector {
    fn failing_first(failures: usize) -> Self {
        let connector = Self::default();
        connector.failures_remaining.store(failures, Ordering::SeqCst);
        connector
    }

    fn gated(failures: usize) -> Self {
        let mut connector = Self::failing_first(failures);
        connector.gate = Some(Semaphore::new(0));
        connector
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    fn link_count(&self) -> usize {
        self.links.lock().expect("links").len()
    }

    fn handshake_count(&self) -> usize {
        self.handshakes.lock().expect("handshakes").len()
    }

    fn handshake(&self, index: usize) -> HandshakeRequest {
        self.handshakes.lock().expect("handshakes")[index].clone()
    }

    fn push_frame(&self, link: usize, frame: &[u8]) {
        let links = self.links.lock().expect("links");
        let tx = links[link].server_tx.as_ref().expect("link still open");
        tx.send(Ok(frame.to_vec())).expect("reader alive");
    }

    fn push_json(&self, link: usize, value: serde_json::Value) {
        self.push_frame(link, value.to_string().as_bytes());
    }

    fn close_from_server(&self, link: usize) {
        self.links.lock().expect("links")[link].server_tx = None;
    }

    fn fail_link(&self, link: usize) {
        let links = self.links.lock().expect("links");
        if let Some(tx) = links[link].server_tx.as_ref() {
            let _ = tx.send(Err(TransportError::Receive("connection reset".into())));
        }
    }

    fn reader_dropped(&self, link: usize) -> bool {
        self.links.lock().expect("links")[link]
            .server_tx
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    fn take_client_frame(&self, link: usize) -> Option<String> {
        self.links.lock().expect("links")[link].client_rx.try_recv().ok()
    }

    fn client_side_closed(&self, link: usize) -> bool {
        matches!(
            self.links.lock().expect("links")[link].client_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}

#[async_trait]
impl ChatConnector for FakeConnector {
    async fn open(&self, request: HandshakeRequest) -> Result<TransportLink> {
        self.handshakes.lock().expect("handshakes").push(request);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("connection refused"));
        }

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        self.links.lock().expect("links").push(FakeLink {
            server_tx: Some(server_tx),
            client_rx,
        });
        Ok(TransportLink {
            outbound: client_tx,
            inbound: UnboundedReceiverStream::new(server_rx).boxed(),
        })
    }
}

fn manager_with(connector: &Arc<FakeConnector>) -> Arc<ConnectionManager> {
    let connector: Arc<dyn ChatConnector> = connector.clone();
    ConnectionManager::new(
        connector,
        ConnectionSettings::default().with_reconnect_interval(RETRY),
    )
}

async fn wait_for_state(manager: &ConnectionManager, expected: LifecycleState) {
    let mut rx = manager.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}, at {:?}", manager.state()))
        .expect("state channel open");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn user() -> UserId {
    UserId::new("u1")
}

#[tokio::test]
async fn connect_opens_with_user_id_and_bypass_header() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    let handshake = connector.handshake(0);
    assert_eq!(handshake.url.as_str(), "wss://chat.example/?userId=u1");
    assert_eq!(
        handshake.headers,
        vec![("ngrok-skip-browser-warning".to_string(), "true".to_string())]
    );
}

#[tokio::test]
async fn second_connect_while_open_is_a_no_op() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let _subscription = manager.subscribe(move |_event: &InboundEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    manager.connect("wss://chat.example", &user()).await;

    assert_eq!(manager.state(), LifecycleState::Open);
    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(manager.listeners().len(), 1);

    connector.push_json(0, json!({"type": "message", "id": "m1"}));
    wait_until(|| received.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn back_to_back_connects_start_one_attempt() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(manager.connection_attempts().await, 1);
}

#[tokio::test]
async fn missing_address_or_user_abandons_connect() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("", &user()).await;
    manager.connect("wss://chat.example", &UserId::new("")).await;
    tokio::time::sleep(RETRY * 2).await;

    assert_eq!(manager.state(), LifecycleState::Idle);
    assert_eq!(connector.handshake_count(), 0);
    assert!(!manager.reconnect_pending().await);
}

#[tokio::test]
async fn unexpected_close_schedules_fixed_interval_reconnect() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    connector.close_from_server(0);
    wait_for_state(&manager, LifecycleState::Reconnecting).await;
    assert!(manager.reconnect_pending().await);

    wait_until(|| connector.handshake_count() == 2).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    assert!(!manager.reconnect_pending().await);
}

#[tokio::test]
async fn transport_error_is_treated_like_close() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    connector.fail_link(0);
    wait_until(|| connector.handshake_count() == 2).await;
    wait_for_state(&manager, LifecycleState::Open).await;
}

#[tokio::test]
async fn failed_handshakes_retry_until_success() {
    let connector = Arc::new(FakeConnector::failing_first(2));
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_until(|| connector.handshake_count() == 3).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    tokio::time::sleep(RETRY * 3).await;
    assert_eq!(connector.handshake_count(), 3);
    assert!(!manager.reconnect_pending().await);
}

#[tokio::test]
async fn backgrounding_closes_and_suppresses_reconnects() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    manager.set_app_activity(AppActivity::Background).await;
    assert_eq!(manager.state(), LifecycleState::Closed);
    assert!(!manager.reconnect_pending().await);

    tokio::time::sleep(RETRY * 4).await;
    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(manager.state(), LifecycleState::Closed);
    assert!(connector.client_side_closed(0));
}

#[tokio::test]
async fn backgrounding_cancels_pending_reconnect_timer() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    connector.close_from_server(0);
    wait_for_state(&manager, LifecycleState::Reconnecting).await;

    manager.set_app_activity(AppActivity::Background).await;
    assert!(!manager.reconnect_pending().await);

    tokio::time::sleep(RETRY * 4).await;
    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(manager.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn foreground_after_background_reconnects_once_and_notifies() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);
    let reconnected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reconnected);
    manager
        .set_on_reconnected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    manager.set_app_activity(AppActivity::Foreground).await;
    assert_eq!(reconnected.load(Ordering::SeqCst), 0);

    manager.set_app_activity(AppActivity::Background).await;
    manager.set_app_activity(AppActivity::Foreground).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    assert_eq!(connector.handshake_count(), 2);
    assert_eq!(reconnected.load(Ordering::SeqCst), 1);

    manager.set_app_activity(AppActivity::Foreground).await;
    tokio::time::sleep(RETRY * 2).await;
    assert_eq!(connector.handshake_count(), 2);
    assert_eq!(reconnected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_while_backgrounded_waits_for_foreground() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.set_app_activity(AppActivity::Background).await;
    manager.connect("wss://chat.example", &user()).await;
    tokio::time::sleep(RETRY * 2).await;
    assert_eq!(connector.handshake_count(), 0);
    assert_eq!(manager.state(), LifecycleState::Idle);

    manager.set_app_activity(AppActivity::Foreground).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    assert_eq!(connector.handshake_count(), 1);
}

#[tokio::test]
async fn lifecycle_signal_drives_pause_and_resume() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);
    let (signal_tx, signal_rx) = watch::channel(AppActivity::Foreground);
    manager.attach_app_lifecycle(signal_rx).await;

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    signal_tx.send(AppActivity::Background).expect("signal");
    wait_for_state(&manager, LifecycleState::Closed).await;

    signal_tx.send(AppActivity::Foreground).expect("signal");
    wait_until(|| connector.handshake_count() == 2).await;
    wait_for_state(&manager, LifecycleState::Open).await;
}

#[tokio::test]
async fn send_is_dropped_unless_open() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.send(&json!({"type": "ping"})).await;

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    manager.send(&json!({"type": "message", "content": "hi"})).await;

    let frame = connector.take_client_frame(0).expect("frame written");
    let value: serde_json::Value = serde_json::from_str(&frame).expect("json frame");
    assert_eq!(value, json!({"type": "message", "content": "hi"}));
    assert!(connector.take_client_frame(0).is_none());

    manager.set_app_activity(AppActivity::Background).await;
    manager.send(&json!({"type": "message", "content": "lost"})).await;
    manager.set_app_activity(AppActivity::Foreground).await;
    wait_for_state(&manager, LifecycleState::Open).await;
    assert!(connector.take_client_frame(1).is_none());
}

#[tokio::test]
async fn malformed_frame_is_discarded_without_closing() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = manager.subscribe(move |event: &InboundEvent| {
        let id = event.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        sink.lock().expect("seen").push(id.to_string());
    });

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    connector.push_frame(0, b"{not json");
    connector.push_frame(0, b"\"just a string\"");
    connector.push_json(0, json!({"id": "m1"}));
    connector.push_json(0, json!({"id": "m2"}));

    wait_until(|| seen.lock().expect("seen").len() == 2).await;
    assert_eq!(*seen.lock().expect("seen"), vec!["m1", "m2"]);
    assert_eq!(manager.state(), LifecycleState::Open);
    assert_eq!(connector.handshake_count(), 1);
}

#[tokio::test]
async fn shutdown_is_terminal() {
    let connector = Arc::new(FakeConnector::default());
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_for_state(&manager, LifecycleState::Open).await;

    manager.shutdown().await;
    assert_eq!(manager.state(), LifecycleState::Closed);

    manager.connect("wss://chat.example", &user()).await;
    manager.set_app_activity(AppActivity::Background).await;
    manager.set_app_activity(AppActivity::Foreground).await;
    tokio::time::sleep(RETRY * 3).await;
    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(manager.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn handshake_completing_after_background_is_discarded() {
    let connector = Arc::new(FakeConnector::gated(0));
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_until(|| connector.handshake_count() == 1).await;
    assert_eq!(manager.state(), LifecycleState::Connecting);

    manager.set_app_activity(AppActivity::Background).await;
    assert_eq!(manager.state(), LifecycleState::Closed);

    connector.release();
    wait_until(|| connector.link_count() == 1).await;
    wait_until(|| connector.client_side_closed(0)).await;
    wait_until(|| connector.reader_dropped(0)).await;

    tokio::time::sleep(RETRY * 3).await;
    assert_eq!(manager.state(), LifecycleState::Closed);
    assert_eq!(connector.handshake_count(), 1);
    assert!(!manager.reconnect_pending().await);

    manager.send(&json!({"type": "ping"})).await;
    assert!(connector.take_client_frame(0).is_none());
}

#[tokio::test]
async fn handshake_failure_after_shutdown_schedules_nothing() {
    let connector = Arc::new(FakeConnector::gated(1));
    let manager = manager_with(&connector);

    manager.connect("wss://chat.example", &user()).await;
    wait_until(|| connector.handshake_count() == 1).await;
    manager.shutdown().await;
    assert_eq!(manager.state(), LifecycleState::Closed);

    connector.release();
    tokio::time::sleep(RETRY * 4).await;
    assert_eq!(manager.state(), LifecycleState::Closed);
    assert_eq!(connector.handshake_count(), 1);
    assert_eq!(connector.link_count(), 0);
    assert!(!manager.reconnect_pending().await);
}
