use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use shared::{
    domain::{AppActivity, UserId},
    protocol::InboundEvent,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ConnectionSettings,
    error::ConnectError,
    listeners::{ListenerRegistry, Subscription},
    transport::{
        handshake_url, ChatConnector, HandshakeRequest, InboundFrames, TransportLink,
        WebSocketConnector,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

pub type ReconnectedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectTarget {
    address: String,
    user_id: UserId,
    url: Url,
}

impl ConnectTarget {
    fn new(address: &str, user_id: &UserId, user_id_param: &str) -> Result<Self, ConnectError> {
        let url = handshake_url(address, user_id, user_id_param)?;
        Ok(Self {
            address: address.trim().to_string(),
            user_id: user_id.clone(),
            url,
        })
    }
}

struct ConnectionState {
    target: Option<ConnectTarget>,
    lifecycle: LifecycleState,
    activity: AppActivity,
    was_backgrounded: bool,
    shut_down: bool,
    // Bumped for every attempt and every deliberate close, so notifications
    // from superseded links can be recognised and ignored.
    generation: u64,
    attempts: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    lifecycle_task: Option<JoinHandle<()>>,
    on_reconnected: Option<ReconnectedCallback>,
}

/// Owns the single persistent connection to the chat backend.
///
/// Construct one per process and share the `Arc`. All mutation goes through
/// one async mutex, so handlers observe a consistent state even though the
/// attempt, reader and timer run as separate tasks.
pub struct ConnectionManager {
    connector: Arc<dyn ChatConnector>,
    settings: ConnectionSettings,
    listeners: ListenerRegistry,
    state_tx: watch::Sender<LifecycleState>,
    inner: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn ChatConnector>, settings: ConnectionSettings) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        Arc::new(Self {
            connector,
            settings,
            listeners: ListenerRegistry::new(),
            state_tx,
            inner: Mutex::new(ConnectionState {
                target: None,
                lifecycle: LifecycleState::Idle,
                activity: AppActivity::Foreground,
                was_backgrounded: false,
                shut_down: false,
                generation: 0,
                attempts: 0,
                outbound: None,
                reader_task: None,
                reconnect_timer: None,
                lifecycle_task: None,
                on_reconnected: None,
            }),
        })
    }

    pub fn with_websocket(settings: ConnectionSettings) -> Arc<Self> {
        Self::new(Arc::new(WebSocketConnector), settings)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub async fn reconnect_pending(&self) -> bool {
        self.inner.lock().await.reconnect_timer.is_some()
    }

    pub async fn connection_attempts(&self) -> u64 {
        self.inner.lock().await.attempts
    }

    /// Called after a background-to-foreground transition so callers can
    /// refresh anything missed while disconnected.
    pub async fn set_on_reconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().await.on_reconnected = Some(Arc::new(callback));
    }

    /// Records the target and starts connecting unless a connection is
    /// already open or in progress. Invalid input is logged and ignored.
    pub async fn connect(self: &Arc<Self>, address: &str, user_id: &UserId) {
        let target = match ConnectTarget::new(address, user_id, &self.settings.user_id_param) {
            Ok(target) => target,
            Err(err) => {
                warn!(error = %err, "chat: connect abandoned");
                return;
            }
        };

        let mut guard = self.inner.lock().await;
        if guard.shut_down {
            warn!("chat: connect ignored after shutdown");
            return;
        }
        guard.target = Some(target);

        if matches!(
            guard.lifecycle,
            LifecycleState::Open | LifecycleState::Connecting
        ) {
            debug!(state = ?guard.lifecycle, "chat: connect ignored, connection already live");
            return;
        }
        if guard.activity == AppActivity::Background {
            info!("chat: app in background, connecting on next foreground");
            return;
        }
        self.begin_attempt(&mut guard);
    }

    /// Serializes `payload` and writes it as one text frame. Dropped with a
    /// warning unless the connection is open; nothing is queued.
    pub async fn send<T>(&self, payload: &T)
    where
        T: Serialize + ?Sized,
    {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "chat: dropping unserializable outbound payload");
                return;
            }
        };

        let guard = self.inner.lock().await;
        match (&guard.lifecycle, &guard.outbound) {
            (LifecycleState::Open, Some(outbound)) => {
                if outbound.send(text).is_err() {
                    warn!("chat: dropping outbound payload, transport writer has stopped");
                }
            }
            (state, _) => {
                warn!(state = ?state, "chat: dropping outbound payload, connection not open");
            }
        }
    }

    pub async fn set_app_activity(self: &Arc<Self>, activity: AppActivity) {
        match activity {
            AppActivity::Background => self.enter_background().await,
            AppActivity::Foreground => self.enter_foreground().await,
        }
    }

    /// Follows the host's lifecycle signal for as long as the manager lives.
    pub async fn attach_app_lifecycle(self: &Arc<Self>, mut signal: watch::Receiver<AppActivity>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let activity = *signal.borrow_and_update();
                manager.set_app_activity(activity).await;
            }
            debug!("chat: app lifecycle signal closed");
        });

        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.lifecycle_task.replace(task) {
            previous.abort();
        }
    }

    /// Terminal transition for process teardown.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        guard.shut_down = true;
        if let Some(task) = guard.lifecycle_task.take() {
            task.abort();
        }
        self.close_link(&mut guard);
        info!("chat: connection manager shut down");
    }

    fn set_lifecycle(&self, state: &mut ConnectionState, next: LifecycleState) {
        if state.lifecycle != next {
            debug!(from = ?state.lifecycle, to = ?next, "chat: lifecycle transition");
        }
        state.lifecycle = next;
        self.state_tx.send_replace(next);
    }

    fn begin_attempt(self: &Arc<Self>, state: &mut ConnectionState) {
        let Some(target) = state.target.clone() else {
            return;
        };
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }

        state.generation += 1;
        state.attempts += 1;
        let generation = state.generation;
        self.set_lifecycle(state, LifecycleState::Connecting);
        info!(
            address = %target.address,
            user_id = %target.user_id,
            attempt = state.attempts,
            "chat: connecting"
        );

        let request = HandshakeRequest {
            url: target.url,
            headers: self.settings.handshake_headers(),
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match manager.connector.open(request).await {
                Ok(link) => manager.on_link_open(generation, link).await,
                Err(err) => {
                    warn!(error = %err, "chat: connection attempt failed");
                    manager.on_link_closed(generation).await;
                }
            }
        });
    }

    async fn on_link_open(self: &Arc<Self>, generation: u64, link: TransportLink) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation || guard.lifecycle != LifecycleState::Connecting {
            debug!(generation, "chat: discarding connection from superseded attempt");
            return;
        }

        if let Some(timer) = guard.reconnect_timer.take() {
            timer.abort();
        }
        let TransportLink { outbound, inbound } = link;
        guard.outbound = Some(outbound);
        let manager = Arc::clone(self);
        guard.reader_task = Some(tokio::spawn(async move {
            manager.read_frames(generation, inbound).await;
        }));
        self.set_lifecycle(&mut guard, LifecycleState::Open);
        info!(attempt = guard.attempts, "chat: connection open");
    }

    async fn read_frames(self: Arc<Self>, generation: u64, mut inbound: InboundFrames) {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(bytes) => match InboundEvent::from_frame(&bytes) {
                    Ok(event) => {
                        self.listeners.dispatch(&event);
                    }
                    Err(err) => {
                        warn!(error = %err, len = bytes.len(), "chat: discarding malformed frame");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "chat: transport error");
                    break;
                }
            }
        }
        self.on_link_closed(generation).await;
    }

    async fn on_link_closed(self: &Arc<Self>, generation: u64) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation
            || !matches!(
                guard.lifecycle,
                LifecycleState::Connecting | LifecycleState::Open
            )
        {
            debug!(generation, "chat: ignoring stale close notification");
            return;
        }

        guard.outbound = None;
        // Detach rather than abort: this may be running on the reader task itself.
        guard.reader_task = None;
        self.set_lifecycle(&mut guard, LifecycleState::Closed);
        info!("chat: connection closed");
        self.schedule_reconnect(&mut guard);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ConnectionState) {
        if state.shut_down || state.activity == AppActivity::Background || state.target.is_none()
        {
            return;
        }
        if state.reconnect_timer.is_some() {
            return;
        }

        let interval = self.settings.reconnect_interval;
        let manager = Arc::clone(self);
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            manager.retry().await;
        }));
        self.set_lifecycle(state, LifecycleState::Reconnecting);
        info!(
            retry_in_ms = interval.as_millis() as u64,
            "chat: reconnect scheduled"
        );
    }

    async fn retry(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        // Our own handle; dropping it detaches without cancelling this task.
        guard.reconnect_timer = None;
        if guard.shut_down
            || guard.activity == AppActivity::Background
            || guard.lifecycle != LifecycleState::Reconnecting
        {
            return;
        }
        self.begin_attempt(&mut guard);
    }

    async fn enter_background(&self) {
        let mut guard = self.inner.lock().await;
        if guard.activity == AppActivity::Background {
            return;
        }
        guard.activity = AppActivity::Background;
        guard.was_backgrounded = true;
        self.close_link(&mut guard);
        info!("chat: app backgrounded, connection paused");
    }

    async fn enter_foreground(self: &Arc<Self>) {
        let callback = {
            let mut guard = self.inner.lock().await;
            guard.activity = AppActivity::Foreground;
            if !guard.was_backgrounded {
                return;
            }
            guard.was_backgrounded = false;
            if guard.shut_down || guard.target.is_none() {
                return;
            }

            info!("chat: app foregrounded, reconnecting");
            if !matches!(
                guard.lifecycle,
                LifecycleState::Open | LifecycleState::Connecting
            ) {
                self.begin_attempt(&mut guard);
            }
            guard.on_reconnected.clone()
        };

        if let Some(callback) = callback {
            callback();
        }
    }

    // Deliberate close: no reconnect is scheduled from here.
    fn close_link(&self, state: &mut ConnectionState) {
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = state.reader_task.take() {
            reader.abort();
        }
        // Dropping the sender makes the transport writer close the socket.
        state.outbound = None;
        state.generation += 1;
        if state.lifecycle != LifecycleState::Idle {
            self.set_lifecycle(state, LifecycleState::Closed);
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
