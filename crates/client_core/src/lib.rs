use std::sync::Arc;

use serde::Serialize;
use shared::{
    domain::{AppActivity, ConversationId, UserId},
    protocol::{ClientFrame, InboundEvent, StatusUpdate},
};
use tokio::sync::watch;

pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod status;
pub mod transport;

pub use config::{load_settings, ConnectionSettings};
pub use connection::{ConnectionManager, LifecycleState};
pub use listeners::{ListenerRegistry, Subscription};
pub use status::{ConversationSummary, StatusReconciler};
pub use transport::{ChatConnector, HandshakeRequest, TransportLink, WebSocketConnector};

/// The process-scoped chat client: one connection, one status projection.
///
/// Built once at application start and handed to screens by reference.
/// The status reconciler stays subscribed for the session's lifetime.
pub struct ChatSession {
    connection: Arc<ConnectionManager>,
    status: Arc<StatusReconciler>,
    _status_subscription: Subscription,
}

impl ChatSession {
    pub fn new(connector: Arc<dyn ChatConnector>, settings: ConnectionSettings) -> Self {
        Self::from_connection(ConnectionManager::new(connector, settings))
    }

    pub fn with_websocket(settings: ConnectionSettings) -> Self {
        Self::from_connection(ConnectionManager::with_websocket(settings))
    }

    fn from_connection(connection: Arc<ConnectionManager>) -> Self {
        let status = Arc::new(StatusReconciler::new());
        let status_subscription = status.attach(connection.listeners());
        Self {
            connection,
            status,
            _status_subscription: status_subscription,
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn status(&self) -> &Arc<StatusReconciler> {
        &self.status
    }

    pub async fn connect(&self, address: &str, user_id: &UserId) {
        self.connection.connect(address, user_id).await;
    }

    pub async fn send<T>(&self, payload: &T)
    where
        T: Serialize + ?Sized,
    {
        self.connection.send(payload).await;
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.connection.subscribe(callback)
    }

    pub fn apply_local_read(&self, conversation_id: &ConversationId) -> StatusUpdate {
        self.status.apply_local_read(conversation_id)
    }

    /// Optimistically marks the conversation read, then tells the backend.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &UserId,
    ) -> StatusUpdate {
        let update = self.status.apply_local_read(conversation_id);
        self.connection
            .send(&ClientFrame::MarkRead {
                conversation_id: conversation_id.clone(),
                reader_id: reader_id.clone(),
            })
            .await;
        update
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.status.summaries()
    }

    pub async fn set_app_activity(&self, activity: AppActivity) {
        self.connection.set_app_activity(activity).await;
    }

    pub async fn attach_app_lifecycle(&self, signal: watch::Receiver<AppActivity>) {
        self.connection.attach_app_lifecycle(signal).await;
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}
