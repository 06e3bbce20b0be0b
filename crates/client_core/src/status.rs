use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{
    domain::{ConversationId, MessageStatus, UserId},
    protocol::{InboundEvent, MessageTarget, StatusUpdate},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::listeners::{ListenerRegistry, Subscription};

// Accepted spellings per logical field, highest priority first.
const MESSAGE_ID_KEYS: &[&str] = &["messageId", "message_id", "id", "_id"];
const CONVERSATION_ID_KEYS: &[&str] = &["conversationId", "conversation_id", "chatId", "chat_id"];
const SENDER_ID_KEYS: &[&str] = &["senderId", "sender_id", "userId", "user_id", "from"];
const STATUS_KEYS: &[&str] = &["status", "messageStatus", "message_status"];
const DELIVERED_AT_KEYS: &[&str] = &["deliveredAt", "delivered_at"];
const READ_AT_KEYS: &[&str] = &["readAt", "read_at"];
const NESTED_PAYLOAD_KEYS: &[&str] = &["data", "payload"];

/// Per-conversation projection shown by the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    /// The other participant, used to match updates that carry no conversation id.
    pub participant_id: Option<UserId>,
    pub unread_count: u32,
    pub last_message_status: Option<MessageStatus>,
    pub last_status_is_local: bool,
}

impl ConversationSummary {
    pub fn new(conversation_id: ConversationId, participant_id: Option<UserId>) -> Self {
        Self {
            conversation_id,
            participant_id,
            unread_count: 0,
            last_message_status: None,
            last_status_is_local: false,
        }
    }

    pub fn with_unread(mut self, unread_count: u32) -> Self {
        self.unread_count = unread_count;
        self
    }
}

/// Folds status notifications, remote and local, into conversation summaries.
pub struct StatusReconciler {
    summaries: RwLock<Vec<ConversationSummary>>,
    changes: broadcast::Sender<ConversationSummary>,
}

impl Default for StatusReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReconciler {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            summaries: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// Registers this reconciler as an inbound-event listener.
    pub fn attach(self: &Arc<Self>, registry: &ListenerRegistry) -> Subscription {
        let reconciler = Arc::clone(self);
        registry.subscribe(move |event: &InboundEvent| {
            reconciler.handle_event(event);
        })
    }

    pub fn handle_event(&self, event: &InboundEvent) -> bool {
        match Self::normalize(event) {
            Some(update) => self.merge(&update),
            None => false,
        }
    }

    pub fn normalize(event: &InboundEvent) -> Option<StatusUpdate> {
        Self::normalize_payload(event.payload())
    }

    /// Extracts a canonical update from a loosely structured payload. Returns
    /// `None` unless both a message id and a known status can be found.
    pub fn normalize_payload(payload: &Map<String, Value>) -> Option<StatusUpdate> {
        let scopes = payload_scopes(payload);

        let message = lookup(&scopes, MESSAGE_ID_KEYS, identifier)
            .map(|raw| MessageTarget::from_raw(&raw))?;
        let status = lookup(&scopes, STATUS_KEYS, |value| {
            value.as_str()?.parse::<MessageStatus>().ok()
        })?;

        Some(StatusUpdate {
            message,
            conversation_id: lookup(&scopes, CONVERSATION_ID_KEYS, identifier)
                .map(ConversationId::from),
            sender_id: lookup(&scopes, SENDER_ID_KEYS, identifier).map(UserId::from),
            status,
            delivered_at: lookup(&scopes, DELIVERED_AT_KEYS, timestamp),
            read_at: lookup(&scopes, READ_AT_KEYS, timestamp),
            is_local: false,
        })
    }

    /// Marks every message in the conversation read before the server confirms it.
    pub fn apply_local_read(&self, conversation_id: &ConversationId) -> StatusUpdate {
        let update = StatusUpdate::local_read(conversation_id.clone());
        self.merge(&update);
        update
    }

    /// Applies `update` to the matching summary. Returns false when no summary
    /// matches; summaries are never created here.
    ///
    /// Last applied wins: there is no timestamp ordering, so a late `delivered`
    /// overwrites an earlier `read`.
    pub fn merge(&self, update: &StatusUpdate) -> bool {
        let changed = {
            let mut summaries = self
                .summaries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let position = match (&update.conversation_id, &update.sender_id) {
                (Some(conversation_id), _) => summaries
                    .iter()
                    .position(|summary| &summary.conversation_id == conversation_id),
                (None, Some(sender_id)) => summaries
                    .iter()
                    .position(|summary| summary.participant_id.as_ref() == Some(sender_id)),
                (None, None) => None,
            };
            let Some(position) = position else {
                debug!(
                    message_ref = %update.message,
                    conversation_id = ?update.conversation_id,
                    status = %update.status,
                    "chat: status update matches no conversation"
                );
                return false;
            };

            let summary = &mut summaries[position];
            if update.status == MessageStatus::Read {
                summary.unread_count = 0;
            }
            summary.last_message_status = Some(update.status);
            summary.last_status_is_local = update.is_local;
            summary.clone()
        };

        if update.is_local {
            info!(
                conversation_id = %changed.conversation_id,
                status = %update.status,
                "chat: applied local status"
            );
        } else {
            debug!(
                conversation_id = %changed.conversation_id,
                message_ref = %update.message,
                status = %update.status,
                "chat: applied server status"
            );
        }
        let _ = self.changes.send(changed);
        true
    }

    /// Replaces the known conversations, e.g. after the list screen refetches.
    pub fn replace_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self
            .summaries
            .write()
            .unwrap_or_else(PoisonError::into_inner) = summaries;
    }

    pub fn upsert_summary(&self, summary: ConversationSummary) {
        let mut summaries = self
            .summaries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match summaries
            .iter()
            .position(|existing| existing.conversation_id == summary.conversation_id)
        {
            Some(position) => summaries[position] = summary,
            None => summaries.push(summary),
        }
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.summaries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summary(&self, conversation_id: &ConversationId) -> Option<ConversationSummary> {
        self.summaries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|summary| &summary.conversation_id == conversation_id)
            .cloned()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ConversationSummary> {
        self.changes.subscribe()
    }
}

fn payload_scopes(payload: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    let mut scopes = vec![payload];
    scopes.extend(
        NESTED_PAYLOAD_KEYS
            .iter()
            .filter_map(|key| payload.get(*key).and_then(Value::as_object)),
    );
    scopes
}

// Alias order dominates scope order, so a nested `messageId` beats an
// envelope's generic `id`. Values that fail `convert` fall through to the
// next candidate.
fn lookup<'a, T>(
    scopes: &[&'a Map<String, Value>],
    aliases: &[&str],
    convert: impl Fn(&'a Value) -> Option<T>,
) -> Option<T> {
    aliases.iter().find_map(|key| {
        scopes
            .iter()
            .copied()
            .find_map(|scope| scope.get(*key).and_then(&convert))
    })
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
