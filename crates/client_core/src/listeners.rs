use std::{
    any::Any,
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use shared::protocol::InboundEvent;
use tracing::{debug, warn};

type Listener = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    // Ids grow monotonically, so key order is registration order.
    listeners: BTreeMap<ListenerId, Listener>,
}

/// Fan-out of inbound events to every registered consumer.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        let id = ListenerId(state.next_id);
        state.next_id += 1;
        state.listeners.insert(id, Arc::new(callback));
        debug!(listener_id = id.0, total = state.listeners.len(), "chat: listener subscribed");

        Subscription {
            id,
            registry: Arc::downgrade(&self.state),
            active: AtomicBool::new(true),
        }
    }

    /// Delivers `event` to every listener registered when the dispatch starts,
    /// in registration order. Returns how many listeners completed normally.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = lock(&self.state)
            .listeners
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => warn!(
                    listener_id = id.0,
                    reason = panic_reason(payload.as_ref()),
                    "chat: listener panicked during dispatch"
                ),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: ListenerId,
    registry: Weak<Mutex<RegistryState>>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes the listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.registry.upgrade() {
            let mut state = lock(&state);
            state.listeners.remove(&self.id);
            debug!(
                listener_id = self.id.0,
                total = state.listeners.len(),
                "chat: listener unsubscribed"
            );
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "tests/listeners_tests.rs"]
mod tests;
