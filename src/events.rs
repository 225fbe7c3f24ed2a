use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

/// Named events published by a [`Scheduler`](crate::operations::Scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueEvent {
    /// Any operation or queue-status mutation.
    StateChanged,
    /// One operation reached a terminal state.
    OperationDone,
    /// The queue returned to idle.
    DrainComplete,
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Minimal named publish/subscribe used to fan out queue-state changes.
///
/// Listener invocations are isolated: a panicking listener is logged and does
/// not prevent subsequent listeners from running or abort the scheduler.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<QueueEvent, Vec<(ListenerToken, Listener)>>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an event. Multiple listeners per event are supported.
    pub fn on(&self, event: QueueEvent, listener: impl Fn() + Send + Sync + 'static) -> ListenerToken {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut map = self.lock();
        map.entry(event).or_default().push((token, Arc::new(listener)));
        token
    }

    /// Remove a previously registered listener. Unknown tokens are ignored.
    pub fn off(&self, event: QueueEvent, token: ListenerToken) {
        let mut map = self.lock();
        if let Some(list) = map.get_mut(&event) {
            list.retain(|(t, _)| *t != token);
        }
    }

    /// Invoke every listener registered for `event`.
    pub(crate) fn emit(&self, event: QueueEvent) {
        // Snapshot the listener list so listeners can subscribe/unsubscribe
        // (or emit) without deadlocking on the registry lock.
        let listeners: Vec<Listener> = {
            let map = self.lock();
            map.get(&event)
                .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                error!(?event, "event listener panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QueueEvent, Vec<(ListenerToken, Listener)>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
