//! Per-session event registry.
//!
//! Broad handlers are keyed on an [`EventKind`], narrow ones on a kind plus
//! the entity id the event is about (see [`Event::entity_id`]). Both fire for
//! a matching event, broad first, each group in registration order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use parley_media::MediaHandle;
use parley_shared::protocol::{Event, EventKind};
use parley_shared::types::UserId;
use tracing::{debug, error, warn};

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type StreamCallback = Arc<dyn Fn(&UserId, &MediaHandle) + Send + Sync>;

/// Returned by every registration; pass it to [`EventHandler::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Tables {
    next_id: u64,
    broad: HashMap<EventKind, Vec<(HandlerId, Callback)>>,
    /// Kind, then entity id. Emptied entries are removed, so a present kind
    /// always has a live handler.
    narrow: HashMap<EventKind, HashMap<String, Vec<(HandlerId, Callback)>>>,
    streams: Vec<(HandlerId, StreamCallback)>,
}

impl Tables {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    fn has_narrow(&self, kind: EventKind) -> bool {
        self.narrow.contains_key(&kind)
    }

    fn prune_narrow(&mut self) {
        for by_entity in self.narrow.values_mut() {
            by_entity.retain(|_, handlers| !handlers.is_empty());
        }
        self.narrow.retain(|_, by_entity| !by_entity.is_empty());
    }
}

/// Cheap to clone; clones share the same tables.
#[derive(Clone, Default)]
pub struct EventHandler {
    tables: Arc<Mutex<Tables>>,
}

/// Non-owning reference to an [`EventHandler`], for closures stored in its
/// own tables.
#[derive(Clone)]
pub struct WeakEventHandler {
    tables: Weak<Mutex<Tables>>,
}

impl WeakEventHandler {
    pub fn upgrade(&self) -> Option<EventHandler> {
        self.tables.upgrade().map(|tables| EventHandler { tables })
    }
}

impl EventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakEventHandler {
        WeakEventHandler {
            tables: Arc::downgrade(&self.tables),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Callbacks never run under the lock, so poisoning cannot leave the
        // tables half-updated.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_event<F>(&self, kind: EventKind, callback: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut tables = self.lock();
        let id = tables.next_id();
        tables
            .broad
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(kind = %kind, "Registered event handler");
        id
    }

    pub fn on_concrete_event<F>(&self, kind: EventKind, entity: &str, callback: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut tables = self.lock();
        let id = tables.next_id();
        tables
            .narrow
            .entry(kind)
            .or_default()
            .entry(entity.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(kind = %kind, entity, "Registered concrete event handler");
        id
    }

    pub fn on_error<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_event(EventKind::Error, callback)
    }

    pub fn on_remote_stream<F>(&self, callback: F) -> HandlerId
    where
        F: Fn(&UserId, &MediaHandle) + Send + Sync + 'static,
    {
        let mut tables = self.lock();
        let id = tables.next_id();
        tables.streams.push((id, Arc::new(callback)));
        id
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut guard = self.lock();
        let tables = &mut *guard;
        let mut removed = false;
        let narrow = tables.narrow.values_mut().flat_map(|by_entity| by_entity.values_mut());
        for handlers in tables.broad.values_mut().chain(narrow) {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            removed |= handlers.len() != before;
        }
        tables.prune_narrow();
        let before = tables.streams.len();
        tables.streams.retain(|(h, _)| *h != id);
        removed | (tables.streams.len() != before)
    }

    /// Drop every narrow handler registered for `entity`, whatever the kind.
    pub fn forget_entity(&self, entity: &str) {
        let mut tables = self.lock();
        let mut dropped = 0;
        for by_entity in tables.narrow.values_mut() {
            dropped += by_entity.remove(entity).map_or(0, |handlers| handlers.len());
        }
        tables.prune_narrow();
        if dropped > 0 {
            debug!(entity, dropped, "Forgot entity handlers");
        }
    }

    pub fn notify(&self, event: &Event) {
        let kind = event.kind();

        // Snapshot so handlers may (un)register without deadlocking; changes
        // apply from the next dispatch on.
        let (broad, narrow, any_narrow) = {
            let tables = self.lock();
            let broad: Vec<Callback> = tables
                .broad
                .get(&kind)
                .map(|hs| hs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            let narrow: Vec<Callback> = event
                .entity_id()
                .and_then(|id| tables.narrow.get(&kind)?.get(id))
                .map(|hs| hs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            (broad, narrow, tables.has_narrow(kind))
        };

        if kind == EventKind::Error {
            if broad.is_empty() {
                warn!(event = ?event, "Error event with no error handler, dropping");
                return;
            }
            run_all(kind, &broad, event);
            return;
        }

        if broad.is_empty() && !any_narrow {
            debug!(kind = %kind, "No handler for event");
            self.notify(&Event::unhandled(event));
            return;
        }

        run_all(kind, &broad, event);
        run_all(kind, &narrow, event);
    }

    pub fn notify_remote_stream(&self, peer: &UserId, stream: &MediaHandle) {
        let callbacks: Vec<StreamCallback> = self
            .lock()
            .streams
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        if callbacks.is_empty() {
            debug!(peer = %peer, stream = stream.id(), "Remote stream with no subscriber");
        }
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(peer, stream))).is_err() {
                error!(peer = %peer, "Remote stream handler panicked");
            }
        }
    }
}

fn run_all(kind: EventKind, callbacks: &[Callback], event: &Event) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!(kind = %kind, "Event handler panicked");
        }
    }
}
