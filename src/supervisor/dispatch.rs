//! Listener registry and fan-out
//!
//! Listeners are held by `Arc` identity in insertion order. Registration is
//! idempotent; dispatch snapshots the list, so removal while a dispatch is
//! running never panics and never affects the in-flight delivery round. A
//! listener that panics is logged and skipped; the remaining listeners still
//! receive the record.

use crate::protocol::{matches_topic, AgentEvent, AgentLogEntry};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, trace};

/// Receives framework events whose topic matches one of the declared
/// patterns
pub trait EventListener: Send + Sync {
    /// Topic patterns this listener subscribes to; see
    /// [`matches_topic`](crate::protocol::matches_topic) for the rule
    fn topics(&self) -> Vec<String>;

    fn on_event(&self, event: &AgentEvent);
}

/// Receives every log record, unfiltered
pub trait LogListener: Send + Sync {
    fn logged(&self, entry: &AgentLogEntry);
}

#[derive(Default)]
pub struct ListenerRegistry {
    event_listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    log_listeners: RwLock<Vec<Arc<dyn LogListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-adding an already-registered listener is a no-op
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.event_listeners.write().expect("listener lock poisoned");
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) {
        let mut listeners = self.event_listeners.write().expect("listener lock poisoned");
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_log_listener(&self, listener: Arc<dyn LogListener>) {
        let mut listeners = self.log_listeners.write().expect("listener lock poisoned");
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_log_listener(&self, listener: &Arc<dyn LogListener>) {
        let mut listeners = self.log_listeners.write().expect("listener lock poisoned");
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn event_listener_count(&self) -> usize {
        self.event_listeners.read().expect("listener lock poisoned").len()
    }

    pub fn log_listener_count(&self) -> usize {
        self.log_listeners.read().expect("listener lock poisoned").len()
    }

    /// Deliver an event to every listener whose pattern set matches its
    /// topic
    pub fn dispatch_event(&self, event: &AgentEvent) {
        let snapshot: Vec<_> = {
            let listeners = self.event_listeners.read().expect("listener lock poisoned");
            listeners.clone()
        };
        trace!(topic = %event.topic, listeners = snapshot.len(), "dispatching event");
        for listener in snapshot {
            if matches_topic(&event.topic, &listener.topics()) {
                if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                    error!(topic = %event.topic, "event listener panicked; continuing");
                }
            }
        }
    }

    /// Deliver a log record to every registered log listener
    pub fn dispatch_log(&self, entry: &AgentLogEntry) {
        let snapshot: Vec<_> = {
            let listeners = self.log_listeners.read().expect("listener lock poisoned");
            listeners.clone()
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener.logged(entry))).is_err() {
                error!("log listener panicked; continuing");
            }
        }
    }
}
