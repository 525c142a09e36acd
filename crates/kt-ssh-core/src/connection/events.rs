//! Connection event bus (§3, §4.2.3)
//!
//! Every `emitEvent` call appends to the per-instance ring first, then
//! delivers to each registered listener in registration order — the same
//! "snapshot under lock, invoke outside" discipline the teacher's
//! `StateCoordinator` documents for cross-collection operations.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use kt_core::time::current_time_millis;
use kt_core::types::InstanceId;

use crate::ring_buffer::RingBuffer;

/// Capacity of the per-instance event ring buffer (§3).
pub const EVENT_HISTORY_CAPACITY: usize = 100;

/// A typed, timestamped connection/audit event (§3).
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub instance: InstanceId,
    pub kind: ConnectionEventKind,
    pub timestamp_millis: u64,
    pub details: String,
}

/// The closed set of event kinds §3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
    KeyUploaded,
    HealthCheckFailed,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventKind::Connected => "connected",
            ConnectionEventKind::Disconnected => "disconnected",
            ConnectionEventKind::Reconnecting => "reconnecting",
            ConnectionEventKind::Reconnected => "reconnected",
            ConnectionEventKind::ReconnectFailed => "reconnect_failed",
            ConnectionEventKind::KeyUploaded => "key_uploaded",
            ConnectionEventKind::HealthCheckFailed => "health_check_failed",
        }
    }
}

/// A callback invoked synchronously for every emitted event, in
/// registration order. Must not re-enter `EventBus`/`ConnectionManager`
/// methods that take the same instance's lock (§5); long work should be
/// offloaded by the listener itself.
pub type EventListener = Box<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Owns the per-instance event ring buffers and the set of registered
/// listeners.
#[derive(Default)]
pub struct EventBus {
    history: DashMap<InstanceId, RingBuffer<ConnectionEvent>>,
    listeners: RwLock<Vec<Arc<EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            history: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener invoked on every future event.
    pub fn on_event(&self, listener: EventListener) {
        self.listeners
            .write()
            .expect("event bus listener lock poisoned")
            .push(Arc::new(listener));
    }

    /// Append to the instance's ring and deliver to listeners, in that
    /// order (§4.2.3). This is the sole entry point for emitting events.
    pub fn emit(&self, instance: InstanceId, kind: ConnectionEventKind, details: impl Into<String>) {
        let event = ConnectionEvent {
            instance,
            kind,
            timestamp_millis: current_time_millis(),
            details: details.into(),
        };

        self.history
            .entry(instance)
            .or_insert_with(|| RingBuffer::new(EVENT_HISTORY_CAPACITY))
            .push(event.clone());

        // Snapshot the listener list under lock, then invoke outside it —
        // listeners must never be called while holding a manager lock.
        let listeners = self
            .listeners
            .read()
            .expect("event bus listener lock poisoned")
            .clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Up to the most recent `EVENT_HISTORY_CAPACITY` events for an
    /// instance, in chronological order.
    pub fn history(&self, instance: InstanceId) -> Vec<ConnectionEvent> {
        self.history
            .get(&instance)
            .map(|buf| buf.snapshot())
            .unwrap_or_default()
    }
}
