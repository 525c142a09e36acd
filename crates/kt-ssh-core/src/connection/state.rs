//! Per-instance connection state machine (§3, §4.2.2)

use std::sync::{Mutex, RwLock};

use dashmap::DashMap;

use kt_core::time::current_time_millis;
use kt_core::types::{ConnectionState, InstanceId};

use crate::ring_buffer::RingBuffer;

/// Capacity of the per-instance state-transition ring buffer (§3).
pub const STATE_HISTORY_CAPACITY: usize = 50;

/// One recorded transition (§3).
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp_millis: u64,
    pub reason: String,
}

/// A callback invoked synchronously on every state change, outside any
/// manager lock (§4.2.2, §9).
pub type StateListener = Box<dyn Fn(InstanceId, &StateTransition) + Send + Sync>;

struct InstanceState {
    current: ConnectionState,
    history: RingBuffer<StateTransition>,
}

/// Owns the per-instance current state, its transition history, and the
/// set of registered state-change callbacks.
#[derive(Default)]
pub struct StateTracker {
    states: DashMap<InstanceId, Mutex<InstanceState>>,
    listeners: RwLock<Vec<std::sync::Arc<StateListener>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked on every future state change.
    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners
            .write()
            .expect("state tracker listener lock poisoned")
            .push(std::sync::Arc::new(listener));
    }

    /// Current state for an instance, `Disconnected` if never observed.
    pub fn current(&self, instance: InstanceId) -> ConnectionState {
        self.states
            .get(&instance)
            .map(|entry| entry.lock().expect("state lock poisoned").current)
            .unwrap_or(ConnectionState::INITIAL)
    }

    /// Set the state for an instance. A no-op, per §4.2.2/§8, when `to`
    /// already equals the current state — no transition is recorded and no
    /// callback fires.
    pub fn set_state(&self, instance: InstanceId, to: ConnectionState, reason: impl Into<String>) {
        let entry = self
            .states
            .entry(instance)
            .or_insert_with(|| Mutex::new(InstanceState {
                current: ConnectionState::INITIAL,
                history: RingBuffer::new(STATE_HISTORY_CAPACITY),
            }));
        let mut guard = entry.lock().expect("state lock poisoned");

        if guard.current == to {
            return;
        }

        let transition = StateTransition {
            from: guard.current,
            to,
            timestamp_millis: current_time_millis(),
            reason: reason.into(),
        };
        guard.current = to;
        guard.history.push(transition.clone());
        drop(guard);

        let listeners = self
            .listeners
            .read()
            .expect("state tracker listener lock poisoned")
            .clone();
        for listener in listeners {
            listener(instance, &transition);
        }
    }

    /// Chronological copy of an instance's transition history.
    pub fn transitions(&self, instance: InstanceId) -> Vec<StateTransition> {
        self.states
            .get(&instance)
            .map(|entry| entry.lock().expect("state lock poisoned").history.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_instance_starts_disconnected() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.current(InstanceId::new(1)), ConnectionState::Disconnected);
        assert!(tracker.transitions(InstanceId::new(1)).is_empty());
    }

    #[test]
    fn setting_the_same_state_is_a_noop() {
        let tracker = StateTracker::new();
        let instance = InstanceId::new(1);
        tracker.set_state(instance, ConnectionState::Connecting, "connect");
        tracker.set_state(instance, ConnectionState::Connecting, "duplicate");

        assert_eq!(tracker.transitions(instance).len(), 1);
    }

    #[test]
    fn transitions_recorded_in_order() {
        let tracker = StateTracker::new();
        let instance = InstanceId::new(1);
        tracker.set_state(instance, ConnectionState::Connecting, "connect");
        tracker.set_state(instance, ConnectionState::Connected, "handshake ok");
        tracker.set_state(instance, ConnectionState::Disconnected, "keepalive_failed");

        let history = tracker.transitions(instance);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].to, ConnectionState::Connecting);
        assert_eq!(history[1].to, ConnectionState::Connected);
        assert_eq!(history[2].to, ConnectionState::Disconnected);
        assert_eq!(history[2].reason, "keepalive_failed");
    }

    #[test]
    fn history_caps_at_50() {
        let tracker = StateTracker::new();
        let instance = InstanceId::new(1);
        for i in 0..60 {
            let target = if i % 2 == 0 {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            tracker.set_state(instance, target, format!("n={i}"));
        }
        assert_eq!(tracker.transitions(instance).len(), STATE_HISTORY_CAPACITY);
    }

    #[test]
    fn listener_receives_every_non_noop_transition() {
        let tracker = StateTracker::new();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = std::sync::Arc::clone(&count);
        tracker.on_state_change(Box::new(move |_, _| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let instance = InstanceId::new(1);
        tracker.set_state(instance, ConnectionState::Connecting, "a");
        tracker.set_state(instance, ConnectionState::Connecting, "a-dup");
        tracker.set_state(instance, ConnectionState::Connected, "b");

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
