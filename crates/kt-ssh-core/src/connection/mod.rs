//! Connections: one multiplexed SSH client per instance (§3, §4.2)

mod client;
mod events;
mod manager;
mod state;

pub use events::{ConnectionEvent, ConnectionEventKind, EventBus, EventListener, EVENT_HISTORY_CAPACITY};
pub use manager::{ConnectionManager, ManagedConnection, ReconnectRequest};
pub use state::{StateListener, StateTracker, StateTransition, STATE_HISTORY_CAPACITY};
