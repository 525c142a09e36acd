//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric identifier for a managed agent instance.
///
/// Stable across agent renames — `ConnectionManager`, `TunnelManager`, and
/// the Reconciler key every Connection, Tunnel, and state/event buffer off
/// this value rather than a hostname or alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// Create a new instance ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The fixed, closed set of services a Tunnel can front (§3).
///
/// `Vnc` and `Gateway` bind fixed remote ports; `Custom` carries a
/// caller-supplied remote port for ad hoc forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceLabel {
    /// Remote-desktop-streaming service on the agent.
    Vnc,
    /// HTTP/WebSocket gateway service on the agent.
    Gateway,
    /// Caller-supplied remote port, not one of the two well-known services.
    Custom,
}

impl fmt::Display for ServiceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceLabel::Vnc => write!(f, "vnc"),
            ServiceLabel::Gateway => write!(f, "gateway"),
            ServiceLabel::Custom => write!(f, "custom"),
        }
    }
}

/// Per-instance connection state, as tracked by `ConnectionManager` (§4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No Connection exists and none is being established.
    Disconnected,
    /// A Connect/reconnect attempt's handshake is in flight.
    Connecting,
    /// A live Connection is published and its keepalive loop is running.
    Connected,
    /// The Reconnector is retrying establishment after a detected failure.
    Reconnecting,
    /// Reconnection was exhausted; the instance needs an explicit trigger.
    Failed,
}

impl ConnectionState {
    /// The initial state for an instance never seen before.
    pub const INITIAL: ConnectionState = ConnectionState::Disconnected;
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// External status of an instance, as reported by the status source the
/// Reconciler reads (§6, treated as opaque here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// The agent container is running and should have a live Connection.
    Running,
    /// The agent container is stopped; any tunnels for it are stray.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_display() {
        assert_eq!(format!("{}", InstanceId::new(42)), "42");
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "connected");
        assert_eq!(format!("{}", ConnectionState::Reconnecting), "reconnecting");
    }

    #[test]
    fn service_label_display() {
        assert_eq!(ServiceLabel::Vnc.to_string(), "vnc");
        assert_eq!(ServiceLabel::Gateway.to_string(), "gateway");
    }
}
