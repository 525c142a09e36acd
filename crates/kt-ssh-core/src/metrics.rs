//! Observational metrics for Connections and Tunnels (§3)
//!
//! Purely observational — nothing here drives behavior. Accessor methods
//! return owned snapshots rather than references into a locked struct,
//! matching the teacher's `ConnectionPool::list()` style.

use kt_core::time::current_time_millis;

/// Creation/probe bookkeeping for a Connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMetrics {
    pub created_at_millis: u64,
    pub last_probe_millis: Option<u64>,
    pub keepalive_successes: u64,
    pub keepalive_failures: u64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            created_at_millis: now_millis(),
            last_probe_millis: None,
            keepalive_successes: 0,
            keepalive_failures: 0,
        }
    }

    pub fn record_probe_success(&mut self) {
        self.keepalive_successes += 1;
        self.last_probe_millis = Some(now_millis());
    }

    pub fn record_probe_failure(&mut self) {
        self.keepalive_failures += 1;
        self.last_probe_millis = Some(now_millis());
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Creation/probe bookkeeping for a Tunnel.
#[derive(Debug, Clone)]
pub struct TunnelMetrics {
    pub created_at_millis: u64,
    pub last_check_millis: Option<u64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self {
            created_at_millis: now_millis(),
            last_check_millis: None,
            success_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn record_probe_success(&mut self) {
        self.success_count += 1;
        self.last_check_millis = Some(now_millis());
        self.last_error = None;
    }

    pub fn record_probe_failure(&mut self, error: impl Into<String>) {
        self.failure_count += 1;
        self.last_check_millis = Some(now_millis());
        self.last_error = Some(error.into());
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) use current_time_millis as now_millis;
