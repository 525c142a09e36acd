//! The orchestrator capability the SSH core consumes (§6, §9)
//!
//! In the source this is satisfied structurally (Docker and Kubernetes
//! backends each happen to have the right two methods). Rust has no
//! structural interfaces, so it is a nominal trait here — any concrete
//! backend (Docker, Kubernetes, or a test double) implements it explicitly,
//! the way the teacher's `kt_core::traits::Connection`/`ConnectionPool`
//! traits are implemented by concrete pool types.

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::types::{InstanceId, InstanceStatus};

/// The two-method capability the Reconnector and `EnsureConnected` depend
/// on. Both backends this ships against (Docker, Kubernetes) are out of
/// scope for this core — only the contract is defined here.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Install `public_key` into the agent's authorized-keys store so a
    /// subsequent SSH authentication with the matching signer succeeds.
    ///
    /// Must be idempotent: repeated calls with the same key succeed without
    /// side effects beyond the first. Called at least once per reconnection
    /// attempt (§4.5.2) because the agent container may have restarted and
    /// wiped its authorized-keys file.
    async fn configure_ssh_access(
        &self,
        instance: InstanceId,
        public_key: &str,
    ) -> Result<(), OrchestratorError>;

    /// Resolve the agent's current routable SSH endpoint.
    async fn get_ssh_address(
        &self,
        instance: InstanceId,
    ) -> Result<(String, u16), OrchestratorError>;
}

/// The instance-set source the Reconciler reads (§6). Backed by the
/// database layer in the full system; treated as opaque here.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// List every known instance and its external status.
    async fn list_instances(&self) -> Vec<(InstanceId, InstanceStatus)>;

    /// Per-instance gateway remote port, since `gateway_remote_port` is
    /// configurable per instance (§3) while `vnc_remote_port` is fixed.
    async fn gateway_port(&self, instance: InstanceId) -> Option<u16>;
}
