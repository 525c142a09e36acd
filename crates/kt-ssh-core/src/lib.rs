//! kt-ssh-core: the SSH connectivity core of the agent-orchestration
//! control plane.
//!
//! Five cooperating components (§2): [`KeyStore`] owns the process-global
//! SSH identity; [`connection::ConnectionManager`] maintains at most one
//! multiplexed SSH client per instance; [`tunnel::TunnelManager`] runs
//! reverse TCP forwards over those clients; [`health::HealthSupervisor`]
//! probes both layers; [`reconcile::Reconciler`]/[`reconcile::Reconnector`]
//! converge desired tunnel state and recover from failure with backoff.

pub mod connection;
pub mod health;
pub mod keystore;
pub mod metrics;
pub mod reconcile;
mod ring_buffer;
pub mod tunnel;

pub use connection::{ConnectionEvent, ConnectionEventKind, ConnectionManager, ManagedConnection, ReconnectRequest, StateTransition};
pub use health::HealthSupervisor;
pub use keystore::KeyStore;
pub use metrics::{ConnectionMetrics, TunnelMetrics};
pub use reconcile::{Reconciler, Reconnector};
pub use tunnel::{Tunnel, TunnelManager};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kt_core::config::SshCoreConfig;
use kt_core::traits::{Orchestrator, StatusSource};

/// Every component wired together, the way a caller (a daemon's `main`)
/// would construct the core at startup.
pub struct SshCore {
    pub connections: Arc<ConnectionManager>,
    pub tunnels: Arc<TunnelManager>,
    pub supervisor: Arc<HealthSupervisor>,
    pub reconciler: Arc<Reconciler>,
    pub reconnector: Arc<Reconnector>,
}

impl SshCore {
    /// Construct every component from configuration. Does not start any
    /// background loop; call [`SshCore::spawn`] once `status_source` and
    /// `orchestrator` are ready.
    pub fn new(config: Arc<SshCoreConfig>, orchestrator: Arc<dyn Orchestrator>, status_source: Arc<dyn StatusSource>) -> Result<Self, kt_core::KtError> {
        let keystore = Arc::new(KeyStore::load_or_generate(&config.data_dir)?);

        let connections = ConnectionManager::new(Arc::clone(&config), Arc::clone(&keystore));
        connections.set_orchestrator(Arc::clone(&orchestrator));

        let tunnels = TunnelManager::new(Arc::clone(&config), Arc::clone(&connections));

        let supervisor = Arc::new(HealthSupervisor::new(
            Arc::clone(&connections),
            Arc::clone(&tunnels),
            config.health_check_interval,
            config.health_check_timeout,
            config.tunnel_health_interval,
            config.tunnel_health_timeout,
        ));

        let reconciler = Reconciler::new(
            Arc::clone(&connections),
            Arc::clone(&tunnels),
            status_source,
            config.reconcile_interval,
        );

        let reconnector = Reconnector::new(
            Arc::clone(&connections),
            keystore,
            config.reconnect_default_retries,
            config.reconnect_backoff.clone(),
        );

        Ok(Self {
            connections,
            tunnels,
            supervisor,
            reconciler,
            reconnector,
        })
    }

    /// Start every background loop: the Reconnector's request loop, both
    /// health probes, and the Reconciler's sweep. Returns their join
    /// handles for an orderly shutdown (§5 shutdown sequence).
    pub fn spawn(&self, instances_for_probe: Arc<dyn Fn() -> Vec<kt_core::types::InstanceId> + Send + Sync>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let reconnect_tx = self.reconnector.spawn(cancel.clone());
        self.connections.set_reconnect_trigger(reconnect_tx);

        let (connection_probe, tunnel_probe) = self.supervisor.spawn(instances_for_probe, cancel.clone());
        let reconcile_loop = self.reconciler.spawn(cancel);

        vec![connection_probe, tunnel_probe, reconcile_loop]
    }

    /// Shutdown sequence (§5): cancel supervisor/reconciler/reconnector via
    /// the caller's `CancellationToken`, then drain tunnels and
    /// connections. Callers cancel their token before calling this.
    pub async fn shutdown(&self) {
        self.tunnels.close_all().await;
        self.connections.close_all().await;
    }
}
