//! Reconciler: desired-state convergence loop (§4.5.1)

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kt_core::traits::StatusSource;
use kt_core::types::{InstanceId, InstanceStatus, ServiceLabel};

use crate::connection::ConnectionManager;
use crate::tunnel::TunnelManager;

/// At each sweep, for every instance whose external status is `Running`,
/// ensures a live Connection and exactly the desired tunnels exist; closes
/// stray tunnels for stopped instances (§4.5.1).
pub struct Reconciler {
    connections: Arc<ConnectionManager>,
    tunnels: Arc<TunnelManager>,
    status_source: Arc<dyn StatusSource>,
    reconcile_interval: Duration,
}

impl Reconciler {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tunnels: Arc<TunnelManager>,
        status_source: Arc<dyn StatusSource>,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections,
            tunnels,
            status_source,
            reconcile_interval,
        })
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.reconcile_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                reconciler.reconcile_once().await;
            }
        })
    }

    /// Run one sweep. Exposed directly so callers can kick a reconcile
    /// immediately after an instance status change rather than waiting for
    /// the next tick (§4.5.1 "or on explicit kick").
    pub async fn reconcile_once(&self) {
        let Some(orchestrator) = self.connections.orchestrator() else {
            tracing::warn!("reconcile: no orchestrator bound, skipping sweep");
            return;
        };

        let instances = self.status_source.list_instances().await;

        for (instance, status) in &instances {
            match status {
                InstanceStatus::Running => self.reconcile_running(*instance, orchestrator.as_ref()).await,
                InstanceStatus::Stopped => self.tunnels.close_tunnels(*instance).await,
            }
        }
    }

    async fn reconcile_running(&self, instance: InstanceId, orchestrator: &dyn kt_core::traits::Orchestrator) {
        if !self.connections.is_connected(instance).await {
            if let Err(error) = self.connections.ensure_connected(instance, orchestrator).await {
                tracing::warn!(%instance, %error, "reconcile: failed to ensure connection");
                return;
            }
        }

        if self.needs_recreate(instance, ServiceLabel::Vnc) {
            if let Err(error) = self.tunnels.create_tunnel_for_vnc(instance).await {
                tracing::warn!(%instance, %error, "reconcile: failed to (re)create vnc tunnel");
            }
        }

        if self.needs_recreate(instance, ServiceLabel::Gateway) {
            let gateway_port = self.status_source.gateway_port(instance).await;
            if let Err(error) = self.tunnels.create_tunnel_for_gateway(instance, gateway_port).await {
                tracing::warn!(%instance, %error, "reconcile: failed to (re)create gateway tunnel");
            }
        }
    }

    fn needs_recreate(&self, instance: InstanceId, service: ServiceLabel) -> bool {
        match self.tunnels.get_tunnel(instance, service) {
            None => true,
            Some(tunnel) => tunnel.is_closed() || tunnel.metrics_snapshot().last_error.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kt_core::config::SshCoreConfig;
    use tempfile::TempDir;

    struct FakeStatusSource {
        instances: Vec<(InstanceId, InstanceStatus)>,
    }

    #[async_trait]
    impl StatusSource for FakeStatusSource {
        async fn list_instances(&self) -> Vec<(InstanceId, InstanceStatus)> {
            self.instances.clone()
        }

        async fn gateway_port(&self, _instance: InstanceId) -> Option<u16> {
            None
        }
    }

    fn test_reconciler(data_dir: &std::path::Path, instances: Vec<(InstanceId, InstanceStatus)>) -> Arc<Reconciler> {
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(crate::keystore::KeyStore::load_or_generate(data_dir).unwrap());
        let connections = ConnectionManager::new(Arc::clone(&config), keystore);
        let tunnels = TunnelManager::new(config, Arc::clone(&connections));
        let status_source = Arc::new(FakeStatusSource { instances });
        Reconciler::new(connections, tunnels, status_source, Duration::from_secs(15))
    }

    #[tokio::test]
    async fn sweep_without_a_bound_orchestrator_does_nothing() {
        let dir = TempDir::new().unwrap();
        let reconciler = test_reconciler(dir.path(), vec![(InstanceId::new(1), InstanceStatus::Running)]);

        // No panic, no orchestrator call attempted.
        reconciler.reconcile_once().await;
    }

    #[tokio::test]
    async fn stopped_instances_have_their_tunnels_closed() {
        let dir = TempDir::new().unwrap();
        let instance = InstanceId::new(2);
        let reconciler = test_reconciler(dir.path(), vec![(instance, InstanceStatus::Stopped)]);

        reconciler.reconcile_once().await;

        assert!(reconciler.tunnels.get_tunnels(instance).is_empty());
    }
}
