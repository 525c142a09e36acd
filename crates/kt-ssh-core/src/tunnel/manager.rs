//! TunnelManager: reverse TCP forwards over a Connection (§4.3)
//!
//! Grounded in the teacher's `ConnectionPool` (`kt_orchestrator::connection::pool`)
//! for the DashMap-keyed-map-plus-snapshot shape, generalized from one flat
//! connection map to a map keyed by `(instance, service)` so that at most
//! one open Tunnel exists per pair (§3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use russh::client::Msg;
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use kt_core::config::SshCoreConfig;
use kt_core::error::{KtError, TunnelSetupError};
use kt_core::types::{InstanceId, ServiceLabel};

use crate::connection::ConnectionManager;
use crate::metrics::{now_millis, TunnelMetrics};

/// The local accept loop's poll deadline (§4.3, §5): short enough that
/// cancellation is observed promptly, long enough to not busy-loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A reverse forward: local TCP listener on the control plane, spliced to
/// a remote port on the agent over an existing Connection (§3 "Tunnel").
pub struct Tunnel {
    pub instance: InstanceId,
    pub service: ServiceLabel,
    pub remote_port: u16,
    pub local_port: u16,
    pub created_at_millis: u64,
    closed: AtomicBool,
    metrics: Mutex<TunnelMetrics>,
    accept_cancel: CancellationToken,
}

impl Tunnel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: closing twice cancels the accept loop once (§8 "Closing
    /// a Tunnel twice returns nil both times").
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.accept_cancel.cancel();
        }
    }

    pub fn metrics_snapshot(&self) -> TunnelMetrics {
        self.metrics.lock().expect("tunnel metrics lock poisoned").clone()
    }

    pub(crate) fn record_probe_success(&self) {
        self.metrics.lock().expect("tunnel metrics lock poisoned").record_probe_success();
    }

    pub(crate) fn record_probe_failure(&self, error: impl Into<String>) {
        self.metrics
            .lock()
            .expect("tunnel metrics lock poisoned")
            .record_probe_failure(error);
    }
}

/// Owns every live Tunnel, keyed by `(instance, service)`. Holds a
/// non-owning reference to the ConnectionManager to borrow clients (§3
/// ownership summary) — the dependency runs one way, Tunnels never
/// reference back (§9).
pub struct TunnelManager {
    config: Arc<SshCoreConfig>,
    connections: Arc<ConnectionManager>,
    tunnels: DashMap<(InstanceId, ServiceLabel), Arc<Tunnel>>,
}

impl TunnelManager {
    pub fn new(config: Arc<SshCoreConfig>, connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections,
            tunnels: DashMap::new(),
        })
    }

    /// Create a reverse forward from `127.0.0.1:local_port` (0 = auto-assign)
    /// to `remote_port` on the agent's SSH server, over the instance's live
    /// Connection (§4.3 CreateReverseTunnel).
    pub async fn create_reverse_tunnel(
        self: &Arc<Self>,
        instance: InstanceId,
        remote_port: u16,
        local_port: u16,
        service: ServiceLabel,
    ) -> Result<u16, KtError> {
        if self.connections.get_connection(instance).is_none() {
            return Err(KtError::TunnelSetup(TunnelSetupError::NoClient(instance.as_u64())));
        }

        let bind_addr = format!("127.0.0.1:{local_port}");
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            KtError::TunnelSetup(TunnelSetupError::BindFailed {
                requested: local_port,
                message: e.to_string(),
            })
        })?;
        let bound_port = listener.local_addr()?.port();

        // At most one open Tunnel per (instance, service) (§3, §8).
        self.close_tunnel(instance, service);

        let accept_cancel = CancellationToken::new();
        let tunnel = Arc::new(Tunnel {
            instance,
            service,
            remote_port,
            local_port: bound_port,
            created_at_millis: now_millis(),
            closed: AtomicBool::new(false),
            metrics: Mutex::new(TunnelMetrics::new()),
            accept_cancel: accept_cancel.clone(),
        });
        self.tunnels.insert((instance, service), Arc::clone(&tunnel));

        let connections = Arc::clone(&self.connections);
        let manager = Arc::clone(self);
        let tunnel_handle = Arc::clone(&tunnel);
        tokio::spawn(async move {
            run_accept_loop(listener, &connections, &tunnel_handle, accept_cancel).await;
            tunnel_handle.close();
            manager.remove_closed(instance);
        });

        Ok(bound_port)
    }

    pub async fn create_tunnel_for_vnc(self: &Arc<Self>, instance: InstanceId) -> Result<u16, KtError> {
        self.create_reverse_tunnel(instance, self.config.vnc_remote_port, 0, ServiceLabel::Vnc).await
    }

    pub async fn create_tunnel_for_gateway(
        self: &Arc<Self>,
        instance: InstanceId,
        remote_port: Option<u16>,
    ) -> Result<u16, KtError> {
        let port = remote_port.unwrap_or(self.config.gateway_remote_port);
        self.create_reverse_tunnel(instance, port, 0, ServiceLabel::Gateway).await
    }

    pub fn get_tunnel(&self, instance: InstanceId, service: ServiceLabel) -> Option<Arc<Tunnel>> {
        self.tunnels.get(&(instance, service)).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_tunnels(&self, instance: InstanceId) -> Vec<Arc<Tunnel>> {
        self.tunnels
            .iter()
            .filter(|entry| entry.key().0 == instance)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get_all_tunnels(&self) -> HashMap<InstanceId, Vec<Arc<Tunnel>>> {
        let mut grouped: HashMap<InstanceId, Vec<Arc<Tunnel>>> = HashMap::new();
        for entry in self.tunnels.iter() {
            grouped.entry(entry.key().0).or_default().push(Arc::clone(entry.value()));
        }
        grouped
    }

    fn close_tunnel(&self, instance: InstanceId, service: ServiceLabel) {
        if let Some((_, tunnel)) = self.tunnels.remove(&(instance, service)) {
            tunnel.close();
        }
    }

    pub async fn close_tunnels(&self, instance: InstanceId) {
        let keys: Vec<(InstanceId, ServiceLabel)> = self
            .tunnels
            .iter()
            .filter(|entry| entry.key().0 == instance)
            .map(|entry| *entry.key())
            .collect();
        for key in keys {
            if let Some((_, tunnel)) = self.tunnels.remove(&key) {
                tunnel.close();
            }
        }
    }

    pub async fn close_all(&self) {
        let keys: Vec<(InstanceId, ServiceLabel)> = self.tunnels.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, tunnel)) = self.tunnels.remove(&key) {
                tunnel.close();
            }
        }
    }

    /// Sweep tunnels the accept loop itself marked closed (listener
    /// failure), e.g. after `HealthSupervisor` observes a dead listener
    /// (§4.3 `removeClosed`).
    pub(crate) fn remove_closed(&self, instance: InstanceId) {
        self.tunnels
            .retain(|key, tunnel| !(key.0 == instance && tunnel.is_closed()));
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    connections: &Arc<ConnectionManager>,
    tunnel: &Arc<Tunnel>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
                let (stream, _peer) = match accepted {
                    Err(_) => continue, // poll deadline elapsed; re-check cancellation
                    Ok(Ok(pair)) => pair,
                    Ok(Err(error)) => {
                        tracing::warn!(
                            instance = %tunnel.instance,
                            service = %tunnel.service,
                            %error,
                            "tunnel listener error, closing tunnel"
                        );
                        return;
                    }
                };

                let Some(connection) = connections.get_connection(tunnel.instance) else {
                    // The Connection is gone: per §3's weak-reference invariant
                    // the Tunnel cannot outlive it. Close and let the caller's
                    // `remove_closed` sweep drop it from the map.
                    tracing::debug!(instance = %tunnel.instance, "accepted tunnel connection with no live client, closing tunnel");
                    tunnel.close();
                    return;
                };

                let channel = match connection.open_direct_tcpip("127.0.0.1", tunnel.remote_port).await {
                    Ok(channel) => channel,
                    Err(error) => {
                        tracing::warn!(
                            instance = %tunnel.instance,
                            service = %tunnel.service,
                            %error,
                            "failed to dial remote port for accepted tunnel connection"
                        );
                        continue;
                    }
                };

                let instance = tunnel.instance;
                let service = tunnel.service;
                tokio::spawn(async move {
                    if let Err(error) = splice(stream, channel).await {
                        tracing::debug!(%instance, %service, %error, "tunnel connection copy ended");
                    }
                });
            }
        }
    }
}

async fn splice(mut local: TcpStream, channel: Channel<Msg>) -> std::io::Result<(u64, u64)> {
    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut local, &mut remote).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_core::config::SshCoreConfig;
    use kt_core::error::KtError;
    use tempfile::TempDir;

    fn test_tunnel_manager(data_dir: &std::path::Path) -> Arc<TunnelManager> {
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(crate::keystore::KeyStore::load_or_generate(data_dir).unwrap());
        let connections = ConnectionManager::new(Arc::clone(&config), keystore);
        TunnelManager::new(config, connections)
    }

    #[tokio::test]
    async fn create_reverse_tunnel_without_a_connection_fails_fast() {
        let dir = TempDir::new().unwrap();
        let tunnels = test_tunnel_manager(dir.path());
        let instance = InstanceId::new(1);

        let result = tunnels.create_reverse_tunnel(instance, 5900, 0, ServiceLabel::Vnc).await;

        match result {
            Err(KtError::TunnelSetup(TunnelSetupError::NoClient(id))) => assert_eq!(id, instance.as_u64()),
            other => panic!("expected NoClient, got {other:?}"),
        }
        assert!(tunnels.get_tunnels(instance).is_empty());
    }

    #[tokio::test]
    async fn get_tunnels_and_get_all_tunnels_start_empty() {
        let dir = TempDir::new().unwrap();
        let tunnels = test_tunnel_manager(dir.path());
        let instance = InstanceId::new(7);

        assert!(tunnels.get_tunnels(instance).is_empty());
        assert!(tunnels.get_all_tunnels().is_empty());
        assert!(tunnels.get_tunnel(instance, ServiceLabel::Gateway).is_none());
    }

    #[tokio::test]
    async fn close_tunnels_and_close_all_are_no_ops_when_nothing_is_open() {
        let dir = TempDir::new().unwrap();
        let tunnels = test_tunnel_manager(dir.path());
        let instance = InstanceId::new(3);

        tunnels.close_tunnels(instance).await;
        tunnels.close_all().await;

        assert!(tunnels.get_tunnels(instance).is_empty());
    }

    /// §3's weak-reference invariant: an accepted tunnel connection whose
    /// Connection has disappeared must close and drop the Tunnel rather
    /// than keep accepting against a client that no longer exists.
    #[tokio::test]
    async fn accept_loop_closes_tunnel_when_connection_is_gone() {
        let dir = TempDir::new().unwrap();
        let instance = InstanceId::new(9);

        // No call to `manager.connect` for this instance, so
        // `connections.get_connection(instance)` returns `None` the whole
        // time — exactly the state the accept loop must react to.
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(crate::keystore::KeyStore::load_or_generate(dir.path()).unwrap());
        let connections = ConnectionManager::new(config, keystore);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        let accept_cancel = CancellationToken::new();
        let tunnel = Arc::new(Tunnel {
            instance,
            service: ServiceLabel::Vnc,
            remote_port: 5900,
            local_port,
            created_at_millis: now_millis(),
            closed: AtomicBool::new(false),
            metrics: Mutex::new(TunnelMetrics::new()),
            accept_cancel: accept_cancel.clone(),
        });

        let loop_handle = {
            let connections = Arc::clone(&connections);
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move {
                run_accept_loop(listener, &connections, &tunnel, accept_cancel).await;
            })
        };

        let _client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), loop_handle).await.unwrap().unwrap();
        assert!(tunnel.is_closed());
    }
}
