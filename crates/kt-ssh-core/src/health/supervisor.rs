//! HealthSupervisor: the two periodic probes (§4.4)
//!
//! Shaped after the teacher's `HealthMonitor::spawn` (interval + cancel
//! token, iterating a snapshot of the pool on every tick) but split into
//! the spec's two independent cadences rather than one heartbeat sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kt_core::types::InstanceId;

use crate::connection::ConnectionManager;
use crate::tunnel::TunnelManager;

/// The command run by the end-to-end probe (§4.4.1). A connection that
/// answers this is known to accept channel opens and spawn a remote
/// process, which protocol-level keepalive (§4.2.1) does not exercise.
const HEALTH_PROBE_COMMAND: &str = "echo ping";
const HEALTH_PROBE_EXPECTED_OUTPUT: &str = "ping";

/// Owns the two probe loops. Holds non-owning references to both managers
/// and never mutates either map except through their documented
/// operations (§3 ownership summary).
pub struct HealthSupervisor {
    connections: Arc<ConnectionManager>,
    tunnels: Arc<TunnelManager>,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    tunnel_health_interval: Duration,
    tunnel_health_timeout: Duration,
}

impl HealthSupervisor {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tunnels: Arc<TunnelManager>,
        health_check_interval: Duration,
        health_check_timeout: Duration,
        tunnel_health_interval: Duration,
        tunnel_health_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            tunnels,
            health_check_interval,
            health_check_timeout,
            tunnel_health_interval,
            tunnel_health_timeout,
        }
    }

    /// Spawn both probe loops. Returns their join handles so the caller
    /// can await clean shutdown after cancelling.
    pub fn spawn(&self, instances: Arc<dyn Fn() -> Vec<InstanceId> + Send + Sync>, cancel: CancellationToken) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let connection_probe = spawn_connection_probe(
            Arc::clone(&self.connections),
            Arc::clone(&instances),
            self.health_check_interval,
            self.health_check_timeout,
            cancel.clone(),
        );
        let tunnel_probe = spawn_tunnel_probe(
            Arc::clone(&self.tunnels),
            self.tunnel_health_interval,
            self.tunnel_health_timeout,
            cancel,
        );
        (connection_probe, tunnel_probe)
    }
}

fn spawn_connection_probe(
    connections: Arc<ConnectionManager>,
    instances: Arc<dyn Fn() -> Vec<InstanceId> + Send + Sync>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            // Snapshot the instance set before probing so additions/removals
            // mid-sweep do not disturb this tick (§4.4 "must tolerate
            // addition/removal of entries during a sweep").
            for instance in (instances)() {
                let Some(connection) = connections.get_connection(instance) else {
                    continue;
                };

                match connection.run_command(HEALTH_PROBE_COMMAND, timeout).await {
                    Ok((true, output)) if output == HEALTH_PROBE_EXPECTED_OUTPUT => {
                        connection.record_probe_success();
                    }
                    Ok((_, output)) => {
                        connection.record_probe_failure();
                        // Remove the connection ourselves rather than leaving
                        // it for the Reconnector's own `close` (§4.5.2 step 2)
                        // to find — otherwise that later close would fire a
                        // second, spurious disconnected transition right
                        // after Reconnecting is set.
                        connections.fail_connection(
                            instance,
                            &connection,
                            &format!("end-to-end probe returned unexpected output: {output:?}"),
                        );
                    }
                    Err(error) => {
                        connection.record_probe_failure();
                        connections.fail_connection(
                            instance,
                            &connection,
                            &format!("end-to-end probe failed: {error}"),
                        );
                    }
                }
            }
        }
    })
}

fn spawn_tunnel_probe(
    tunnels: Arc<TunnelManager>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let snapshot = tunnels.get_all_tunnels();
            for (_, instance_tunnels) in snapshot {
                for tunnel in instance_tunnels {
                    if tunnel.is_closed() {
                        continue;
                    }

                    let addr = format!("127.0.0.1:{}", tunnel.local_port);
                    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
                        Ok(Ok(_stream)) => tunnel.record_probe_success(),
                        Ok(Err(error)) => tunnel.record_probe_failure(error.to_string()),
                        Err(_) => tunnel.record_probe_failure("dial timed out"),
                    }
                    // The tunnel is not closed here (§4.4.2): recreation is
                    // the Reconciler's job on its next sweep.
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_core::config::SshCoreConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn both_probe_loops_stop_promptly_on_cancellation() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(crate::keystore::KeyStore::load_or_generate(dir.path()).unwrap());
        let connections = ConnectionManager::new(Arc::clone(&config), keystore);
        let tunnels = TunnelManager::new(Arc::clone(&config), Arc::clone(&connections));

        let supervisor = HealthSupervisor::new(
            connections,
            tunnels,
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
        );

        let cancel = CancellationToken::new();
        let instances: Arc<dyn Fn() -> Vec<InstanceId> + Send + Sync> = Arc::new(|| Vec::<InstanceId>::new());
        let (connection_probe, tunnel_probe) = supervisor.spawn(instances, cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), connection_probe).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), tunnel_probe).await.unwrap().unwrap();
    }
}
