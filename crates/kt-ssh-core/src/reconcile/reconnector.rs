//! Reconnector: single-flight, backoff-driven reconnection (§4.5.2)
//!
//! Grounded in the teacher's `ExponentialBackoff`-driven
//! `TunnelConnector::connect_with_retry` loop, generalized from "one
//! tunnel, retry forever" to "one Connection per instance, bounded
//! retries, re-applying the key-install side effect every attempt".

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kt_core::config::BackoffConfig;
use kt_core::types::{ConnectionState, InstanceId};

use crate::connection::{ConnectionEventKind, ConnectionManager, ReconnectRequest};
use crate::keystore::KeyStore;
use crate::reconcile::backoff::Backoff;

/// Single-flight, backoff-driven reconnection for every instance (§4.5.2).
/// Holds a non-owning reference to the `ConnectionManager` it drives.
pub struct Reconnector {
    connections: Arc<ConnectionManager>,
    keystore: Arc<KeyStore>,
    max_retries: u32,
    backoff_config: BackoffConfig,
    in_flight: DashMap<InstanceId, CancellationToken>,
}

impl Reconnector {
    pub fn new(connections: Arc<ConnectionManager>, keystore: Arc<KeyStore>, max_retries: u32, backoff_config: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            connections,
            keystore,
            max_retries,
            backoff_config,
            in_flight: DashMap::new(),
        })
    }

    /// Spawn the request-consuming loop and return the sender to install
    /// via `ConnectionManager::set_reconnect_trigger`. `cancel` drains every
    /// in-flight reconnection on shutdown (§5 `cancelAllReconnections`).
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::UnboundedSender<ReconnectRequest> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reconnector = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        reconnector.cancel_all();
                        return;
                    }
                    request = rx.recv() => {
                        match request {
                            Some(request) => reconnector.trigger(request.instance, request.reason),
                            None => return,
                        }
                    }
                }
            }
        });

        tx
    }

    /// Trigger a reconnection for `instance`. Duplicate triggers while one
    /// is already in flight are silently dropped (§4.5.2, §8).
    pub fn trigger(self: &Arc<Self>, instance: InstanceId, reason: impl Into<String>) {
        let reason = reason.into();
        let token = CancellationToken::new();

        let mut admitted = false;
        self.in_flight.entry(instance).or_insert_with(|| {
            admitted = true;
            token.clone()
        });
        if !admitted {
            tracing::debug!(%instance, "reconnect already in flight, dropping duplicate trigger");
            return;
        }

        let reconnector = Arc::clone(self);
        tokio::spawn(async move {
            reconnector.run(instance, reason, token).await;
            reconnector.in_flight.remove(&instance);
        });
    }

    /// Cancel every in-flight reconnection (shutdown path).
    pub fn cancel_all(&self) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
    }

    async fn run(&self, instance: InstanceId, reason: String, cancel: CancellationToken) {
        let Some(orchestrator) = self.connections.orchestrator() else {
            tracing::error!(%instance, "reconnect triggered with no orchestrator bound");
            return;
        };

        self.connections.set_state(instance, ConnectionState::Reconnecting, reason.clone());
        self.connections.emit_event(instance, ConnectionEventKind::Reconnecting, reason);

        // Releases tunnels to be recreated by the Reconciler (§4.5.2 step 2).
        self.connections.close(instance).await;

        let mut backoff = Backoff::from_config(&self.backoff_config);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            if cancel.is_cancelled() {
                return;
            }

            match self.attempt(instance, attempt, orchestrator.as_ref()).await {
                Ok(()) => {
                    self.connections.record_reconnection(instance);
                    self.connections.emit_event(instance, ConnectionEventKind::Reconnected, format!("attempt {attempt}"));
                    return;
                }
                Err(error) => {
                    last_error = error;
                    if attempt == self.max_retries {
                        break;
                    }

                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let reason = format!("gave up after {} attempts: {last_error}", self.max_retries);
        self.connections.set_state(instance, kt_core::types::ConnectionState::Failed, reason.clone());
        self.connections.emit_event(instance, ConnectionEventKind::ReconnectFailed, reason);
    }

    /// One attempt: re-install the public key (the agent container may have
    /// restarted and wiped authorized-keys), resolve the address, then
    /// connect (§4.5.2 steps 3b-3d).
    async fn attempt(&self, instance: InstanceId, attempt: u32, orchestrator: &dyn kt_core::traits::Orchestrator) -> Result<(), String> {
        let public_key = self.keystore.public_key_line();
        orchestrator
            .configure_ssh_access(instance, &public_key)
            .await
            .map_err(|e| e.to_string())?;
        self.connections.emit_event(instance, ConnectionEventKind::KeyUploaded, format!("attempt {attempt}"));

        let (host, port) = orchestrator.get_ssh_address(instance).await.map_err(|e| e.to_string())?;

        self.connections.connect(instance, host, port).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_core::config::SshCoreConfig;
    use tempfile::TempDir;

    fn test_reconnector(data_dir: &std::path::Path) -> Arc<Reconnector> {
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(KeyStore::load_or_generate(data_dir).unwrap());
        let connections = ConnectionManager::new(config, Arc::clone(&keystore));
        Reconnector::new(connections, keystore, 3, BackoffConfig::default())
    }

    #[tokio::test]
    async fn duplicate_trigger_is_dropped_while_one_is_in_flight() {
        let dir = TempDir::new().unwrap();
        let reconnector = test_reconnector(dir.path());
        let instance = InstanceId::new(1);

        // Both calls run to completion synchronously before the runtime
        // gets a chance to poll either spawned task, so this is
        // deterministic regardless of scheduling.
        reconnector.trigger(instance, "first");
        assert_eq!(reconnector.in_flight.len(), 1);

        reconnector.trigger(instance, "duplicate");
        assert_eq!(reconnector.in_flight.len(), 1);
    }

    #[tokio::test]
    async fn independent_instances_each_get_their_own_slot() {
        let dir = TempDir::new().unwrap();
        let reconnector = test_reconnector(dir.path());

        reconnector.trigger(InstanceId::new(1), "a");
        reconnector.trigger(InstanceId::new(2), "b");

        assert_eq!(reconnector.in_flight.len(), 2);
    }
}
