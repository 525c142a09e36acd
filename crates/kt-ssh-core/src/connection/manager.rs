//! ConnectionManager: one multiplexed SSH client per instance (§4.2)
//!
//! Grounded in the teacher's `kt_agent::tunnel::connector::TunnelConnector`
//! for the dial/handshake/auth sequence and in
//! `kt_orchestrator::connection::health` for the cancellation-token-driven
//! interval loop shape, generalized from "one tunnel to the orchestrator"
//! to "one client per instance, many instances".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::KeyPair;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kt_core::config::SshCoreConfig;
use kt_core::error::{KtError, NetworkError};
use kt_core::traits::Orchestrator;
use kt_core::types::{ConnectionState, InstanceId};

use crate::connection::client::ClientHandler;
use crate::connection::events::{ConnectionEvent, ConnectionEventKind, EventBus, EventListener};
use crate::connection::state::{StateListener, StateTracker, StateTransition};
use crate::keystore::KeyStore;
use crate::metrics::{now_millis, ConnectionMetrics};

/// A request to (re)establish the connection for an instance, consumed by
/// the Reconnector. Defined here, not in `reconcile`, so the dependency
/// stays one-way: `reconcile` depends on `connection`, never the reverse
/// (§9 "keep the direction one-way").
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    pub instance: InstanceId,
    pub reason: String,
}

/// A live, multiplexed SSH client for one instance (§3 "Connection").
pub struct ManagedConnection {
    pub instance: InstanceId,
    pub host: String,
    pub port: u16,
    pub created_at_millis: u64,
    handle: Handle<ClientHandler>,
    metrics: Mutex<ConnectionMetrics>,
    keepalive_cancel: CancellationToken,
}

impl ManagedConnection {
    /// Protocol-level keepalive (§4.2.1): a no-payload round trip with a
    /// reply, used only to learn whether the transport is still alive.
    /// Opening and immediately closing a session channel is the cheapest
    /// operation on the public `Handle` API that requires a server
    /// acknowledgement.
    pub async fn keepalive(&self, timeout: Duration) -> Result<(), NetworkError> {
        let attempt = async {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
            channel
                .close()
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| NetworkError::KeepaliveTimeout)?
    }

    /// Run a command to completion and report its exit success and trimmed
    /// stdout (§4.4.1 end-to-end probe).
    pub async fn run_command(&self, command: &str, timeout: Duration) -> Result<(bool, String), NetworkError> {
        let attempt = async {
            let mut channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| NetworkError::Transport(e.to_string()))?;

            let mut stdout = Vec::new();
            let mut exit_success = false;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status } => exit_success = exit_status == 0,
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok((exit_success, String::from_utf8_lossy(&stdout).trim().to_string()))
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| NetworkError::KeepaliveTimeout)?
    }

    /// Open a `direct-tcpip` channel to `remote_host:remote_port`, the
    /// primitive a reverse tunnel's accept loop dials through.
    pub async fn open_direct_tcpip(&self, remote_host: &str, remote_port: u16) -> Result<Channel<client::Msg>, NetworkError> {
        self.handle
            .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| NetworkError::Transport(e.to_string()))
    }

    pub fn metrics_snapshot(&self) -> ConnectionMetrics {
        *self.metrics.lock().expect("connection metrics lock poisoned")
    }

    pub(crate) fn record_probe_success(&self) {
        self.metrics.lock().expect("connection metrics lock poisoned").record_probe_success();
    }

    pub(crate) fn record_probe_failure(&self) {
        self.metrics.lock().expect("connection metrics lock poisoned").record_probe_failure();
    }
}

/// Owns, at most, one [`ManagedConnection`] per instance, plus its state
/// and event buffers (§3 ownership summary).
pub struct ConnectionManager {
    config: Arc<SshCoreConfig>,
    keystore: Arc<KeyStore>,
    connections: DashMap<InstanceId, Arc<ManagedConnection>>,
    state: StateTracker,
    events: EventBus,
    orchestrator: RwLock<Option<Arc<dyn Orchestrator>>>,
    reconnect_tx: RwLock<Option<mpsc::UnboundedSender<ReconnectRequest>>>,
    /// Per-instance reconnection counts (§3 "per-instance reconnection
    /// count"). Kept here rather than on `ManagedConnection` because a
    /// successful reconnect replaces that struct entirely — a per-connection
    /// counter would always read back zero.
    reconnection_counts: DashMap<InstanceId, AtomicU64>,
}

impl ConnectionManager {
    pub fn new(config: Arc<SshCoreConfig>, keystore: Arc<KeyStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            keystore,
            connections: DashMap::new(),
            state: StateTracker::new(),
            events: EventBus::new(),
            orchestrator: RwLock::new(None),
            reconnect_tx: RwLock::new(None),
            reconnection_counts: DashMap::new(),
        })
    }

    /// Bind the orchestrator used by `EnsureConnected`. Must be called
    /// before the Reconciler/HealthSupervisor start (§4.2 "Orchestrator
    /// binding").
    pub fn set_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) {
        *self.orchestrator.write().expect("orchestrator lock poisoned") = Some(orchestrator);
    }

    pub fn orchestrator(&self) -> Option<Arc<dyn Orchestrator>> {
        self.orchestrator.read().expect("orchestrator lock poisoned").clone()
    }

    /// Register the channel the Reconnector receives triggers on. Until
    /// this is called, keepalive/probe failures are logged and dropped.
    pub fn set_reconnect_trigger(&self, tx: mpsc::UnboundedSender<ReconnectRequest>) {
        *self.reconnect_tx.write().expect("reconnect trigger lock poisoned") = Some(tx);
    }

    pub(crate) fn trigger_reconnect(&self, instance: InstanceId, reason: impl Into<String>) {
        let reason = reason.into();
        let guard = self.reconnect_tx.read().expect("reconnect trigger lock poisoned");
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(ReconnectRequest { instance, reason });
            }
            None => tracing::warn!(%instance, %reason, "reconnect triggered with no Reconnector registered"),
        }
    }

    /// Dial, handshake, and publish a new Connection for `instance`
    /// (§4.2 Connect).
    pub async fn connect(self: &Arc<Self>, instance: InstanceId, host: impl Into<String>, port: u16) -> Result<Arc<ManagedConnection>, KtError> {
        let host = host.into();
        self.state.set_state(instance, ConnectionState::Connecting, "connect");

        let handle = match self.dial_and_handshake(&host, port).await {
            Ok(handle) => handle,
            Err(err) => {
                self.state.set_state(instance, ConnectionState::Failed, err.to_string());
                return Err(err);
            }
        };

        if let Some((_, previous)) = self.connections.remove(&instance) {
            previous.keepalive_cancel.cancel();
            let _ = previous.handle.disconnect(Disconnect::ByApplication, "superseded", "en").await;
        }

        let connection = Arc::new(ManagedConnection {
            instance,
            host,
            port,
            created_at_millis: now_millis(),
            handle,
            metrics: Mutex::new(ConnectionMetrics::new()),
            keepalive_cancel: CancellationToken::new(),
        });

        self.connections.insert(instance, Arc::clone(&connection));
        self.spawn_keepalive_loop(Arc::clone(&connection));

        self.events.emit(
            instance,
            ConnectionEventKind::Connected,
            format!("connected to {}:{}", connection.host, connection.port),
        );
        self.state.set_state(instance, ConnectionState::Connected, "connect_succeeded");

        Ok(connection)
    }

    async fn dial_and_handshake(&self, host: &str, port: u16) -> Result<Handle<ClientHandler>, KtError> {
        let addr = format!("{host}:{port}");
        let ssh_config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, addr.as_str(), ClientHandler),
        )
        .await
        .map_err(|_| KtError::Network(NetworkError::DialTimeout(addr.clone())))?
        .map_err(|e| KtError::Network(NetworkError::HandshakeFailed(e.to_string())))?;

        let signer: KeyPair = self.keystore.signer();
        let authenticated = handle
            .authenticate_publickey(self.config.ssh_username.clone(), Arc::new(signer))
            .await
            .map_err(|e| KtError::Network(NetworkError::HandshakeFailed(e.to_string())))?;

        if !authenticated {
            return Err(KtError::Network(NetworkError::HandshakeFailed(
                "public key authentication rejected".into(),
            )));
        }

        Ok(handle)
    }

    /// Convenience primitive for callers that do not know the endpoint
    /// (§4.2 EnsureConnected).
    pub async fn ensure_connected(
        self: &Arc<Self>,
        instance: InstanceId,
        orchestrator: &dyn Orchestrator,
    ) -> Result<Arc<ManagedConnection>, KtError> {
        if self.is_connected(instance).await {
            if let Some(connection) = self.get_connection(instance) {
                return Ok(connection);
            }
        }

        let (host, port) = orchestrator.get_ssh_address(instance).await?;

        let public_key = self.keystore.public_key_line();
        orchestrator.configure_ssh_access(instance, &public_key).await?;
        self.events.emit(instance, ConnectionEventKind::KeyUploaded, "ensure_connected");

        self.connect(instance, host, port).await
    }

    pub fn get_connection(&self, instance: InstanceId) -> Option<Arc<ManagedConnection>> {
        self.connections.get(&instance).map(|entry| Arc::clone(entry.value()))
    }

    /// Like [`Self::get_connection`], but returns [`KtError::NotConnected`]
    /// instead of `None` for callers that want a `Result` they can
    /// propagate with `?` rather than deciding for themselves how to react
    /// to a missing client (§6 "Client capability"; §7 `NotConnected` —
    /// "a caller asked for a client that does not exist").
    pub fn require_connection(&self, instance: InstanceId) -> Result<Arc<ManagedConnection>, KtError> {
        self.get_connection(instance).ok_or(KtError::NotConnected(instance))
    }

    /// Distinguishes "map entry exists" from "still alive" with a single
    /// keepalive round trip (§4.2 IsConnected).
    pub async fn is_connected(&self, instance: InstanceId) -> bool {
        let Some(connection) = self.get_connection(instance) else {
            return false;
        };
        connection.keepalive(self.config.keepalive_timeout).await.is_ok()
    }

    /// Cancel the keepalive loop, close the client, remove the entry, and
    /// emit `disconnected` (§4.2 Close). A no-op if no entry exists —
    /// `Close(I)` is idempotent (§8).
    pub async fn close(&self, instance: InstanceId) {
        if let Some((_, connection)) = self.connections.remove(&instance) {
            connection.keepalive_cancel.cancel();
            let _ = connection.handle.disconnect(Disconnect::ByApplication, "closed", "en").await;
            self.events.emit(instance, ConnectionEventKind::Disconnected, "close");
            self.state.set_state(instance, ConnectionState::Disconnected, "close");
        }
    }

    pub async fn close_all(&self) {
        let instances: Vec<InstanceId> = self.connections.iter().map(|entry| *entry.key()).collect();
        for instance in instances {
            self.close(instance).await;
        }
    }

    pub fn current_state(&self, instance: InstanceId) -> ConnectionState {
        self.state.current(instance)
    }

    pub fn state_transitions(&self, instance: InstanceId) -> Vec<StateTransition> {
        self.state.transitions(instance)
    }

    pub fn on_state_change(&self, listener: StateListener) {
        self.state.on_state_change(listener);
    }

    pub fn on_event(&self, listener: EventListener) {
        self.events.on_event(listener);
    }

    pub fn event_history(&self, instance: InstanceId) -> Vec<ConnectionEvent> {
        self.events.history(instance)
    }

    /// Number of successful reconnections recorded for an instance since
    /// process start (§3 "per-instance reconnection count").
    pub fn reconnection_count(&self, instance: InstanceId) -> u64 {
        self.reconnection_counts
            .get(&instance)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub(crate) fn record_reconnection(&self, instance: InstanceId) {
        self.reconnection_counts
            .entry(instance)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Force a state transition from outside the normal Connect/Close
    /// lifecycle. Used by the Reconnector, which owns the Reconnecting and
    /// Failed transitions (§4.2.2).
    pub(crate) fn set_state(&self, instance: InstanceId, state: ConnectionState, reason: impl Into<String>) {
        self.state.set_state(instance, state, reason);
    }

    pub(crate) fn emit_event(&self, instance: InstanceId, kind: ConnectionEventKind, details: impl Into<String>) {
        self.events.emit(instance, kind, details);
    }

    /// Tear a Connection down after a health signal (keepalive timeout,
    /// §4.2.1, or end-to-end probe failure, §4.4.1): remove it if it is
    /// still the one `observed` points to, cancel its keepalive loop,
    /// transition to Disconnected, emit `disconnected` + `health_check_failed`,
    /// and trigger reconnection. A no-op if `observed` has already been
    /// superseded or removed by a concurrent path — this keeps every
    /// failure source converging on the same transition history instead of
    /// leaving a stale entry for a later `Reconnector::close` to tear down
    /// again (which would otherwise interleave a spurious
    /// Reconnecting → Disconnected transition into the ring buffers).
    pub(crate) fn fail_connection(&self, instance: InstanceId, observed: &Arc<ManagedConnection>, reason: &str) {
        let still_current = self
            .connections
            .get(&instance)
            .map(|entry| Arc::ptr_eq(entry.value(), observed))
            .unwrap_or(false);
        if !still_current {
            return;
        }

        self.connections.remove(&instance);
        observed.keepalive_cancel.cancel();
        self.state.set_state(instance, ConnectionState::Disconnected, reason);
        self.events.emit(instance, ConnectionEventKind::Disconnected, reason);
        self.events.emit(instance, ConnectionEventKind::HealthCheckFailed, reason);
        self.trigger_reconnect(instance, reason);
    }

    fn spawn_keepalive_loop(self: &Arc<Self>, connection: Arc<ManagedConnection>) {
        let manager = Arc::clone(self);
        let cancel = connection.keepalive_cancel.clone();
        let interval = self.config.keepalive_interval;
        let timeout = self.config.keepalive_timeout;
        let instance = connection.instance;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match connection.keepalive(timeout).await {
                    Ok(()) => connection.record_probe_success(),
                    Err(_) => {
                        connection.record_probe_failure();
                        manager.fail_connection(instance, &connection, "keepalive_failed");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_core::config::SshCoreConfig;
    use tempfile::TempDir;

    fn test_manager(data_dir: &std::path::Path) -> Arc<ConnectionManager> {
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(KeyStore::load_or_generate(data_dir).unwrap());
        ConnectionManager::new(config, keystore)
    }

    #[tokio::test]
    async fn unknown_instance_has_no_connection() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let instance = InstanceId::new(1);

        assert!(manager.get_connection(instance).is_none());
        assert!(!manager.is_connected(instance).await);
        assert_eq!(manager.current_state(instance), ConnectionState::Disconnected);
        assert!(manager.event_history(instance).is_empty());
        match manager.require_connection(instance) {
            Err(KtError::NotConnected(id)) => assert_eq!(id, instance),
            other => panic!("expected NotConnected, got {other:?}"),
        }
        assert!(manager.state_transitions(instance).is_empty());
    }

    #[tokio::test]
    async fn explicit_connect_failure_transitions_through_connecting_to_failed() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let instance = InstanceId::new(5);

        // Nothing listens on this port, so the dial fails fast with
        // "connection refused" rather than waiting out connect_timeout.
        let result = manager.connect(instance, "127.0.0.1", 1).await;
        assert!(result.is_err());

        let transitions = manager.state_transitions(instance);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, ConnectionState::Connecting);
        assert_eq!(transitions[1].to, ConnectionState::Failed);
        assert_eq!(manager.current_state(instance), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn close_is_a_no_op_without_a_connection() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let instance = InstanceId::new(1);

        manager.close(instance).await;
        manager.close_all().await;

        assert!(manager.event_history(instance).is_empty());
        assert_eq!(manager.current_state(instance), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnection_count_starts_at_zero_and_survives_reconnection_records() {
        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        let instance = InstanceId::new(1);

        assert_eq!(manager.reconnection_count(instance), 0);

        manager.record_reconnection(instance);
        manager.record_reconnection(instance);

        assert_eq!(manager.reconnection_count(instance), 2);
        assert_eq!(manager.reconnection_count(InstanceId::new(2)), 0);
    }

    #[test]
    fn reconnect_trigger_without_a_registered_receiver_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(SshCoreConfig::default());
        let keystore = Arc::new(KeyStore::load_or_generate(dir.path()).unwrap());
        let manager = ConnectionManager::new(config, keystore);

        manager.trigger_reconnect(InstanceId::new(1), "no receiver yet");
    }

    #[tokio::test]
    async fn set_and_get_orchestrator_round_trips() {
        use async_trait::async_trait;
        use kt_core::error::OrchestratorError;

        struct NullOrchestrator;
        #[async_trait]
        impl Orchestrator for NullOrchestrator {
            async fn configure_ssh_access(&self, _instance: InstanceId, _public_key: &str) -> Result<(), OrchestratorError> {
                Ok(())
            }
            async fn get_ssh_address(&self, _instance: InstanceId) -> Result<(String, u16), OrchestratorError> {
                Ok(("127.0.0.1".to_string(), 22))
            }
        }

        let dir = TempDir::new().unwrap();
        let manager = test_manager(dir.path());
        assert!(manager.orchestrator().is_none());

        manager.set_orchestrator(Arc::new(NullOrchestrator));
        assert!(manager.orchestrator().is_some());
    }
}
