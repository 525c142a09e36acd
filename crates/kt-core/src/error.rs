//! Core error taxonomy for the SSH connectivity core (§7)
//!
//! Errors are grouped by kind, not by call site: `OrchestratorError` covers
//! both methods of the orchestrator capability (§6), `NetworkError` covers
//! transport-level failures that should trigger reconnection rather than
//! being returned up a call chain, and so on. Background loops never return
//! these to a caller — they translate them into a state transition and an
//! emitted event (§4.2.2, §4.2.3) instead.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the k-terminus SSH core.
#[derive(Error, Debug)]
pub enum KtError {
    /// Configuration could not be loaded or was invalid. Fatal at init.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The orchestrator capability (`ConfigureSSHAccess`/`GetSSHAddress`)
    /// failed.
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// A transport-level failure: dial timeout, handshake failure, keepalive
    /// timeout.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A reverse tunnel could not be set up.
    #[error("tunnel setup error: {0}")]
    TunnelSetup(#[from] TunnelSetupError),

    /// Caller asked for a client/tunnel that does not exist.
    #[error("not connected: instance {0}")]
    NotConnected(crate::types::InstanceId),

    /// The operation's context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// I/O error (key file access, local listener bind).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the `Orchestrator` capability (§6).
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// `ConfigureSSHAccess` failed to install the public key.
    #[error("failed to configure SSH access for instance {instance}: {message}")]
    ConfigureAccessFailed { instance: u64, message: String },

    /// `GetSSHAddress` could not resolve a routable endpoint.
    #[error("failed to resolve SSH address for instance {instance}: {message}")]
    AddressResolutionFailed { instance: u64, message: String },
}

/// Transport-level failures. Never returned from a background loop; they
/// drive a reconnection instead (§4.5.2).
#[derive(Error, Debug)]
pub enum NetworkError {
    /// TCP dial exceeded `connect_timeout`.
    #[error("dial to {0} timed out")]
    DialTimeout(String),

    /// The SSH handshake or public-key authentication failed.
    #[error("SSH handshake failed: {0}")]
    HandshakeFailed(String),

    /// A keepalive request was not answered within `keepalive_timeout`.
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// The transport reported an error outside of a keepalive round-trip.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A reverse tunnel's local listener could not be bound.
#[derive(Error, Debug)]
pub enum TunnelSetupError {
    /// No live Connection exists for the instance.
    #[error("no client for instance {0}")]
    NoClient(u64),

    /// `bind` on the requested local port failed.
    #[error("failed to bind local port {requested}: {message}")]
    BindFailed { requested: u16, message: String },
}

/// A single spliced connection's byte-copy failed. Logged; the owning
/// tunnel remains open (§4.3).
#[derive(Error, Debug)]
#[error("tunnel runtime error on instance {instance} ({service}): {message}")]
pub struct TunnelRuntimeError {
    pub instance: u64,
    pub service: String,
    pub message: String,
}

/// Configuration-related errors. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error.
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// The key file existed but could not be parsed.
    #[error("key file at {path} is not a valid key: {message}")]
    BadKeyFormat { path: PathBuf, message: String },
}
