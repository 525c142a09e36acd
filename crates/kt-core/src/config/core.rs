//! Configuration for the SSH connectivity core (§6)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Every tunable the core exposes (§6). No CLI or file format is owned by
/// the core itself; callers load this with `kt_core::config::load_config`
/// the way the teacher's daemon loads `OrchestratorConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshCoreConfig {
    /// Where the KeyStore's `ssh_key`/`ssh_key.pub` live.
    pub data_dir: PathBuf,

    /// Protocol-level keepalive cadence (§4.2.1). Default 30s.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Deadline for a single keepalive round-trip. Default 10s.
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Bound on the initial TCP dial + SSH handshake. Default 30s.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Reconnection backoff parameters (§4.5.2).
    pub reconnect_backoff: BackoffConfig,

    /// Reconnection attempts before giving up and transitioning to Failed.
    pub reconnect_default_retries: u32,

    /// End-to-end command-probe cadence (§4.4.1). Default 30s.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Overall deadline for a single end-to-end probe. Default 15s.
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Tunnel listener-probe cadence (§4.4.2). Default 60s.
    #[serde(with = "humantime_serde")]
    pub tunnel_health_interval: Duration,

    /// Dial timeout for a single tunnel listener probe. Default 2s.
    #[serde(with = "humantime_serde")]
    pub tunnel_health_timeout: Duration,

    /// Reconciler sweep cadence.
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Fixed well-known VNC port on every agent.
    pub vnc_remote_port: u16,

    /// Default gateway port; per-instance config may override it.
    pub gateway_remote_port: u16,

    /// SSH username presented during authentication.
    pub ssh_username: String,
}

impl Default for SshCoreConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            data_dir: config_dir,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            reconnect_backoff: BackoffConfig::default(),
            reconnect_default_retries: 10,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(15),
            tunnel_health_interval: Duration::from_secs(60),
            tunnel_health_timeout: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(15),
            vnc_remote_port: 5900,
            gateway_remote_port: 8080,
            ssh_username: "agent".to_string(),
        }
    }
}

/// Exponential backoff parameters: delay doubles each attempt, capped at
/// `max` (§4.5.2, §8 — the sequence for N attempts is exactly
/// `1, 2, 4, 8, 16, 16, ...` with the defaults below).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Delay ceiling; once reached it no longer grows.
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Growth factor applied after each attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(16),
            multiplier: 2.0,
        }
    }
}

// Helper module for Duration serialization with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_matches_spec_sequence() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(16));
        assert_eq!(backoff.multiplier, 2.0);
    }

    #[test]
    fn default_config_uses_well_known_ports() {
        let config = SshCoreConfig::default();
        assert_eq!(config.vnc_remote_port, 5900);
        assert_eq!(config.reconnect_default_retries, 10);
    }
}
