//! russh client handler for agent connections
//!
//! Host-key pinning is deliberately out of scope at this layer (§4.2, §9
//! Open Questions) — the handler accepts any server key. Adding
//! verification later is a clean extension of this type, not required by
//! this spec.

use async_trait::async_trait;
use russh::client::{Handler, Session};
use russh::ChannelId;
use russh_keys::key::PublicKey;

/// Minimal client handler: the core never needs unsolicited data on the
/// main session (commands run through `exec` on dedicated channels, and
/// tunnels are plain `direct-tcpip` channels), so every callback besides
/// host-key checking is a no-op.
pub struct ClientHandler;

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        tracing::debug!("accepting server host key {}", server_public_key.fingerprint());
        Ok(true)
    }

    async fn channel_close(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        Ok(())
    }
}
