//! Tunnels: reverse TCP forwards over a Connection (§3, §4.3)

mod manager;

pub use manager::{Tunnel, TunnelManager};
