//! Shared fixtures for Linkhub benchmarks.

use linkhub_core::{Broker, HeartbeatConfig, Link, Tunnel, TunnelConfig};
use linkhub_transport::{MemoryHandle, MemoryTransport};
use std::sync::Arc;

/// A tunnel with heartbeat filtering on, backed by a fresh broker.
#[must_use]
pub fn heartbeat_tunnel() -> (Tunnel, Arc<Broker>) {
    let broker = Arc::new(Broker::new());
    let config = TunnelConfig {
        heartbeat: HeartbeatConfig {
            enabled: true,
            interval_secs: 0,
            content: "FE".to_string(),
            is_hex: true,
        },
        pending_limit: None,
    };
    (Tunnel::new(1, "bench", config, broker.clone()), broker)
}

/// Open a link on an in-memory transport.
#[must_use]
pub fn memory_link(tunnel: &Tunnel) -> (Arc<Link>, MemoryHandle) {
    let (transport, handle) = MemoryTransport::new();
    (tunnel.open_link(Box::new(transport), None), handle)
}
