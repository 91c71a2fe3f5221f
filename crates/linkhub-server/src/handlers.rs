//! Device connection handlers for the Linkhub server.
//!
//! Every tunnel gets a listener. Each device connection is served by its own
//! task that reads from the socket and feeds the link, so a slow peer or
//! listener only holds back the device it belongs to.

use crate::config::{Config, Protocol, ResumeMatch, TunnelEntry};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredTransport};
use crate::tap;
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use bytes::{Bytes, BytesMut};
use linkhub_core::{Broker, Bus, Link, LinkError, Tunnel};
use linkhub_transport::{tcp, UdpTransport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Datagrams queued per UDP device before new ones are dropped.
const UDP_PEER_QUEUE: usize = 256;

/// Maximum UDP datagram size.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Shortest interval between two sweeps for expired closed links.
const MIN_REAP_PERIOD: Duration = Duration::from_millis(10);

/// Shared server state.
pub struct AppState {
    /// The bus every link mirrors to.
    pub broker: Arc<Broker>,
    /// Configured tunnels.
    pub tunnels: Vec<Arc<Tunnel>>,
}

impl AppState {
    /// Create tunnels and the broker from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let broker = Arc::new(Broker::with_config(config.broker.to_broker_config()));
        let bus: Arc<dyn Bus> = broker.clone();

        let tunnels = config
            .tunnels
            .iter()
            .map(|entry| {
                Arc::new(Tunnel::new(
                    entry.id,
                    entry.name.clone(),
                    entry.to_tunnel_config(),
                    bus.clone(),
                ))
            })
            .collect();

        Self { broker, tunnels }
    }
}

/// Run the device listeners and the HTTP API.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound or the API server fails.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(&config));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    for (entry, tunnel) in config.tunnels.iter().zip(&state.tunnels) {
        spawn_tunnel(entry, tunnel.clone()).await?;
    }

    let app = router(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP API on {}", addr))?;

    info!("Linkhub API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for tunnel in &state.tunnels {
        tunnel.close_all().await;
    }

    Ok(())
}

/// HTTP routes: health, stats and the bus tap.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/tap", get(tap::tap_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Bind a tunnel's listener and start accepting devices.
async fn spawn_tunnel(entry: &TunnelEntry, tunnel: Arc<Tunnel>) -> Result<()> {
    let addr = entry.listen_addr()?;

    match entry.protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind tunnel {} on {}", entry.id, addr))?;
            info!(tunnel = entry.id, "TCP tunnel listening on {}", addr);
            tokio::spawn(serve_tcp(
                tunnel.clone(),
                listener,
                entry.read_buffer_size,
                entry.resume_match,
            ));
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("Failed to bind tunnel {} on {}", entry.id, addr))?;
            info!(tunnel = entry.id, "UDP tunnel listening on {}", addr);
            tokio::spawn(serve_udp(
                tunnel.clone(),
                Arc::new(socket),
                entry.idle_timeout(),
                entry.resume_match,
            ));
        }
    }

    tokio::spawn(reap_closed_links(tunnel, entry.closed_retention()));
    Ok(())
}

/// Periodically drop links that stayed closed past `retention`.
async fn reap_closed_links(tunnel: Arc<Tunnel>, retention: Duration) {
    let mut ticker = tokio::time::interval(retention.max(MIN_REAP_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let reaped = tunnel.reap_closed(retention).await;
        if reaped > 0 {
            metrics::record_reaped(reaped);
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Link and bus statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tunnels: Vec<_> = state
        .tunnels
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id(),
                "name": t.name(),
                "links": t.link_count(),
            })
        })
        .collect();

    axum::Json(serde_json::json!({
        "broker": state.broker.stats(),
        "topics": state.broker.topic_names(),
        "tunnels": tunnels,
    }))
}

async fn serve_tcp(
    tunnel: Arc<Tunnel>,
    listener: TcpListener,
    read_buffer_size: usize,
    resume_match: ResumeMatch,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let remote_key = resume_match.remote_key(addr);
                tokio::spawn(handle_stream(
                    tunnel.clone(),
                    stream,
                    addr,
                    remote_key,
                    read_buffer_size,
                ));
            }
            Err(e) => {
                warn!(tunnel = tunnel.id(), error = %e, "Accept failed");
                metrics::record_error("accept");
            }
        }
    }
}

/// Serve one TCP device until its connection ends.
async fn handle_stream(
    tunnel: Arc<Tunnel>,
    stream: TcpStream,
    addr: SocketAddr,
    remote_key: String,
    read_buffer_size: usize,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut reader, transport) = tcp::split(stream);

    let (link, resumed) = tunnel
        .resume_or_open(Box::new(MeteredTransport::new(transport)), &remote_key)
        .await;
    metrics::record_link(resumed);
    debug!(tunnel = tunnel.id(), link = link.id(), remote = %addr, resumed, "Device connected");

    let mut buf = BytesMut::with_capacity(read_buffer_size);
    loop {
        buf.reserve(read_buffer_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(tunnel = tunnel.id(), link = link.id(), "Device disconnected");
                break;
            }
            Ok(n) => {
                metrics::record_bytes(n, "inbound");
                link.on_data(buf.split().freeze()).await;
            }
            Err(e) => {
                warn!(tunnel = tunnel.id(), link = link.id(), error = %e, "Device read failed");
                metrics::record_error("read");
                break;
            }
        }
    }

    close_link(&link).await;
}

async fn close_link(link: &Link) {
    match link.close().await {
        Ok(()) | Err(LinkError::AlreadyClosed) => {}
        Err(e) => {
            debug!(tunnel = link.tunnel_id(), link = link.id(), error = %e, "Closing link failed");
            metrics::record_error("close");
        }
    }
}

/// A datagram device being served.
struct UdpDevice {
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

/// Demultiplex datagrams by source address into per-device tasks.
async fn serve_udp(
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    idle_timeout: Duration,
    resume_match: ResumeMatch,
) {
    let mut peers: HashMap<SocketAddr, UdpDevice> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(tunnel = tunnel.id(), error = %e, "Datagram receive failed");
                metrics::record_error("read");
                continue;
            }
        };
        metrics::record_bytes(n, "inbound");
        let payload = Bytes::copy_from_slice(&buf[..n]);

        let payload = match peers.get(&addr) {
            Some(device) => match device.tx.try_send(payload) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(tunnel = tunnel.id(), remote = %addr, "Device queue full, dropping datagram");
                    metrics::record_error("overflow");
                    continue;
                }
                // The device task went idle; start a new one
                Err(mpsc::error::TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };

        // The new task waits for the idle one to close its link first
        let previous = peers.remove(&addr).map(|device| device.task);
        peers.retain(|_, device| !device.tx.is_closed());

        let (tx, rx) = mpsc::channel(UDP_PEER_QUEUE);
        // A fresh channel always has room for the first datagram
        let _ = tx.try_send(payload);
        let task = tokio::spawn(handle_datagrams(
            tunnel.clone(),
            socket.clone(),
            addr,
            resume_match.remote_key(addr),
            rx,
            idle_timeout,
            previous,
        ));
        peers.insert(addr, UdpDevice { tx, task });
    }
}

/// Serve one UDP device until it goes quiet for `idle_timeout`.
async fn handle_datagrams(
    tunnel: Arc<Tunnel>,
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    remote_key: String,
    mut rx: mpsc::Receiver<Bytes>,
    idle_timeout: Duration,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(tunnel = tunnel.id(), remote = %addr, error = %e, "Previous device task failed");
        }
    }

    let _metrics_guard = ConnectionMetricsGuard::new();
    let transport = MeteredTransport::new(UdpTransport::new(socket, addr));
    let (link, resumed) = tunnel.resume_or_open(Box::new(transport), &remote_key).await;
    metrics::record_link(resumed);
    debug!(tunnel = tunnel.id(), link = link.id(), remote = %addr, resumed, "Datagram device connected");

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(payload)) => link.on_data(payload).await,
            Ok(None) => break,
            Err(_) => {
                debug!(tunnel = tunnel.id(), link = link.id(), "Datagram device idle");
                break;
            }
        }
    }

    drain_datagrams(&link, &mut rx).await;
    close_link(&link).await;
}

/// Stop accepting datagrams and feed the ones already queued to the link.
async fn drain_datagrams(link: &Link, rx: &mut mpsc::Receiver<Bytes>) {
    rx.close();
    while let Some(payload) = rx.recv().await {
        link.on_data(payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkhub_core::{HeartbeatConfig, TunnelConfig};
    use tokio::io::AsyncWriteExt;

    fn tunnel(config: TunnelConfig) -> (Arc<Tunnel>, Arc<Broker>) {
        let broker = Arc::new(Broker::new());
        let tunnel = Arc::new(Tunnel::new(1, "test", config, broker.clone()));
        (tunnel, broker)
    }

    async fn first_link(tunnel: &Tunnel) -> Arc<Link> {
        loop {
            if let Some(link) = tunnel.links().into_iter().next() {
                return link;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_links(tunnel: &Tunnel, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while tunnel.link_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_device_data_reaches_bus() {
        let (tunnel, broker) = tunnel(TunnelConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(tunnel.clone(), listener, 1024, ResumeMatch::Address));

        let mut device = TcpStream::connect(addr).await.unwrap();

        // Wait for the link to register before subscribing to its topic
        let link = first_link(&tunnel).await;
        let mut recv = broker.subscribe("test", &link.topics().recv).unwrap();

        device.write_all(b"temp=21").await.unwrap();
        let publication = tokio::time::timeout(Duration::from_secs(5), recv.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&publication.payload[..], b"temp=21");

        link.write("ack").await.unwrap();
        let mut reply = [0u8; 3];
        device.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ack");
    }

    #[tokio::test]
    async fn test_tcp_reconnect_by_ip_resumes() {
        let (tunnel, _broker) = tunnel(TunnelConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(tunnel.clone(), listener, 1024, ResumeMatch::Ip));

        let device = TcpStream::connect(addr).await.unwrap();
        let link = first_link(&tunnel).await;
        drop(device);

        while link.is_open().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(link.write("queued").await, Err(LinkError::LinkClosed)));

        let mut device = TcpStream::connect(addr).await.unwrap();
        let mut replayed = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(5), device.read_exact(&mut replayed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&replayed, b"queued");
        assert_eq!(tunnel.link_count(), 1);
    }

    #[tokio::test]
    async fn test_tcp_second_device_on_same_ip_gets_fresh_link() {
        let (tunnel, _broker) = tunnel(TunnelConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(tunnel.clone(), listener, 1024, ResumeMatch::Address));

        let first = TcpStream::connect(addr).await.unwrap();
        let link_one = first_link(&tunnel).await;
        drop(first);
        while link_one.is_open().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        link_one.write("for-1").await.unwrap_err();

        let mut second = TcpStream::connect(addr).await.unwrap();
        wait_for_links(&tunnel, 2).await;
        let second_link = tunnel
            .links()
            .into_iter()
            .find(|link| link.id() != link_one.id())
            .unwrap();
        assert!(second_link.is_open().await);

        second_link.write("for-2").await.unwrap();
        let mut received = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"for-2");
        assert_eq!(link_one.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_udp_heartbeat_filtered_per_device() {
        let config = TunnelConfig {
            heartbeat: HeartbeatConfig {
                enabled: true,
                interval_secs: 0,
                content: "ping".to_string(),
                is_hex: false,
            },
            pending_limit: None,
        };
        let (tunnel, broker) = tunnel(config);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        tokio::spawn(serve_udp(
            tunnel.clone(),
            socket,
            Duration::from_secs(60),
            ResumeMatch::Address,
        ));

        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        device.send_to(b"ping", addr).await.unwrap();

        let link = first_link(&tunnel).await;
        let mut recv = broker.subscribe("test", &link.topics().recv).unwrap();

        device.send_to(b"ping", addr).await.unwrap();
        device.send_to(b"data", addr).await.unwrap();
        let publication = tokio::time::timeout(Duration::from_secs(5), recv.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&publication.payload[..], b"data");

        link.write("reply").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn test_idle_udp_links_are_reaped() {
        const DEVICES: usize = 20;

        let (tunnel, _broker) = tunnel(TunnelConfig::default());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        tokio::spawn(serve_udp(
            tunnel.clone(),
            socket,
            Duration::from_millis(300),
            ResumeMatch::Address,
        ));
        tokio::spawn(reap_closed_links(tunnel.clone(), Duration::from_millis(50)));

        let mut devices = Vec::new();
        for _ in 0..DEVICES {
            let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            device.send_to(b"hello", addr).await.unwrap();
            devices.push(device);
        }

        wait_for_links(&tunnel, DEVICES).await;
        wait_for_links(&tunnel, 0).await;
    }

    #[tokio::test]
    async fn test_drain_delivers_queued_datagrams() {
        let (tunnel, broker) = tunnel(TunnelConfig::default());
        let (transport, _handle) = linkhub_transport::MemoryTransport::new();
        let link = tunnel.open_link(Box::new(transport), None);
        let mut recv = broker.subscribe("test", &link.topics().recv).unwrap();

        let (tx, mut rx) = mpsc::channel(UDP_PEER_QUEUE);
        tx.try_send(Bytes::from_static(b"one")).unwrap();
        tx.try_send(Bytes::from_static(b"two")).unwrap();

        drain_datagrams(&link, &mut rx).await;

        assert!(matches!(
            tx.try_send(Bytes::from_static(b"late")),
            Err(mpsc::error::TrySendError::Closed(_))
        ));
        assert_eq!(&recv.try_recv().unwrap().payload[..], b"one");
        assert_eq!(&recv.try_recv().unwrap().payload[..], b"two");
    }

    #[test]
    fn test_app_state_builds_tunnels() {
        let config: Config = toml::from_str(
            r#"
            [[tunnels]]
            id = 4
            name = "meters"
            listen = "127.0.0.1:0"
        "#,
        )
        .unwrap();

        let state = AppState::new(&config);
        assert_eq!(state.tunnels.len(), 1);
        assert_eq!(state.tunnels[0].id(), 4);
        assert_eq!(state.tunnels[0].name(), "meters");
    }
}
