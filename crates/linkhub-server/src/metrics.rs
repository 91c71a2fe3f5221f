//! Metrics collection and export for Linkhub.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use linkhub_transport::{Transport, TransportError};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const LINKS_OPENED_TOTAL: &str = "linkhub_links_opened_total";
    pub const LINKS_RESUMED_TOTAL: &str = "linkhub_links_resumed_total";
    pub const LINKS_REAPED_TOTAL: &str = "linkhub_links_reaped_total";
    pub const TAPS_ACTIVE: &str = "linkhub_taps_active";
    pub const CONNECTIONS_ACTIVE: &str = "linkhub_connections_active";
    pub const BYTES_TOTAL: &str = "linkhub_bytes_total";
    pub const ERRORS_TOTAL: &str = "linkhub_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::LINKS_OPENED_TOTAL, "Total number of links created");
    metrics::describe_counter!(
        names::LINKS_RESUMED_TOTAL,
        "Total number of closed links resumed by a reconnecting device"
    );
    metrics::describe_counter!(
        names::LINKS_REAPED_TOTAL,
        "Total number of closed links dropped after the retention window"
    );
    metrics::describe_gauge!(names::TAPS_ACTIVE, "Current number of bus tap clients");
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of connected devices"
    );
    metrics::describe_counter!(names::BYTES_TOTAL, "Device payload bytes by direction");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a link being opened or resumed.
pub fn record_link(resumed: bool) {
    if resumed {
        counter!(names::LINKS_RESUMED_TOTAL).increment(1);
    } else {
        counter!(names::LINKS_OPENED_TOTAL).increment(1);
    }
}

/// Record closed links removed from a tunnel.
pub fn record_reaped(count: usize) {
    counter!(names::LINKS_REAPED_TOTAL).increment(count as u64);
}

/// Record a bus tap client connecting or leaving.
pub fn record_tap(connected: bool) {
    if connected {
        gauge!(names::TAPS_ACTIVE).increment(1.0);
    } else {
        gauge!(names::TAPS_ACTIVE).decrement(1.0);
    }
}

/// Record device payload bytes.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that tracks a connected device until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// A transport wrapper counting outbound bytes.
pub struct MeteredTransport<T> {
    inner: T,
}

impl<T> MeteredTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: Transport> Transport for MeteredTransport<T> {
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self.inner.write(data).await {
            Ok(n) => {
                record_bytes(n, "outbound");
                Ok(n)
            }
            Err(e) => {
                record_error("write");
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }
}
